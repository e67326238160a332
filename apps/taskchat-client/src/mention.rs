//! `@mention` picker: query extraction, ranking and token insertion.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use taskchat_proto::UserId;

pub const EXACT_SCORE: u32 = 100;
pub const PREFIX_SCORE: u32 = 50;
pub const SUBSTRING_SCORE: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub user_id: UserId,
    pub handle: String,
    #[serde(default)]
    pub secondary_handle: Option<String>,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionCandidate {
    pub entry: DirectoryEntry,
    pub score: u32,
}

/// The partial token being typed: `start` is the byte offset of its `@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionQuery {
    pub start: usize,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub cursor: usize,
}

/// Finds the query between the last `@` before `cursor` (a byte offset) and
/// the cursor. None when there is no `@`, or whitespace follows it.
pub fn active_query(text: &str, cursor: usize) -> Option<MentionQuery> {
    let before = text.get(..cursor)?;
    let start = before.rfind('@')?;
    let query = &before[start + 1..];
    if query.chars().any(char::is_whitespace) {
        return None;
    }
    Some(MentionQuery {
        start,
        query: query.to_string(),
    })
}

fn handle_score(handle: &str, query: &str) -> u32 {
    let handle = handle.to_lowercase();
    if handle == query {
        EXACT_SCORE
    } else if handle.starts_with(query) {
        PREFIX_SCORE
    } else if handle.contains(query) {
        SUBSTRING_SCORE
    } else {
        0
    }
}

/// Relevance of `entry` for a non-empty query; 0 means excluded.
pub fn score(entry: &DirectoryEntry, query: &str) -> u32 {
    let query = query.to_lowercase();
    let primary = handle_score(&entry.handle, &query);
    let secondary = entry
        .secondary_handle
        .as_deref()
        .map(|handle| handle_score(handle, &query))
        .unwrap_or(0);
    primary.max(secondary)
}

fn by_display_name(a: &DirectoryEntry, b: &DirectoryEntry) -> Ordering {
    a.display_name
        .to_lowercase()
        .cmp(&b.display_name.to_lowercase())
        .then_with(|| a.handle.cmp(&b.handle))
}

/// Ranks the directory for `query`. An empty query lists everyone
/// alphabetically.
pub fn rank(directory: &[DirectoryEntry], query: &str) -> Vec<MentionCandidate> {
    let mut candidates: Vec<MentionCandidate> = if query.is_empty() {
        directory
            .iter()
            .map(|entry| MentionCandidate {
                entry: entry.clone(),
                score: 0,
            })
            .collect()
    } else {
        directory
            .iter()
            .filter_map(|entry| {
                let score = score(entry, query);
                (score > 0).then(|| MentionCandidate {
                    entry: entry.clone(),
                    score,
                })
            })
            .collect()
    };
    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| by_display_name(&a.entry, &b.entry))
    });
    candidates
}

/// Replaces the partial token with `@handle ` and puts the cursor after the
/// trailing space. A query or cursor that does not fit `text` leaves the text
/// unchanged.
pub fn complete(
    text: &str,
    cursor: usize,
    query: &MentionQuery,
    entry: &DirectoryEntry,
) -> Completion {
    let end = cursor.min(text.len()).max(query.start);
    let (Some(head), Some(tail)) = (text.get(..query.start), text.get(end..)) else {
        return Completion {
            text: text.to_string(),
            cursor: cursor.min(text.len()),
        };
    };
    let token = format!("@{} ", entry.handle);
    let mut out = String::with_capacity(text.len() + token.len());
    out.push_str(head);
    out.push_str(&token);
    out.push_str(tail);
    Completion {
        text: out,
        cursor: query.start + token.len(),
    }
}

/// User ids mentioned in `text`, in order of first appearance.
pub fn extract_mentions(text: &str, directory: &[DirectoryEntry]) -> Vec<UserId> {
    let mut found = Vec::new();
    for (index, _) in text.match_indices('@') {
        let token: String = text[index + 1..]
            .chars()
            .take_while(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-'))
            .collect();
        let token = token.trim_end_matches('.');
        if token.is_empty() {
            continue;
        }
        let hit = directory.iter().find(|entry| {
            entry.handle.eq_ignore_ascii_case(token)
                || entry
                    .secondary_handle
                    .as_deref()
                    .is_some_and(|h| h.eq_ignore_ascii_case(token))
        });
        if let Some(entry) = hit {
            if !found.contains(&entry.user_id) {
                found.push(entry.user_id);
            }
        }
    }
    found
}
