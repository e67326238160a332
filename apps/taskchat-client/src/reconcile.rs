//! Optimistic view cache.
//!
//! User actions show up immediately as pending entries. When the server's
//! record for the same action arrives it takes the pending entry's slot, so
//! the view never shows the action twice or reorders it.

use serde_json::Value;
use std::collections::HashMap;
use taskchat_proto::{
    Action, ActionType, ChannelId, ClientId, Conversation, MessageId, MessageRecord, ServerFrame,
    UserId,
};
use time::OffsetDateTime;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::session::ConnectionState;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticRecord {
    pub local_id: Uuid,
    pub client_id: ClientId,
    pub action: Action,
    pub created_at: OffsetDateTime,
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEntry {
    Pending(OptimisticRecord),
    Confirmed {
        record: MessageRecord,
        /// Local edit not yet acknowledged; its content is what the view shows.
        pending_edit: Option<OptimisticRecord>,
    },
}

impl ViewEntry {
    pub fn content(&self) -> &str {
        match self {
            ViewEntry::Pending(pending) => pending.action.content(),
            ViewEntry::Confirmed {
                pending_edit: Some(edit),
                ..
            } => edit.action.content(),
            ViewEntry::Confirmed { record, .. } => &record.content,
        }
    }

    pub fn server_id(&self) -> Option<MessageId> {
        match self {
            ViewEntry::Pending(_) => None,
            ViewEntry::Confirmed { record, .. } => Some(record.id),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ViewEntry::Pending(_)
                | ViewEntry::Confirmed {
                    pending_edit: Some(_),
                    ..
                }
        )
    }

    fn confirmed(record: MessageRecord) -> Self {
        ViewEntry::Confirmed {
            record,
            pending_edit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelChange {
    Updated(Value),
    MemberAdded(UserId),
    MemberRemoved(UserId),
}

/// Updates pushed to the UI-facing cache.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Upserted {
        conversation: Conversation,
        entry: ViewEntry,
    },
    /// A pending entry was confirmed in place.
    Replaced {
        conversation: Conversation,
        local_id: Uuid,
        entry: ViewEntry,
    },
    /// An optimistic entry was taken back because its action was never queued.
    Withdrawn {
        conversation: Conversation,
        local_id: Uuid,
    },
    Typing {
        conversation: Conversation,
        user_id: UserId,
        is_typing: bool,
    },
    ChannelChanged {
        channel_id: Option<ChannelId>,
        change: ChannelChange,
    },
    ServerError {
        message: String,
        error_type: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Send,
    Enqueue,
}

/// Only a live, non-degraded connection takes actions directly.
pub fn route(connection: ConnectionState) -> Route {
    match connection {
        ConnectionState::Connected => Route::Send,
        _ => Route::Enqueue,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Created,
    Updated,
}

#[derive(Debug)]
pub struct Reconciler {
    client_id: ClientId,
    self_user: Option<UserId>,
    views: HashMap<Conversation, Vec<ViewEntry>>,
}

impl Reconciler {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            self_user: None,
            views: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn set_self_user(&mut self, user: Option<UserId>) {
        self.self_user = user;
    }

    /// Identity change: pending entries of the old identity no longer match.
    pub fn reset(&mut self, client_id: ClientId) {
        self.client_id = client_id;
        self.self_user = None;
        self.views.clear();
    }

    pub fn entries(&self, conversation: Conversation) -> Vec<ViewEntry> {
        self.views.get(&conversation).cloned().unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.views
            .values()
            .flatten()
            .filter(|entry| entry.is_pending())
            .count()
    }

    /// Publishes an optimistic entry for `action`.
    pub fn submit(&mut self, action: Action) -> (OptimisticRecord, Option<ViewEvent>) {
        let optimistic = OptimisticRecord {
            local_id: Uuid::new_v4(),
            client_id: self.client_id.clone(),
            action,
            created_at: OffsetDateTime::now_utc(),
            confirmed: false,
        };
        let conversation = optimistic.action.conversation();
        let view = self.views.entry(conversation).or_default();

        let event = match &optimistic.action {
            Action::EditChannelMessage(edit) => {
                let target = view
                    .iter_mut()
                    .find(|entry| entry.server_id() == Some(edit.message_id));
                match target {
                    Some(ViewEntry::Confirmed { pending_edit, .. }) => {
                        *pending_edit = Some(optimistic.clone());
                        target_event(conversation, view, edit.message_id)
                    }
                    _ => {
                        debug!(
                            target = "taskchat::reconcile",
                            message_id = edit.message_id,
                            "edit for a message outside the view"
                        );
                        None
                    }
                }
            }
            _ => {
                let entry = ViewEntry::Pending(optimistic.clone());
                view.push(entry.clone());
                Some(ViewEvent::Upserted {
                    conversation,
                    entry,
                })
            }
        };
        (optimistic, event)
    }

    /// Removes the optimistic entry published for `optimistic`. A pending
    /// edit is cleared and the message falls back to its confirmed content.
    pub fn withdraw(&mut self, optimistic: &OptimisticRecord) -> Option<ViewEvent> {
        let conversation = optimistic.action.conversation();
        let view = self.views.get_mut(&conversation)?;
        let local_id = optimistic.local_id;
        if let Some(index) = view.iter().position(
            |entry| matches!(entry, ViewEntry::Pending(pending) if pending.local_id == local_id),
        ) {
            view.remove(index);
            return Some(ViewEvent::Withdrawn {
                conversation,
                local_id,
            });
        }
        let target = view.iter_mut().find_map(|entry| match entry {
            ViewEntry::Confirmed {
                record,
                pending_edit,
            } if pending_edit
                .as_ref()
                .is_some_and(|edit| edit.local_id == local_id) =>
            {
                *pending_edit = None;
                Some(record.id)
            }
            _ => None,
        })?;
        target_event(conversation, view, target)
    }

    /// Drops a view and the optimistic entries it held.
    pub fn unmount(&mut self, conversation: Conversation) -> usize {
        let discarded = self
            .views
            .remove(&conversation)
            .map(|view| view.iter().filter(|entry| entry.is_pending()).count())
            .unwrap_or(0);
        if discarded > 0 {
            debug!(
                target = "taskchat::reconcile",
                ?conversation,
                discarded,
                "discarded optimistic entries on unmount"
            );
        }
        discarded
    }

    /// Folds a server frame into the views.
    pub fn apply_frame(&mut self, frame: &ServerFrame) -> Vec<ViewEvent> {
        match frame {
            ServerFrame::NewChannelMessage { message } => {
                self.apply_channel(RecordKind::Created, message)
            }
            ServerFrame::MessageUpdated { message } => {
                self.apply_channel(RecordKind::Updated, message)
            }
            ServerFrame::DirectMessageSent { message } => {
                self.apply_direct(RecordKind::Created, message)
            }
            ServerFrame::DirectMessageUpdated { message } => {
                self.apply_direct(RecordKind::Updated, message)
            }
            ServerFrame::TypingIndicator(typing) => {
                let conversation = match typing.channel_id {
                    Some(channel) => Conversation::Channel(channel),
                    None => Conversation::Direct(typing.user_id),
                };
                vec![ViewEvent::Typing {
                    conversation,
                    user_id: typing.user_id,
                    is_typing: typing.is_typing,
                }]
            }
            ServerFrame::ChannelUpdated { channel } => vec![ViewEvent::ChannelChanged {
                channel_id: channel.get("id").and_then(Value::as_i64),
                change: ChannelChange::Updated(channel.clone()),
            }],
            ServerFrame::ChannelMemberAdded {
                channel_id,
                user_id,
            } => vec![ViewEvent::ChannelChanged {
                channel_id: Some(*channel_id),
                change: ChannelChange::MemberAdded(*user_id),
            }],
            ServerFrame::ChannelMemberRemoved {
                channel_id,
                user_id,
            } => vec![ViewEvent::ChannelChanged {
                channel_id: Some(*channel_id),
                change: ChannelChange::MemberRemoved(*user_id),
            }],
            _ => Vec::new(),
        }
    }

    /// Applies a record returned directly for `action` (REST fallback).
    pub fn confirm(&mut self, action: &Action, record: &MessageRecord) -> Vec<ViewEvent> {
        let kind = match action.action_type() {
            ActionType::EditChannelMessage => RecordKind::Updated,
            _ => RecordKind::Created,
        };
        let mut record = record.clone();
        record.client_id.get_or_insert_with(|| self.client_id.clone());
        record.client_nonce.get_or_insert(action.nonce());
        self.apply_record(kind, action.conversation(), record)
    }

    fn apply_channel(&mut self, kind: RecordKind, record: &MessageRecord) -> Vec<ViewEvent> {
        let Some(channel) = record.channel_id else {
            debug!(
                target = "taskchat::reconcile",
                id = record.id,
                "channel message without channel id"
            );
            return Vec::new();
        };
        self.apply_record(kind, Conversation::Channel(channel), record.clone())
    }

    fn apply_direct(&mut self, kind: RecordKind, record: &MessageRecord) -> Vec<ViewEvent> {
        let ours = record.client_id.as_ref() == Some(&self.client_id)
            || (self.self_user.is_some() && record.sender_id == self.self_user);
        let peer = if ours {
            record.recipient_id
        } else {
            record.sender_id
        };
        let Some(peer) = peer else {
            debug!(
                target = "taskchat::reconcile",
                id = record.id,
                "direct message without a peer"
            );
            return Vec::new();
        };
        self.apply_record(kind, Conversation::Direct(peer), record.clone())
    }

    fn apply_record(
        &mut self,
        kind: RecordKind,
        conversation: Conversation,
        record: MessageRecord,
    ) -> Vec<ViewEvent> {
        let client_id = self.client_id.clone();
        let self_user = self.self_user;
        let view = self.views.entry(conversation).or_default();

        if kind == RecordKind::Created {
            if let Some(index) = find_pending_send(view, &client_id, self_user, &record) {
                let ViewEntry::Pending(mut retired) = std::mem::replace(
                    &mut view[index],
                    ViewEntry::confirmed(record),
                ) else {
                    return Vec::new();
                };
                retired.confirmed = true;
                trace!(
                    target = "taskchat::reconcile",
                    local_id = %retired.local_id,
                    "optimistic entry confirmed"
                );
                return vec![ViewEvent::Replaced {
                    conversation,
                    local_id: retired.local_id,
                    entry: view[index].clone(),
                }];
            }
        }

        let id = record.id;
        match view.iter_mut().find(|entry| entry.server_id() == Some(id)) {
            Some(entry) => {
                let pending_edit = match entry {
                    ViewEntry::Confirmed { pending_edit, .. } => pending_edit
                        .take()
                        .filter(|edit| !edit_matches(edit, &client_id, &record)),
                    ViewEntry::Pending(_) => None,
                };
                *entry = ViewEntry::Confirmed {
                    record,
                    pending_edit,
                };
            }
            None => view.push(ViewEntry::confirmed(record)),
        }
        target_event(conversation, view, id).into_iter().collect()
    }
}

fn target_event(
    conversation: Conversation,
    view: &[ViewEntry],
    id: MessageId,
) -> Option<ViewEvent> {
    view.iter()
        .find(|entry| entry.server_id() == Some(id))
        .map(|entry| ViewEvent::Upserted {
            conversation,
            entry: entry.clone(),
        })
}

/// Pairs a created record with the pending send it confirms: by echoed
/// nonce when the server carries one, else by content from this client.
fn find_pending_send(
    view: &[ViewEntry],
    client_id: &ClientId,
    self_user: Option<UserId>,
    record: &MessageRecord,
) -> Option<usize> {
    let pending = view.iter().enumerate().filter_map(|(index, entry)| match entry {
        ViewEntry::Pending(pending) => Some((index, pending)),
        _ => None,
    });

    if let Some(nonce) = record.client_nonce {
        let same_client = record
            .client_id
            .as_ref()
            .map_or(true, |id| id == client_id);
        if !same_client {
            return None;
        }
        return pending
            .filter(|(_, p)| p.action.nonce() == nonce)
            .map(|(index, _)| index)
            .next();
    }

    let from_us = match (&record.client_id, record.sender_id, self_user) {
        (Some(id), _, _) => id == client_id,
        (None, Some(sender), Some(me)) => sender == me,
        _ => false,
    };
    if !from_us {
        return None;
    }
    pending
        .filter(|(_, p)| p.action.content() == record.content)
        .map(|(index, _)| index)
        .next()
}

fn edit_matches(edit: &OptimisticRecord, client_id: &ClientId, record: &MessageRecord) -> bool {
    match record.client_nonce {
        Some(nonce) => {
            nonce == edit.action.nonce()
                && record.client_id.as_ref().map_or(true, |id| id == client_id)
        }
        None => record.content == edit.action.content(),
    }
}
