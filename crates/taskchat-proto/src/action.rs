use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ChannelId, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendChannelMessage,
    EditChannelMessage,
    SendDirectMessage,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::SendChannelMessage => "send_channel_message",
            ActionType::EditChannelMessage => "edit_channel_message",
            ActionType::SendDirectMessage => "send_direct_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessagePayload {
    pub channel_id: ChannelId,
    pub client_nonce: Uuid,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessagePayload {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub client_nonce: Uuid,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessagePayload {
    pub recipient_id: UserId,
    pub client_nonce: Uuid,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mentions: Vec<UserId>,
}

/// A user-initiated chat action. The nonce is the payload identity used to
/// pair an optimistic entry with the record the server later confirms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "actionType", content = "payload", rename_all = "snake_case")]
pub enum Action {
    SendChannelMessage(ChannelMessagePayload),
    EditChannelMessage(EditMessagePayload),
    SendDirectMessage(DirectMessagePayload),
}

impl Action {
    pub fn channel_message(channel_id: ChannelId, content: impl Into<String>) -> Self {
        Action::SendChannelMessage(ChannelMessagePayload {
            channel_id,
            client_nonce: Uuid::new_v4(),
            content: content.into(),
            mentions: Vec::new(),
        })
    }

    pub fn edit_message(
        channel_id: ChannelId,
        message_id: MessageId,
        content: impl Into<String>,
    ) -> Self {
        Action::EditChannelMessage(EditMessagePayload {
            channel_id,
            message_id,
            client_nonce: Uuid::new_v4(),
            content: content.into(),
            mentions: Vec::new(),
        })
    }

    pub fn direct_message(recipient_id: UserId, content: impl Into<String>) -> Self {
        Action::SendDirectMessage(DirectMessagePayload {
            recipient_id,
            client_nonce: Uuid::new_v4(),
            content: content.into(),
            mentions: Vec::new(),
        })
    }

    pub fn with_mentions(mut self, mentions: Vec<UserId>) -> Self {
        match &mut self {
            Action::SendChannelMessage(p) => p.mentions = mentions,
            Action::EditChannelMessage(p) => p.mentions = mentions,
            Action::SendDirectMessage(p) => p.mentions = mentions,
        }
        self
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Action::SendChannelMessage(_) => ActionType::SendChannelMessage,
            Action::EditChannelMessage(_) => ActionType::EditChannelMessage,
            Action::SendDirectMessage(_) => ActionType::SendDirectMessage,
        }
    }

    pub fn nonce(&self) -> Uuid {
        match self {
            Action::SendChannelMessage(p) => p.client_nonce,
            Action::EditChannelMessage(p) => p.client_nonce,
            Action::SendDirectMessage(p) => p.client_nonce,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Action::SendChannelMessage(p) => &p.content,
            Action::EditChannelMessage(p) => &p.content,
            Action::SendDirectMessage(p) => &p.content,
        }
    }

    pub fn mentions(&self) -> &[UserId] {
        match self {
            Action::SendChannelMessage(p) => &p.mentions,
            Action::EditChannelMessage(p) => &p.mentions,
            Action::SendDirectMessage(p) => &p.mentions,
        }
    }

    pub fn conversation(&self) -> Conversation {
        match self {
            Action::SendChannelMessage(p) => Conversation::Channel(p.channel_id),
            Action::EditChannelMessage(p) => Conversation::Channel(p.channel_id),
            Action::SendDirectMessage(p) => Conversation::Direct(p.recipient_id),
        }
    }
}

/// A view a message belongs to: a channel, or a direct thread keyed by the
/// other participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Conversation {
    Channel(ChannelId),
    Direct(UserId),
}
