use serde::{Deserialize, Serialize};

use crate::action::{Action, ChannelMessagePayload, DirectMessagePayload, EditMessagePayload};
use crate::{ChannelId, ClientId, MessageRecord, TypingIndicator, UserId, UserRecord};

/// `errorType` the server uses for rate-limit notices.
pub const RATE_LIMIT_ERROR: &str = "rate_limit";

/// Frames sent from a sync client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Auth {
        client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Ping,
    Pong,
    #[serde(rename_all = "camelCase")]
    SendChannelMessage {
        client_id: ClientId,
        #[serde(flatten)]
        payload: ChannelMessagePayload,
    },
    #[serde(rename_all = "camelCase")]
    EditChannelMessage {
        client_id: ClientId,
        #[serde(flatten)]
        payload: EditMessagePayload,
    },
    #[serde(rename_all = "camelCase")]
    SendDirectMessage {
        client_id: ClientId,
        #[serde(flatten)]
        payload: DirectMessagePayload,
    },
}

impl ClientFrame {
    pub fn action(client_id: ClientId, action: &Action) -> Self {
        match action {
            Action::SendChannelMessage(payload) => ClientFrame::SendChannelMessage {
                client_id,
                payload: payload.clone(),
            },
            Action::EditChannelMessage(payload) => ClientFrame::EditChannelMessage {
                client_id,
                payload: payload.clone(),
            },
            Action::SendDirectMessage(payload) => ClientFrame::SendDirectMessage {
                client_id,
                payload: payload.clone(),
            },
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(
            self,
            ClientFrame::SendChannelMessage { .. }
                | ClientFrame::EditChannelMessage { .. }
                | ClientFrame::SendDirectMessage { .. }
        )
    }
}

/// Frames pushed by the server. Unrecognised `type`s decode to `Unknown` so
/// newer servers never break older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthSuccess {
        #[serde(default)]
        user: Option<UserRecord>,
    },
    Welcome {
        #[serde(default)]
        message: Option<String>,
    },
    NewChannelMessage {
        message: MessageRecord,
    },
    DirectMessageSent {
        message: MessageRecord,
    },
    MessageUpdated {
        message: MessageRecord,
    },
    DirectMessageUpdated {
        message: MessageRecord,
    },
    TypingIndicator(TypingIndicator),
    ChannelUpdated {
        channel: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ChannelMemberAdded {
        channel_id: ChannelId,
        user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    ChannelMemberRemoved {
        channel_id: ChannelId,
        user_id: UserId,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(default)]
        error_type: Option<String>,
    },
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::AuthSuccess { .. } => "auth_success",
            ServerFrame::Welcome { .. } => "welcome",
            ServerFrame::NewChannelMessage { .. } => "new_channel_message",
            ServerFrame::DirectMessageSent { .. } => "direct_message_sent",
            ServerFrame::MessageUpdated { .. } => "message_updated",
            ServerFrame::DirectMessageUpdated { .. } => "direct_message_updated",
            ServerFrame::TypingIndicator(_) => "typing_indicator",
            ServerFrame::ChannelUpdated { .. } => "channel_updated",
            ServerFrame::ChannelMemberAdded { .. } => "channel_member_added",
            ServerFrame::ChannelMemberRemoved { .. } => "channel_member_removed",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Ping => "ping",
            ServerFrame::Pong => "pong",
            ServerFrame::Unknown => "unknown",
        }
    }
}
