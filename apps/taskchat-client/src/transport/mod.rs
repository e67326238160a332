//! Transport session: one live duplex connection to the server.
//!
//! A transport is a dumb pipe. It reports lifecycle through
//! [`TransportNotice`]s and never reconnects on its own; retry policy lives
//! in [`crate::reconnect`].

use taskchat_proto::{ClientFrame, ClientId, ServerFrame};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

pub mod mock;
pub mod websocket;

pub use websocket::WsTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("frame encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(ServerFrame),
    Error(String),
    Close { reason: Option<String> },
}

/// Event tagged with the connection generation that produced it, so events
/// from a replaced socket can be told apart from the live one.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportNotice {
    pub generation: u64,
    pub event: TransportEvent,
}

pub type NoticeSender = mpsc::UnboundedSender<TransportNotice>;

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub endpoint: Url,
    pub identity: ClientId,
    pub token: Option<String>,
    pub generation: u64,
}

impl ConnectRequest {
    pub fn auth_frame(&self) -> ClientFrame {
        ClientFrame::Auth {
            client_id: self.identity.clone(),
            token: self.token.clone(),
        }
    }
}

pub trait Transport: Send + Sync {
    /// Starts connecting; the outcome arrives as `Open` or `Error`/`Close`.
    /// Any previous connection is dropped first.
    fn connect(&self, request: ConnectRequest, notices: NoticeSender);

    /// Returns false, without erroring, unless the connection is open.
    fn send(&self, frame: &ClientFrame) -> bool;

    /// Closes the connection. No further notices are emitted for it.
    fn close(&self);

    fn is_connected(&self) -> bool;
}

pub(crate) fn encode_frame(frame: &ClientFrame) -> Result<String, TransportError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes an inbound text frame. Malformed frames are logged and dropped.
pub fn decode_frame(text: &str) -> Option<ServerFrame> {
    match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!(
                target = "taskchat::transport",
                error = %err,
                bytes = text.len(),
                "discarding malformed server frame"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_frames_are_discarded() {
        assert!(decode_frame("{not json").is_none());
        assert!(decode_frame(r#"{"type":"new_channel_message"}"#).is_none());
        assert_eq!(decode_frame(r#"{"type":"ping"}"#), Some(ServerFrame::Ping));
    }
}
