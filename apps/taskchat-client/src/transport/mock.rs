//! Scripted in-process transport for driving the session without a server.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use taskchat_proto::{ClientFrame, ServerFrame};

use super::{ConnectRequest, NoticeSender, Transport, TransportEvent, TransportNotice};

/// What the next `connect` call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Opens immediately and records the auth frame.
    Open,
    /// Reports an error followed by a close.
    Fail,
    /// Does nothing until the test calls [`MockTransport::emit`].
    Manual,
}

#[derive(Debug)]
struct MockState {
    default_behavior: ConnectBehavior,
    script: VecDeque<ConnectBehavior>,
    connects: Vec<ConnectRequest>,
    sent: Vec<ClientFrame>,
    connected: bool,
    reject_sends: bool,
    closes: usize,
    notices: Option<NoticeSender>,
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(default_behavior: ConnectBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                default_behavior,
                script: VecDeque::new(),
                connects: Vec::new(),
                sent: Vec::new(),
                connected: false,
                reject_sends: false,
                closes: 0,
                notices: None,
                generation: 0,
            })),
        }
    }

    /// Queues behaviors for the next connect calls, ahead of the default.
    pub fn script(&self, behaviors: impl IntoIterator<Item = ConnectBehavior>) {
        self.state.lock().script.extend(behaviors);
    }

    pub fn set_default(&self, behavior: ConnectBehavior) {
        self.state.lock().default_behavior = behavior;
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects.len()
    }

    pub fn connects(&self) -> Vec<ConnectRequest> {
        self.state.lock().connects.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    pub fn sent(&self) -> Vec<ClientFrame> {
        self.state.lock().sent.clone()
    }

    /// Sent frames that carry an action, in send order.
    pub fn sent_actions(&self) -> Vec<ClientFrame> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|frame| frame.is_action())
            .cloned()
            .collect()
    }

    /// While set, `send` reports failure even on an open connection.
    pub fn reject_sends(&self, reject: bool) {
        self.state.lock().reject_sends = reject;
    }

    /// Pushes an event as if it came from the current connection.
    pub fn emit(&self, event: TransportEvent) {
        let mut state = self.state.lock();
        match &event {
            TransportEvent::Open => state.connected = true,
            TransportEvent::Close { .. } => state.connected = false,
            _ => {}
        }
        if matches!(event, TransportEvent::Open) {
            let auth = state.connects.last().map(ConnectRequest::auth_frame);
            state.sent.extend(auth);
        }
        notify(&state, event);
    }

    pub fn deliver(&self, frame: ServerFrame) {
        self.emit(TransportEvent::Message(frame));
    }

    /// Simulates the server going away.
    pub fn drop_connection(&self, reason: Option<&str>) {
        self.emit(TransportEvent::Close {
            reason: reason.map(str::to_string),
        });
    }
}

fn notify(state: &MockState, event: TransportEvent) {
    if let Some(notices) = &state.notices {
        let _ = notices.send(TransportNotice {
            generation: state.generation,
            event,
        });
    }
}

impl Transport for MockTransport {
    fn connect(&self, request: ConnectRequest, notices: NoticeSender) {
        let mut state = self.state.lock();
        state.connected = false;
        state.generation = request.generation;
        state.notices = Some(notices);
        let behavior = state
            .script
            .pop_front()
            .unwrap_or(state.default_behavior);
        let auth = request.auth_frame();
        state.connects.push(request);
        match behavior {
            ConnectBehavior::Open => {
                state.connected = true;
                state.sent.push(auth);
                notify(&state, TransportEvent::Open);
            }
            ConnectBehavior::Fail => {
                notify(&state, TransportEvent::Error("connection refused".into()));
                notify(&state, TransportEvent::Close { reason: None });
            }
            ConnectBehavior::Manual => {}
        }
    }

    fn send(&self, frame: &ClientFrame) -> bool {
        let mut state = self.state.lock();
        if !state.connected || state.reject_sends {
            return false;
        }
        state.sent.push(frame.clone());
        true
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.closes += 1;
        state.notices = None;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}
