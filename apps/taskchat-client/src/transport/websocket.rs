use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskchat_proto::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};

use super::{
    decode_frame, encode_frame, ConnectRequest, NoticeSender, Transport, TransportEvent,
    TransportNotice,
};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Websocket transport over `tokio-tungstenite`.
#[derive(Default)]
pub struct WsTransport {
    link: Mutex<Option<Link>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for WsTransport {
    fn connect(&self, request: ConnectRequest, notices: NoticeSender) {
        self.close();

        let connected = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let notifier = Notifier {
            generation: request.generation,
            notices,
            cancelled: cancelled.clone(),
        };
        let task = tokio::spawn(run_socket(
            request,
            outbound_rx,
            connected.clone(),
            notifier,
        ));

        *self.link.lock() = Some(Link {
            outbound,
            connected,
            cancelled,
            task,
        });
    }

    fn send(&self, frame: &ClientFrame) -> bool {
        let guard = self.link.lock();
        let Some(link) = guard.as_ref() else {
            return false;
        };
        if !link.connected.load(Ordering::Acquire) {
            return false;
        }
        match encode_frame(frame) {
            Ok(json) => link.outbound.send(Message::Text(json)).is_ok(),
            Err(err) => {
                warn!(target = "taskchat::transport", error = %err, "failed to encode frame");
                false
            }
        }
    }

    fn close(&self) {
        let Some(link) = self.link.lock().take() else {
            return;
        };
        link.cancelled.store(true, Ordering::Release);
        link.connected.store(false, Ordering::Release);
        let _ = link.outbound.send(Message::Close(None));
        let task = link.task;
        tokio::spawn(async move {
            tokio::time::sleep(CLOSE_GRACE).await;
            task.abort();
        });
    }

    fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.connected.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.cancelled.store(true, Ordering::Release);
            link.task.abort();
        }
    }
}

struct Notifier {
    generation: u64,
    notices: NoticeSender,
    cancelled: Arc<AtomicBool>,
}

impl Notifier {
    fn emit(&self, event: TransportEvent) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let _ = self.notices.send(TransportNotice {
            generation: self.generation,
            event,
        });
    }
}

async fn run_socket(
    request: ConnectRequest,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    connected: Arc<AtomicBool>,
    notifier: Notifier,
) {
    let generation = request.generation;
    let stream = match connect_async(request.endpoint.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            debug!(
                target = "taskchat::transport",
                generation,
                endpoint = %request.endpoint,
                error = %err,
                "websocket connect failed"
            );
            notifier.emit(TransportEvent::Error(err.to_string()));
            notifier.emit(TransportEvent::Close { reason: None });
            return;
        }
    };
    let (mut sink, mut source) = stream.split();

    let auth = match encode_frame(&request.auth_frame()) {
        Ok(json) => json,
        Err(err) => {
            notifier.emit(TransportEvent::Error(err.to_string()));
            notifier.emit(TransportEvent::Close { reason: None });
            return;
        }
    };
    if let Err(err) = sink.send(Message::Text(auth)).await {
        notifier.emit(TransportEvent::Error(err.to_string()));
        notifier.emit(TransportEvent::Close { reason: None });
        return;
    }

    connected.store(true, Ordering::Release);
    info!(
        target = "taskchat::transport",
        generation,
        endpoint = %request.endpoint,
        "websocket open"
    );
    notifier.emit(TransportEvent::Open);

    let mut reason = None;
    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(message) = outgoing else { break };
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    notifier.emit(TransportEvent::Error(err.to_string()));
                    break;
                }
                if closing {
                    break;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                    Some(ServerFrame::Ping) => {
                        trace!(target = "taskchat::transport", generation, "answering ping");
                        let pong = encode_frame(&ClientFrame::Pong);
                        if let Ok(json) = pong {
                            if let Err(err) = sink.send(Message::Text(json)).await {
                                notifier.emit(TransportEvent::Error(err.to_string()));
                                break;
                            }
                        }
                    }
                    Some(frame) => notifier.emit(TransportEvent::Message(frame)),
                    None => {}
                },
                Some(Ok(Message::Close(frame))) => {
                    reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    notifier.emit(TransportEvent::Error(err.to_string()));
                    break;
                }
                None => break,
            }
        }
    }

    connected.store(false, Ordering::Release);
    debug!(target = "taskchat::transport", generation, ?reason, "websocket closed");
    notifier.emit(TransportEvent::Close { reason });
}
