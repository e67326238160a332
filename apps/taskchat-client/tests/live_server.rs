//! Drives the client against an in-process axum server speaking the
//! taskchat REST and websocket protocol.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskchat_sync::health::{HealthProbe, HttpHealthProbe, ToggleProbe};
use taskchat_sync::proto::{
    Action, ClientFrame, ClientId, Conversation, MessageBody, MessageRecord, ServerFrame,
    UserRecord,
};
use taskchat_sync::reconcile::Route;
use taskchat_sync::rest::{RestClient, RestError};
use taskchat_sync::session::SessionParts;
use taskchat_sync::store::MemoryStore;
use taskchat_sync::transport::mock::{ConnectBehavior, MockTransport};
use taskchat_sync::transport::WsTransport;
use taskchat_sync::{ConnectionState, RetryPolicy, SyncConfig, SyncHandle, SyncSession};

const SERVER_USER: i64 = 2;
const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Server {
    unhealthy: AtomicBool,
    reject_rest: AtomicBool,
    kick_next_socket: AtomicBool,
    next_id: AtomicI64,
    sockets: AtomicUsize,
    rest_calls: Mutex<Vec<(String, Option<String>, MessageBody)>>,
    socket_frames: Mutex<Vec<ClientFrame>>,
}

impl Server {
    fn record(
        &self,
        id: Option<i64>,
        channel_id: Option<i64>,
        recipient_id: Option<i64>,
        body: MessageBody,
    ) -> MessageRecord {
        MessageRecord {
            id: id.unwrap_or_else(|| 1_000 + self.next_id.fetch_add(1, Ordering::SeqCst)),
            channel_id,
            sender_id: Some(SERVER_USER),
            recipient_id,
            content: body.content,
            mentions: body.mentions,
            created_at: None,
            updated_at: None,
            client_id: body.client_id,
            client_nonce: body.client_nonce,
        }
    }

    fn log_rest(&self, route: String, headers: &HeaderMap, body: &MessageBody) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.rest_calls.lock().push((route, auth, body.clone()));
    }

    fn has_frame(&self, predicate: impl Fn(&ClientFrame) -> bool) -> bool {
        self.socket_frames.lock().iter().any(predicate)
    }
}

async fn serve(server: Arc<Server>) -> SocketAddr {
    let app = Router::new()
        .route("/health", get(health))
        .route("/channels/:channel_id/messages", post(post_channel))
        .route(
            "/channels/:channel_id/messages/:message_id",
            patch(edit_channel),
        )
        .route("/direct-messages/:recipient_id", post(post_direct))
        .route("/ws", get(upgrade))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn health(State(server): State<Arc<Server>>) -> Json<serde_json::Value> {
    Json(json!({ "databaseConnected": !server.unhealthy.load(Ordering::SeqCst) }))
}

async fn post_channel(
    State(server): State<Arc<Server>>,
    Path(channel_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Result<Json<MessageRecord>, StatusCode> {
    if server.reject_rest.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    server.log_rest(format!("POST /channels/{channel_id}/messages"), &headers, &body);
    Ok(Json(server.record(None, Some(channel_id), None, body)))
}

async fn edit_channel(
    State(server): State<Arc<Server>>,
    Path((channel_id, message_id)): Path<(i64, i64)>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Json<MessageRecord> {
    server.log_rest(
        format!("PATCH /channels/{channel_id}/messages/{message_id}"),
        &headers,
        &body,
    );
    Json(server.record(Some(message_id), Some(channel_id), None, body))
}

async fn post_direct(
    State(server): State<Arc<Server>>,
    Path(recipient_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<MessageBody>,
) -> Json<MessageRecord> {
    server.log_rest(format!("POST /direct-messages/{recipient_id}"), &headers, &body);
    Json(server.record(None, None, Some(recipient_id), body))
}

async fn upgrade(ws: WebSocketUpgrade, State(server): State<Arc<Server>>) -> Response {
    server.sockets.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| talk(socket, server))
}

fn encode(frame: &ServerFrame) -> Message {
    Message::Text(serde_json::to_string(frame).expect("encode server frame"))
}

async fn talk(mut socket: WebSocket, server: Arc<Server>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        server.socket_frames.lock().push(frame.clone());

        let replies = match frame {
            ClientFrame::Auth { .. } => vec![
                encode(&ServerFrame::AuthSuccess {
                    user: Some(UserRecord {
                        id: SERVER_USER,
                        username: "sam".into(),
                        display_name: Some("Sam Carter".into()),
                        email: None,
                    }),
                }),
                Message::Text("{not json".into()),
                encode(&ServerFrame::Ping),
            ],
            ClientFrame::SendChannelMessage { client_id, payload } => {
                let body = MessageBody {
                    content: payload.content,
                    mentions: payload.mentions,
                    client_id: Some(client_id),
                    client_nonce: Some(payload.client_nonce),
                };
                let message = server.record(None, Some(payload.channel_id), None, body);
                vec![encode(&ServerFrame::NewChannelMessage { message })]
            }
            _ => Vec::new(),
        };
        for reply in replies {
            if socket.send(reply).await.is_err() {
                return;
            }
        }
        if server.kick_next_socket.swap(false, Ordering::SeqCst) {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }
}

fn base_url(addr: SocketAddr) -> String {
    format!("http://{addr}")
}

fn config_for(addr: SocketAddr) -> SyncConfig {
    SyncConfig {
        server_url: base_url(addr),
        retry: RetryPolicy {
            base_delay_ms: 50,
            max_delay_ms: 200,
            inter_item_delay_ms: 10,
            ..RetryPolicy::default()
        },
        ..SyncConfig::default()
    }
}

fn start(config: SyncConfig, parts: SessionParts) -> SyncHandle {
    let (session, handle) = SyncSession::new(config, parts).expect("session");
    session.spawn();
    handle
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_connected(handle: &SyncHandle) {
    tokio::time::timeout(
        WAIT,
        handle.wait_for(|s| s.connection == ConnectionState::Connected),
    )
    .await
    .expect("connected in time")
    .expect("session alive");
}

#[tokio::test]
async fn health_probe_follows_database_flag() {
    let server = Arc::new(Server::default());
    let addr = serve(server.clone()).await;
    let probe = HttpHealthProbe::new(RestClient::new(base_url(addr).parse().unwrap(), None).unwrap());

    assert!(probe.probe().await);
    server.unhealthy.store(true, Ordering::SeqCst);
    assert!(!probe.probe().await);

    let vacant = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let unreachable =
        HttpHealthProbe::new(RestClient::new(base_url(vacant).parse().unwrap(), None).unwrap());
    assert!(!unreachable.probe().await);
}

#[tokio::test]
async fn rest_client_routes_each_action_type() {
    let server = Arc::new(Server::default());
    let addr = serve(server.clone()).await;
    let client = RestClient::new(base_url(addr).parse().unwrap(), Some("secret".into())).unwrap();
    let client_id = ClientId::mint();

    let sent = client
        .deliver(&client_id, &Action::channel_message(4, "hello"))
        .await
        .expect("channel post");
    assert_eq!(sent.channel_id, Some(4));
    assert_eq!(sent.client_id.as_ref(), Some(&client_id));

    let edited = client
        .deliver(&client_id, &Action::edit_message(4, sent.id, "hello again"))
        .await
        .expect("edit");
    assert_eq!(edited.id, sent.id);
    assert_eq!(edited.content, "hello again");

    let direct = client
        .deliver(&client_id, &Action::direct_message(9, "psst"))
        .await
        .expect("direct");
    assert_eq!(direct.recipient_id, Some(9));

    let calls = server.rest_calls.lock().clone();
    let routes: Vec<&str> = calls.iter().map(|(route, _, _)| route.as_str()).collect();
    assert_eq!(
        routes,
        vec![
            "POST /channels/4/messages".to_string(),
            format!("PATCH /channels/4/messages/{}", sent.id),
            "POST /direct-messages/9".to_string(),
        ]
    );
    assert!(calls
        .iter()
        .all(|(_, auth, _)| auth.as_deref() == Some("Bearer secret")));

    server.reject_rest.store(true, Ordering::SeqCst);
    let err = client
        .deliver(&client_id, &Action::channel_message(4, "refused"))
        .await
        .expect_err("rejected");
    assert!(matches!(
        err,
        RestError::UnexpectedStatus { status, .. } if status.as_u16() == 503
    ));
}

#[tokio::test]
async fn forced_sync_falls_back_to_rest_while_socket_is_down() {
    let server = Arc::new(Server::default());
    let addr = serve(server.clone()).await;
    let mock = MockTransport::new(ConnectBehavior::Manual);
    let handle = start(
        config_for(addr),
        SessionParts {
            store: Arc::new(MemoryStore::new()),
            transport: Arc::new(mock.clone()),
            probe: Arc::new(ToggleProbe::new(true)),
        },
    );

    let submitted = handle
        .send_channel_message(12, "via http", Vec::new())
        .await
        .unwrap();
    assert_eq!(submitted.route, Route::Enqueue);

    let report = handle.force_sync().await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(report.confirmed.len(), 1);
    assert!(handle.pending().is_empty());
    assert!(mock.sent_actions().is_empty());

    let view = handle.entries(Conversation::Channel(12)).await.unwrap();
    assert_eq!(view.len(), 1);
    assert!(!view[0].is_pending());
    assert_eq!(view[0].server_id(), Some(report.confirmed[0].1.id));

    let calls = server.rest_calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].2.client_id.as_ref(), Some(handle.client_id()));
}

#[tokio::test]
async fn websocket_session_authenticates_and_reconciles() {
    let server = Arc::new(Server::default());
    let addr = serve(server.clone()).await;
    let handle = start(
        config_for(addr),
        SessionParts {
            store: Arc::new(MemoryStore::new()),
            transport: Arc::new(WsTransport::new()),
            probe: Arc::new(ToggleProbe::new(true)),
        },
    );
    wait_connected(&handle).await;

    let client_id = handle.client_id().clone();
    eventually("auth frame", || {
        server.has_frame(|f| matches!(f, ClientFrame::Auth { client_id: id, .. } if *id == client_id))
    })
    .await;
    eventually("pong", || server.has_frame(|f| matches!(f, ClientFrame::Pong))).await;
    eventually("cached user", || {
        matches!(handle.cached_user(), Ok(Some(user)) if user.id == SERVER_USER)
    })
    .await;
    assert_eq!(handle.status().connection, ConnectionState::Connected);

    let submitted = handle
        .send_channel_message(3, "over the socket", Vec::new())
        .await
        .unwrap();
    assert_eq!(submitted.route, Route::Send);

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let view = handle.entries(Conversation::Channel(3)).await.unwrap();
        assert_eq!(view.len(), 1);
        if !view[0].is_pending() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "echo never reconciled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(server.rest_calls.lock().is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn websocket_session_reconnects_after_server_close() {
    let server = Arc::new(Server::default());
    server.kick_next_socket.store(true, Ordering::SeqCst);
    let addr = serve(server.clone()).await;
    let handle = start(
        config_for(addr),
        SessionParts {
            store: Arc::new(MemoryStore::new()),
            transport: Arc::new(WsTransport::new()),
            probe: Arc::new(ToggleProbe::new(true)),
        },
    );

    eventually("second socket", || server.sockets.load(Ordering::SeqCst) >= 2).await;
    wait_connected(&handle).await;
    eventually("two auth frames", || {
        server
            .socket_frames
            .lock()
            .iter()
            .filter(|f| matches!(f, ClientFrame::Auth { .. }))
            .count()
            >= 2
    })
    .await;
    handle.shutdown().await.unwrap();
}
