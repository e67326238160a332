//! The sync session actor.
//!
//! One tokio task owns the transport, reconnection controller, health
//! monitor, queue and reconciler, and processes one event at a time: user
//! commands, transport notices, retry timers, health results and finished
//! drains. Callers talk to it through a cloneable [`SyncHandle`].

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use taskchat_proto::{
    Action, ChannelId, ClientFrame, ClientId, Conversation, MessageId, ServerFrame, UserId,
    UserRecord, RATE_LIMIT_ERROR,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::health::{HealthMonitor, HealthProbe, HealthTransition, HttpHealthProbe};
use crate::identity;
use crate::metrics;
use crate::queue::{ActionSink, Delivery, DrainReport, DrainRequest, OutboundQueue, QueueItem};
use crate::reconcile::{self, Reconciler, Route, ViewEntry, ViewEvent};
use crate::reconnect::{ControlEffect, ControlEvent, Controller, Phase, TriggerReason};
use crate::rest::RestClient;
use crate::store::{FileStore, LocalStore};
use crate::transport::{
    ConnectRequest, Transport, TransportEvent, TransportNotice, WsTransport,
};

const COMMAND_BUFFER: usize = 64;
const VIEW_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Backing store unreachable; overrides the transport's own state.
    Degraded,
    /// Reconnection gave up; waiting for an external trigger.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub connection: ConnectionState,
    pub pending: usize,
    pub reachable: bool,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            pending: 0,
            reachable: true,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub local_id: Uuid,
    pub route: Route,
}

enum SessionCommand {
    Submit {
        action: Action,
        reply: oneshot::Sender<Result<Submitted, SyncError>>,
    },
    Unmount(Conversation),
    Visibility(bool),
    ForceSync {
        reply: oneshot::Sender<DrainReport>,
    },
    Retry,
    ChangeIdentity {
        token: Option<String>,
    },
    Entries {
        conversation: Conversation,
        reply: oneshot::Sender<Vec<ViewEntry>>,
    },
    Shutdown,
}

enum Internal {
    RetryDue { epoch: u64 },
    Health(bool),
    DrainFinished(DrainReport),
}

/// Collaborators a session runs against.
pub struct SessionParts {
    pub store: Arc<dyn LocalStore>,
    pub transport: Arc<dyn Transport>,
    pub probe: Arc<dyn HealthProbe>,
}

pub struct SyncSession {
    config: SyncConfig,
    endpoint: Url,
    client_id: ClientId,
    token: Option<String>,
    store: Arc<dyn LocalStore>,
    transport: Arc<dyn Transport>,
    probe: Arc<dyn HealthProbe>,
    rest: Option<RestClient>,
    queue: Arc<OutboundQueue>,
    controller: Controller,
    health: HealthMonitor,
    reconciler: Reconciler,
    last_error: Option<String>,
    probe_in_flight: bool,
    retry_timer: Option<JoinHandle<()>>,
    commands: mpsc::Receiver<SessionCommand>,
    notices_tx: mpsc::UnboundedSender<TransportNotice>,
    notices_rx: mpsc::UnboundedReceiver<TransportNotice>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    status_tx: watch::Sender<SyncStatus>,
    view_tx: broadcast::Sender<ViewEvent>,
}

impl SyncSession {
    pub fn new(config: SyncConfig, parts: SessionParts) -> Result<(Self, SyncHandle), SyncError> {
        let endpoint = config.socket_url()?;
        let client_id = identity::load_or_mint(parts.store.as_ref())?;
        let queue = Arc::new(OutboundQueue::open(
            parts.store.clone(),
            config.retry.clone(),
        )?);
        let rest = if config.rest_fallback {
            Some(RestClient::new(
                config.server_url()?,
                config.auth_token.clone(),
            )?)
        } else {
            None
        };

        let mut reconciler = Reconciler::new(client_id.clone());
        match identity::cached_user(parts.store.as_ref()) {
            Ok(user) => reconciler.set_self_user(user.map(|u| u.id)),
            Err(err) => warn!(target = "taskchat::session", error = %err, "cached user unreadable"),
        }

        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SyncStatus {
            pending: queue.len(),
            ..SyncStatus::default()
        });
        let (view_tx, _) = broadcast::channel(VIEW_BUFFER);

        let handle = SyncHandle {
            client_id: client_id.clone(),
            commands: commands_tx,
            status: status_rx,
            views: view_tx.clone(),
            store: parts.store.clone(),
            queue: queue.clone(),
        };
        let session = Self {
            token: config.auth_token.clone(),
            controller: Controller::new(config.retry.clone()),
            config,
            endpoint,
            client_id,
            store: parts.store,
            transport: parts.transport,
            probe: parts.probe,
            rest,
            queue,
            health: HealthMonitor::new(),
            reconciler,
            last_error: None,
            probe_in_flight: false,
            retry_timer: None,
            commands,
            notices_tx,
            notices_rx,
            internal_tx,
            internal_rx,
            status_tx,
            view_tx,
        };
        Ok((session, handle))
    }

    /// Session over the websocket transport, the HTTP health probe and a
    /// file store at `store_path` (or the per-user data directory).
    pub fn from_config(config: SyncConfig) -> Result<(Self, SyncHandle), SyncError> {
        let path = match &config.store_path {
            Some(path) => path.clone(),
            None => FileStore::default_path()?,
        };
        let store: Arc<dyn LocalStore> = Arc::new(FileStore::open(path)?);
        let probe = HttpHealthProbe::new(RestClient::new(config.server_url()?, None)?);
        Self::new(
            config,
            SessionParts {
                store,
                transport: Arc::new(WsTransport::new()),
                probe: Arc::new(probe),
            },
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!(
            target = "taskchat::session",
            client_id = %self.client_id,
            endpoint = %self.endpoint,
            "sync session starting"
        );
        self.apply_control(ControlEvent::Start);
        self.request_probe();

        let mut health_tick = tokio::time::interval(self.config.health_interval());
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health_tick.tick().await;
        self.publish_status();

        loop {
            // transport events first: a command sees every frame that arrived before it
            tokio::select! {
                biased;
                Some(notice) = self.notices_rx.recv() => self.handle_notice(notice),
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = health_tick.tick() => self.request_probe(),
            }
            self.publish_status();
        }

        self.teardown();
        self.publish_status();
    }

    pub fn connection_state(&self) -> ConnectionState {
        if !self.health.reachable() {
            return ConnectionState::Degraded;
        }
        match self.controller.phase() {
            Phase::Connected => ConnectionState::Connected,
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Idle | Phase::Waiting => ConnectionState::Disconnected,
            Phase::Parked => ConnectionState::Error,
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Submit { action, reply } => {
                let _ = reply.send(self.submit(action));
            }
            SessionCommand::Unmount(conversation) => {
                self.reconciler.unmount(conversation);
            }
            SessionCommand::Visibility(visible) => {
                debug!(target = "taskchat::session", visible, "visibility changed");
                if visible {
                    self.apply_control(ControlEvent::Trigger(TriggerReason::Visible));
                    self.request_drain(false, None);
                }
            }
            SessionCommand::ForceSync { reply } => {
                self.request_probe();
                self.apply_control(ControlEvent::Trigger(TriggerReason::Manual));
                self.request_drain(true, Some(reply));
            }
            SessionCommand::Retry => {
                self.apply_control(ControlEvent::Trigger(TriggerReason::Manual));
            }
            SessionCommand::ChangeIdentity { token } => self.change_identity(token),
            SessionCommand::Entries {
                conversation,
                reply,
            } => {
                let _ = reply.send(self.reconciler.entries(conversation));
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn submit(&mut self, action: Action) -> Result<Submitted, SyncError> {
        let (optimistic, event) = self.reconciler.submit(action.clone());
        if let Some(event) = event {
            self.emit(event);
        }

        let connection = self.connection_state();
        // a direct send must not overtake actions still waiting in the queue
        let route = match reconcile::route(connection) {
            Route::Send if self.queue.is_empty() => {
                let frame = ClientFrame::action(self.client_id.clone(), &action);
                if self.transport.send(&frame) {
                    metrics::ACTIONS_DELIVERED
                        .with_label_values(&[action.action_type().as_str(), "socket"])
                        .inc();
                    Route::Send
                } else {
                    debug!(
                        target = "taskchat::session",
                        "socket send refused; queueing action"
                    );
                    Route::Enqueue
                }
            }
            _ => Route::Enqueue,
        };

        if route == Route::Enqueue {
            if let Err(err) = self.queue.enqueue(self.client_id.clone(), action) {
                if let Some(event) = self.reconciler.withdraw(&optimistic) {
                    self.emit(event);
                }
                return Err(err.into());
            }
            if connection == ConnectionState::Connected {
                self.request_drain(false, None);
            }
        }
        trace!(
            target = "taskchat::session",
            local_id = %optimistic.local_id,
            ?route,
            "action submitted"
        );
        Ok(Submitted {
            local_id: optimistic.local_id,
            route,
        })
    }

    fn handle_notice(&mut self, notice: TransportNotice) {
        if notice.generation != self.controller.epoch() {
            trace!(
                target = "taskchat::session",
                generation = notice.generation,
                "ignoring event from a replaced connection"
            );
            return;
        }
        match notice.event {
            TransportEvent::Open => {
                self.apply_control(ControlEvent::Opened);
                self.last_error = None;
                self.request_drain(false, None);
            }
            TransportEvent::Message(frame) => self.handle_frame(frame),
            TransportEvent::Error(message) => {
                debug!(target = "taskchat::session", error = %message, "transport error");
                self.last_error = Some(message);
                self.apply_control(ControlEvent::Failed);
            }
            TransportEvent::Close { reason } => {
                info!(target = "taskchat::session", ?reason, "connection closed");
                self.apply_control(ControlEvent::Closed);
            }
        }
    }

    fn handle_frame(&mut self, frame: ServerFrame) {
        match &frame {
            ServerFrame::AuthSuccess { user } => {
                info!(target = "taskchat::session", "authenticated");
                if let Some(user) = user {
                    self.reconciler.set_self_user(Some(user.id));
                    if let Err(err) = identity::cache_user(self.store.as_ref(), user) {
                        warn!(target = "taskchat::session", error = %err, "failed to cache user");
                    }
                }
            }
            ServerFrame::Welcome { message } => {
                debug!(target = "taskchat::session", ?message, "welcome");
            }
            ServerFrame::Error {
                message,
                error_type,
            } => {
                let rate_limited = error_type.as_deref() == Some(RATE_LIMIT_ERROR);
                if rate_limited && self.config.suppress_rate_limit_errors {
                    debug!(target = "taskchat::session", %message, "rate limit notice suppressed");
                    return;
                }
                warn!(target = "taskchat::session", %message, ?error_type, "server error");
                self.last_error = Some(message.clone());
                self.emit(ViewEvent::ServerError {
                    message: message.clone(),
                    error_type: error_type.clone(),
                });
            }
            ServerFrame::Ping => {
                self.transport.send(&ClientFrame::Pong);
            }
            ServerFrame::Pong => {}
            ServerFrame::Unknown => {
                debug!(target = "taskchat::session", "ignoring unknown frame type");
            }
            _ => {
                for event in self.reconciler.apply_frame(&frame) {
                    self.emit(event);
                }
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::RetryDue { epoch } => {
                self.retry_timer = None;
                self.apply_control(ControlEvent::RetryDue { epoch });
            }
            Internal::Health(reachable) => {
                self.probe_in_flight = false;
                match self.health.observe(reachable) {
                    HealthTransition::Lost => self.queue.set_degraded(true),
                    HealthTransition::Recovered => {
                        self.queue.set_degraded(false);
                        self.apply_control(ControlEvent::Trigger(TriggerReason::HealthRecovered));
                        self.request_drain(false, None);
                    }
                    HealthTransition::Unchanged => {}
                }
            }
            Internal::DrainFinished(report) => self.finish_drain(report),
        }
    }

    fn finish_drain(&mut self, report: DrainReport) {
        for (action, record) in &report.confirmed {
            for event in self.reconciler.confirm(action, record) {
                self.emit(event);
            }
        }
        if !report.dropped.is_empty() {
            self.last_error = Some(format!(
                "{} undeliverable action(s) dropped",
                report.dropped.len()
            ));
        }
        if report.completed() && report.remaining > 0 {
            self.request_drain(false, None);
        }
    }

    fn apply_control(&mut self, event: ControlEvent) {
        for effect in self.controller.handle(event) {
            match effect {
                ControlEffect::Connect { epoch } => {
                    self.cancel_retry_timer();
                    let request = ConnectRequest {
                        endpoint: self.endpoint.clone(),
                        identity: self.client_id.clone(),
                        token: self.token.clone(),
                        generation: epoch,
                    };
                    debug!(target = "taskchat::session", epoch, "connecting");
                    self.transport.connect(request, self.notices_tx.clone());
                }
                ControlEffect::Schedule {
                    delay,
                    attempt,
                    epoch,
                } => {
                    self.cancel_retry_timer();
                    debug!(
                        target = "taskchat::session",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnect scheduled"
                    );
                    let tx = self.internal_tx.clone();
                    self.retry_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(Internal::RetryDue { epoch });
                    }));
                }
                ControlEffect::Park { attempts } => {
                    self.cancel_retry_timer();
                    error!(
                        target = "taskchat::session",
                        attempts, "giving up on reconnecting until retried"
                    );
                    self.last_error = Some(format!("unable to connect after {attempts} attempts"));
                }
            }
        }
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn request_probe(&mut self) {
        if self.probe_in_flight {
            return;
        }
        self.probe_in_flight = true;
        let probe = self.probe.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let reachable = probe.probe().await;
            let _ = tx.send(Internal::Health(reachable));
        });
    }

    fn request_drain(&mut self, forced: bool, reply: Option<oneshot::Sender<DrainReport>>) {
        if self.queue.is_empty() {
            if let Some(reply) = reply {
                let _ = reply.send(DrainReport::default());
            }
            return;
        }
        let request = DrainRequest { forced };
        let sink = RoutedSink {
            transport: self.transport.clone(),
            rest: self.rest.clone(),
        };
        let queue = self.queue.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let report = queue.drain(&sink, request).await;
            // the session sees the result before the caller does
            let _ = tx.send(Internal::DrainFinished(report.clone()));
            if let Some(reply) = reply {
                let _ = reply.send(report);
            }
        });
    }

    fn change_identity(&mut self, token: Option<String>) {
        info!(target = "taskchat::session", "identity changed; reconnecting");
        self.token = token;
        if let Some(rest) = &self.rest {
            self.rest = Some(rest.with_token(self.token.clone()));
        }
        if let Err(err) = identity::forget_user(self.store.as_ref()) {
            warn!(target = "taskchat::session", error = %err, "failed to clear cached user");
        }
        self.reconciler.reset(self.client_id.clone());
        self.cancel_retry_timer();
        self.transport.close();
        self.apply_control(ControlEvent::Start);
    }

    fn teardown(&mut self) {
        info!(target = "taskchat::session", "sync session shutting down");
        self.apply_control(ControlEvent::Teardown);
        self.cancel_retry_timer();
        self.transport.close();
    }

    fn emit(&self, event: ViewEvent) {
        let _ = self.view_tx.send(event);
    }

    fn publish_status(&self) {
        let next = SyncStatus {
            connection: self.connection_state(),
            pending: self.queue.len(),
            reachable: self.health.reachable(),
            last_error: self.last_error.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Delivers queued actions over the socket when it is open, else through the
/// REST fallback when configured.
struct RoutedSink {
    transport: Arc<dyn Transport>,
    rest: Option<RestClient>,
}

#[async_trait]
impl ActionSink for RoutedSink {
    async fn deliver(&self, item: &QueueItem) -> Delivery {
        let action_type = item.action.action_type().as_str();
        if self.transport.is_connected() {
            let frame = ClientFrame::action(item.client_id.clone(), &item.action);
            if self.transport.send(&frame) {
                metrics::ACTIONS_DELIVERED
                    .with_label_values(&[action_type, "socket"])
                    .inc();
                return Delivery::Sent;
            }
        }
        let Some(rest) = &self.rest else {
            return Delivery::Failed("transport not connected".into());
        };
        match rest.deliver(&item.client_id, &item.action).await {
            Ok(record) => {
                metrics::ACTIONS_DELIVERED
                    .with_label_values(&[action_type, "rest"])
                    .inc();
                Delivery::Confirmed(record)
            }
            Err(err) => Delivery::Failed(err.to_string()),
        }
    }
}

/// Cloneable front door to a running [`SyncSession`].
#[derive(Clone)]
pub struct SyncHandle {
    client_id: ClientId,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SyncStatus>,
    views: broadcast::Sender<ViewEvent>,
    store: Arc<dyn LocalStore>,
    queue: Arc<OutboundQueue>,
}

impl SyncHandle {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn command(&self, command: SessionCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::Closed)
    }

    pub async fn submit(&self, action: Action) -> Result<Submitted, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Submit { action, reply }).await?;
        rx.await.map_err(|_| SyncError::Closed)?
    }

    pub async fn send_channel_message(
        &self,
        channel_id: ChannelId,
        content: impl Into<String>,
        mentions: Vec<UserId>,
    ) -> Result<Submitted, SyncError> {
        self.submit(Action::channel_message(channel_id, content).with_mentions(mentions))
            .await
    }

    pub async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: impl Into<String>,
        mentions: Vec<UserId>,
    ) -> Result<Submitted, SyncError> {
        self.submit(
            Action::edit_message(channel_id, message_id, content).with_mentions(mentions),
        )
        .await
    }

    pub async fn send_direct_message(
        &self,
        recipient_id: UserId,
        content: impl Into<String>,
        mentions: Vec<UserId>,
    ) -> Result<Submitted, SyncError> {
        self.submit(Action::direct_message(recipient_id, content).with_mentions(mentions))
            .await
    }

    pub async fn unmount(&self, conversation: Conversation) -> Result<(), SyncError> {
        self.command(SessionCommand::Unmount(conversation)).await
    }

    pub async fn set_visible(&self, visible: bool) -> Result<(), SyncError> {
        self.command(SessionCommand::Visibility(visible)).await
    }

    /// Re-probes health, restarts a parked connection and drains the queue
    /// even while degraded. Resolves when that drain finishes.
    pub async fn force_sync(&self) -> Result<DrainReport, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::ForceSync { reply }).await?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    pub async fn retry(&self) -> Result<(), SyncError> {
        self.command(SessionCommand::Retry).await
    }

    pub async fn change_identity(&self, token: Option<String>) -> Result<(), SyncError> {
        self.command(SessionCommand::ChangeIdentity { token }).await
    }

    pub async fn entries(&self, conversation: Conversation) -> Result<Vec<ViewEntry>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command(SessionCommand::Entries {
            conversation,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SyncError::Closed)
    }

    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.command(SessionCommand::Shutdown).await
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Waits until the published status satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&SyncStatus) -> bool,
    ) -> Result<SyncStatus, SyncError> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|status| predicate(status))
            .await
            .map_err(|_| SyncError::Closed)?;
        Ok(status.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.views.subscribe()
    }

    pub fn pending(&self) -> Vec<QueueItem> {
        self.queue.snapshot()
    }

    /// Last user the server authenticated; for offline display only.
    pub fn cached_user(&self) -> Result<Option<UserRecord>, SyncError> {
        Ok(identity::cached_user(self.store.as_ref())?)
    }
}
