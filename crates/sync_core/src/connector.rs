use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{future, stream, stream::BoxStream, StreamExt};
use reqwest::{header::ACCEPT, Client};
use shared::{
    domain::SessionId,
    error::SyncError,
    protocol::{InboundMessage, ProgressEvent, PongRequest, UpstreamHealth},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, sleep_until, timeout, timeout_at, Instant},
};
use tokio_stream::wrappers::WatchStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{websocket_url, Settings, TransportKind},
    event_stream::EventStreamDecoder,
    health::ConnectionHealth,
    reconciler::{Reconciler, SessionState},
    snapshot::{ProgressSnapshot, SnapshotContent, SnapshotPublisher},
};

/// Raw text frames of one open event channel. The stream ending means the peer went away.
pub type FrameStream = BoxStream<'static, anyhow::Result<String>>;

#[async_trait]
pub trait ProgressTransport: Send + Sync {
    async fn connect(&self, url: &Url) -> anyhow::Result<FrameStream>;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn pong(&self, url: &Url, request: &PongRequest) -> anyhow::Result<()>;
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, url: &Url) -> anyhow::Result<UpstreamHealth>;
}

/// Reads the progress endpoint as server-sent events over a long-lived GET.
#[derive(Debug, Default, Clone)]
pub struct EventStreamTransport {
    client: Client,
}

impl EventStreamTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProgressTransport for EventStreamTransport {
    async fn connect(&self, url: &Url) -> anyhow::Result<FrameStream> {
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("failed to open event stream: {url}"))?
            .error_for_status()
            .context("event stream rejected")?;
        let mut decoder = EventStreamDecoder::default();
        let frames = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
                Err(err) => vec![Err(anyhow!("event stream receive failed: {err}"))],
            })
            .flat_map(stream::iter);
        Ok(frames.boxed())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl ProgressTransport for WebSocketTransport {
    async fn connect(&self, url: &Url) -> anyhow::Result<FrameStream> {
        let url = websocket_url(url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let frames = ws_stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(err) => Some(Err(anyhow!("websocket receive failed: {err}"))),
                }
            });
        Ok(frames.boxed())
    }
}

#[derive(Debug, Default, Clone)]
pub struct HttpAcknowledger {
    client: Client,
}

impl HttpAcknowledger {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Acknowledger for HttpAcknowledger {
    async fn pong(&self, url: &Url, request: &PongRequest) -> anyhow::Result<()> {
        self.client
            .post(url.clone())
            .json(request)
            .send()
            .await
            .with_context(|| format!("failed to send pong to {url}"))?
            .error_for_status()
            .context("pong rejected")?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct HttpHealthCheck {
    client: Client,
}

impl HttpHealthCheck {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, url: &Url) -> anyhow::Result<UpstreamHealth> {
        let body = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to reach {url}"))?
            .error_for_status()
            .context("health check rejected")?
            .text()
            .await
            .context("failed to read health response")?;
        // Any 2xx counts as available when the body is not the structured form.
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("upstream health check failed: {0}")]
    HealthCheck(String),
    #[error("upstream unavailable: {0:?}")]
    Unavailable(UpstreamHealth),
}

pub struct StreamConnector {
    settings: Arc<Settings>,
    transport: Arc<dyn ProgressTransport>,
    acknowledger: Arc<dyn Acknowledger>,
    health_check: Arc<dyn HealthCheck>,
}

impl StreamConnector {
    pub fn new(settings: Settings) -> Self {
        let client = Client::new();
        let transport: Arc<dyn ProgressTransport> = match settings.transport {
            TransportKind::EventStream => Arc::new(EventStreamTransport::new(client.clone())),
            TransportKind::WebSocket => Arc::new(WebSocketTransport),
        };
        Self::with_dependencies(
            settings,
            transport,
            Arc::new(HttpAcknowledger::new(client.clone())),
            Arc::new(HttpHealthCheck::new(client)),
        )
    }

    pub fn with_dependencies(
        settings: Settings,
        transport: Arc<dyn ProgressTransport>,
        acknowledger: Arc<dyn Acknowledger>,
        health_check: Arc<dyn HealthCheck>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            transport,
            acknowledger,
            health_check,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn check_upstream(&self) -> Result<UpstreamHealth, OpenError> {
        let url = self
            .settings
            .health_url()
            .map_err(|err| OpenError::Endpoint(format!("{err:#}")))?;
        let health = self
            .health_check
            .check(&url)
            .await
            .map_err(|err| OpenError::HealthCheck(format!("{err:#}")))?;
        if !health.is_available() {
            return Err(OpenError::Unavailable(health));
        }
        Ok(health)
    }

    /// Opens the session only when the upstream health check reports every service up.
    pub async fn open_when_available(
        &self,
        session_id: SessionId,
    ) -> Result<SessionHandle, OpenError> {
        self.check_upstream().await?;
        self.open(session_id)
            .map_err(|err| OpenError::Endpoint(format!("{err:#}")))
    }

    /// Spawns the session task. Must be called within a tokio runtime.
    pub fn open(&self, session_id: SessionId) -> anyhow::Result<SessionHandle> {
        let progress_url = self.settings.progress_url(&session_id)?;
        let pong_url = self.settings.pong_url(&session_id)?;

        let reconciler = Reconciler::new(session_id.clone());
        let health = ConnectionHealth::default();
        let publisher = SnapshotPublisher::new(
            SnapshotContent::project(reconciler.state(), &health),
            Utc::now(),
        );
        let snapshots = publisher.subscribe();
        let (health_tx, health_rx) = watch::channel(health.clone());
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = SessionWorker {
            session_id: session_id.clone(),
            settings: Arc::clone(&self.settings),
            transport: Arc::clone(&self.transport),
            acknowledger: Arc::clone(&self.acknowledger),
            progress_url,
            pong_url,
            reconciler,
            health,
            publisher,
            health_tx,
            ack_tx,
            ack_rx,
            pending_acks: 0,
        };
        info!(session_id = %session_id, "opening progress session");
        let task = tokio::spawn(worker.run(shutdown_rx));

        Ok(SessionHandle {
            session_id,
            snapshots,
            health: health_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

struct AckOutcome {
    result: Result<DateTime<Utc>, SyncError>,
}

enum PumpExit {
    Finished,
    Shutdown,
    Disconnected(SyncError),
}

struct SessionWorker {
    session_id: SessionId,
    settings: Arc<Settings>,
    transport: Arc<dyn ProgressTransport>,
    acknowledger: Arc<dyn Acknowledger>,
    progress_url: Url,
    pong_url: Url,
    reconciler: Reconciler,
    health: ConnectionHealth,
    publisher: SnapshotPublisher,
    health_tx: watch::Sender<ConnectionHealth>,
    ack_tx: mpsc::UnboundedSender<AckOutcome>,
    ack_rx: mpsc::UnboundedReceiver<AckOutcome>,
    /// Pongs spawned but not yet reported back on `ack_rx`.
    pending_acks: usize,
}

impl SessionWorker {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> SessionState {
        loop {
            let opened = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                opened = self.transport.connect(&self.progress_url) => opened,
            };

            let dropped = match opened {
                Ok(frames) => {
                    self.health.mark_connected(Utc::now());
                    self.publish();
                    info!(session_id = %self.session_id, url = %self.progress_url, "progress channel open");
                    match self.pump(frames, &mut shutdown).await {
                        PumpExit::Finished => {
                            info!(
                                session_id = %self.session_id,
                                status = ?self.reconciler.state().status,
                                "pipeline finished; releasing progress channel"
                            );
                            self.drain_acks().await;
                            break;
                        }
                        PumpExit::Shutdown => break,
                        PumpExit::Disconnected(err) => err,
                    }
                }
                Err(err) => SyncError::Transport(format!("{err:#}")),
            };

            self.health.mark_disconnected(&dropped, Utc::now());
            self.health.reconnect_attempts += 1;
            let attempt = self.health.reconnect_attempts;
            if attempt > self.settings.max_reconnect_attempts {
                warn!(
                    session_id = %self.session_id,
                    error = %dropped,
                    attempts = attempt - 1,
                    "giving up on progress channel"
                );
                self.publish();
                break;
            }

            let delay = self.settings.reconnect_backoff(attempt);
            warn!(
                session_id = %self.session_id,
                error = %dropped,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "progress channel lost; reconnecting"
            );
            self.publish();
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = sleep(delay) => {}
            }
        }

        self.health.mark_closed();
        self.publish();
        self.reconciler.into_state()
    }

    async fn pump(
        &mut self,
        mut frames: FrameStream,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> PumpExit {
        let mut last_traffic = Instant::now();
        loop {
            let stale_deadline = last_traffic + self.settings.stale_after;
            let watching = !self.health.stale;
            tokio::select! {
                biased;
                _ = &mut *shutdown => return PumpExit::Shutdown,
                Some(outcome) = self.ack_rx.recv() => self.on_ack(outcome),
                _ = sleep_until(stale_deadline), if watching => self.on_stale(),
                frame = frames.next() => match frame {
                    Some(Ok(raw)) => {
                        last_traffic = Instant::now();
                        if self.on_frame(&raw) {
                            return PumpExit::Finished;
                        }
                    }
                    Some(Err(err)) => {
                        return PumpExit::Disconnected(SyncError::Transport(format!("{err:#}")));
                    }
                    None => {
                        return PumpExit::Disconnected(SyncError::Transport(
                            "progress channel closed by peer".into(),
                        ));
                    }
                },
            }
        }
    }

    /// Returns true once the pipeline has reported a terminal status.
    fn on_frame(&mut self, raw: &str) -> bool {
        let now = Utc::now();
        self.health.record_message(now);

        match InboundMessage::parse(raw) {
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "dropping malformed message");
                self.health.record_error(&err, now);
            }
            Ok(InboundMessage::Ping(ping)) => {
                debug!(session_id = %self.session_id, timestamp = ?ping.timestamp, "ping");
                self.health.record_ping(&ping, now);
                self.spawn_pong(ping.timestamp, now);
            }
            Ok(InboundMessage::Progress(events)) => {
                for event in &events {
                    if let ProgressEvent::Unknown { kind } = event {
                        let err = SyncError::Protocol(
                            kind.clone().unwrap_or_else(|| "<untyped>".to_string()),
                        );
                        debug!(session_id = %self.session_id, error = %err, "ignoring event");
                        self.health.record_unrecognized(&err, now);
                    }
                }
                self.reconciler.apply_all(&events, now);
            }
        }

        self.publish();
        self.reconciler.state().status.is_terminal()
    }

    fn spawn_pong(&mut self, ping_timestamp: Option<f64>, now: DateTime<Utc>) {
        let acknowledger = Arc::clone(&self.acknowledger);
        let url = self.pong_url.clone();
        let ack_timeout = self.settings.ack_timeout;
        let ack_tx = self.ack_tx.clone();
        let request = PongRequest {
            ping_timestamp,
            timestamp: epoch_seconds(now),
        };

        self.pending_acks += 1;
        tokio::spawn(async move {
            let result = match timeout(ack_timeout, acknowledger.pong(&url, &request)).await {
                Ok(Ok(())) => Ok(Utc::now()),
                Ok(Err(err)) => Err(SyncError::Acknowledgement(format!("{err:#}"))),
                Err(_) => Err(SyncError::Acknowledgement(format!(
                    "no response within {ack_timeout:?}"
                ))),
            };
            // The session may already be gone; nothing is waiting for the outcome then.
            let _ = ack_tx.send(AckOutcome { result });
        });
    }

    fn on_ack(&mut self, outcome: AckOutcome) {
        self.pending_acks = self.pending_acks.saturating_sub(1);
        match outcome.result {
            Ok(at) => self.health.record_pong(at),
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "pong failed");
                self.health.record_ack_failure(&err, Utc::now());
            }
        }
        self.publish();
    }

    /// Waits up to one ack timeout for pongs still in flight so their outcome reaches
    /// health before the session closes.
    async fn drain_acks(&mut self) {
        let deadline = Instant::now() + self.settings.ack_timeout;
        while self.pending_acks > 0 {
            match timeout_at(deadline, self.ack_rx.recv()).await {
                Ok(Some(outcome)) => self.on_ack(outcome),
                Ok(None) | Err(_) => {
                    debug!(
                        session_id = %self.session_id,
                        pending = self.pending_acks,
                        "abandoning unfinished pongs"
                    );
                    break;
                }
            }
        }
    }

    fn on_stale(&mut self) {
        let err = SyncError::LivenessTimeout(self.settings.stale_after);
        warn!(session_id = %self.session_id, error = %err, "progress channel is stale");
        self.health.mark_stale(&err, Utc::now());
        self.publish();
    }

    fn publish(&mut self) {
        let content = SnapshotContent::project(self.reconciler.state(), &self.health);
        self.publisher.publish(content, Utc::now());
        self.health_tx.send_replace(self.health.clone());
    }
}

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Consumer side of one open session. Dropping it aborts the session task.
pub struct SessionHandle {
    session_id: SessionId,
    snapshots: watch::Receiver<Arc<ProgressSnapshot>>,
    health: watch::Receiver<ConnectionHealth>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<SessionState>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn snapshot(&self) -> Arc<ProgressSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ProgressSnapshot>> {
        self.snapshots.clone()
    }

    /// Current snapshot first, then every new version until the session ends.
    pub fn updates(&self) -> WatchStream<Arc<ProgressSnapshot>> {
        WatchStream::new(self.snapshots.clone())
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<ConnectionHealth> {
        self.health.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops processing, releases the channel and returns the final session state.
    pub async fn close(mut self) -> anyhow::Result<SessionState> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let task = self
            .task
            .take()
            .ok_or_else(|| anyhow!("session task already released"))?;
        task.await.context("session task failed")
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/connector_tests.rs"]
mod tests;
