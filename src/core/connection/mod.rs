//! Coordinator link: connect and register, heartbeat, serialized writes,
//! teardown and fixed-interval reconnect.

pub mod dispatch;
pub mod transport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::{AgentIdentity, Config, CoordinatorConfig};
use crate::core::protocol::{
    AGENT_TYPE, AgentMessage, ErrorMessage, HeartbeatMessage, QueryResult, RegisterMessage,
};

pub use dispatch::{Dispatcher, JobHandler};
pub use transport::{Dialer, FrameSink, FrameSource, TransportError, WebSocketDialer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registered,
    Active,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Registered => "registered",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Outbound frames other than registration are only legal once registered.
    pub fn accepts_writes(&self) -> bool {
        matches!(self, Self::Registered | Self::Active)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State and write half shared by the manager and every outbox handle.
struct Link {
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<Box<dyn FrameSink>>>,
    write_timeout: Duration,
}

impl Link {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Connection state {} -> {}", current, next);
            *current = next;
            true
        });
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

/// Cloneable handle for sending frames to the coordinator. All writers share
/// one lock, so frames never interleave. Sends while disconnected are
/// dropped silently.
#[derive(Clone)]
pub struct Outbox {
    link: Arc<Link>,
}

impl Outbox {
    pub async fn send(&self, message: &AgentMessage) -> Result<(), TransportError> {
        let frame = message
            .encode()
            .map_err(|e| TransportError::Send(format!("encode {}: {}", message.kind(), e)))?;

        let mut writer = self.link.writer.lock().await;
        if !self.link.state().accepts_writes() {
            debug!("Not connected, dropping {} frame", message.kind());
            return Ok(());
        }
        let Some(sink) = writer.as_mut() else {
            return Ok(());
        };
        match tokio::time::timeout(self.link.write_timeout, sink.send(frame)).await {
            Ok(sent) => sent,
            Err(_) => {
                // Peer stopped reading. Drop the transport without a close
                // handshake so teardown and shutdown never wait on it.
                warn!(
                    "Write of {} frame stalled for {:?}, dropping connection",
                    message.kind(),
                    self.link.write_timeout
                );
                writer.take();
                self.link.set_state(ConnectionState::Disconnected);
                Err(TransportError::Send(format!(
                    "write timed out after {:?}",
                    self.link.write_timeout
                )))
            }
        }
    }

    pub async fn send_result(&self, result: QueryResult) {
        let request_id = result.request_id.clone();
        if let Err(e) = self.send(&AgentMessage::QueryResult(result)).await {
            error!("[{}] Failed to deliver query result: {}", request_id, e);
        }
    }

    pub async fn send_error(&self, request_id: Option<&str>, code: &str, message: &str) {
        let envelope = AgentMessage::Error(ErrorMessage {
            request_id: request_id.map(str::to_string),
            code: code.to_string(),
            message: message.to_string(),
        });
        if let Err(e) = self.send(&envelope).await {
            error!(
                "[{}] Failed to deliver {} error: {}",
                request_id.unwrap_or("-"),
                code,
                e
            );
        }
    }
}

struct Inner {
    identity: AgentIdentity,
    settings: CoordinatorConfig,
    dialer: Arc<dyn Dialer>,
    dispatcher: Dispatcher,
    link: Arc<Link>,
    /// Stop signal of the tasks owned by the current connection.
    session: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: &Config, dialer: Arc<dyn Dialer>, handler: Arc<dyn JobHandler>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let link = Arc::new(Link {
            state,
            writer: Mutex::new(None),
            write_timeout: config.coordinator.write_timeout,
        });
        let outbox = Outbox {
            link: Arc::clone(&link),
        };
        let dispatcher = Dispatcher::new(handler, config.limits.max_concurrent_queries, outbox);

        Self {
            inner: Arc::new(Inner {
                identity: config.agent.clone(),
                settings: config.coordinator.clone(),
                dialer,
                dispatcher,
                link,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.link.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().accepts_writes()
    }

    /// Jobs currently admitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.in_flight()
    }

    pub fn outbox(&self) -> Outbox {
        Outbox {
            link: Arc::clone(&self.inner.link),
        }
    }

    pub async fn send_result(&self, result: QueryResult) {
        self.outbox().send_result(result).await
    }

    pub async fn send_error(&self, request_id: Option<&str>, code: &str, message: &str) {
        self.outbox().send_error(request_id, code, message).await
    }

    /// Dials, registers and starts the reader and heartbeat tasks.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        let url = inner.settings.url.as_str();

        let (mut sink, source) = match inner.dialer.dial(url).await {
            Ok(link) => link,
            Err(e) => {
                inner.link.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        inner.link.set_state(ConnectionState::Connecting);

        let register = AgentMessage::Register(RegisterMessage {
            agent_id: inner.identity.id.clone(),
            agent_name: inner.identity.name.clone(),
            agent_type: AGENT_TYPE.to_string(),
            token: inner.identity.token.clone(),
        });
        let write_timeout = inner.link.write_timeout;
        let sent = match register.encode() {
            Ok(frame) => match tokio::time::timeout(write_timeout, sink.send(frame)).await {
                Ok(sent) => sent,
                Err(_) => Err(TransportError::Send(format!(
                    "registration write timed out after {write_timeout:?}"
                ))),
            },
            Err(e) => Err(TransportError::Send(e.to_string())),
        };
        if let Err(e) = sent {
            let _ = tokio::time::timeout(write_timeout, sink.close()).await;
            inner.link.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let token = CancellationToken::new();
        {
            let mut session = inner.session.lock().await;
            if let Some(previous) = session.replace(token.clone()) {
                previous.cancel();
            }
            let mut writer = inner.link.writer.lock().await;
            if let Some(mut stale) = writer.replace(sink) {
                let _ = tokio::time::timeout(write_timeout, stale.close()).await;
            }
            inner.link.set_state(ConnectionState::Registered);
        }

        tokio::spawn(self.clone().read_loop(source, token.clone()));
        tokio::spawn(self.clone().heartbeat_loop(token.clone()));

        {
            let _session = inner.session.lock().await;
            if !token.is_cancelled() {
                inner.link.set_state(ConnectionState::Active);
            }
        }
        info!("[{}] Connected to coordinator at {}", inner.identity.id, url);
        Ok(())
    }

    /// Idempotent. Stops the connection's tasks and closes the transport.
    pub async fn close(&self) {
        self.teardown(None).await;
    }

    /// Retries `connect` every `reconnect_interval` until it succeeds.
    pub async fn reconnect(&self) {
        let interval = self.inner.settings.reconnect_interval;
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            self.inner.link.set_state(ConnectionState::Reconnecting);
            tokio::time::sleep(interval).await;
            match self.connect().await {
                Ok(()) => {
                    info!("Reconnected on attempt {}", attempt);
                    return;
                }
                Err(e) => warn!(
                    "Reconnect attempt {} failed: {}, retrying in {:?}",
                    attempt, e, interval
                ),
            }
        }
    }

    /// Keeps the agent connected until `shutdown` fires, then closes.
    pub async fn run(&self, shutdown: CancellationToken) {
        if let Err(e) = self.connect().await {
            warn!("Initial connection failed: {}", e);
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.disconnected() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.reconnect() => {}
            }
        }
        info!("Shutting down coordinator connection");
        self.close().await;
    }

    async fn disconnected(&self) {
        let mut state = self.subscribe();
        let _ = state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await;
    }

    /// Tears the current connection down. With `owner` set, only if that
    /// token still belongs to the live connection.
    async fn teardown(&self, owner: Option<&CancellationToken>) {
        let mut session = self.inner.session.lock().await;
        if owner.is_some_and(|token| token.is_cancelled()) {
            return;
        }
        if let Some(token) = session.take() {
            token.cancel();
        }

        let mut writer = self.inner.link.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            match tokio::time::timeout(self.inner.link.write_timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Closing coordinator transport: {}", e),
                Err(_) => debug!("Closing coordinator transport timed out"),
            }
        }
        self.inner.link.set_state(ConnectionState::Disconnected);
    }

    async fn read_loop(self, mut source: Box<dyn FrameSource>, token: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return,
                next = source.next() => next,
            };
            match next {
                Some(Ok(frame)) => self.inner.dispatcher.dispatch(&frame).await,
                Some(Err(e)) => {
                    warn!("Coordinator connection lost: {}", e);
                    break;
                }
                None => {
                    info!("Coordinator closed the connection");
                    break;
                }
            }
        }
        self.teardown(Some(&token)).await;
    }

    async fn heartbeat_loop(self, token: CancellationToken) {
        let period = self.inner.settings.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let outbox = self.outbox();
        let mut last = 0i64;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            last = chrono::Utc::now().timestamp().max(last);
            let beat = AgentMessage::Heartbeat(HeartbeatMessage {
                agent_id: self.inner.identity.id.clone(),
                timestamp: last,
            });
            if let Err(e) = outbox.send(&beat).await {
                warn!("Heartbeat failed: {}", e);
            }
        }
    }
}
