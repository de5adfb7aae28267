//! The auth socket: one shared connection carrying correlated requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use connectsuite_shared::{ClientError, Envelope};
use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::correlator::RequestCorrelator;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Callback for envelopes that are not replies to a pending request
pub type UnsolicitedHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Connection state for the socket
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// How hard `connect()` tries before giving up
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Extra attempts after the first failure (0 = fail immediately)
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u32,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u32,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> u32 {
        let delay = self.initial_delay_ms as f32 * self.backoff_multiplier.powi(attempt as i32);
        (delay as u32).min(self.max_delay_ms)
    }
}

/// Per-call request settings
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Sent in the envelope's `session_id`
    pub session_id: Option<String>,
    /// Overrides the channel's default timeout
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Anything that can carry a correlated request and return its reply.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request_with(
        &self,
        kind: &str,
        payload: Value,
        options: RequestOptions,
    ) -> Result<Value, ClientError>;
}

struct Shared {
    correlator: RequestCorrelator,
    handlers: HashMap<String, UnsolicitedHandler>,
    outbound: Option<UnboundedSender<Envelope>>,
    /// Bumped on every attach and teardown so a stale read task cannot tear
    /// down its successor.
    generation: u64,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A persistent socket to the auth server with request/reply correlation.
pub struct ConnectionChannel {
    url: String,
    reconnect_config: ReconnectConfig,
    default_timeout: Option<Duration>,
    shared: Arc<Mutex<Shared>>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Serializes open attempts so concurrent callers share one
    connect_lock: tokio::sync::Mutex<()>,
}

impl ConnectionChannel {
    pub fn new(url: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            reconnect_config: ReconnectConfig::default(),
            default_timeout: None,
            shared: Arc::new(Mutex::new(Shared {
                correlator: RequestCorrelator::new(),
                handlers: HashMap::new(),
                outbound: None,
                generation: 0,
            })),
            state: Arc::new(state),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect_config = config;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared)
            .outbound
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared).correlator.pending_count()
    }

    /// Open the socket if it is not open already.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_open() {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().await;
        if self.is_open() {
            return Ok(());
        }

        // A disconnect() while the handshake is in flight bumps this.
        let generation = lock(&self.shared).generation;
        let mut attempt = 0u32;
        loop {
            if attempt == 0 {
                self.state.send_replace(ConnectionState::Connecting);
            } else {
                self.state
                    .send_replace(ConnectionState::Reconnecting { attempt });
            }

            match connect_async(self.url.as_str()).await {
                Ok((socket, _response)) => {
                    if let Err(e) = self.attach(socket, generation) {
                        crate::log_info!("Socket to {} opened after teardown, closing it", self.url);
                        self.state.send_replace(ConnectionState::Disconnected);
                        return Err(e);
                    }
                    self.state.send_replace(ConnectionState::Connected);
                    crate::log_info!("Socket connected to {}", self.url);
                    return Ok(());
                }
                Err(e) => {
                    crate::log_error!("Socket error for {}: {}", self.url, e);

                    if attempt >= self.reconnect_config.max_attempts {
                        let reason = format!("failed to connect to {}: {}", self.url, e);
                        self.state.send_replace(ConnectionState::Failed {
                            reason: reason.clone(),
                        });
                        return Err(ClientError::Network(reason));
                    }

                    let delay = self.reconnect_config.delay_for_attempt(attempt);
                    crate::log_info!(
                        "Reconnecting to {} in {}ms (attempt {})",
                        self.url,
                        delay,
                        attempt + 1
                    );
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Send a request and wait for its correlated reply.
    pub async fn request(&self, kind: &str, payload: Value) -> Result<Value, ClientError> {
        self.send_request(kind, payload, RequestOptions::default())
            .await
    }

    async fn send_request(
        &self,
        kind: &str,
        payload: Value,
        options: RequestOptions,
    ) -> Result<Value, ClientError> {
        self.connect().await?;

        let correlation_id = RequestCorrelator::next_id(kind);
        let mut envelope = Envelope::request(kind, payload, &correlation_id);
        if let Some(session_id) = options.session_id {
            envelope = envelope.with_session(session_id);
        }

        let reply = {
            let mut shared = lock(&self.shared);
            let Some(outbound) = shared.outbound.clone() else {
                return Err(ClientError::Network("socket is not connected".to_string()));
            };
            let reply = shared.correlator.register(correlation_id.clone())?;
            if let Err(e) = outbound.unbounded_send(envelope) {
                shared.correlator.cancel(&correlation_id);
                return Err(ClientError::Network(format!("failed to send: {}", e)));
            }
            reply
        };
        crate::log_debug!("Request '{}' sent as {}", kind, correlation_id);

        let waited = match options.timeout.or(self.default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(waited) => waited,
                Err(_) => {
                    lock(&self.shared).correlator.cancel(&correlation_id);
                    crate::log_warn!("Request {} timed out after {:?}", correlation_id, limit);
                    return Err(ClientError::Timeout(limit));
                }
            },
            None => reply.await,
        };

        waited.unwrap_or_else(|_| {
            Err(ClientError::Network(
                "request abandoned: channel dropped".to_string(),
            ))
        })
    }

    /// Register a handler for unsolicited envelopes of the given type.
    /// Replaces any previous handler for that type.
    pub fn on(&self, kind: impl Into<String>, handler: impl Fn(Envelope) + Send + Sync + 'static) {
        lock(&self.shared)
            .handlers
            .insert(kind.into(), Arc::new(handler));
    }

    pub fn off(&self, kind: &str) {
        lock(&self.shared).handlers.remove(kind);
    }

    /// Close the socket. Every pending request is rejected with a network
    /// error and the handler table is cleared.
    pub fn disconnect(&self) {
        let rejected = {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.outbound = None;
            shared.handlers.clear();
            shared
                .correlator
                .reject_all(ClientError::Network("connection torn down".to_string()))
        };
        self.state.send_replace(ConnectionState::Disconnected);
        crate::log_info!(
            "Socket to {} disconnected ({} pending rejected)",
            self.url,
            rejected
        );
    }

    /// Wire a freshly opened socket into the channel: one task drains the
    /// outbound queue, another reads and dispatches inbound envelopes.
    fn attach(&self, socket: Socket, expected_generation: u64) -> Result<(), ClientError> {
        let (mut write, mut read) = socket.split();
        let (outbound, mut queue) = unbounded::<Envelope>();

        let generation = install_outbound(&self.shared, expected_generation, outbound)?;

        // Write task
        let url_for_write = self.url.clone();
        tokio::spawn(async move {
            while let Some(envelope) = queue.next().await {
                match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        crate::log_debug!("Sending to {}: {}", url_for_write, json);
                        if let Err(e) = write.send(Message::text(json)).await {
                            crate::log_error!("Send failed: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        crate::log_error!("Serialize failed: {}", e);
                    }
                }
            }
            let _ = write.close().await;
            crate::log_debug!("Write task for {} stopped", url_for_write);
        });

        // Read task
        let shared = self.shared.clone();
        let state = self.state.clone();
        let url_for_read = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<Envelope>(text.as_str()) {
                            Ok(envelope) => dispatch_inbound(&shared, envelope),
                            Err(e) => crate::log_error!("Failed to parse envelope: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => {
                        crate::log_info!("Socket to {} received close frame", url_for_read);
                        break;
                    }
                    Ok(_) => {
                        // Ignore binary, ping, pong
                    }
                    Err(e) => {
                        crate::log_error!("Socket read error: {}", e);
                        break;
                    }
                }
            }
            on_closed(&shared, &state, generation);
        });
        Ok(())
    }
}

#[async_trait]
impl Requester for ConnectionChannel {
    async fn request_with(
        &self,
        kind: &str,
        payload: Value,
        options: RequestOptions,
    ) -> Result<Value, ClientError> {
        self.send_request(kind, payload, options).await
    }
}

impl Drop for ConnectionChannel {
    fn drop(&mut self) {
        let mut shared = lock(&self.shared);
        shared.generation += 1;
        shared.outbound = None;
        shared.handlers.clear();
        shared
            .correlator
            .reject_all(ClientError::Network("connection torn down".to_string()));
    }
}

/// Make `outbound` the live socket queue and return the new generation.
///
/// Anything still pending was sent on a socket that is now dead, so it is
/// rejected here rather than left for that socket's read task, whose
/// generation no longer matches. Fails if the channel was torn down since
/// `expected` was read.
fn install_outbound(
    shared: &Mutex<Shared>,
    expected: u64,
    outbound: UnboundedSender<Envelope>,
) -> Result<u64, ClientError> {
    let mut shared = lock(shared);
    if shared.generation != expected {
        return Err(ClientError::Network(
            "connection torn down while connecting".to_string(),
        ));
    }
    let stale = shared
        .correlator
        .reject_all(ClientError::Network("connection closed".to_string()));
    if stale > 0 {
        crate::log_info!("{} requests on the previous socket rejected", stale);
    }
    shared.generation += 1;
    shared.outbound = Some(outbound);
    Ok(shared.generation)
}

/// Replies settle their pending request; anything else goes to the handler
/// registered for its type, or is dropped.
fn dispatch_inbound(shared: &Mutex<Shared>, envelope: Envelope) {
    let handler = {
        let mut shared = lock(shared);
        if shared.correlator.settle(&envelope) {
            return;
        }
        shared.handlers.get(&envelope.kind).cloned()
    };

    match handler {
        Some(handler) => handler(envelope),
        None => crate::log_debug!("Dropping unsolicited '{}' envelope", envelope.kind),
    }
}

/// The remote side went away. Only the current connection may reset state.
fn on_closed(shared: &Mutex<Shared>, state: &watch::Sender<ConnectionState>, generation: u64) {
    let rejected = {
        let mut shared = lock(shared);
        if shared.generation != generation {
            return;
        }
        shared.outbound = None;
        shared
            .correlator
            .reject_all(ClientError::Network("connection closed".to_string()))
    };
    state.send_replace(ConnectionState::Disconnected);
    crate::log_info!("Socket closed ({} pending rejected)", rejected);
}
