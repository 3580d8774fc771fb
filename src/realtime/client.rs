//! Realtime websocket client.
//!
//! The client owns one physical connection at a time inside a background
//! worker task: it authenticates the connection after open, keeps it alive
//! with text-frame probes, reconnects with linear backoff after abnormal
//! closes, and fans inbound events out to the subscriber registry.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::realtime::proto::{ClientMessage, EventEnvelope, ServerMessage, PING_FRAME, PONG_FRAME};
use crate::realtime::registry::{SubscriberRegistry, Subscription};
use crate::retry::ReconnectPolicy;
use crate::session_api::SessionCheck;

/// Endpoint used when neither an explicit realtime endpoint nor an API base
/// address is configured: the local realtime service on its well-known port.
pub const FALLBACK_ENDPOINT: &str = "ws://localhost:6001";

/// Interval between keepalive probes while the connection is open.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle state of the realtime connection.
///
/// Exactly one physical connection is current at any time; the state always
/// refers to that connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No connection and no attempt in flight.
    Idle,
    /// Session check and transport handshake in progress.
    Connecting,
    /// Transport open, waiting for the establishment acknowledgment.
    Authenticating,
    /// Acknowledged and ready for event traffic.
    Open,
    /// Local teardown in progress.
    Closing,
    /// Connection gone; a reconnect may or may not be scheduled.
    Closed,
}

/// Entry point for starting realtime connections.
#[derive(Clone)]
pub struct RealtimeClient {
    token: Option<SecretString>,
    endpoint_override: Option<String>,
    api_base_url: Option<String>,
    reconnect: ReconnectPolicy,
    keepalive_interval: Duration,
}

impl Default for RealtimeClient {
    fn default() -> Self {
        Self {
            token: None,
            endpoint_override: None,
            api_base_url: None,
            reconnect: ReconnectPolicy::default(),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

impl RealtimeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the credential carried in the post-open auth message.
    ///
    /// Without a token the auth message carries an empty credential and the
    /// server falls back to the ambient credential sent with the handshake.
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Sets an explicit realtime endpoint.
    ///
    /// Takes precedence over the address derived from the API base URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into().trim().to_string());
        self
    }

    /// Sets the ordinary API base address the realtime endpoint is derived
    /// from when no explicit endpoint is configured (`https` becomes `wss`,
    /// `http` becomes `ws`).
    pub fn with_api_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api_base_url = Some(base_url.into().trim().to_string());
        self
    }

    /// Overrides the reconnect backoff schedule.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Overrides the keepalive probe interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    fn endpoint(&self) -> String {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint.to_string();
        }
        if let Some(derived) = self.api_base_url.as_deref().and_then(derive_ws_endpoint) {
            return derived;
        }
        FALLBACK_ENDPOINT.to_string()
    }

    /// Starts the connection worker and returns its handle.
    ///
    /// The worker attempts a connection immediately. `session` is consulted
    /// once per connection attempt; when it reports no authenticated
    /// session, the attempt is skipped without opening a socket.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, session: Arc<dyn SessionCheck>) -> RealtimeHandle {
        let registry = Arc::new(SubscriberRegistry::new());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(SharedState {
            state_tx,
            scope: RwLock::new(None),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = tokio::spawn(realtime_worker(WorkerContext {
            endpoint: self.endpoint(),
            token: self.token.clone(),
            reconnect: self.reconnect,
            keepalive_interval: self.keepalive_interval,
            session,
            registry: Arc::clone(&registry),
            shared: Arc::clone(&shared),
            shutdown_rx,
        }));

        RealtimeHandle {
            registry,
            shared,
            state_rx,
            shutdown_tx,
            worker,
        }
    }
}

/// Derives a websocket address from an HTTP base address by substituting
/// the scheme. Addresses that are already websocket addresses pass through.
fn derive_ws_endpoint(base_url: &str) -> Option<String> {
    let base = base_url.trim().trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    if let Some(rest) = base.strip_prefix("http://") {
        return Some(format!("ws://{rest}"));
    }
    if base.starts_with("wss://") || base.starts_with("ws://") {
        return Some(base.to_string());
    }
    None
}

/// Handle to a running realtime connection worker.
///
/// Subscriptions are owned by the application, not the connection: they
/// survive reconnects. Dropping the handle (or calling [`close`]) tears the
/// worker down, cancelling any pending reconnect and closing the transport
/// with a normal-status close.
///
/// [`close`]: RealtimeHandle::close
pub struct RealtimeHandle {
    registry: Arc<SubscriberRegistry>,
    shared: Arc<SharedState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl RealtimeHandle {
    /// Registers `callback` for envelopes of type `event` (or the `*`
    /// wildcard) and returns the handle that deregisters it.
    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        self.registry.subscribe(event, callback)
    }

    /// Removes the registration identified by `subscription`.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.registry.unsubscribe(subscription)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Whether the connection is established and ready for event traffic.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Tenant scope the current connection is bound to, if established.
    pub fn bound_scope(&self) -> Option<String> {
        self.shared.bound_scope()
    }

    /// Returns a watcher over lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Tears the worker down and waits for it to finish.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.worker.await;
    }
}

struct SharedState {
    state_tx: watch::Sender<ConnectionState>,
    scope: RwLock<Option<String>>,
}

impl SharedState {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    fn bind_scope(&self, tenant_id: String) {
        if let Ok(mut guard) = self.scope.write() {
            *guard = Some(tenant_id);
        }
    }

    fn clear_scope(&self) {
        if let Ok(mut guard) = self.scope.write() {
            *guard = None;
        }
    }

    fn bound_scope(&self) -> Option<String> {
        self.scope.read().ok().and_then(|guard| guard.clone())
    }
}

struct WorkerContext {
    endpoint: String,
    token: Option<SecretString>,
    reconnect: ReconnectPolicy,
    keepalive_interval: Duration,
    session: Arc<dyn SessionCheck>,
    registry: Arc<SubscriberRegistry>,
    shared: Arc<SharedState>,
    shutdown_rx: watch::Receiver<bool>,
}

enum ConnectionOutcome {
    /// Local teardown was requested.
    Shutdown,
    /// Peer closed with the normal status code; reconnect is suppressed.
    NormalClosure,
    /// Any other close, including failed connection attempts.
    Abnormal,
}

async fn realtime_worker(ctx: WorkerContext) {
    let WorkerContext {
        endpoint,
        token,
        reconnect,
        keepalive_interval,
        session,
        registry,
        shared,
        mut shutdown_rx,
    } = ctx;

    // Attempts made so far. Incremented on every abnormal close, reset only
    // once the establishment ack arrives.
    let mut attempts: u32 = 0;

    loop {
        shared.clear_scope();
        shared.set_state(ConnectionState::Connecting);

        let authenticated = tokio::select! {
            authenticated = session.is_authenticated() => authenticated,
            _ = shutdown_rx.changed() => {
                shared.set_state(ConnectionState::Closed);
                return;
            }
        };
        if !authenticated {
            debug!(event = "realtime_connect_skipped", reason = "unauthenticated");
            shared.set_state(ConnectionState::Idle);
            return;
        }

        let outcome = run_connection(
            &endpoint,
            token.as_ref(),
            keepalive_interval,
            &registry,
            &shared,
            &mut shutdown_rx,
            &mut attempts,
        )
        .await;

        shared.clear_scope();
        shared.set_state(ConnectionState::Closed);

        match outcome {
            ConnectionOutcome::Shutdown | ConnectionOutcome::NormalClosure => return,
            ConnectionOutcome::Abnormal => {
                attempts += 1;
                if reconnect.exhausted(attempts) {
                    warn!(event = "realtime_reconnect_exhausted", attempts);
                    return;
                }

                let delay = reconnect.delay_for_attempt(attempts);
                debug!(
                    event = "realtime_reconnect_scheduled",
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => return,
                }
            }
        }
    }
}

/// Runs one physical connection from transport handshake to close.
///
/// The keepalive interval lives in this frame, so it can never outlive or
/// fire against a superseded connection.
async fn run_connection(
    endpoint: &str,
    token: Option<&SecretString>,
    keepalive_interval: Duration,
    registry: &SubscriberRegistry,
    shared: &SharedState,
    shutdown_rx: &mut watch::Receiver<bool>,
    attempts: &mut u32,
) -> ConnectionOutcome {
    let connected = tokio::select! {
        connected = connect_async(endpoint) => connected,
        _ = shutdown_rx.changed() => return ConnectionOutcome::Shutdown,
    };
    let (mut socket, _) = match connected {
        Ok(pair) => pair,
        Err(err) => {
            debug!(event = "realtime_connect_failed", error = %err);
            return ConnectionOutcome::Abnormal;
        }
    };

    shared.set_state(ConnectionState::Authenticating);

    // The transport handshake cannot carry the credential, so it rides in
    // the first application frame; empty means "use the ambient credential".
    let auth = ClientMessage::Auth {
        token: token
            .map(|token| token.expose_secret().clone())
            .unwrap_or_default(),
    };
    let payload = match auth.to_text() {
        Ok(payload) => payload,
        Err(err) => {
            warn!(event = "realtime_auth_encode_failed", error = %err);
            let _ = socket.close(None).await;
            return ConnectionOutcome::Abnormal;
        }
    };
    if let Err(err) = socket.send(Message::Text(payload)).await {
        debug!(event = "realtime_auth_send_failed", error = %err);
        let _ = socket.close(None).await;
        return ConnectionOutcome::Abnormal;
    }

    let mut keepalive = tokio::time::interval(keepalive_interval);
    let mut established = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                shared.set_state(ConnectionState::Closing);
                let _ = socket
                    .close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client shutdown".into(),
                    }))
                    .await;
                return ConnectionOutcome::Shutdown;
            }
            _ = keepalive.tick(), if established => {
                if socket.send(Message::Text(PING_FRAME.to_string())).await.is_err() {
                    return ConnectionOutcome::Abnormal;
                }
            }
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if text.as_str() == PONG_FRAME {
                        continue;
                    }
                    match ServerMessage::from_text(&text) {
                        Ok(ServerMessage::Established { tenant_id }) => {
                            debug!(event = "realtime_established", tenant_id = %tenant_id);
                            shared.bind_scope(tenant_id);
                            *attempts = 0;
                            established = true;
                            keepalive.reset();
                            shared.set_state(ConnectionState::Open);
                        }
                        Ok(ServerMessage::Error { message }) => {
                            warn!(event = "realtime_server_error", message = %message);
                        }
                        Ok(ServerMessage::Event(envelope)) => {
                            deliver(registry, shared, established, &envelope);
                        }
                        Err(err) => {
                            debug!(event = "realtime_malformed_payload", error = %err);
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        return ConnectionOutcome::Abnormal;
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame
                        .as_ref()
                        .is_some_and(|frame| frame.code == CloseCode::Normal);
                    debug!(event = "realtime_closed_by_peer", normal);
                    return if normal {
                        ConnectionOutcome::NormalClosure
                    } else {
                        ConnectionOutcome::Abnormal
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(event = "realtime_transport_error", error = %err);
                    return ConnectionOutcome::Abnormal;
                }
                None => return ConnectionOutcome::Abnormal,
            }
        }
    }
}

fn deliver(
    registry: &SubscriberRegistry,
    shared: &SharedState,
    established: bool,
    envelope: &EventEnvelope,
) {
    if !established {
        debug!(event = "realtime_event_before_ack", event_type = %envelope.event);
        return;
    }

    let bound = shared.bound_scope();
    if let (Some(declared), Some(bound)) = (envelope.tenant_id.as_deref(), bound.as_deref()) {
        if declared != bound {
            debug!(
                event = "realtime_scope_mismatch",
                event_type = %envelope.event,
                declared = %declared
            );
            return;
        }
    }

    registry.dispatch(envelope);
}
