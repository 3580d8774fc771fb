use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use pulsedesk_sdk::realtime::client::{ConnectionState, RealtimeClient};
use pulsedesk_sdk::realtime::proto::{EventEnvelope, WILDCARD};
use pulsedesk_sdk::retry::ReconnectPolicy;
use pulsedesk_sdk::session_api::SessionCheck;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-connection server behavior; invoked with the 0-based connection index.
type ConnScript = Arc<dyn Fn(usize, WebSocket) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
struct WsServerState {
    connections: Arc<AtomicUsize>,
    script: ConnScript,
}

struct RealtimeServer {
    url: String,
    connections: Arc<AtomicUsize>,
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl RealtimeServer {
    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = timeout(Duration::from_secs(3), self.task).await;
    }
}

async fn ws_handler(State(state): State<WsServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let index = state.connections.fetch_add(1, Ordering::SeqCst);
    let script = Arc::clone(&state.script);
    ws.on_upgrade(move |socket| script(index, socket))
}

async fn spawn_realtime_server(script: ConnScript) -> RealtimeServer {
    let connections = Arc::new(AtomicUsize::new(0));
    let state = WsServerState {
        connections: Arc::clone(&connections),
        script,
    };
    let app = Router::new()
        .route("/realtime", get(ws_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });

    RealtimeServer {
        url: format!("ws://{addr}/realtime"),
        connections,
        shutdown_tx,
        task,
    }
}

struct StaticSession(bool);

#[async_trait]
impl SessionCheck for StaticSession {
    async fn is_authenticated(&self) -> bool {
        self.0
    }
}

fn authenticated_session() -> Arc<dyn SessionCheck> {
    Arc::new(StaticSession(true))
}

fn test_client(url: &str) -> RealtimeClient {
    RealtimeClient::new()
        .with_endpoint(url)
        .with_reconnect_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(40),
            max_attempts: 5,
        })
        .with_keepalive_interval(Duration::from_millis(50))
}

async fn expect_auth(socket: &mut WebSocket) -> Value {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text).expect("auth message should be json");
            }
            Some(Ok(Message::Close(_))) | None => panic!("socket closed before auth message"),
            Some(Ok(_)) => {}
            Some(Err(err)) => panic!("websocket receive error before auth: {err}"),
        }
    }
}

async fn send_text(socket: &mut WebSocket, text: impl Into<String>) {
    socket
        .send(Message::Text(text.into()))
        .await
        .expect("send text frame");
}

async fn send_established(socket: &mut WebSocket, tenant: &str) {
    let payload = json!({"type": "connection.established", "tenant_id": tenant}).to_string();
    send_text(socket, payload).await;
}

async fn close_with(socket: &mut WebSocket, code: u16) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: "scripted close".into(),
        })))
        .await;
}

fn envelope_json(event: &str, tenant: &str) -> String {
    json!({
        "type": event,
        "tenant_id": tenant,
        "data": {"id": 1},
        "timestamp": "2026-08-07T10:00:00Z",
    })
    .to_string()
}

/// Serves an established connection: forwards frames queued by the test and
/// answers keepalive probes until the peer goes away.
async fn serve_established(
    mut socket: WebSocket,
    tenant: &str,
    cmd_rx: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    pings: Arc<AtomicUsize>,
) {
    let auth = expect_auth(&mut socket).await;
    assert_eq!(auth["token"], "");
    send_established(&mut socket, tenant).await;

    let mut cmd_rx = cmd_rx.lock().await;
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(message) => {
                    if socket.send(message).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    pings.fetch_add(1, Ordering::SeqCst);
                    if socket.send(Message::Text("pong".to_string())).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            }
        }
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn subscribe_into_channel(
    handle: &pulsedesk_sdk::realtime::client::RealtimeHandle,
    event: &str,
) -> (
    pulsedesk_sdk::realtime::registry::Subscription,
    mpsc::UnboundedReceiver<EventEnvelope>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = handle.subscribe(event, move |envelope: &EventEnvelope| {
        let _ = tx.send(envelope.clone());
    });
    (subscription, rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binds_scope_and_dispatches_to_exact_and_wildcard() {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Message>();
    let cmd_rx = Arc::new(Mutex::new(cmd_rx));
    let pings = Arc::new(AtomicUsize::new(0));

    let script: ConnScript = {
        let pings = Arc::clone(&pings);
        Arc::new(move |_, socket| {
            let cmd_rx = Arc::clone(&cmd_rx);
            let pings = Arc::clone(&pings);
            async move { serve_established(socket, "T1", cmd_rx, pings).await }.boxed()
        })
    };
    let server = spawn_realtime_server(script).await;

    let handle = test_client(&server.url).start(authenticated_session());
    let (_exact_sub, mut exact_rx) = subscribe_into_channel(&handle, "quote.updated");
    let (_wild_sub, mut wild_rx) = subscribe_into_channel(&handle, WILDCARD);

    wait_until("connection to establish", || handle.is_connected()).await;
    assert_eq!(handle.bound_scope().as_deref(), Some("T1"));
    assert_eq!(handle.state(), ConnectionState::Open);

    cmd_tx
        .send(Message::Text(envelope_json("quote.updated", "T1")))
        .expect("queue envelope");

    let delivered = timeout(RECV_TIMEOUT, exact_rx.recv())
        .await
        .expect("exact subscriber should receive the envelope")
        .expect("exact channel open");
    assert_eq!(delivered.event, "quote.updated");
    assert_eq!(delivered.tenant_id.as_deref(), Some("T1"));

    let mirrored = timeout(RECV_TIMEOUT, wild_rx.recv())
        .await
        .expect("wildcard subscriber should receive the envelope")
        .expect("wildcard channel open");
    assert_eq!(mirrored.event, "quote.updated");

    handle.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_tenant_control_and_malformed_frames_are_never_dispatched() {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Message>();
    let cmd_rx = Arc::new(Mutex::new(cmd_rx));
    let pings = Arc::new(AtomicUsize::new(0));

    let script: ConnScript = {
        let pings = Arc::clone(&pings);
        Arc::new(move |_, socket| {
            let cmd_rx = Arc::clone(&cmd_rx);
            let pings = Arc::clone(&pings);
            async move { serve_established(socket, "T1", cmd_rx, pings).await }.boxed()
        })
    };
    let server = spawn_realtime_server(script).await;

    let handle = test_client(&server.url).start(authenticated_session());
    let (_wild_sub, mut wild_rx) = subscribe_into_channel(&handle, WILDCARD);

    wait_until("connection to establish", || handle.is_connected()).await;

    // None of these may reach a subscriber, wildcard included.
    for frame in [
        envelope_json("order.updated", "T2"),
        "pong".to_string(),
        "{not json".to_string(),
        json!({"type": "error", "message": "channel rejected"}).to_string(),
    ] {
        cmd_tx.send(Message::Text(frame)).expect("queue frame");
    }
    cmd_tx
        .send(Message::Text(envelope_json("marker.event", "T1")))
        .expect("queue marker");

    let delivered = timeout(RECV_TIMEOUT, wild_rx.recv())
        .await
        .expect("marker should arrive")
        .expect("wildcard channel open");
    assert_eq!(delivered.event, "marker.event");
    assert!(
        wild_rx.try_recv().is_err(),
        "only the marker may be dispatched"
    );

    // The connection survived the malformed frame and the error notice.
    assert!(handle.is_connected());

    handle.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribed_callback_stops_receiving() {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Message>();
    let cmd_rx = Arc::new(Mutex::new(cmd_rx));
    let pings = Arc::new(AtomicUsize::new(0));

    let script: ConnScript = {
        let pings = Arc::clone(&pings);
        Arc::new(move |_, socket| {
            let cmd_rx = Arc::clone(&cmd_rx);
            let pings = Arc::clone(&pings);
            async move { serve_established(socket, "T1", cmd_rx, pings).await }.boxed()
        })
    };
    let server = spawn_realtime_server(script).await;

    let handle = test_client(&server.url).start(authenticated_session());
    let (exact_sub, mut exact_rx) = subscribe_into_channel(&handle, "ticket.assigned");
    let (_wild_sub, mut wild_rx) = subscribe_into_channel(&handle, WILDCARD);

    wait_until("connection to establish", || handle.is_connected()).await;

    cmd_tx
        .send(Message::Text(envelope_json("ticket.assigned", "T1")))
        .expect("queue envelope");
    timeout(RECV_TIMEOUT, exact_rx.recv())
        .await
        .expect("subscriber should receive the first envelope")
        .expect("exact channel open");
    timeout(RECV_TIMEOUT, wild_rx.recv())
        .await
        .expect("wildcard keeps pace")
        .expect("wildcard channel open");

    assert!(handle.unsubscribe(&exact_sub));
    assert!(!handle.unsubscribe(&exact_sub));

    cmd_tx
        .send(Message::Text(envelope_json("ticket.assigned", "T1")))
        .expect("queue envelope");
    timeout(RECV_TIMEOUT, wild_rx.recv())
        .await
        .expect("wildcard still receives")
        .expect("wildcard channel open");
    assert!(
        exact_rx.try_recv().is_err(),
        "unsubscribed callback must not be invoked"
    );

    handle.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auth_message_carries_configured_token() {
    let (observed_tx, observed_rx) = oneshot::channel::<Value>();
    let observed_tx = Arc::new(Mutex::new(Some(observed_tx)));

    let script: ConnScript = Arc::new(move |_, mut socket| {
        let observed_tx = Arc::clone(&observed_tx);
        async move {
            let auth = expect_auth(&mut socket).await;
            if let Some(tx) = observed_tx.lock().await.take() {
                let _ = tx.send(auth);
            }
            send_established(&mut socket, "T1").await;
            while let Some(Ok(frame)) = socket.recv().await {
                if matches!(frame, Message::Close(_)) {
                    return;
                }
            }
        }
        .boxed()
    });
    let server = spawn_realtime_server(script).await;

    let client = test_client(&server.url)
        .with_token(secrecy::SecretString::new("bearer-sekrit".to_string()));
    let handle = client.start(authenticated_session());

    let auth = timeout(RECV_TIMEOUT, observed_rx)
        .await
        .expect("auth message should arrive")
        .expect("observation channel open");
    assert_eq!(auth, json!({"type": "auth", "token": "bearer-sekrit"}));

    wait_until("connection to establish", || handle.is_connected()).await;
    handle.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn normal_close_suppresses_reconnect() {
    let script: ConnScript = Arc::new(|_, mut socket| {
        async move {
            let _ = expect_auth(&mut socket).await;
            send_established(&mut socket, "T1").await;
            close_with(&mut socket, close_code::NORMAL).await;
        }
        .boxed()
    });
    let server = spawn_realtime_server(script).await;

    // Long keepalive so the close frame is processed before any probe.
    let handle = test_client(&server.url)
        .with_keepalive_interval(Duration::from_secs(10))
        .start(authenticated_session());

    wait_until("connection to close", || {
        handle.state() == ConnectionState::Closed
    })
    .await;

    // Several backoff periods; no new attempt may be scheduled.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(server.connection_count(), 1);
    assert!(!handle.is_connected());

    handle.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abnormal_close_triggers_reconnect_until_established() {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Message>();
    let cmd_rx = Arc::new(Mutex::new(cmd_rx));
    let pings = Arc::new(AtomicUsize::new(0));

    let script: ConnScript = {
        let pings = Arc::clone(&pings);
        Arc::new(move |index, mut socket| {
            let cmd_rx = Arc::clone(&cmd_rx);
            let pings = Arc::clone(&pings);
            async move {
                if index == 0 {
                    let _ = expect_auth(&mut socket).await;
                    close_with(&mut socket, close_code::ERROR).await;
                    return;
                }
                serve_established(socket, "T1", cmd_rx, pings).await;
            }
            .boxed()
        })
    };
    let server = spawn_realtime_server(script).await;

    let handle = test_client(&server.url).start(authenticated_session());

    wait_until("reconnect to establish", || handle.is_connected()).await;
    assert_eq!(server.connection_count(), 2);
    assert_eq!(handle.bound_scope().as_deref(), Some("T1"));

    handle.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_gives_up_at_attempt_ceiling() {
    let script: ConnScript = Arc::new(|_, mut socket| {
        async move {
            let _ = expect_auth(&mut socket).await;
            close_with(&mut socket, close_code::ERROR).await;
        }
        .boxed()
    });
    let server = spawn_realtime_server(script).await;

    let client = RealtimeClient::new()
        .with_endpoint(server.url.as_str())
        .with_reconnect_policy(ReconnectPolicy {
            base_delay: Duration::from_millis(30),
            max_attempts: 3,
        })
        .with_keepalive_interval(Duration::from_millis(50));
    let handle = client.start(authenticated_session());

    wait_until("attempt ceiling to be reached", || {
        server.connection_count() == 3
    })
    .await;

    // Give a would-be fourth attempt ample time, then confirm it never came.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connection_count(), 3);
    assert!(!handle.is_connected());
    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(handle.bound_scope(), None);

    handle.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthenticated_session_skips_connection() {
    let script: ConnScript = Arc::new(|_, _socket| async move {}.boxed());
    let server = spawn_realtime_server(script).await;

    let handle = test_client(&server.url).start(Arc::new(StaticSession(false)));

    wait_until("worker to settle", || {
        handle.state() == ConnectionState::Idle
    })
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(server.connection_count(), 0);
    assert!(!handle.is_connected());

    handle.close().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keepalive_probes_flow_without_reaching_subscribers() {
    let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Message>();
    let cmd_rx = Arc::new(Mutex::new(cmd_rx));
    let pings = Arc::new(AtomicUsize::new(0));

    let script: ConnScript = {
        let pings = Arc::clone(&pings);
        Arc::new(move |_, socket| {
            let cmd_rx = Arc::clone(&cmd_rx);
            let pings = Arc::clone(&pings);
            async move { serve_established(socket, "T1", cmd_rx, pings).await }.boxed()
        })
    };
    let server = spawn_realtime_server(script).await;

    let handle = test_client(&server.url).start(authenticated_session());
    let (_wild_sub, mut wild_rx) = subscribe_into_channel(&handle, WILDCARD);

    wait_until("connection to establish", || handle.is_connected()).await;
    let observed_pings = Arc::clone(&pings);
    wait_until("keepalive probes to flow", || {
        observed_pings.load(Ordering::SeqCst) >= 2
    })
    .await;

    assert!(
        wild_rx.try_recv().is_err(),
        "keepalive traffic must not be dispatched"
    );
    assert!(handle.is_connected());

    handle.close().await;
    server.stop().await;
}
