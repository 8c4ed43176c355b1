use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{
    CONNECT_TIMEOUT, RECONNECT_ATTEMPTS, RECONNECT_DELAY_INITIAL, RECONNECT_DELAY_MAX,
};
use crate::error::{AppError, Result};
use crate::ws::messages::{
    decode_event, encode_event, ChannelEvent, EngineEndpoint, Frame, Handshake, RoomScope, Topic,
    NAMESPACE_CONNECT, NAMESPACE_DISCONNECT, PONG,
};
use crate::ws::transport::{self, Transport};
use crate::ws::RealtimeChannel;

pub type EventSink = mpsc::UnboundedSender<ChannelEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Connecting,
    Joined,
    Reconnecting,
    Disconnected,
}

impl ChannelState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ChannelState::Connecting | ChannelState::Joined | ChannelState::Reconnecting
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Reconnect attempts after the first failure; 0 disables reconnection.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Bound on a single connect + handshake.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RECONNECT_ATTEMPTS,
            initial_delay: RECONNECT_DELAY_INITIAL,
            max_delay: RECONNECT_DELAY_MAX,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delivery gate shared by a manager and its connection task. State changes
/// and dispatches from the task run under the gate's lock, so once `close`
/// returns the task can no longer reach a sink or the state.
#[derive(Clone)]
struct Gate(Arc<Mutex<bool>>);

impl Gate {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(true)))
    }

    fn close(&self, on_close: impl FnOnce()) {
        let mut open = lock(&self.0);
        *open = false;
        on_close();
    }

    fn with_open<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let open = lock(&self.0);
        if *open {
            Some(f())
        } else {
            None
        }
    }
}

struct Connection {
    gate: Gate,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One Socket.IO subscription, owned by a single view.
///
/// `connect` spawns the connection task unless one is already running, so a
/// manager never holds two sockets. `disconnect` is synchronous from the
/// caller's point of view: when it returns the state is `Disconnected` and no
/// further event reaches any sink. The task then closes the socket on its own.
pub struct ChannelManager {
    endpoint: EngineEndpoint,
    policy: ReconnectPolicy,
    sinks: Arc<Mutex<HashMap<Topic, EventSink>>>,
    state: Arc<watch::Sender<ChannelState>>,
    connection: Option<Connection>,
}

impl ChannelManager {
    pub fn new(endpoint: EngineEndpoint) -> Self {
        Self::with_policy(endpoint, ReconnectPolicy::default())
    }

    pub fn with_policy(endpoint: EngineEndpoint, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        Self {
            endpoint,
            policy,
            sinks: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(state),
            connection: None,
        }
    }

    pub fn state_watch(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }
}

impl RealtimeChannel for ChannelManager {
    fn connect(&mut self, scope: RoomScope) -> bool {
        if let Some(conn) = &self.connection {
            if !conn.task.is_finished() && self.state().is_active() {
                debug!(room = ?scope, "realtime already connected, reusing");
                return false;
            }
        }
        // Left over from a server disconnect or exhausted retries.
        if let Some(stale) = self.connection.take() {
            stale.gate.close(|| {});
            let _ = stale.shutdown.send(());
        }

        let gate = Gate::new();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.state.send_replace(ChannelState::Connecting);
        info!(endpoint = %self.endpoint, room = ?scope, "realtime connecting");

        let task = ConnectionTask {
            endpoint: self.endpoint.clone(),
            scope,
            policy: self.policy,
            sinks: Arc::clone(&self.sinks),
            state: Arc::clone(&self.state),
            gate: gate.clone(),
        };
        let handle = tokio::spawn(task.run(shutdown_rx));

        self.connection = Some(Connection {
            gate,
            shutdown: shutdown_tx,
            task: handle,
        });
        true
    }

    fn disconnect(&mut self) -> bool {
        let Some(conn) = self.connection.take() else {
            return false;
        };
        let state = &self.state;
        conn.gate.close(|| {
            state.send_replace(ChannelState::Disconnected);
        });
        let _ = conn.shutdown.send(());
        info!(endpoint = %self.endpoint, "realtime disconnected");
        true
    }

    fn subscribe(&mut self, topic: Topic, sink: EventSink) {
        if lock(&self.sinks).insert(topic, sink).is_some() {
            debug!(?topic, "replaced existing sink");
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ---------------------------------------------------------------------------
// Connection task
// ---------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    ServerDisconnect,
    Dropped(String),
}

struct ConnectionTask {
    endpoint: EngineEndpoint,
    scope: RoomScope,
    policy: ReconnectPolicy,
    sinks: Arc<Mutex<HashMap<Topic, EventSink>>>,
    state: Arc<watch::Sender<ChannelState>>,
    gate: Gate,
}

impl ConnectionTask {
    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut attempt = 0u32;

        loop {
            let established = tokio::select! {
                _ = &mut shutdown => return,
                res = timeout(self.policy.connect_timeout, self.establish()) => {
                    res.unwrap_or(Err(AppError::Timeout("realtime connect")))
                }
            };

            match established {
                Ok((transport, handshake)) => {
                    attempt = 0;
                    self.set_state(ChannelState::Joined);
                    match self.pump(transport, &handshake, &mut shutdown).await {
                        SessionEnd::Shutdown => return,
                        SessionEnd::ServerDisconnect => {
                            info!(room = ?self.scope, "server closed the subscription, not retrying");
                            self.set_state(ChannelState::Disconnected);
                            return;
                        }
                        SessionEnd::Dropped(reason) => {
                            warn!(room = ?self.scope, "realtime connection dropped: {reason}");
                        }
                    }
                }
                Err(e) => {
                    warn!(room = ?self.scope, "realtime connect failed: {e}");
                    self.dispatch(ChannelEvent::ConnectError(e.to_string()));
                }
            }

            attempt += 1;
            if attempt > self.policy.max_attempts {
                error!(
                    room = ?self.scope,
                    "realtime gave up after {} reconnect attempts",
                    self.policy.max_attempts
                );
                self.dispatch(ChannelEvent::ConnectError(format!(
                    "gave up after {} reconnect attempts",
                    self.policy.max_attempts
                )));
                self.set_state(ChannelState::Disconnected);
                return;
            }

            let delay = self.policy.delay(attempt);
            self.set_state(ChannelState::Reconnecting);
            warn!(
                "realtime reconnecting in {}ms (attempt {attempt}/{})",
                delay.as_millis(),
                self.policy.max_attempts
            );
            tokio::select! {
                _ = &mut shutdown => return,
                _ = sleep(delay) => {}
            }
        }
    }

    /// Engine.IO open over the negotiated transport, then Socket.IO
    /// namespace connect.
    async fn establish(&self) -> Result<(Transport, Handshake)> {
        let (mut transport, handshake) = transport::open(&self.endpoint).await?;

        transport.send(NAMESPACE_CONNECT).await?;
        loop {
            match transport.next_frame().await? {
                Some(Frame::Connected) => break,
                Some(Frame::ConnectError(m)) => {
                    return Err(AppError::Protocol(format!("namespace connect refused: {m}")))
                }
                Some(Frame::Ping) => transport.send(PONG).await?,
                Some(other) => debug!(?other, "ignored before namespace connect"),
                None => {
                    return Err(AppError::Protocol(
                        "transport closed during namespace connect".to_string(),
                    ))
                }
            }
        }

        debug!(sid = %handshake.sid, transport = transport.name(), "realtime handshake complete");
        Ok((transport, handshake))
    }

    async fn pump(
        &self,
        mut transport: Transport,
        handshake: &Handshake,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let (name, payload) = self.scope.join_event();
        if let Err(e) = transport.send(&encode_event(name, &payload)).await {
            return SessionEnd::Dropped(format!("join failed: {e}"));
        }
        info!(room = ?self.scope, transport = transport.name(), "realtime joined {name}");

        // Server pings every `ping_interval`; silence past interval + timeout means a dead link.
        let silence = Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
        let mut deadline = Instant::now() + silence;

        loop {
            tokio::select! {
                _ = &mut *shutdown => {
                    let _ = transport.send(NAMESPACE_DISCONNECT).await;
                    transport.close().await;
                    return SessionEnd::Shutdown;
                }

                _ = sleep_until(deadline) => {
                    return SessionEnd::Dropped("ping timeout".to_string());
                }

                frame = transport.next_frame() => {
                    deadline = Instant::now() + silence;
                    match frame {
                        Ok(Some(Frame::Ping)) => {
                            if let Err(e) = transport.send(PONG).await {
                                return SessionEnd::Dropped(e.to_string());
                            }
                        }
                        Ok(Some(Frame::Event { name, payload })) => self.handle_event(&name, payload),
                        Ok(Some(Frame::ServerDisconnect)) => return SessionEnd::ServerDisconnect,
                        Ok(Some(Frame::Close)) => return SessionEnd::Dropped("engine close".to_string()),
                        Ok(Some(Frame::ConnectError(m))) => {
                            self.dispatch(ChannelEvent::ConnectError(m));
                        }
                        Ok(Some(other)) => debug!(?other, "ignored frame"),
                        Ok(None) => return SessionEnd::Dropped("transport closed".to_string()),
                        Err(e) => return SessionEnd::Dropped(e.to_string()),
                    }
                }
            }
        }
    }

    fn handle_event(&self, name: &str, payload: serde_json::Value) {
        match decode_event(name, payload) {
            Ok(Some(event)) => self.dispatch(event),
            Ok(None) => debug!(event = name, "unhandled realtime event"),
            Err(e) => warn!(event = name, "dropping malformed realtime payload: {e}"),
        }
    }

    fn set_state(&self, next: ChannelState) {
        self.gate.with_open(|| {
            self.state.send_replace(next);
        });
    }

    fn dispatch(&self, event: ChannelEvent) {
        self.gate.with_open(|| {
            let topic = event.topic();
            let sinks = lock(&self.sinks);
            match sinks.get(&topic) {
                Some(sink) => {
                    if sink.send(event).is_err() {
                        debug!(?topic, "sink closed, event dropped");
                    }
                }
                None => debug!(?topic, "no sink registered, event dropped"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MeetingDate;
    use crate::ws::messages::TransportMode;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

    type ServerSocket = WebSocketStream<TcpStream>;

    const OPEN: &str =
        r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

    fn date() -> MeetingDate {
        MeetingDate::parse("25122024").unwrap()
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Minimal Socket.IO server: completes the handshake and hands each
    /// joined socket to the test.
    async fn start_server() -> (EngineEndpoint, mpsc::UnboundedReceiver<ServerSocket>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    ws.send(Message::Text(OPEN.into())).await.unwrap();
                    let connect = ws.next().await.unwrap().unwrap();
                    assert_eq!(connect.into_text().unwrap(), "40");
                    ws.send(Message::Text(r#"40{"sid":"n1"}"#.into())).await.unwrap();
                    let _ = tx.send(ws);
                });
            }
        });
        let endpoint =
            EngineEndpoint::parse(&format!("ws://{addr}"), TransportMode::WebsocketOnly).unwrap();
        (endpoint, rx)
    }

    async fn accept(conns: &mut mpsc::UnboundedReceiver<ServerSocket>) -> ServerSocket {
        timeout(Duration::from_secs(5), conns.recv())
            .await
            .expect("no connection within 5s")
            .expect("server stopped")
    }

    async fn read_text(ws: &mut ServerSocket) -> String {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .unwrap()
            .unwrap();
        msg.into_text().unwrap()
    }

    async fn wait_for_state(manager: &ChannelManager, target: ChannelState) {
        let mut rx = manager.state_watch();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
            .await
            .unwrap_or_else(|_| panic!("state never reached {target:?}"))
            .unwrap();
    }

    /// Long-polling Engine.IO server. Packets the client POSTs come out of
    /// `posted`; packets sent on `outbound` go out on the next poll.
    struct PollingServer {
        endpoint: EngineEndpoint,
        posted: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[derive(Clone)]
    struct PollingState {
        upgrades: &'static str,
        posted: mpsc::UnboundedSender<String>,
        outbound_tx: mpsc::UnboundedSender<String>,
        outbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    }

    async fn start_polling_server(upgrades: &'static str) -> PollingServer {
        let (posted_tx, posted) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let state = PollingState {
            upgrades,
            posted: posted_tx,
            outbound_tx: outbound.clone(),
            outbound: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
        };
        let app = Router::new()
            .route("/socket.io/", get(poll).post(post))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let endpoint =
            EngineEndpoint::parse(&format!("http://{addr}"), TransportMode::PollingFirst).unwrap();
        PollingServer {
            endpoint,
            posted,
            outbound,
        }
    }

    async fn poll(
        State(state): State<PollingState>,
        Query(query): Query<HashMap<String, String>>,
    ) -> (StatusCode, String) {
        // No websocket here: the upgrade request is refused.
        if query.get("transport").map(String::as_str) != Some("polling") {
            return (StatusCode::BAD_REQUEST, "transport unknown".to_string());
        }
        if !query.contains_key("sid") {
            let open = format!(
                r#"0{{"sid":"p1","upgrades":{},"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}}"#,
                state.upgrades
            );
            return (StatusCode::OK, open);
        }
        let mut outbound = state.outbound.lock().await;
        let mut packets = match timeout(Duration::from_millis(500), outbound.recv()).await {
            Ok(Some(packet)) => vec![packet],
            _ => vec!["6".to_string()],
        };
        while let Ok(packet) = outbound.try_recv() {
            packets.push(packet);
        }
        (StatusCode::OK, packets.join("\u{1e}"))
    }

    async fn post(State(state): State<PollingState>, body: String) -> &'static str {
        for packet in body.split('\u{1e}') {
            if packet == NAMESPACE_CONNECT {
                let _ = state.outbound_tx.send(r#"40{"sid":"n1"}"#.to_string());
            }
            let _ = state.posted.send(packet.to_string());
        }
        "ok"
    }

    async fn next_posted(server: &mut PollingServer) -> String {
        timeout(Duration::from_secs(5), server.posted.recv())
            .await
            .expect("nothing posted within 5s")
            .expect("server stopped")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn second_connect_reuses_the_socket() {
        let (endpoint, mut conns) = start_server().await;
        let mut manager = ChannelManager::with_policy(endpoint, fast_policy(3));
        assert_eq!(manager.state(), ChannelState::Idle);

        assert!(manager.connect(RoomScope::Reunions(date())));
        assert!(!manager.connect(RoomScope::Reunions(date())));

        let mut ws = accept(&mut conns).await;
        assert_eq!(read_text(&mut ws).await, r#"42["join_reunions",{"date":"25122024"}]"#);
        wait_for_state(&manager, ChannelState::Joined).await;

        assert!(!manager.connect(RoomScope::Reunions(date())));
        assert!(
            timeout(Duration::from_millis(300), conns.recv()).await.is_err(),
            "a second socket was opened"
        );
    }

    #[tokio::test]
    async fn events_reach_the_latest_sink_only() {
        let (endpoint, mut conns) = start_server().await;
        let mut manager = ChannelManager::with_policy(endpoint, fast_policy(3));
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();
        manager.subscribe(Topic::Reunions, first_tx);
        manager.subscribe(Topic::Reunions, second_tx);

        manager.connect(RoomScope::Reunions(date()));
        let mut ws = accept(&mut conns).await;
        read_text(&mut ws).await;
        ws.send(Message::Text(r#"42["reunions_update",{"R1":[{"race_label":"C1"}]}]"#.into()))
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(5), second_rx.recv()).await.unwrap().unwrap();
        match event {
            ChannelEvent::Reunions(c) => assert_eq!(c.races("R1").unwrap()[0].race_label, "C1"),
            other => panic!("expected Reunions, got {other:?}"),
        }
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_errors_go_to_the_errors_topic() {
        let (endpoint, mut conns) = start_server().await;
        let mut manager = ChannelManager::with_policy(endpoint, fast_policy(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(Topic::Errors, tx);

        let scope = crate::types::RaceScope::new(date(), "R1", "C2");
        manager.connect(RoomScope::Selections(scope));
        let mut ws = accept(&mut conns).await;
        let join = read_text(&mut ws).await;
        assert!(join.starts_with(r#"42["join",{"#), "unexpected join {join}");

        ws.send(Message::Text(r#"42["error",{"message":"race not found"}]"#.into()))
            .await
            .unwrap();
        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(event, ChannelEvent::ServerError("race not found".to_string()));
        assert_eq!(manager.state(), ChannelState::Joined);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_silences_sinks() {
        let (endpoint, mut conns) = start_server().await;
        let mut manager = ChannelManager::with_policy(endpoint, fast_policy(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(Topic::Reunions, tx);

        manager.connect(RoomScope::Reunions(date()));
        let mut ws = accept(&mut conns).await;
        read_text(&mut ws).await;
        wait_for_state(&manager, ChannelState::Joined).await;

        assert!(manager.disconnect());
        assert_eq!(manager.state(), ChannelState::Disconnected);
        assert!(!manager.disconnect());
        assert_eq!(manager.state(), ChannelState::Disconnected);

        // The client leaves the namespace before closing.
        assert_eq!(read_text(&mut ws).await, "41");
        let _ = ws
            .send(Message::Text(r#"42["reunions_update",{"R9":[]}]"#.into()))
            .await;
        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_initiated_disconnect_is_not_retried() {
        let (endpoint, mut conns) = start_server().await;
        let mut manager = ChannelManager::with_policy(endpoint, fast_policy(3));

        manager.connect(RoomScope::Reunions(date()));
        let mut ws = accept(&mut conns).await;
        read_text(&mut ws).await;
        ws.send(Message::Text("41".into())).await.unwrap();

        wait_for_state(&manager, ChannelState::Disconnected).await;
        assert!(
            timeout(Duration::from_millis(300), conns.recv()).await.is_err(),
            "client reconnected after a server disconnect"
        );

        // A fresh connect after the server dropped us opens a new socket.
        assert!(manager.connect(RoomScope::Reunions(date())));
        accept(&mut conns).await;
    }

    #[tokio::test]
    async fn transport_drop_reconnects_and_rejoins() {
        let (endpoint, mut conns) = start_server().await;
        let mut manager = ChannelManager::with_policy(endpoint, fast_policy(3));

        manager.connect(RoomScope::Reunions(date()));
        let mut ws = accept(&mut conns).await;
        read_text(&mut ws).await;
        drop(ws);

        let mut ws = accept(&mut conns).await;
        assert_eq!(read_text(&mut ws).await, r#"42["join_reunions",{"date":"25122024"}]"#);
        wait_for_state(&manager, ChannelState::Joined).await;
    }

    #[tokio::test]
    async fn unreachable_server_gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let endpoint =
            EngineEndpoint::parse(&format!("http://{addr}"), TransportMode::PollingFirst).unwrap();
        let mut manager = ChannelManager::with_policy(endpoint, fast_policy(2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(Topic::Errors, tx);

        manager.connect(RoomScope::Reunions(date()));
        wait_for_state(&manager, ChannelState::Disconnected).await;

        let mut errors = Vec::new();
        while let Ok(event) = rx.try_recv() {
            errors.push(event);
        }
        // Initial attempt + 2 retries, then the give-up notice.
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(matches!(errors.last(), Some(ChannelEvent::ConnectError(m)) if m.contains("gave up")));
    }

    #[tokio::test]
    async fn polling_only_server_gets_a_full_session() {
        let mut server = start_polling_server("[]").await;
        let mut manager = ChannelManager::with_policy(server.endpoint.clone(), fast_policy(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(Topic::Reunions, tx);

        manager.connect(RoomScope::Reunions(date()));
        assert_eq!(next_posted(&mut server).await, "40");
        assert_eq!(
            next_posted(&mut server).await,
            r#"42["join_reunions",{"date":"25122024"}]"#
        );
        wait_for_state(&manager, ChannelState::Joined).await;

        server.outbound.send("2".to_string()).unwrap();
        assert_eq!(next_posted(&mut server).await, "3");

        server
            .outbound
            .send(r#"42["reunions_update",{"R1":[{"race_label":"C1"}]}]"#.to_string())
            .unwrap();
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
            ChannelEvent::Reunions(c) => assert_eq!(c.races("R1").unwrap()[0].race_label, "C1"),
            other => panic!("expected Reunions, got {other:?}"),
        }

        assert!(manager.disconnect());
        assert_eq!(next_posted(&mut server).await, "41");
    }

    #[tokio::test]
    async fn refused_upgrade_stays_on_polling() {
        let mut server = start_polling_server(r#"["websocket"]"#).await;
        let mut manager = ChannelManager::with_policy(server.endpoint.clone(), fast_policy(0));

        manager.connect(RoomScope::Reunions(date()));
        assert_eq!(next_posted(&mut server).await, "40");
        assert_eq!(
            next_posted(&mut server).await,
            r#"42["join_reunions",{"date":"25122024"}]"#
        );
        wait_for_state(&manager, ChannelState::Joined).await;
    }
}
