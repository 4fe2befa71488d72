//! WebSocket relay server
//!
//! One task per accepted socket multiplexes inbound frames with the socket's
//! outbound queue and reports every transport event to a [`Dispatcher`]:
//!
//! - resident model: events are forwarded to a single hub task that owns the
//!   [`Relay`] and runs the liveness sweep, so routing state is only ever
//!   touched from one place;
//! - hibernating model: every event runs a fresh [`HibernatingHandler`] over
//!   the shared [`SocketHost`] inside the socket's own task.
//!
//! Plain HTTP requests are answered without upgrading: `/health` returns
//! JSON counters, anything else a short `okay`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{Config, ExecutionModel};
use crate::connection::{ConnectionHandle, ConnectionId, Outbound};
use crate::error::RelayError;
use crate::hibernation::{HibernatingHandler, SocketHost};
use crate::liveness;
use crate::relay::Relay;
use crate::storage::SqliteStore;

/// Close code reported when the stream ends without a close frame
const ABNORMAL_CLOSE: u16 = 1006;

/// Close code reported for a close frame without a status
const NO_STATUS: u16 = 1005;

/// Largest request head we look at before deciding how to answer
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Time allowed for the request head to arrive
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between peeks while the request head is incomplete
const PEEK_BACKOFF: Duration = Duration::from_millis(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Counters exposed on `/health`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub connections: usize,
    pub topics: usize,
}

/// Receiver of transport events for every socket
trait Dispatcher: Send + Sync {
    fn on_open(&self, conn: ConnectionHandle);
    fn on_frame(&self, conn: &ConnectionHandle, frame: Vec<u8>);
    fn on_pong(&self, conn: &ConnectionHandle);
    fn on_close(&self, conn: &ConnectionHandle, code: u16, reason: String);
    fn stats(&self) -> RelayStats;
}

/// Signal server
pub struct SignalServer {
    config: Config,
}

impl SignalServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn serve(self) -> Result<(), RelayError> {
        self.config.validate()?;
        let addr = SocketAddr::new(self.config.server.bind, self.config.server.port);
        let listener = TcpListener::bind(addr).await?;
        info!("Signal relay listening on {}", addr);
        self.run(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn run(self, listener: TcpListener) -> Result<(), RelayError> {
        self.config.validate()?;
        let dispatcher = start_dispatcher(&self.config)?;
        let upgrade_path: Option<Arc<str>> =
            self.config.server.upgrade_path.as_deref().map(Arc::from);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let dispatcher = dispatcher.clone();
            let upgrade_path = upgrade_path.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer_addr, dispatcher, upgrade_path).await
                {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }
}

fn start_dispatcher(config: &Config) -> Result<Arc<dyn Dispatcher>, RelayError> {
    match config.relay.mode {
        ExecutionModel::Resident => {
            if config.relay.db_path.is_some() {
                warn!("db_path is only used by the hibernating model; ignoring it");
            }
            info!(
                "Resident relay, liveness interval {:?}",
                config.relay.liveness_interval()
            );
            Ok(Arc::new(ResidentDispatcher::start(
                config.relay.liveness_interval(),
            )))
        }
        ExecutionModel::Hibernating => {
            let host = match &config.relay.db_path {
                Some(path) => {
                    // Create parent directory if it doesn't exist
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    info!("Hibernating relay, attachments in {:?}", path);
                    SocketHost::new(SqliteStore::open(path)?)
                }
                None => {
                    info!("Hibernating relay, attachments in memory");
                    SocketHost::in_memory()
                }
            };
            Ok(Arc::new(HibernatingDispatcher {
                host: Arc::new(host),
            }))
        }
    }
}

/// Events consumed by the resident hub, in arrival order
enum RelayEvent {
    Open(ConnectionHandle),
    Frame(ConnectionId, Vec<u8>),
    Pong(ConnectionId),
    Close(ConnectionId, u16, String),
}

struct SharedStats {
    connections: AtomicUsize,
    topics: AtomicUsize,
}

impl SharedStats {
    fn record(&self, relay: &Relay) {
        self.connections
            .store(relay.connection_count(), Ordering::Relaxed);
        self.topics.store(relay.topic_count(), Ordering::Relaxed);
    }
}

struct ResidentDispatcher {
    events: mpsc::UnboundedSender<RelayEvent>,
    stats: Arc<SharedStats>,
}

impl ResidentDispatcher {
    /// Spawn the hub task that owns the relay
    fn start(liveness_interval: Duration) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(SharedStats {
            connections: AtomicUsize::new(0),
            topics: AtomicUsize::new(0),
        });

        tokio::spawn(run_hub(Relay::new(), rx, liveness_interval, stats.clone()));
        Self { events, stats }
    }

    fn emit(&self, event: RelayEvent) {
        if self.events.send(event).is_err() {
            warn!("Relay hub has stopped; dropping event");
        }
    }
}

impl Dispatcher for ResidentDispatcher {
    fn on_open(&self, conn: ConnectionHandle) {
        self.emit(RelayEvent::Open(conn));
    }

    fn on_frame(&self, conn: &ConnectionHandle, frame: Vec<u8>) {
        self.emit(RelayEvent::Frame(conn.id(), frame));
    }

    fn on_pong(&self, conn: &ConnectionHandle) {
        self.emit(RelayEvent::Pong(conn.id()));
    }

    fn on_close(&self, conn: &ConnectionHandle, code: u16, reason: String) {
        self.emit(RelayEvent::Close(conn.id(), code, reason));
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.stats.connections.load(Ordering::Relaxed),
            topics: self.stats.topics.load(Ordering::Relaxed),
        }
    }
}

/// The resident event loop. Ends once every event sender is gone.
async fn run_hub(
    mut relay: Relay,
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
    liveness_interval: Duration,
    stats: Arc<SharedStats>,
) {
    let mut ticker = liveness::ticker(liveness_interval);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RelayEvent::Open(conn)) => {
                    relay.on_connect(conn);
                }
                Some(RelayEvent::Frame(id, frame)) => relay.on_message(id, &frame),
                Some(RelayEvent::Pong(id)) => relay.on_pong(id),
                Some(RelayEvent::Close(id, code, reason)) => {
                    relay.on_close(id, code, &reason);
                }
                None => break,
            },
            _ = ticker.tick() => {
                relay.sweep_liveness();
            }
        }
        stats.record(&relay);
    }

    debug!("Relay hub stopped");
}

struct HibernatingDispatcher {
    host: Arc<SocketHost>,
}

impl Dispatcher for HibernatingDispatcher {
    fn on_open(&self, conn: ConnectionHandle) {
        HibernatingHandler::new(&self.host).on_open(conn);
    }

    fn on_frame(&self, conn: &ConnectionHandle, frame: Vec<u8>) {
        HibernatingHandler::new(&self.host).on_message(conn, &frame);
    }

    // the hibernating model leaves liveness to the transport
    fn on_pong(&self, _conn: &ConnectionHandle) {}

    fn on_close(&self, conn: &ConnectionHandle, code: u16, reason: String) {
        HibernatingHandler::new(&self.host).on_close(conn, code, &reason);
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.host.connection_count(),
            topics: self.host.topic_count().unwrap_or(0),
        }
    }
}

/// The parts of an HTTP request head used for routing
#[derive(Debug, PartialEq, Eq)]
struct RequestHead {
    path: String,
    websocket: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Upgrade,
    Health,
    Plain,
    NotFound,
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    dispatcher: Arc<dyn Dispatcher>,
    upgrade_path: Option<Arc<str>>,
) -> Result<(), BoxError> {
    let head = timeout(HANDSHAKE_TIMEOUT, peek_request_head(&stream)).await??;
    let Some(head) = parse_request_head(&head) else {
        debug!("Dropping non-HTTP connection from {}", peer_addr);
        return Ok(());
    };

    match route(&head, upgrade_path.as_deref()) {
        Route::Upgrade => {
            let ws_stream = accept_async(stream).await?;
            run_socket(ws_stream, peer_addr, dispatcher).await;
            Ok(())
        }
        Route::Health => {
            let stats = dispatcher.stats();
            let body = serde_json::json!({
                "status": "healthy",
                "connections": stats.connections,
                "topics": stats.topics,
            })
            .to_string();
            respond(&mut stream, "200 OK", "application/json", &body).await
        }
        Route::Plain => respond(&mut stream, "200 OK", "text/plain", "okay").await,
        Route::NotFound => {
            debug!("Rejecting upgrade for {} from {}", head.path, peer_addr);
            respond(&mut stream, "404 Not Found", "text/plain", "not found").await
        }
    }
}

/// Peek until the request head is complete, the buffer is full, or the
/// peer stops sending.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let mut seen = 0;

    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 || n == buf.len() || find_head_end(&buf[..n]).is_some() {
            buf.truncate(n);
            return Ok(buf);
        }
        if n == seen {
            tokio::time::sleep(PEEK_BACKOFF).await;
        }
        seen = n;
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_head(bytes: &[u8]) -> Option<RequestHead> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.split("\r\n");

    let mut request_line = lines.next()?.split_whitespace();
    let _method = request_line.next()?;
    let target = request_line.next()?;
    if !request_line.next()?.starts_with("HTTP/") {
        return None;
    }
    let path = target.split('?').next().unwrap_or("/").to_owned();

    let websocket = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .any(|(name, value)| {
            name.trim().eq_ignore_ascii_case("upgrade")
                && value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
        });

    Some(RequestHead { path, websocket })
}

fn route(head: &RequestHead, upgrade_path: Option<&str>) -> Route {
    if head.websocket {
        match upgrade_path {
            Some(path) if path != head.path => Route::NotFound,
            _ => Route::Upgrade,
        }
    } else if head.path == "/health" {
        Route::Health
    } else {
        Route::Plain
    }
}

/// Answer a plain HTTP request and close
async fn respond(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &str,
) -> Result<(), BoxError> {
    // Consume the request we peeked at
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let _ = stream.read(&mut buf).await?;

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Pump one WebSocket until either side closes it
async fn run_socket(
    ws_stream: WebSocketStream<TcpStream>,
    peer_addr: SocketAddr,
    dispatcher: Arc<dyn Dispatcher>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (conn, mut outbound) = ConnectionHandle::channel();
    debug!("New connection from {} as {}", peer_addr, conn.id());

    dispatcher.on_open(conn.clone());

    let (code, reason) = loop {
        tokio::select! {
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatcher.on_frame(&conn, text.into_bytes()),
                Some(Ok(Message::Binary(data))) => dispatcher.on_frame(&conn, data),
                Some(Ok(Message::Pong(_))) => dispatcher.on_pong(&conn),
                Some(Ok(Message::Close(frame))) => break close_parts(frame),
                // tungstenite queues the pong for transport pings itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    debug!("WebSocket error on {}: {:?}", conn.id(), e);
                    break (ABNORMAL_CLOSE, String::new());
                }
                None => break (ABNORMAL_CLOSE, String::new()),
            },
            Some(frame) = outbound.recv() => match frame {
                Outbound::Text(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text)).await {
                        debug!("Send to {} failed: {:?}", conn.id(), e);
                        break (ABNORMAL_CLOSE, String::new());
                    }
                }
                Outbound::Ping => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break (ABNORMAL_CLOSE, String::new());
                    }
                }
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break (code, reason);
                }
            },
        }
    };

    dispatcher.on_close(&conn, code, reason);
    debug!("Connection closed: {}", conn.id());
}

fn close_parts(frame: Option<CloseFrame<'static>>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
        None => (NO_STATUS, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use serde_json::{json, Value};
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start(config: Config) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(SignalServer::new(config).run(listener));
        addr
    }

    fn config(mode: ExecutionModel) -> Config {
        let mut config = Config::default();
        config.relay.mode = mode;
        config
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
        ws
    }

    async fn send_json(client: &mut Client, value: Value) {
        client.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn recv_json(client: &mut Client) -> Value {
        loop {
            let msg = timeout(WAIT, client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Round-trip a ping so everything sent before it has been handled
    async fn sync(client: &mut Client) {
        send_json(client, json!({"type": "ping"})).await;
        assert_eq!(recv_json(client).await, json!({"type": "pong"}));
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        timeout(WAIT, stream.read_to_string(&mut response))
            .await
            .unwrap()
            .unwrap();
        response
    }

    async fn health(addr: SocketAddr) -> Value {
        let response = http_get(addr, "/health").await;
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        serde_json::from_str(body).unwrap()
    }

    async fn wait_for_connections(addr: SocketAddr, expected: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while health(addr).await["connections"] != json!(expected) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "connection count never reached {}",
                expected
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn room_scenario(mode: ExecutionModel) {
        let addr = start(config(mode)).await;
        let mut a = connect(addr).await;
        let mut b = connect(addr).await;

        send_json(&mut a, json!({"type": "subscribe", "topics": ["room1"]})).await;
        send_json(&mut b, json!({"type": "subscribe", "topics": ["room1"]})).await;
        sync(&mut a).await;
        sync(&mut b).await;

        let publish = json!({"type": "publish", "topic": "room1", "text": "hi"});
        send_json(&mut a, publish.clone()).await;

        let expected = json!({"type": "publish", "topic": "room1", "text": "hi", "clients": 2});
        assert_eq!(recv_json(&mut b).await, expected);
        assert_eq!(recv_json(&mut a).await, expected);

        b.close(None).await.unwrap();
        wait_for_connections(addr, 1).await;

        send_json(&mut a, publish).await;
        assert_eq!(
            recv_json(&mut a).await,
            json!({"type": "publish", "topic": "room1", "text": "hi", "clients": 1})
        );

        send_json(&mut a, json!({"type": "unsubscribe", "topics": ["room1"]})).await;
        sync(&mut a).await;
        assert_eq!(health(addr).await["topics"], json!(0));
    }

    #[tokio::test]
    async fn test_room_scenario_resident() {
        room_scenario(ExecutionModel::Resident).await;
    }

    #[tokio::test]
    async fn test_room_scenario_hibernating() {
        room_scenario(ExecutionModel::Hibernating).await;
    }

    #[tokio::test]
    async fn test_hibernating_with_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(ExecutionModel::Hibernating);
        config.relay.db_path = Some(dir.path().join("state").join("relay.db"));
        let addr = start(config).await;

        let mut a = connect(addr).await;
        send_json(&mut a, json!({"type": "subscribe", "topics": ["x"]})).await;
        sync(&mut a).await;
        assert_eq!(health(addr).await["topics"], json!(1));

        send_json(&mut a, json!({"type": "publish", "topic": "x", "n": 1})).await;
        assert_eq!(recv_json(&mut a).await["clients"], json!(1));
    }

    #[tokio::test]
    async fn test_unknown_frames_get_no_reply() {
        let addr = start(config(ExecutionModel::Resident)).await;
        let mut a = connect(addr).await;

        send_json(&mut a, json!({"type": "dance"})).await;
        send_json(&mut a, json!({"foo": 1})).await;
        a.send(Message::Text("not json".into())).await.unwrap();

        // the first reply must be the pong
        sync(&mut a).await;
        assert_eq!(health(addr).await["topics"], json!(0));
    }

    #[tokio::test]
    async fn test_binary_frames() {
        let addr = start(config(ExecutionModel::Resident)).await;
        let mut a = connect(addr).await;

        let subscribe = json!({"type": "subscribe", "topics": ["bin"]}).to_string();
        a.send(Message::Binary(subscribe.into_bytes())).await.unwrap();
        let publish = json!({"type": "publish", "topic": "bin"}).to_string();
        a.send(Message::Binary(publish.into_bytes())).await.unwrap();

        assert_eq!(
            recv_json(&mut a).await,
            json!({"type": "publish", "topic": "bin", "clients": 1})
        );
    }

    #[tokio::test]
    async fn test_plain_http() {
        let addr = start(config(ExecutionModel::Resident)).await;

        let response = http_get(addr, "/").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("okay"));

        let stats = health(addr).await;
        assert_eq!(stats["status"], json!("healthy"));
        assert_eq!(stats["connections"], json!(0));
    }

    #[tokio::test]
    async fn test_upgrade_path() {
        let mut config = config(ExecutionModel::Resident);
        config.server.upgrade_path = Some("/signal".into());
        let addr = start(config).await;

        assert!(connect_async(format!("ws://{}/elsewhere", addr)).await.is_err());

        let (mut ws, _) = connect_async(format!("ws://{}/signal?room=1", addr))
            .await
            .unwrap();
        sync(&mut ws).await;
    }

    #[tokio::test]
    async fn test_liveness_eviction_over_network() {
        let mut config = config(ExecutionModel::Resident);
        config.relay.liveness_interval_ms = 50;
        let addr = start(config).await;

        let mut a = connect(addr).await;
        sync(&mut a).await;

        // a client that stops reading never answers pings
        wait_for_connections(addr, 0).await;
        drop(a);
    }

    #[tokio::test]
    async fn test_invalid_liveness_interval_is_rejected() {
        for interval in [0, u64::MAX] {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let mut config = config(ExecutionModel::Resident);
            config.relay.liveness_interval_ms = interval;

            let result = timeout(WAIT, SignalServer::new(config).run(listener))
                .await
                .expect("run should fail instead of serving");
            assert!(matches!(
                result,
                Err(RelayError::Config(ConfigError::Invalid(_)))
            ));
        }
    }

    #[test]
    fn test_parse_request_head() {
        let request = concat!(
            "GET /signal?x=1 HTTP/1.1\r\n",
            "Host: a\r\n",
            "Connection: Upgrade\r\n",
            "Upgrade: WebSocket\r\n\r\n",
        );
        let head = parse_request_head(request.as_bytes()).unwrap();
        assert_eq!(head.path, "/signal");
        assert!(head.websocket);

        let head = parse_request_head(b"GET /health HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(head.path, "/health");
        assert!(!head.websocket);

        assert!(parse_request_head(b"\x16\x03\x01garbage").is_none());
        assert!(parse_request_head(b"").is_none());
    }

    #[test]
    fn test_route() {
        let upgrade = RequestHead {
            path: "/a".into(),
            websocket: true,
        };
        assert_eq!(route(&upgrade, None), Route::Upgrade);
        assert_eq!(route(&upgrade, Some("/a")), Route::Upgrade);
        assert_eq!(route(&upgrade, Some("/b")), Route::NotFound);

        let health = RequestHead {
            path: "/health".into(),
            websocket: false,
        };
        assert_eq!(route(&health, Some("/b")), Route::Health);

        let other = RequestHead {
            path: "/".into(),
            websocket: false,
        };
        assert_eq!(route(&other, None), Route::Plain);
    }

    #[test]
    fn test_close_parts() {
        assert_eq!(close_parts(None), (NO_STATUS, String::new()));

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert_eq!(close_parts(Some(frame)), (1000, "bye".to_string()));
    }
}
