//! End-to-end: a real server on a random port, driven by websocket and HTTP clients.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_auth::{AuthConfig, IdentityGate};
use relay_core::{AccountStore, ChatStore, Identity, StoreError, StoredMessage, UserId};
use relay_server::{start, RelayConfig, RelayServices, ServerHandle};
use relay_store::{Database, SqliteStore};
use relay_telemetry::RelayMetrics;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "integration-secret";

/// SQLite store that can be told to fail the next save, and counts calls.
struct FlakyStore {
    inner: SqliteStore,
    fail_next_save: AtomicBool,
    user_calls: AtomicUsize,
    save_calls: AtomicUsize,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: SqliteStore::new(Database::in_memory().unwrap()),
            fail_next_save: AtomicBool::new(false),
            user_calls: AtomicUsize::new(0),
            save_calls: AtomicUsize::new(0),
        }
    }
}

impl ChatStore for FlakyStore {
    fn get_or_create_user(&self, username: &str) -> Result<UserId, StoreError> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_or_create_user(username)
    }

    fn save_message(&self, user_id: UserId, content: &str) -> Result<(), StoreError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database("injected failure".into()));
        }
        self.inner.save_message(user_id, content)
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.recent_messages(limit)
    }
}

impl AccountStore for FlakyStore {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserId, StoreError> {
        self.inner.create_user(username, password_hash)
    }

    fn credentials(&self, username: &str) -> Result<(UserId, String), StoreError> {
        self.inner.credentials(username)
    }

    fn username_of(&self, user_id: UserId) -> Result<String, StoreError> {
        self.inner.username_of(user_id)
    }
}

struct Relay {
    handle: ServerHandle,
    store: Arc<FlakyStore>,
    metrics: Arc<RelayMetrics>,
    gate: IdentityGate,
}

impl Relay {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(tweak: impl FnOnce(&mut RelayConfig)) -> Self {
        let mut config = RelayConfig::default();
        config.server.host = "127.0.0.1".into();
        config.server.port = 0;
        config.auth = AuthConfig {
            secret: SECRET.into(),
            ..Default::default()
        };
        tweak(&mut config);

        let store = Arc::new(FlakyStore::new());
        let services = RelayServices::new(store.clone());
        let metrics = services.metrics.clone();
        let gate = IdentityGate::new(&config.auth);
        let handle = start(config, services).await.unwrap();
        Self {
            handle,
            store,
            metrics,
            gate,
        }
    }

    fn token(&self, user_id: i64, username: &str) -> String {
        self.gate
            .issue_access(&Identity::new(user_id, username))
            .unwrap()
    }

    fn ws_url(&self, token: &str) -> String {
        format!("ws://127.0.0.1:{}/ws?token={token}", self.handle.port)
    }

    async fn connect(&self, user_id: i64, username: &str) -> Ws {
        let (ws, _) = connect_async(self.ws_url(&self.token(user_id, username)))
            .await
            .unwrap();
        ws
    }

    async fn health(&self) -> serde_json::Value {
        reqwest::get(format!("http://127.0.0.1:{}/health", self.handle.port))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn wait_for_connections(&self, n: u64) {
        for _ in 0..200 {
            if self.health().await["connections"] == n {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("never reached {n} connections");
    }
}

async fn send_chat(ws: &mut Ws, username: &str, content: &str) {
    let frame = serde_json::json!({"username": username, "content": content}).to_string();
    ws.send(Message::text(frame)).await.unwrap();
}

/// Next chat broadcast, skipping liveness frames.
async fn next_chat(ws: &mut Ws) -> serde_json::Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for broadcast")
            .expect("stream ended")
            .expect("read error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

fn assert_hh_mm(value: &serde_json::Value) {
    let s = value.as_str().unwrap();
    assert_eq!(s.len(), 5, "got {s}");
    assert_eq!(&s[2..3], ":");
    assert!(s[..2].parse::<u32>().unwrap() < 24);
    assert!(s[3..].parse::<u32>().unwrap() < 60);
}

#[tokio::test]
async fn message_is_persisted_and_broadcast_to_everyone() {
    let relay = Relay::start().await;
    let mut a = relay.connect(1, "alice").await;
    let mut b = relay.connect(2, "bob").await;
    relay.wait_for_connections(2).await;

    send_chat(&mut a, "alice", "hi").await;

    for ws in [&mut a, &mut b] {
        let msg = next_chat(ws).await;
        assert_eq!(msg["username"], "alice");
        assert_eq!(msg["content"], "hi");
        assert_hh_mm(&msg["created_at"]);
        assert_eq!(msg.as_object().unwrap().len(), 3);
    }

    let history = relay.store.recent_messages(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].username, "alice");
    assert_eq!(history[0].content, "hi");
    let (alice_id, _) = relay.store.credentials("alice").unwrap();
    assert_eq!(relay.store.get_or_create_user("alice").unwrap(), alice_id);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn empty_author_is_dropped_and_connection_stays_open() {
    let relay = Relay::start().await;
    let mut a = relay.connect(1, "alice").await;
    relay.wait_for_connections(1).await;

    send_chat(&mut a, "", "hi").await;
    send_chat(&mut a, "alice", "").await;
    send_chat(&mut a, "alice", "still here").await;

    let msg = next_chat(&mut a).await;
    assert_eq!(msg["content"], "still here");
    assert_eq!(relay.store.save_calls.load(Ordering::SeqCst), 1);
    assert_eq!(relay.store.user_calls.load(Ordering::SeqCst), 1);
    assert_eq!(relay.metrics.snapshot().messages_rejected, 2);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_does_not_close_connection() {
    let relay = Relay::start().await;
    let mut a = relay.connect(1, "alice").await;
    relay.wait_for_connections(1).await;

    a.send(Message::text("{{ not json")).await.unwrap();
    send_chat(&mut a, "alice", "after garbage").await;

    assert_eq!(next_chat(&mut a).await["content"], "after garbage");
    assert_eq!(relay.metrics.snapshot().decode_failures, 1);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn failed_save_is_never_broadcast() {
    let relay = Relay::start().await;
    let mut a = relay.connect(1, "alice").await;
    let mut b = relay.connect(2, "bob").await;
    relay.wait_for_connections(2).await;

    relay.store.fail_next_save.store(true, Ordering::SeqCst);
    send_chat(&mut a, "alice", "lost").await;
    send_chat(&mut a, "alice", "kept").await;

    for ws in [&mut a, &mut b] {
        assert_eq!(next_chat(ws).await["content"], "kept");
    }

    let history = relay.store.recent_messages(10).unwrap();
    let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["kept"]);
    assert_eq!(relay.metrics.snapshot().persistence_failures, 1);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn bad_credentials_never_reach_the_hub() {
    let relay = Relay::start().await;

    let foreign_gate = IdentityGate::new(&AuthConfig {
        secret: "wrong-secret".into(),
        ..Default::default()
    });
    let forged = foreign_gate
        .issue_access(&Identity::new(UserId(1), "mallory"))
        .unwrap();
    let refresh = relay.gate.issue_refresh(UserId(1)).unwrap();

    for token in [forged.as_str(), refresh.as_str(), "garbage"] {
        match connect_async(relay.ws_url(token)).await {
            Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 401),
            other => panic!("expected 401, got {:?}", other.map(|(_, r)| r.status())),
        }
    }
    match connect_async(format!("ws://127.0.0.1:{}/ws", relay.handle.port)).await {
        Err(tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 401),
        other => panic!("expected 401, got {:?}", other.map(|(_, r)| r.status())),
    }

    let health = relay.health().await;
    assert_eq!(health["connections"], 0);
    assert_eq!(health["metrics"]["connections_opened"], 0);
    assert_eq!(relay.store.user_calls.load(Ordering::SeqCst), 0);
    assert_eq!(relay.store.save_calls.load(Ordering::SeqCst), 0);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn authorization_header_is_accepted() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let relay = Relay::start().await;
    let mut req = format!("ws://127.0.0.1:{}/ws", relay.handle.port)
        .into_client_request()
        .unwrap();
    req.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", relay.token(3, "carol")).parse().unwrap(),
    );
    let (mut ws, _) = connect_async(req).await.unwrap();
    relay.wait_for_connections(1).await;

    send_chat(&mut ws, "carol", "via header").await;
    assert_eq!(next_chat(&mut ws).await["username"], "carol");

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn disconnect_unregisters() {
    let relay = Relay::start().await;
    let mut a = relay.connect(1, "alice").await;
    let b = relay.connect(2, "bob").await;
    relay.wait_for_connections(2).await;

    drop(b);
    relay.wait_for_connections(1).await;

    send_chat(&mut a, "alice", "anyone?").await;
    assert_eq!(next_chat(&mut a).await["content"], "anyone?");
    assert_eq!(relay.metrics.snapshot().connections_closed, 1);

    a.close(None).await.unwrap();
    relay.wait_for_connections(0).await;

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn silent_peer_times_out() {
    let relay = Relay::start_with(|cfg| cfg.server.pong_wait_secs = 1).await;
    // never polled, so the client never answers pings
    let _idle = relay.connect(1, "idle").await;
    relay.wait_for_connections(1).await;

    sleep(Duration::from_millis(1500)).await;
    relay.wait_for_connections(0).await;

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn server_pings_live_connections() {
    let relay = Relay::start_with(|cfg| cfg.server.pong_wait_secs = 1).await;
    let mut ws = relay.connect(1, "alice").await;

    let got_ping = timeout(Duration::from_secs(3), async {
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Ping(_)) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(got_ping);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let relay = Relay::start().await;
    let mut ws = relay.connect(1, "alice").await;
    relay.wait_for_connections(1).await;

    relay.handle.shutdown().await;

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed);
}

#[tokio::test]
async fn history_endpoint_returns_recent_messages() {
    let relay = Relay::start_with(|cfg| cfg.server.history_limit = 2).await;
    let mut a = relay.connect(1, "alice").await;
    relay.wait_for_connections(1).await;

    for content in ["one", "two", "three"] {
        send_chat(&mut a, "alice", content).await;
        next_chat(&mut a).await;
    }

    let rows: serde_json::Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/messages", relay.handle.port))
        .bearer_auth(relay.token(1, "alice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let contents: Vec<_> = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["content"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(contents, vec!["two", "three"]);

    relay.handle.shutdown().await;
}

#[tokio::test]
async fn peer_that_stops_reading_is_disconnected() {
    let relay = Relay::start_with(|cfg| cfg.server.write_wait_secs = 1).await;
    let alice = relay.connect(1, "alice").await;
    let mut stalled = relay.connect(2, "stalled").await;
    relay.wait_for_connections(2).await;

    // keeps the read deadline fresh but never reads
    let chatter = tokio::spawn(async move {
        while stalled.send(Message::Pong(Default::default())).await.is_ok() {
            sleep(Duration::from_millis(300)).await;
        }
    });

    let (mut alice_tx, mut alice_rx) = alice.split();
    let drain = tokio::spawn(async move { while let Some(Ok(_)) = alice_rx.next().await {} });

    let filler = "x".repeat(60 * 1024);
    let frame = serde_json::json!({"username": "alice", "content": filler}).to_string();
    for _ in 0..600 {
        alice_tx.send(Message::text(frame.clone())).await.unwrap();
    }

    relay.wait_for_connections(1).await;
    assert_eq!(relay.metrics.snapshot().connections_closed, 1);

    chatter.abort();
    drain.abort();
    relay.handle.shutdown().await;
}
