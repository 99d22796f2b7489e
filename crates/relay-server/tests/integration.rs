//! End-to-end tests: real listeners, real WebSocket clients, and several
//! relay processes sharing one in-memory store.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use relay_core::ProcessId;
use relay_core::constants::CONNECTION_COUNT_KEY;
use relay_server::{ReconcileOutcome, RelayServer, ServerConfig, ensure_counter_initialized};
use relay_store::{CounterStore, MemoryStore};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Node {
    ws_url: String,
    http_url: String,
    server: Arc<RelayServer>,
}

/// Boot one relay process on `store` with its egress loops running.
async fn boot_node(store: &MemoryStore, name: &str) -> Node {
    boot_node_with(store, name, ServerConfig::default()).await
}

async fn boot_node_with(store: &MemoryStore, name: &str, config: ServerConfig) -> Node {
    let _ = ensure_counter_initialized(store).await.unwrap();
    let server = Arc::new(RelayServer::new(config, ProcessId::from(name), Arc::new(store.clone())));
    let _egress = server.start_egress().await.unwrap();
    let (addr, _handle) = server.listen().await.unwrap();
    Node {
        ws_url: format!("ws://{addr}/ws"),
        http_url: format!("http://{addr}"),
        server,
    }
}

fn deadline_in(grace: Duration) -> tokio::time::Instant {
    tokio::time::Instant::now() + grace
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Read the next JSON text frame, skipping control frames.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read frames until one of type `ty` arrives.
async fn read_until(ws: &mut WsStream, ty: &str) -> Value {
    loop {
        let v = read_json(ws).await;
        if v["type"] == ty {
            return v;
        }
    }
}

/// Read count updates until `count` is seen.
async fn await_count(ws: &mut WsStream, count: u64) {
    loop {
        let v = read_until(ws, "connection-count-updated").await;
        if v["count"] == count {
            return;
        }
    }
}

async fn stored(store: &MemoryStore) -> i64 {
    store.get(CONNECTION_COUNT_KEY).await.unwrap().unwrap_or(0)
}

async fn send_text(ws: &mut WsStream, text: &str) {
    let frame = json!({"type": "message", "text": text}).to_string();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

/// Poll until the stored count equals `expected`.
async fn await_stored(store: &MemoryStore, expected: i64) {
    timeout(TIMEOUT, async {
        while stored(store).await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stored count never converged");
}

#[tokio::test]
async fn connecting_client_sees_its_own_count_update() {
    let store = MemoryStore::new();
    let node = boot_node(&store, "proc_a").await;

    let mut ws = connect(&node.ws_url).await;
    let v = read_until(&mut ws, "connection-count-updated").await;
    assert_eq!(v["count"], 1);
    assert_eq!(stored(&store).await, 1);
}

#[tokio::test]
async fn message_echoes_to_sender_with_receiver_metadata() {
    let store = MemoryStore::new();
    let node = boot_node(&store, "proc_a").await;
    let mut ws = connect(&node.ws_url).await;
    await_count(&mut ws, 1).await;

    send_text(&mut ws, "hello").await;
    let v = read_until(&mut ws, "new-message").await;
    assert_eq!(v["text"], "hello");
    assert_eq!(v["originProcess"], "proc_a");
    assert!(v["id"].as_str().unwrap().starts_with("msg_"));
    assert!(v["createdAt"].is_string());
}

#[tokio::test]
async fn message_alias_key_is_accepted() {
    let store = MemoryStore::new();
    let node = boot_node(&store, "proc_a").await;
    let mut ws = connect(&node.ws_url).await;
    await_count(&mut ws, 1).await;

    let frame = json!({"type": "message", "message": "aliased"}).to_string();
    ws.send(Message::Text(frame.into())).await.unwrap();
    let v = read_until(&mut ws, "new-message").await;
    assert_eq!(v["text"], "aliased");
}

#[tokio::test]
async fn empty_garbage_and_oversized_frames_publish_nothing() {
    let store = MemoryStore::new();
    let config = ServerConfig {
        max_message_chars: 5,
        ..ServerConfig::default()
    };
    let node = boot_node_with(&store, "proc_a", config).await;
    let mut ws = connect(&node.ws_url).await;
    await_count(&mut ws, 1).await;
    let before = store.publish_count();

    send_text(&mut ws, "").await;
    ws.send(Message::Text(json!({"type": "message"}).to_string().into()))
        .await
        .unwrap();
    ws.send(Message::Text("not json".into())).await.unwrap();
    send_text(&mut ws, "too long").await;
    send_text(&mut ws, "ok").await;

    // The only thing to come back is the last, valid message.
    let v = read_json(&mut ws).await;
    assert_eq!(v["type"], "new-message");
    assert_eq!(v["text"], "ok");
    assert_eq!(store.publish_count(), before + 1);
}

#[tokio::test]
async fn n_connects_then_n_disconnects_restore_the_store() {
    let store = MemoryStore::new();
    let node = boot_node(&store, "proc_a").await;
    store.set(CONNECTION_COUNT_KEY, 7).await.unwrap();

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(connect(&node.ws_url).await);
    }
    await_stored(&store, 11).await;

    for mut ws in clients {
        ws.close(None).await.unwrap();
    }
    await_stored(&store, 7).await;
    assert_eq!(node.server.registry().local_count(), 0);
}

#[tokio::test]
async fn two_processes_share_messages_and_counts() {
    let store = MemoryStore::new();
    let a = boot_node(&store, "proc_a").await;
    let b = boot_node(&store, "proc_b").await;

    let mut a1 = connect(&a.ws_url).await;
    let mut a2 = connect(&a.ws_url).await;
    await_stored(&store, 2).await;
    let mut b1 = connect(&b.ws_url).await;
    await_stored(&store, 3).await;

    for ws in [&mut a1, &mut a2, &mut b1] {
        await_count(ws, 3).await;
    }

    send_text(&mut a1, "test").await;
    let on_a1 = read_until(&mut a1, "new-message").await;
    let on_a2 = read_until(&mut a2, "new-message").await;
    let on_b1 = read_until(&mut b1, "new-message").await;
    for v in [&on_a1, &on_a2, &on_b1] {
        assert_eq!(v["text"], "test");
    }
    assert_eq!(on_a1["originProcess"], "proc_a");
    assert_eq!(on_b1["originProcess"], "proc_b");
    assert_ne!(on_a1["id"], on_a2["id"]);

    a1.close(None).await.unwrap();
    a2.close(None).await.unwrap();
    await_stored(&store, 1).await;
    await_count(&mut b1, 1).await;

    assert_eq!(a.server.drain(deadline_in(Duration::from_secs(1))).await, Some(ReconcileOutcome::Noop));
    assert_eq!(stored(&store).await, 1);
}

#[tokio::test]
async fn shutdown_severs_sessions_and_reconciles() {
    let store = MemoryStore::new();
    let a = boot_node(&store, "proc_a").await;
    let b = boot_node(&store, "proc_b").await;

    let mut a1 = connect(&a.ws_url).await;
    let _a2 = connect(&a.ws_url).await;
    let mut b1 = connect(&b.ws_url).await;
    await_stored(&store, 3).await;
    await_count(&mut b1, 3).await;

    let outcome = a.server.drain(deadline_in(Duration::from_secs(2))).await;
    assert_eq!(
        outcome,
        Some(ReconcileOutcome::Adjusted {
            before: 3,
            after: 1,
            released: 2
        })
    );
    assert_eq!(stored(&store).await, 1);

    // The severed client sees the socket close.
    let closed = timeout(TIMEOUT, async {
        loop {
            match a1.next().await {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    // A second drain has nothing left to do.
    assert_eq!(a.server.drain(deadline_in(Duration::from_secs(1))).await, Some(ReconcileOutcome::Noop));
}

#[tokio::test]
async fn silent_client_is_detached_by_heartbeat() {
    let store = MemoryStore::new();
    let config = ServerConfig {
        heartbeat_interval_ms: 50,
        heartbeat_timeout_ms: 100,
        ..ServerConfig::default()
    };
    let node = boot_node_with(&store, "proc_a", config).await;

    // Never polled, so pings go unanswered and nothing is read.
    let _silent = connect(&node.ws_url).await;
    await_stored(&store, 1).await;
    await_stored(&store, 0).await;
    assert_eq!(node.server.registry().local_count(), 0);
}

#[tokio::test]
async fn healthcheck_over_http() {
    let store = MemoryStore::new();
    let node = boot_node(&store, "proc_health").await;
    let mut ws = connect(&node.ws_url).await;
    await_count(&mut ws, 1).await;

    let resp = reqwest::get(format!("{}/healthcheck", node.http_url)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["process"], "proc_health");
    assert_eq!(body["connections"], 1);
    assert_ne!(body["port"], 0);
}

#[tokio::test]
async fn offline_store_keeps_sessions_alive() {
    let store = MemoryStore::new();
    let node = boot_node(&store, "proc_a").await;
    store.set_offline(true);

    let mut ws = connect(&node.ws_url).await;
    send_text(&mut ws, "lost").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.server.registry().local_count(), 1);

    store.set_offline(false);
    send_text(&mut ws, "delivered").await;
    let v = read_until(&mut ws, "new-message").await;
    assert_eq!(v["text"], "delivered");
}
