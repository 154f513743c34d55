// End-to-end coverage: a real listener, reqwest as the API client and a
// tokio-tungstenite socket standing in for the browser peer.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use lmbridge::{build_router, AppState, Config, ModelCatalog};

type Peer = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: AppState,
}

impl TestServer {
    async fn start(api_key: &str) -> Self {
        let mut config = Config::default();
        config.auth.api_key = api_key.to_string();
        config.bridge.session_id = "default-session".to_string();
        config.bridge.message_id = "default-message".to_string();
        config.bridge.stream_response_timeout_secs = 10;
        let state = AppState::new(config, ModelCatalog::empty("unused-models.json"));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn connect_peer(&self) -> Peer {
        let before = self.connections();
        let (peer, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        for _ in 0..200 {
            if self.connections() > before {
                return peer;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peer was never installed");
    }

    fn connections(&self) -> u64 {
        self.state
            .tunnel_stats
            .connections
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    fn chat(&self, body: Value) -> tokio::task::JoinHandle<reqwest::Response> {
        let url = self.url("/v1/chat/completions");
        tokio::spawn(async move {
            reqwest::Client::new()
                .post(url)
                .json(&body)
                .send()
                .await
                .unwrap()
        })
    }
}

async fn next_envelope(peer: &mut Peer) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .expect("no envelope from bridge")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn reply(peer: &mut Peer, request_id: &str, data: Value) {
    let text = json!({ "request_id": request_id, "data": data }).to_string();
    peer.send(Message::Text(text.into())).await.unwrap();
}

fn request_id(envelope: &Value) -> String {
    envelope["request_id"].as_str().unwrap().to_string()
}

fn hello(model: &str) -> Value {
    json!({ "model": model, "messages": [{ "role": "user", "content": "hi" }] })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aggregate_reply_collects_all_text() {
    let server = TestServer::start("").await;
    let mut peer = server.connect_peer().await;

    let pending = server.chat(hello("test-model"));
    let envelope = next_envelope(&mut peer).await;
    let id = request_id(&envelope);
    assert_eq!(envelope["payload"]["session_id"], "default-session");
    assert_eq!(envelope["payload"]["message_id"], "default-message");
    assert_eq!(envelope["payload"]["message_templates"][0]["content"], "hi");
    assert_eq!(envelope["payload"]["target_model_id"], Value::Null);

    reply(&mut peer, &id, json!("a0:\"Hello\"\na0:\", wor")).await;
    reply(&mut peer, &id, json!("ld\"\nad:{\"finishReason\":\"stop\"}\n")).await;
    reply(&mut peer, &id, json!("[DONE]")).await;

    let resp = pending.await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello, world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(server.state.tunnel.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_reply_ends_with_done() {
    let server = TestServer::start("").await;
    let mut peer = server.connect_peer().await;

    let url = server.url("/v1/chat/completions?stream=true");
    let pending = tokio::spawn(async move {
        reqwest::Client::new()
            .post(url)
            .json(&hello("test-model"))
            .send()
            .await
            .unwrap()
    });
    let id = request_id(&next_envelope(&mut peer).await);
    reply(&mut peer, &id, json!("a0:\"Hi\"\n")).await;
    reply(&mut peer, &id, json!("[DONE]")).await;

    let resp = pending.await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let text = resp.text().await.unwrap();
    let payloads: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();
    assert_eq!(payloads.last(), Some(&"[DONE]"));

    let chunks: Vec<Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hi");
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_complete_out_of_order() {
    let server = TestServer::start("").await;
    let mut peer = server.connect_peer().await;

    let first = server.chat(hello("m1"));
    let id1 = request_id(&next_envelope(&mut peer).await);
    let second = server.chat(hello("m2"));
    let id2 = request_id(&next_envelope(&mut peer).await);
    assert_ne!(id1, id2);
    assert_eq!(server.state.tunnel.registry().len(), 2);

    reply(&mut peer, &id1, json!("a0:\"one-\"")).await;
    reply(&mut peer, &id2, json!("a0:\"two\"")).await;
    reply(&mut peer, &id2, json!("[DONE]")).await;

    let resp = second.await.unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["model"], "m2");
    assert_eq!(body["choices"][0]["message"]["content"], "two");
    assert!(server.state.tunnel.registry().contains(&id1));

    reply(&mut peer, &id1, json!("a0:\"done\"")).await;
    reply(&mut peer, &id1, json!("[DONE]")).await;
    let body: Value = first.await.unwrap().json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "one-done");
    assert!(server.state.tunnel.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_disconnect_fails_open_requests() {
    let server = TestServer::start("").await;
    let mut peer = server.connect_peer().await;

    let pending = server.chat(hello("test-model"));
    let _ = next_envelope(&mut peer).await;
    peer.close(None).await.unwrap();

    let resp = pending.await.unwrap();
    assert_eq!(resp.status().as_u16(), 500);
    let body: Value = resp.json().await.unwrap();
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("peer disconnected"), "{message}");
    assert!(server.state.tunnel.registry().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_error_object_is_reported() {
    let server = TestServer::start("").await;
    let mut peer = server.connect_peer().await;

    let pending = server.chat(hello("test-model"));
    let id = request_id(&next_envelope(&mut peer).await);
    reply(&mut peer, &id, json!({ "error": "Request Entity Too Large" })).await;

    let resp = pending.await.unwrap();
    assert_eq!(resp.status().as_u16(), 413);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "attachment_too_large");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_peer_replaces_old_one() {
    let server = TestServer::start("").await;
    let mut old = server.connect_peer().await;
    let mut new = server.connect_peer().await;

    // The replaced socket is closed by the bridge.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match old.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let pending = server.chat(hello("test-model"));
    let id = request_id(&next_envelope(&mut new).await);
    reply(&mut new, &id, json!("a0:\"fresh\"")).await;
    reply(&mut new, &id, json!("[DONE]")).await;
    let body: Value = pending.await.unwrap().json().await.unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "fresh");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn api_key_guards_chat_and_internal_routes() {
    let server = TestServer::start("sekrit").await;
    let client = reqwest::Client::new();

    let resp = client
        .post(server.url("/v1/chat/completions"))
        .json(&hello("m"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = client
        .post(server.url("/internal/request_page_source"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // Authorized but no peer yet.
    let resp = client
        .post(server.url("/v1/chat/completions"))
        .bearer_auth("sekrit")
        .json(&hello("m"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);

    let resp = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn page_source_command_reaches_peer() {
    let server = TestServer::start("").await;
    let mut peer = server.connect_peer().await;

    let resp = reqwest::Client::new()
        .post(server.url("/internal/request_page_source"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let command = next_envelope(&mut peer).await;
    assert_eq!(command, json!({ "command": "send_page_source" }));
}
