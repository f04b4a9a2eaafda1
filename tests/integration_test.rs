// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end scenarios over real HTTP: a bound axum server wired to the
//! scripted transport, driven with reqwest.

use std::sync::Arc;

use async_trait::async_trait;
use sluice_batch::{BatchEngine, TokenOps};
use sluice_config::Config;
use sluice_core::Pipeline;
use sluice_media::MediaCache;
use sluice_pool::{TokenClass, TokenPool, TokenRecord};
use sluice_server::{AppState, GatewayMediaSink};
use sluice_store::MemoryStore;
use sluice_translate::MediaSink;
use sluice_upstream::{
    DoneReason, ScriptedTransport, Transport, UpstreamClient, UpstreamEvent, WsFrame, WsScript,
};

const API_KEY: &str = "sk-test-public";
const ADMIN_KEY: &str = "sk-test-admin";

struct NoopOps;

#[async_trait]
impl TokenOps for NoopOps {
    async fn refresh_usage(
        &self,
        _token_id: &str,
        _class: TokenClass,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({ "remaining": 1 }))
    }
    async fn enable_content_mode(&self, _: &str) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
    async fn list_assets(&self, _: &str) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
    async fn purge_assets(&self, _: &str) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

struct Harness {
    base: String,
    client: reqwest::Client,
    pool: TokenPool,
    transport: Arc<ScriptedTransport>,
    media: Arc<MediaCache>,
    _media_dir: tempfile::TempDir,
}

impl Harness {
    /// Bind a gateway on an ephemeral port with the given tokens and
    /// config tweaks applied on top of fast-test defaults.
    async fn start(tokens: Vec<TokenRecord>, tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.server.api_key = Some(API_KEY.into());
        config.server.admin_key = Some(ADMIN_KEY.into());
        config.retry.backoff_base_ms = 1;
        config.retry.backoff_max_ms = 5;
        tweak(&mut config);
        let config = Arc::new(config);

        let pool = TokenPool::load(Arc::new(MemoryStore::new()), config.pool.clone())
            .await
            .expect("load empty catalog");
        pool.import(tokens).await;

        let media_dir = tempfile::tempdir().expect("media tempdir");
        let media =
            Arc::new(MediaCache::open(media_dir.path(), 64 * 1024 * 1024).expect("media cache"));
        let upstream =
            Arc::new(UpstreamClient::new(config.upstream.clone()).expect("upstream client"));
        let sink: Arc<dyn MediaSink> = Arc::new(GatewayMediaSink::new(
            media.clone(),
            upstream,
            String::new(),
        ));

        let transport = Arc::new(ScriptedTransport::new());
        let transport_dyn: Arc<dyn Transport> = transport.clone();
        let pipeline = Pipeline::new(pool.clone(), transport_dyn, sink, config.clone());
        let batch = BatchEngine::new(pool.clone(), Arc::new(NoopOps), config.batch.clone());

        let state = AppState {
            config,
            pool: pool.clone(),
            pipeline,
            batch,
            media: media.clone(),
        };
        let app = sluice_server::router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            pool,
            transport,
            media,
            _media_dir: media_dir,
        }
    }

    async fn post_chat(&self, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/v1/chat/completions", self.base))
            .bearer_auth(API_KEY)
            .json(&body)
            .send()
            .await
            .expect("request sent")
    }
}

fn basic(id: &str) -> TokenRecord {
    TokenRecord::new(id, TokenClass::Basic)
}

fn happy_script(text: &str) -> Vec<UpstreamEvent> {
    vec![
        UpstreamEvent::Delta { text: text.into() },
        UpstreamEvent::Done {
            reason: DoneReason::Stop,
        },
    ]
}

/// Pull the `delta.content` pieces out of an SSE body.
fn sse_content(body: &str) -> String {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .filter_map(|data| serde_json::from_str::<serde_json::Value>(data).ok())
        .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(String::from))
        .collect()
}

// ── Scenario 1: happy streamed chat ──────────────────────────────────────────

#[tokio::test]
async fn happy_chat_streams_sse_to_done() {
    let h = Harness::start(vec![basic("sso-a")], |_| {}).await;
    h.transport.queue_chat_events(happy_script("Hello from the pool"));

    let resp = h
        .post_chat(serde_json::json!({
            "model": "grok-4",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true,
        }))
        .await;
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = resp.text().await.unwrap();
    assert_eq!(sse_content(&body), "Hello from the pool");
    assert!(body.contains(r#""finish_reason":"stop""#));
    assert!(body.trim_end().ends_with("data: [DONE]"));

    let rec = h.pool.get("sso-a").await.unwrap();
    assert_eq!(rec.consecutive_failures, 0);
    assert!(rec.last_used_at.is_some());
}

// ── Scenario 2: retry on 429 ─────────────────────────────────────────────────

#[tokio::test]
async fn retry_on_429_uses_other_token() {
    let h = Harness::start(vec![basic("sso-a"), basic("sso-b")], |_| {}).await;
    h.transport.queue_chat_status(429, Some(90));
    h.transport.queue_chat_events(happy_script("answered anyway"));

    let resp = h
        .post_chat(serde_json::json!({
            "model": "grok-4",
            "messages": [{"role": "user", "content": "Hi"}],
        }))
        .await;
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        body["choices"][0]["message"]["content"].as_str().unwrap(),
        "answered anyway"
    );

    let tokens = h.transport.chat_tokens();
    assert_eq!(tokens.len(), 2);
    assert_ne!(tokens[0], tokens[1]);
    assert!(h.pool.get(&tokens[0]).await.unwrap().cooldown_until.is_some());
}

// ── Scenario 3: failure threshold disables the pool ──────────────────────────

#[tokio::test]
async fn five_500s_disable_token_then_pool_empty() {
    let h = Harness::start(vec![basic("sso-a")], |_| {}).await;
    for _ in 0..5 {
        h.transport.queue_chat_status(500, None);
    }

    for _ in 0..5 {
        let resp = h
            .post_chat(serde_json::json!({
                "model": "grok-4",
                "messages": [{"role": "user", "content": "Hi"}],
            }))
            .await;
        assert_eq!(resp.status(), 502);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["code"], "upstream_http_5xx");
    }
    assert!(h.pool.get("sso-a").await.unwrap().disabled);

    let resp = h
        .post_chat(serde_json::json!({
            "model": "grok-4",
            "messages": [{"role": "user", "content": "Hi"}],
        }))
        .await;
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "pool_empty");
    assert_eq!(body["error"]["type"], "upstream_unavailable");
}

// ── Scenario 4: video class routing ──────────────────────────────────────────

#[tokio::test]
async fn video_720p_prefers_super_token() {
    let h = Harness::start(
        vec![
            basic("sso-basic"),
            TokenRecord::new("sso-super", TokenClass::Super),
        ],
        |_| {},
    )
    .await;
    h.transport.queue_chat_events(happy_script("clip rendered"));

    let resp = h
        .post_chat(serde_json::json!({
            "model": "grok-video",
            "messages": [{"role": "user", "content": "a fjord"}],
            "video_config": {"resolution_name": "720p", "video_length": 6},
        }))
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(h.transport.chat_tokens(), vec!["sso-super"]);
}

#[tokio::test]
async fn video_720p_falls_back_to_basic_when_no_super() {
    let h = Harness::start(vec![basic("sso-basic")], |_| {}).await;
    h.transport.queue_chat_events(happy_script("clip rendered"));

    let resp = h
        .post_chat(serde_json::json!({
            "model": "grok-video",
            "messages": [{"role": "user", "content": "a fjord"}],
            "video_config": {"resolution_name": "720p", "video_length": 6},
        }))
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(h.transport.chat_tokens(), vec!["sso-basic"]);
}

// ── Scenario 5: WebSocket image mode blocked ─────────────────────────────────

#[tokio::test]
async fn image_ws_blocked_surfaces_502() {
    let h = Harness::start(vec![basic("sso-a")], |config| {
        config.upstream.image_over_ws = true;
        config.image_ws.final_timeout_secs = 0;
    })
    .await;
    h.transport.queue_ws(WsScript {
        frames: vec![Ok(WsFrame {
            bytes: vec![0u8; 40 * 1024],
        })],
        then_hang: true,
    });

    let resp = h
        .client
        .post(format!("{}/v1/images/generations", h.base))
        .bearer_auth(API_KEY)
        .json(&serde_json::json!({ "prompt": "a lighthouse" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "translator_blocked");
    assert_eq!(body["error"]["type"], "bad_gateway");
}

// ── Image generation + media proxy ───────────────────────────────────────────

#[tokio::test]
async fn image_ws_result_served_by_media_proxy() {
    let h = Harness::start(vec![basic("sso-a")], |config| {
        config.upstream.image_over_ws = true;
    })
    .await;
    // A real-enough PNG so the proxy sniffs image/png.
    let mut png = vec![0x89, b'P', b'N', b'G'];
    png.resize(100 * 1024, 0x7f);
    h.transport.queue_ws(WsScript {
        frames: vec![Ok(WsFrame { bytes: png })],
        then_hang: false,
    });

    let resp = h
        .client
        .post(format!("{}/v1/images/generations", h.base))
        .bearer_auth(API_KEY)
        .json(&serde_json::json!({ "prompt": "a lighthouse" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let url = body["data"][0]["url"].as_str().unwrap();
    assert!(url.starts_with("/v1/files/image/"), "got {url}");

    // The emitted URL must resolve on this gateway, with sniffed type.
    let asset = h
        .client
        .get(format!("{}{url}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(asset.status(), 200);
    assert_eq!(asset.headers().get("content-type").unwrap(), "image/png");
}

// ── Auth and admin surface ───────────────────────────────────────────────────

#[tokio::test]
async fn missing_api_key_is_rejected() {
    let h = Harness::start(vec![basic("sso-a")], |_| {}).await;
    let resp = h
        .client
        .post(format!("{}/v1/chat/completions", h.base))
        .json(&serde_json::json!({
            "model": "grok-4",
            "messages": [{"role": "user", "content": "Hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn models_endpoint_lists_catalog() {
    let h = Harness::start(vec![], |_| {}).await;
    let resp = h
        .client
        .get(format!("{}/v1/models", h.base))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert!(ids.contains(&"grok-4"));
    assert!(ids.contains(&"grok-4-heavy"));
}

#[tokio::test]
async fn admin_surface_requires_admin_key() {
    let h = Harness::start(vec![basic("sso-a")], |_| {}).await;

    let resp = h
        .client
        .get(format!("{}/api/v1/admin/pool", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // The public API key is not an admin key.
    let resp = h
        .client
        .get(format!("{}/api/v1/admin/pool", h.base))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = h
        .client
        .get(format!("{}/api/v1/admin/pool", h.base))
        .bearer_auth(ADMIN_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["stats"]["total"], 1);
}

#[tokio::test]
async fn admin_imports_and_deletes_tokens() {
    let h = Harness::start(vec![], |_| {}).await;

    let resp = h
        .client
        .post(format!("{}/api/v1/admin/tokens", h.base))
        .bearer_auth(ADMIN_KEY)
        .json(&serde_json::json!({
            "tokens": [
                {"id": "sso-new-1"},
                {"id": "sso-new-2", "class": "super"},
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["added"], 2);

    let resp = h
        .client
        .post(format!("{}/api/v1/admin/tokens/delete", h.base))
        .bearer_auth(ADMIN_KEY)
        .json(&serde_json::json!({ "ids": ["sso-new-1"] }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], 1);

    assert!(h.pool.get("sso-new-1").await.is_none());
    assert_eq!(
        h.pool.get("sso-new-2").await.unwrap().class,
        TokenClass::Super
    );
}

// ── Media URL stability across requests ──────────────────────────────────────

#[tokio::test]
async fn identical_bytes_share_one_cached_asset() {
    let h = Harness::start(vec![], |_| {}).await;
    let bytes = {
        let mut b = vec![0x89, b'P', b'N', b'G'];
        b.extend_from_slice(&[1, 2, 3, 4]);
        b
    };
    let a = h
        .media
        .put(&bytes, sluice_media::MediaKind::Image)
        .await
        .unwrap();
    let b = h
        .media
        .put(&bytes, sluice_media::MediaKind::Image)
        .await
        .unwrap();
    assert_eq!(a, b);
}
