// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Production HTTP/WebSocket client.
//!
//! One `reqwest::Client` per gateway process carries every upstream call:
//! proxy, user agent and timeout come from [`UpstreamConfig`].  Each
//! request additionally gets the pooled credential as a bearer token, the
//! anti-bot fingerprint header, and the Cloudflare clearance cookie when
//! configured.

use std::collections::BTreeMap;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use sluice_config::UpstreamConfig;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, protocol::Message};
use tracing::debug;

use crate::{
    drain_complete_lines, fingerprint_for, ChatPayload, EventStream, FrameStream, ImagePayload,
    RateLimitWindow, RemoteAsset, Transport, UpstreamError, UpstreamEvent, WsFrame,
};

pub struct UpstreamClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(std::time::Duration::from_secs(config.timeout_secs));
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
            config,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str, token: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let mut req = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("x-statsig-id", fingerprint_for(&self.config, token, Utc::now()));
        if let Some(cf) = &self.config.cf_clearance {
            req = req.header(reqwest::header::COOKIE, format!("cf_clearance={cf}"));
        }
        req
    }

    /// Turn a non-success response into a [`UpstreamError::Status`],
    /// extracting the `Retry-After` hint when present.
    fn check_status(resp: &reqwest::Response) -> Result<(), UpstreamError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok());
        Err(UpstreamError::Status {
            status: status.as_u16(),
            retry_after,
        })
    }

    // ── Rate limits ───────────────────────────────────────────────────────────

    /// Query remaining quota for the given request kinds, one window per
    /// kind.  Kinds the upstream does not answer for are omitted.
    pub async fn rate_limits(
        &self,
        token: &str,
        kinds: &[&str],
    ) -> Result<BTreeMap<String, RateLimitWindow>, UpstreamError> {
        let mut windows = BTreeMap::new();
        for kind in kinds {
            let resp = self
                .request(reqwest::Method::POST, "/rest/rate-limits", token)
                .json(&json!({ "requestKind": kind }))
                .send()
                .await?;
            Self::check_status(&resp)?;
            match resp.json::<RateLimitWindow>().await {
                Ok(window) => {
                    windows.insert(kind.to_string(), window);
                }
                Err(e) => {
                    return Err(UpstreamError::Protocol(format!(
                        "bad rate-limit response for {kind}: {e}"
                    )))
                }
            }
        }
        Ok(windows)
    }

    // ── Asset repository ──────────────────────────────────────────────────────

    pub async fn list_assets(&self, token: &str) -> Result<Vec<RemoteAsset>, UpstreamError> {
        let resp = self
            .request(reqwest::Method::GET, "/rest/assets?pageSize=1000", token)
            .send()
            .await?;
        Self::check_status(&resp)?;
        let body: serde_json::Value = resp.json().await?;
        let assets = body["assets"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(assets)
    }

    pub async fn delete_asset(&self, token: &str, asset_id: &str) -> Result<(), UpstreamError> {
        let resp = self
            .request(reqwest::Method::POST, "/rest/assets/delete", token)
            .json(&json!({ "assetId": asset_id }))
            .send()
            .await?;
        Self::check_status(&resp)
    }

    /// Flip the account-level content-mode setting for one credential.
    pub async fn enable_content_mode(&self, token: &str) -> Result<(), UpstreamError> {
        let resp = self
            .request(reqwest::Method::POST, "/rest/user/settings", token)
            .json(&json!({ "enableUnrestrictedContent": true }))
            .send()
            .await?;
        Self::check_status(&resp)
    }

    /// Fetch a remote asset's bytes with the token that generated it.
    /// Used by the media cache to pin upstream URLs locally.
    pub async fn fetch_asset_bytes(
        &self,
        token: &str,
        url: &str,
    ) -> Result<Vec<u8>, UpstreamError> {
        let mut req = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("x-statsig-id", fingerprint_for(&self.config, token, Utc::now()));
        if let Some(cf) = &self.config.cf_clearance {
            req = req.header(reqwest::header::COOKIE, format!("cf_clearance={cf}"));
        }
        let resp = req.send().await?;
        Self::check_status(&resp)?;
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait::async_trait]
impl Transport for UpstreamClient {
    async fn chat_stream(
        &self,
        token: &str,
        payload: ChatPayload,
    ) -> Result<EventStream, UpstreamError> {
        debug!(model = %payload.model_name, "opening upstream conversation");
        let resp = self
            .request(
                reqwest::Method::POST,
                "/rest/app-chat/conversations/new",
                token,
            )
            .json(&payload)
            .send()
            .await?;
        Self::check_status(&resp)?;

        // Events can split across TCP packets; keep a line buffer across
        // chunks and emit only complete lines.
        let stream = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<UpstreamEvent, UpstreamError>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_complete_lines(buf)
                    }
                    Err(e) => vec![Err(UpstreamError::Network(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }

    async fn image_ws(
        &self,
        token: &str,
        payload: ImagePayload,
    ) -> Result<FrameStream, UpstreamError> {
        let mut request = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Ws(format!("bad ws url: {e}")))?;

        let fingerprint = fingerprint_for(&self.config, token, Utc::now());
        let headers = request.headers_mut();
        let mut set = |name: &'static str, value: String| {
            if let Ok(v) = value.parse() {
                headers.insert(name, v);
            }
        };
        set("authorization", format!("Bearer {token}"));
        set("x-statsig-id", fingerprint);
        set("user-agent", self.config.user_agent.clone());
        if let Some(cf) = &self.config.cf_clearance {
            set("cookie", format!("cf_clearance={cf}"));
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(resp) => UpstreamError::Status {
                    status: resp.status().as_u16(),
                    retry_after: None,
                },
                other => UpstreamError::Ws(other.to_string()),
            })?;

        let (mut sink, source) = ws.split();
        let text = serde_json::to_string(&payload)
            .map_err(|e| UpstreamError::Protocol(format!("unencodable payload: {e}")))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| UpstreamError::Ws(e.to_string()))?;

        let frames = source.filter_map(|msg| {
            let item = match msg {
                Ok(Message::Binary(bytes)) => Some(Ok(WsFrame { bytes })),
                Ok(Message::Text(text)) => decode_text_frame(&text),
                Ok(Message::Close(_)) => None,
                Ok(_) => None, // ping/pong handled by tungstenite
                Err(e) => Some(Err(UpstreamError::Ws(e.to_string()))),
            };
            std::future::ready(item)
        });

        Ok(Box::pin(frames))
    }
}

/// Text frames either carry a base64 payload or an in-band error; anything
/// else (progress chatter) is skipped.
fn decode_text_frame(text: &str) -> Option<Result<WsFrame, UpstreamError>> {
    use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
    let v: serde_json::Value = serde_json::from_str(text).ok()?;
    if let Some(err) = v.get("error") {
        return Some(Err(UpstreamError::Ws(
            err["message"].as_str().unwrap_or("upstream error").to_string(),
        )));
    }
    let blob = v["blob"].as_str()?;
    match B64.decode(blob) {
        Ok(bytes) => Some(Ok(WsFrame { bytes })),
        Err(e) => Some(Err(UpstreamError::Protocol(format!("bad frame blob: {e}")))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_frame_with_blob_decodes() {
        let frame = decode_text_frame(r#"{"blob":"aGk="}"#).unwrap().unwrap();
        assert_eq!(frame.bytes, b"hi");
    }

    #[test]
    fn text_frame_with_error_surfaces() {
        let result = decode_text_frame(r#"{"error":{"message":"blocked"}}"#).unwrap();
        assert!(matches!(result, Err(UpstreamError::Ws(m)) if m == "blocked"));
    }

    #[test]
    fn progress_chatter_is_skipped() {
        assert!(decode_text_frame(r#"{"progress":0.4}"#).is_none());
        assert!(decode_text_frame("not json").is_none());
    }
}
