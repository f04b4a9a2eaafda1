// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless the user
/// explicitly disables them need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub image_ws: ImageWsConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

// ── Server ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the public + admin HTTP surface.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer key required on the public OpenAI-compatible endpoints.
    /// `None` means the public surface is open (useful behind a trusted
    /// reverse proxy).  Overridden by the `SLUICE_API_KEY` env var.
    pub api_key: Option<String>,
    /// Bearer key required on `/api/v1/admin/...`.  Overridden by the
    /// `SLUICE_ADMIN_KEY` env var.  When unset, admin routes return 403.
    pub admin_key: Option<String>,
    /// Base URL clients can reach this gateway on; used when rewriting
    /// cached media URLs.  Defaults to `http://<bind>`.
    pub public_base_url: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:8180".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: None,
            admin_key: None,
            public_base_url: None,
        }
    }
}

// ── Upstream ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// HTTPS base of the upstream service.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// WebSocket endpoint for streamed image generation.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Optional outbound proxy URL (`http://`, `https://` or `socks5://`).
    pub proxy: Option<String>,
    /// User agent sent on every upstream call.  Must match the fingerprint
    /// family — the upstream correlates the two.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Static anti-bot fingerprint header value.  When set this exact value
    /// is sent as `x-statsig-id` on every request.
    pub statsig_id: Option<String>,
    /// Derive a per-request fingerprint instead of using `statsig_id`.
    /// The derivation is deterministic over `(token id, minute bucket)` so
    /// it is reproducible in tests.  Off by default.
    #[serde(default)]
    pub dynamic_fingerprint: bool,
    /// Cloudflare clearance cookie value, when the upstream sits behind a
    /// challenge.  Sent verbatim as `cf_clearance=<value>`.
    pub cf_clearance: Option<String>,
    /// Whole-request timeout in seconds for a single upstream call.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    /// Route image generation over the WebSocket endpoint instead of HTTP.
    #[serde(default)]
    pub image_over_ws: bool,
}

fn default_base_url() -> String {
    "https://grok.com".into()
}

fn default_ws_url() -> String {
    "wss://grok.com/ws/imagine".into()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/131.0.0.0 Safari/537.36"
        .into()
}

fn default_upstream_timeout() -> u64 {
    120
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            proxy: None,
            user_agent: default_user_agent(),
            statsig_id: None,
            dynamic_fingerprint: false,
            cf_clearance: None,
            timeout_secs: default_upstream_timeout(),
            image_over_ws: false,
        }
    }
}

// ── Retry ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum upstream attempts per client request.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// HTTP status codes that are retried with a fresh token.
    #[serde(default = "default_retry_statuses")]
    pub status_codes: Vec<u16>,
    /// Exponential backoff base delay in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff multiplier applied per attempt.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Backoff delay cap in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Total retry budget per client request in seconds.  Once the
    /// cumulative backoff exceeds this, the request fails with a timeout.
    #[serde(default = "default_retry_budget")]
    pub budget_secs: u64,
}

fn default_max_retry() -> u32 {
    3
}
fn default_retry_statuses() -> Vec<u16> {
    vec![401, 403, 429]
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_retry_budget() -> u64 {
    90
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: default_max_retry(),
            status_codes: default_retry_statuses(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_factor: default_backoff_factor(),
            backoff_max_ms: default_backoff_max_ms(),
            budget_secs: default_retry_budget(),
        }
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Consecutive transient failures before a token is disabled.
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,
    /// Debounce window for persistence flushes in milliseconds.  Mutations
    /// within the window share one write.
    #[serde(default = "default_save_delay_ms")]
    pub save_delay_ms: u64,
    /// How often each worker rereads records whose persisted version moved.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
    /// Quota refresh interval for Basic tokens, in hours.
    #[serde(default = "default_refresh_hours")]
    pub refresh_interval_hours: u64,
    /// Quota refresh interval for Super tokens, in hours.
    #[serde(default = "default_super_refresh_hours")]
    pub super_refresh_interval_hours: u64,
    /// Concurrent quota-refresh probes.
    #[serde(default = "default_usage_concurrent")]
    pub usage_concurrent: usize,
}

fn default_fail_threshold() -> u32 {
    5
}
fn default_save_delay_ms() -> u64 {
    500
}
fn default_reload_interval() -> u64 {
    30
}
fn default_refresh_hours() -> u64 {
    8
}
fn default_super_refresh_hours() -> u64 {
    4
}
fn default_usage_concurrent() -> usize {
    10
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fail_threshold: default_fail_threshold(),
            save_delay_ms: default_save_delay_ms(),
            reload_interval_secs: default_reload_interval(),
            refresh_interval_hours: default_refresh_hours(),
            super_refresh_interval_hours: default_super_refresh_hours(),
            usage_concurrent: default_usage_concurrent(),
        }
    }
}

// ── Stream translation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Idle timeout for chat streams in seconds — no upstream byte for this
    /// long aborts the request.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Idle timeout for video streams in seconds.
    #[serde(default = "default_video_idle_timeout")]
    pub video_idle_timeout_secs: u64,
    /// Idle timeout for image WebSocket streams in seconds.
    #[serde(default = "default_image_idle_timeout")]
    pub image_idle_timeout_secs: u64,
    /// Container tags whose content is suppressed from chat output.
    /// Matching is case-insensitive and nesting-aware.
    #[serde(default = "default_filtered_tags")]
    pub filtered_tags: Vec<String>,
    /// Forward thinking traces as `delta.reasoning_content`.  When false,
    /// reasoning events are dropped.
    #[serde(default = "default_true")]
    pub show_thinking: bool,
}

fn default_idle_timeout() -> u64 {
    120
}
fn default_video_idle_timeout() -> u64 {
    300
}
fn default_image_idle_timeout() -> u64 {
    60
}
fn default_filtered_tags() -> Vec<String> {
    vec![
        "xaiartifact".into(),
        "xai:tool_usage_card".into(),
        "grok:render".into(),
    ]
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            video_idle_timeout_secs: default_video_idle_timeout(),
            image_idle_timeout_secs: default_image_idle_timeout(),
            filtered_tags: default_filtered_tags(),
            show_thinking: true,
        }
    }
}

// ── Image WebSocket thresholds ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageWsConfig {
    /// Frames below this decoded size are previews and are not emitted.
    #[serde(default = "default_medium_min")]
    pub medium_min_bytes: usize,
    /// First frame at or above this size is the final image.
    #[serde(default = "default_final_min")]
    pub final_min_bytes: usize,
    /// After a medium frame, waiting longer than this for a final frame is
    /// treated as a content-policy block.
    #[serde(default = "default_final_timeout")]
    pub final_timeout_secs: u64,
}

fn default_medium_min() -> usize {
    10 * 1024
}
fn default_final_min() -> usize {
    64 * 1024
}
fn default_final_timeout() -> u64 {
    30
}

impl Default for ImageWsConfig {
    fn default() -> Self {
        Self {
            medium_min_bytes: default_medium_min(),
            final_min_bytes: default_final_min(),
            final_timeout_secs: default_final_timeout(),
        }
    }
}

// ── Batch tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Worker count for `list_remote_assets`.
    #[serde(default = "default_batch_workers")]
    pub list_concurrent: usize,
    /// Worker count for `refresh_usage`.
    #[serde(default = "default_batch_workers")]
    pub refresh_concurrent: usize,
    /// Worker count for `enable_content_mode`.
    #[serde(default = "default_batch_workers")]
    pub content_concurrent: usize,
    /// Worker count for `purge_remote_assets`.
    #[serde(default = "default_batch_workers")]
    pub purge_concurrent: usize,
}

fn default_batch_workers() -> usize {
    10
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            list_concurrent: default_batch_workers(),
            refresh_concurrent: default_batch_workers(),
            content_concurrent: default_batch_workers(),
            purge_concurrent: default_batch_workers(),
        }
    }
}

// ── Media cache ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Root directory for cached image/video assets.
    #[serde(default = "default_media_root")]
    pub root: PathBuf,
    /// Cache size cap in bytes; least-recently-used assets are deleted
    /// once the cap is exceeded.
    #[serde(default = "default_media_max_bytes")]
    pub max_bytes: u64,
}

fn default_media_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sluice/media")
}

fn default_media_max_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
            max_bytes: default_media_max_bytes(),
        }
    }
}

// ── Token store ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the token catalog JSON document.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sluice/tokens.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.retry.max_retry, 3);
        assert_eq!(cfg.retry.status_codes, vec![401, 403, 429]);
        assert_eq!(cfg.pool.fail_threshold, 5);
        assert_eq!(cfg.pool.save_delay_ms, 500);
        assert_eq!(cfg.pool.reload_interval_secs, 30);
        assert!(cfg.stream.show_thinking);
    }

    #[test]
    fn filtered_tags_default_set() {
        let cfg = StreamConfig::default();
        assert!(cfg.filtered_tags.iter().any(|t| t == "xaiartifact"));
        assert!(cfg.filtered_tags.iter().any(|t| t == "grok:render"));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let yaml = "server:\n  bind: \"127.0.0.1:9000\"\n  some_future_knob: 42\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
    }

    #[test]
    fn empty_document_yields_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8180");
        assert_eq!(cfg.image_ws.medium_min_bytes, 10 * 1024);
    }
}
