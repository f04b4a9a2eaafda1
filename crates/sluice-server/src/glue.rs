// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapters wiring the translator, pool and batch engine to the concrete
//! upstream client and media cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use sluice_batch::TokenOps;
use sluice_media::{MediaCache, MediaKind};
use sluice_pool::{QuotaProbe, QuotaWindow, RefreshReport, TokenClass, TokenPool};
use sluice_translate::{MediaSink, StoredAsset};
use sluice_upstream::{AssetKind, UpstreamClient};

fn media_kind(kind: AssetKind) -> MediaKind {
    match kind {
        AssetKind::Image => MediaKind::Image,
        AssetKind::Video => MediaKind::Video,
    }
}

// ── Media sink ────────────────────────────────────────────────────────────────

/// Stores assets in the disk cache and mints gateway URLs for them.
pub struct GatewayMediaSink {
    cache: Arc<MediaCache>,
    upstream: Arc<UpstreamClient>,
    /// Prefix for emitted URLs; empty for relative gateway paths.
    base_url: String,
}

impl GatewayMediaSink {
    pub fn new(cache: Arc<MediaCache>, upstream: Arc<UpstreamClient>, base_url: String) -> Self {
        Self {
            cache,
            upstream,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MediaSink for GatewayMediaSink {
    async fn put(&self, bytes: Vec<u8>, kind: AssetKind) -> anyhow::Result<StoredAsset> {
        let kind = media_kind(kind);
        let name = self.cache.put(&bytes, kind).await?;
        Ok(StoredAsset {
            url: format!("{}/v1/files/{}/{}", self.base_url, kind.as_str(), name),
            bytes,
        })
    }

    async fn fetch_and_put(
        &self,
        url: &str,
        kind: AssetKind,
        token: &str,
    ) -> anyhow::Result<StoredAsset> {
        let bytes = self.upstream.fetch_asset_bytes(token, url).await?;
        self.put(bytes, kind).await
    }
}

// ── Quota probe ───────────────────────────────────────────────────────────────

const QUOTA_KINDS: &[&str] = &["chat", "image", "video"];

fn windows_from_limits(
    limits: BTreeMap<String, sluice_upstream::RateLimitWindow>,
) -> BTreeMap<String, QuotaWindow> {
    limits
        .into_iter()
        .map(|(kind, w)| {
            (
                kind,
                QuotaWindow {
                    remaining: w.remaining_queries,
                    window_reset_at: w
                        .window_size_seconds
                        .map(|s| Utc::now() + Duration::seconds(s)),
                },
            )
        })
        .collect()
}

/// Remaining-quota probe used by the pool's refresh scheduler.
pub struct UpstreamQuotaProbe {
    upstream: Arc<UpstreamClient>,
}

impl UpstreamQuotaProbe {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }
}

#[async_trait]
impl QuotaProbe for UpstreamQuotaProbe {
    async fn probe(&self, token_id: &str, _class: TokenClass) -> anyhow::Result<RefreshReport> {
        let limits = self.upstream.rate_limits(token_id, QUOTA_KINDS).await?;
        Ok(RefreshReport {
            windows: windows_from_limits(limits),
            // The probe authenticated; a revoked credential errors out
            // before we get here.
            healthy: true,
        })
    }
}

// ── Batch operations ──────────────────────────────────────────────────────────

/// Per-token batch operations over the live upstream.
pub struct UpstreamTokenOps {
    upstream: Arc<UpstreamClient>,
    pool: TokenPool,
}

impl UpstreamTokenOps {
    pub fn new(upstream: Arc<UpstreamClient>, pool: TokenPool) -> Self {
        Self { upstream, pool }
    }
}

#[async_trait]
impl TokenOps for UpstreamTokenOps {
    async fn refresh_usage(
        &self,
        token_id: &str,
        _class: TokenClass,
    ) -> anyhow::Result<serde_json::Value> {
        let limits = self.upstream.rate_limits(token_id, QUOTA_KINDS).await?;
        let windows = windows_from_limits(limits);
        let summary = serde_json::to_value(&windows)?;
        self.pool.apply_refresh(token_id, windows, true).await;
        Ok(summary)
    }

    async fn enable_content_mode(&self, token_id: &str) -> anyhow::Result<serde_json::Value> {
        self.upstream.enable_content_mode(token_id).await?;
        Ok(serde_json::json!({ "enabled": true }))
    }

    async fn list_assets(&self, token_id: &str) -> anyhow::Result<serde_json::Value> {
        let assets = self.upstream.list_assets(token_id).await?;
        Ok(serde_json::json!({ "count": assets.len(), "assets": assets }))
    }

    async fn purge_assets(&self, token_id: &str) -> anyhow::Result<serde_json::Value> {
        let assets = self.upstream.list_assets(token_id).await?;
        let mut deleted = 0usize;
        for asset in &assets {
            self.upstream.delete_asset(token_id, &asset.asset_id).await?;
            deleted += 1;
        }
        Ok(serde_json::json!({ "deleted": deleted }))
    }
}
