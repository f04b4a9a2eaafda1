// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Background quota refresh.
//!
//! One worker task per process wakes on an interval, finds records whose
//! `last_refreshed_at` is older than the class interval, and probes the
//! upstream's remaining-quota endpoint with each record's own credential.
//! Probes run with bounded concurrency (`pool.usage_concurrent`) so a large
//! pool does not stampede the upstream.  A healthy probe re-enables the
//! token; see [`TokenPool::apply_refresh`].
//!
//! The probe itself is behind the [`QuotaProbe`] trait so tests (and the
//! batch `refresh_usage` task, which reuses [`refresh_one`]) never need a
//! live upstream.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::record::{mask_token, QuotaWindow, TokenClass};
use crate::TokenPool;

/// Result of one remaining-quota probe.
#[derive(Debug, Clone)]
pub struct RefreshReport {
    /// Fresh per-kind quota windows.
    pub windows: BTreeMap<String, QuotaWindow>,
    /// The credential authenticated and the account is usable.
    pub healthy: bool,
}

/// Upstream remaining-quota query, keyed by credential.
#[async_trait]
pub trait QuotaProbe: Send + Sync {
    async fn probe(&self, token_id: &str, class: TokenClass) -> anyhow::Result<RefreshReport>;
}

/// Probe one token and fold the result into the pool.
///
/// Item-level idempotent: probing twice against unchanged upstream state
/// leaves the same snapshot.  A probe error leaves the record untouched.
pub async fn refresh_one(
    pool: &TokenPool,
    probe: &dyn QuotaProbe,
    id: &str,
    class: TokenClass,
) -> anyhow::Result<()> {
    let report = probe.probe(id, class).await?;
    debug!(
        token = %mask_token(id),
        healthy = report.healthy,
        windows = report.windows.len(),
        "quota refreshed"
    );
    pool.apply_refresh(id, report.windows, report.healthy).await;
    Ok(())
}

/// Spawn the per-process refresh worker.
pub fn spawn_refresh_worker(pool: TokenPool, probe: Arc<dyn QuotaProbe>) {
    tokio::spawn(async move {
        // Wake often enough to honour the shorter (Super) interval; the
        // per-record cutoff decides what actually gets probed.
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(15 * 60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            refresh_due(&pool, probe.as_ref()).await;
        }
    });
}

/// One scheduler pass: probe everything due, bounded by `usage_concurrent`.
pub async fn refresh_due(pool: &TokenPool, probe: &dyn QuotaProbe) {
    let config = pool.config().clone();
    let passes = [
        (
            TokenClass::Basic,
            Duration::hours(config.refresh_interval_hours as i64),
        ),
        (
            TokenClass::Super,
            Duration::hours(config.super_refresh_interval_hours as i64),
        ),
    ];

    let mut work = Vec::new();
    for (class, interval) in passes {
        for id in pool.due_for_refresh(class, interval).await {
            work.push((id, class));
        }
    }
    if work.is_empty() {
        return;
    }
    debug!(due = work.len(), "refreshing token quotas");

    futures::stream::iter(work)
        .for_each_concurrent(config.usage_concurrent.max(1), |(id, class)| async move {
            if let Err(e) = refresh_one(pool, probe, &id, class).await {
                warn!(token = %mask_token(&id), "quota refresh failed: {e}");
            }
        })
        .await;
}
