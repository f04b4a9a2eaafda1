// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Operator batch tasks.
//!
//! Long-running fan-outs over the token pool — refresh every quota, flip
//! content mode everywhere, enumerate or purge remote assets — exposed as
//! cancellable, progress-reporting jobs.  The admin surface consumes them
//! as server-sent events.
//!
//! # Design
//!
//! ```text
//!   submit(kind, targets) ──► task registry ──► runner task
//!                                                  │ bounded fan-out
//!                                   ops (upstream) ┤ per token id
//!                                                  ▼
//!   stream(task_id)  ◄── broadcast ◄── snapshot/progress/done/cancelled
//!   cancel(task_id)  ──► watch flag, observed between and during items
//! ```
//!
//! Tasks are in-memory; a restart cancels them.  That is acceptable
//! because every item is idempotent (refresh, enable, list, delete).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use sluice_config::BatchConfig;
use sluice_pool::{mask_token, TokenClass, TokenPool};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// The four operator task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    RefreshUsage,
    EnableContentMode,
    ListRemoteAssets,
    PurgeRemoteAssets,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RefreshUsage => "refresh_usage",
            Self::EnableContentMode => "enable_content_mode",
            Self::ListRemoteAssets => "list_remote_assets",
            Self::PurgeRemoteAssets => "purge_remote_assets",
        }
    }
}

/// Per-token operations a task fans out over.  The production
/// implementation drives the upstream client and folds results back into
/// the pool; tests substitute scripted behaviour.
#[async_trait]
pub trait TokenOps: Send + Sync {
    async fn refresh_usage(
        &self,
        token_id: &str,
        class: TokenClass,
    ) -> anyhow::Result<serde_json::Value>;
    async fn enable_content_mode(&self, token_id: &str) -> anyhow::Result<serde_json::Value>;
    async fn list_assets(&self, token_id: &str) -> anyhow::Result<serde_json::Value>;
    async fn purge_assets(&self, token_id: &str) -> anyhow::Result<serde_json::Value>;
}

// ── Task state & events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Ok,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub status: ItemStatus,
    pub detail: serde_json::Value,
}

/// SSE payloads.  `snapshot` is sent once per subscriber, then live
/// events follow.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Snapshot {
        task_id: Uuid,
        kind: TaskKind,
        total: usize,
        completed: usize,
        results: BTreeMap<String, ItemResult>,
        terminal: Option<&'static str>,
    },
    Progress {
        completed: usize,
        total: usize,
    },
    Done {
        completed: usize,
        total: usize,
    },
    Cancelled {
        completed: usize,
        total: usize,
    },
    Error {
        message: String,
    },
}

struct TaskState {
    total: usize,
    /// Items that actually ran (ok or error); cancelled items don't count.
    completed: usize,
    results: BTreeMap<String, ItemResult>,
    terminal: Option<&'static str>,
    last_emit: std::time::Instant,
}

struct TaskEntry {
    kind: TaskKind,
    cancel_tx: watch::Sender<bool>,
    events: broadcast::Sender<TaskEvent>,
    state: Arc<std::sync::Mutex<TaskState>>,
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BatchEngine {
    pool: TokenPool,
    ops: Arc<dyn TokenOps>,
    config: BatchConfig,
    tasks: Arc<Mutex<std::collections::HashMap<Uuid, Arc<TaskEntry>>>>,
}

impl BatchEngine {
    pub fn new(pool: TokenPool, ops: Arc<dyn TokenOps>, config: BatchConfig) -> Self {
        Self {
            pool,
            ops,
            config,
            tasks: Arc::new(Mutex::new(std::collections::HashMap::new())),
        }
    }

    fn concurrency(&self, kind: TaskKind) -> usize {
        let n = match kind {
            TaskKind::RefreshUsage => self.config.refresh_concurrent,
            TaskKind::EnableContentMode => self.config.content_concurrent,
            TaskKind::ListRemoteAssets => self.config.list_concurrent,
            TaskKind::PurgeRemoteAssets => self.config.purge_concurrent,
        };
        n.max(1)
    }

    /// Launch a task over `targets` (all pool tokens when `None`).
    pub async fn submit(&self, kind: TaskKind, targets: Option<Vec<String>>) -> Uuid {
        let ids = match targets {
            Some(ids) => ids,
            None => self
                .pool
                .list_all()
                .await
                .into_iter()
                .map(|r| r.id)
                .collect(),
        };

        let task_id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        let state = Arc::new(std::sync::Mutex::new(TaskState {
            total: ids.len(),
            completed: 0,
            results: BTreeMap::new(),
            terminal: None,
            last_emit: std::time::Instant::now(),
        }));

        let entry = Arc::new(TaskEntry {
            kind,
            cancel_tx,
            events: events.clone(),
            state: state.clone(),
        });
        self.tasks.lock().await.insert(task_id, entry);

        info!(task = %task_id, kind = kind.as_str(), items = ids.len(), "batch task submitted");
        let engine = self.clone();
        tokio::spawn(engine.run_task(task_id, kind, ids, cancel_rx, events, state));
        task_id
    }

    /// Subscribe to a task: current snapshot plus the live event stream.
    /// `None` for unknown task ids.
    pub async fn subscribe(
        &self,
        task_id: Uuid,
    ) -> Option<(TaskEvent, broadcast::Receiver<TaskEvent>)> {
        let tasks = self.tasks.lock().await;
        let entry = tasks.get(&task_id)?;
        let rx = entry.events.subscribe();
        let state = entry.state.lock().expect("task state lock");
        let snapshot = TaskEvent::Snapshot {
            task_id,
            kind: entry.kind,
            total: state.total,
            completed: state.completed,
            results: state.results.clone(),
            terminal: state.terminal,
        };
        Some((snapshot, rx))
    }

    /// Request cancellation.  Running items are raced against the flag;
    /// unstarted items are recorded as cancelled.  Returns `false` for
    /// unknown ids.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let tasks = self.tasks.lock().await;
        match tasks.get(&task_id) {
            Some(entry) => {
                info!(task = %task_id, "batch task cancel requested");
                let _ = entry.cancel_tx.send(true);
                true
            }
            None => false,
        }
    }

    async fn run_task(
        self,
        task_id: Uuid,
        kind: TaskKind,
        ids: Vec<String>,
        cancel_rx: watch::Receiver<bool>,
        events: broadcast::Sender<TaskEvent>,
        state: Arc<std::sync::Mutex<TaskState>>,
    ) {
        let concurrency = self.concurrency(kind);
        let ops = self.ops.clone();
        let pool = self.pool.clone();

        futures::stream::iter(ids)
            .for_each_concurrent(concurrency, |id| {
                let ops = ops.clone();
                let pool = pool.clone();
                let mut cancel = cancel_rx.clone();
                let events = events.clone();
                let state = state.clone();
                async move {
                    if *cancel.borrow() {
                        record(&state, &id, ItemStatus::Cancelled, serde_json::Value::Null);
                        return;
                    }
                    let outcome = tokio::select! {
                        _ = cancel.changed() => None,
                        result = run_op(ops.as_ref(), &pool, kind, &id) => Some(result),
                    };
                    match outcome {
                        None => {
                            record(&state, &id, ItemStatus::Cancelled, serde_json::Value::Null);
                        }
                        Some(Ok(detail)) => {
                            record_completed(&state, &id, ItemStatus::Ok, detail);
                        }
                        Some(Err(e)) => {
                            warn!(token = %mask_token(&id), kind = kind.as_str(), "batch item failed: {e}");
                            record_completed(
                                &state,
                                &id,
                                ItemStatus::Error,
                                serde_json::json!({ "error": e.to_string() }),
                            );
                        }
                    }
                    maybe_emit_progress(&state, &events);
                }
            })
            .await;

        let cancelled = *cancel_rx.borrow();
        let (completed, total) = {
            let mut s = state.lock().expect("task state lock");
            s.terminal = Some(if cancelled { "cancelled" } else { "done" });
            (s.completed, s.total)
        };
        let terminal = if cancelled {
            TaskEvent::Cancelled { completed, total }
        } else {
            TaskEvent::Done { completed, total }
        };
        info!(
            task = %task_id,
            kind = kind.as_str(),
            completed,
            total,
            cancelled,
            "batch task finished"
        );
        let _ = events.send(terminal);
    }
}

async fn run_op(
    ops: &dyn TokenOps,
    pool: &TokenPool,
    kind: TaskKind,
    id: &str,
) -> anyhow::Result<serde_json::Value> {
    match kind {
        TaskKind::RefreshUsage => {
            let class = pool
                .get(id)
                .await
                .map(|r| r.class)
                .unwrap_or(TokenClass::Basic);
            ops.refresh_usage(id, class).await
        }
        TaskKind::EnableContentMode => {
            let detail = ops.enable_content_mode(id).await?;
            pool.add_tag(id, "content-mode-enabled").await;
            Ok(detail)
        }
        TaskKind::ListRemoteAssets => ops.list_assets(id).await,
        TaskKind::PurgeRemoteAssets => {
            let detail = ops.purge_assets(id).await?;
            pool.mark_cleared(id).await;
            Ok(detail)
        }
    }
}

fn record(
    state: &std::sync::Mutex<TaskState>,
    id: &str,
    status: ItemStatus,
    detail: serde_json::Value,
) {
    let mut s = state.lock().expect("task state lock");
    s.results
        .insert(id.to_string(), ItemResult { status, detail });
}

fn record_completed(
    state: &std::sync::Mutex<TaskState>,
    id: &str,
    status: ItemStatus,
    detail: serde_json::Value,
) {
    let mut s = state.lock().expect("task state lock");
    s.results
        .insert(id.to_string(), ItemResult { status, detail });
    s.completed += 1;
}

/// Emit a progress event on every 8th completion or after 250 ms of
/// silence, whichever comes first.
fn maybe_emit_progress(state: &std::sync::Mutex<TaskState>, events: &broadcast::Sender<TaskEvent>) {
    let mut s = state.lock().expect("task state lock");
    let due =
        s.completed % 8 == 0 || s.last_emit.elapsed() >= std::time::Duration::from_millis(250);
    if due {
        s.last_emit = std::time::Instant::now();
        let _ = events.send(TaskEvent::Progress {
            completed: s.completed,
            total: s.total,
        });
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_config::PoolConfig;
    use sluice_store::MemoryStore;
    use sluice_pool::TokenRecord;
    use tokio::sync::Semaphore;

    struct InstantOps;

    #[async_trait]
    impl TokenOps for InstantOps {
        async fn refresh_usage(
            &self,
            _token_id: &str,
            _class: TokenClass,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "remaining": 42 }))
        }
        async fn enable_content_mode(&self, _: &str) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "enabled": true }))
        }
        async fn list_assets(&self, _: &str) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "assets": [] }))
        }
        async fn purge_assets(&self, _: &str) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "deleted": 0 }))
        }
    }

    /// Ops gated by a semaphore: only `permits` items can ever complete
    /// until the test adds more.  Used for deterministic cancellation.
    struct GatedOps {
        gate: Semaphore,
    }

    #[async_trait]
    impl TokenOps for GatedOps {
        async fn refresh_usage(
            &self,
            _token_id: &str,
            _class: TokenClass,
        ) -> anyhow::Result<serde_json::Value> {
            let permit = self.gate.acquire().await.expect("gate open");
            permit.forget();
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

    async fn pool_with(n: usize) -> TokenPool {
        let pool = TokenPool::load(Arc::new(MemoryStore::new()), PoolConfig::default())
            .await
            .unwrap();
        pool.import(
            (0..n)
                .map(|i| TokenRecord::new(format!("sso-{i:03}"), TokenClass::Basic))
                .collect(),
        )
        .await;
        pool
    }

    fn engine(pool: TokenPool, ops: Arc<dyn TokenOps>, concurrency: usize) -> BatchEngine {
        let config = BatchConfig {
            list_concurrent: concurrency,
            refresh_concurrent: concurrency,
            content_concurrent: concurrency,
            purge_concurrent: concurrency,
        };
        BatchEngine::new(pool, ops, config)
    }

    async fn wait_terminal(
        engine: &BatchEngine,
        task_id: Uuid,
        mut rx: broadcast::Receiver<TaskEvent>,
    ) -> TaskEvent {
        loop {
            match rx.recv().await.expect("event stream open") {
                ev @ (TaskEvent::Done { .. } | TaskEvent::Cancelled { .. }) => {
                    // Snapshot must agree with the terminal event.
                    let (snapshot, _) = engine.subscribe(task_id).await.unwrap();
                    if let TaskEvent::Snapshot { terminal, .. } = snapshot {
                        assert!(terminal.is_some());
                    }
                    return ev;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn refresh_task_completes_all_items() {
        let pool = pool_with(5).await;
        let engine = engine(pool, Arc::new(InstantOps), 4);
        let task_id = engine.submit(TaskKind::RefreshUsage, None).await;
        let (_, rx) = engine.subscribe(task_id).await.unwrap();
        let terminal = wait_terminal(&engine, task_id, rx).await;

        assert!(matches!(
            terminal,
            TaskEvent::Done {
                completed: 5,
                total: 5
            }
        ));
        let (snapshot, _) = engine.subscribe(task_id).await.unwrap();
        match snapshot {
            TaskEvent::Snapshot { results, .. } => {
                assert_eq!(results.len(), 5);
                assert!(results.values().all(|r| r.status == ItemStatus::Ok));
            }
            other => panic!("unexpected snapshot: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_twice_is_idempotent() {
        let pool = pool_with(3).await;
        let engine = engine(pool, Arc::new(InstantOps), 2);

        let mut snapshots = Vec::new();
        for _ in 0..2 {
            let task_id = engine.submit(TaskKind::RefreshUsage, None).await;
            let (_, rx) = engine.subscribe(task_id).await.unwrap();
            wait_terminal(&engine, task_id, rx).await;
            let (snapshot, _) = engine.subscribe(task_id).await.unwrap();
            if let TaskEvent::Snapshot { results, .. } = snapshot {
                snapshots.push(serde_json::to_value(results).unwrap());
            }
        }
        assert_eq!(snapshots[0], snapshots[1]);
    }

    #[tokio::test]
    async fn explicit_targets_override_pool() {
        let pool = pool_with(10).await;
        let engine = engine(pool, Arc::new(InstantOps), 2);
        let task_id = engine
            .submit(
                TaskKind::ListRemoteAssets,
                Some(vec!["sso-000".into(), "sso-001".into()]),
            )
            .await;
        let (_, rx) = engine.subscribe(task_id).await.unwrap();
        let terminal = wait_terminal(&engine, task_id, rx).await;
        assert!(matches!(terminal, TaskEvent::Done { total: 2, .. }));
    }

    #[tokio::test]
    async fn content_mode_tags_records() {
        let pool = pool_with(2).await;
        let engine = engine(pool.clone(), Arc::new(InstantOps), 2);
        let task_id = engine.submit(TaskKind::EnableContentMode, None).await;
        let (_, rx) = engine.subscribe(task_id).await.unwrap();
        wait_terminal(&engine, task_id, rx).await;

        for rec in pool.list_all().await {
            assert!(rec.tags.contains("content-mode-enabled"));
        }
    }

    #[tokio::test]
    async fn cancel_splits_completed_and_cancelled() {
        let pool = pool_with(100).await;
        // Exactly 20 items can complete; item 21 blocks on the gate until
        // cancellation wins the race.  Sequential so counts are exact.
        let engine = engine(
            pool,
            Arc::new(GatedOps {
                gate: Semaphore::new(20),
            }),
            1,
        );
        let task_id = engine.submit(TaskKind::RefreshUsage, None).await;
        let (_, rx) = engine.subscribe(task_id).await.unwrap();

        // Wait until the 20 permitted items are done.
        loop {
            let (snapshot, _) = engine.subscribe(task_id).await.unwrap();
            if let TaskEvent::Snapshot { completed, .. } = snapshot {
                if completed >= 20 {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(engine.cancel(task_id).await);
        let terminal = wait_terminal(&engine, task_id, rx).await;
        assert!(matches!(
            terminal,
            TaskEvent::Cancelled {
                completed: 20,
                total: 100
            }
        ));

        let (snapshot, _) = engine.subscribe(task_id).await.unwrap();
        match snapshot {
            TaskEvent::Snapshot { results, .. } => {
                let ok = results.values().filter(|r| r.status == ItemStatus::Ok).count();
                let cancelled = results
                    .values()
                    .filter(|r| r.status == ItemStatus::Cancelled)
                    .count();
                assert_eq!(ok, 20);
                assert_eq!(cancelled, 80);
            }
            other => panic!("unexpected snapshot: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_false() {
        let pool = pool_with(1).await;
        let engine = engine(pool, Arc::new(InstantOps), 1);
        assert!(!engine.cancel(Uuid::new_v4()).await);
        assert!(engine.subscribe(Uuid::new_v4()).await.is_none());
    }
}
