// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The token pool — single owner of every [`TokenRecord`].
//!
//! # Design
//!
//! ```text
//!   pipeline ──► acquire(hint) ──► TokenLease ──► release(outcome)
//!   admin    ──► import / remove / patch                │
//!   refresh  ──► apply_refresh                          │
//!                     │                                 ▼
//!                PoolInner (mutex)  ──► dirty set ──► debounced saver ──► store
//!                     │
//!                     └──► broadcast<PoolEvent> ──► admin SSE, batch progress
//! ```
//!
//! All mutation goes through this type; no other component ever touches a
//! `TokenRecord` field.  The mutex serialises per-record transitions, which
//! is the only cross-request ordering the gateway promises.  Selection does
//! **not** mean exclusivity: several live
//! leases may reference the same token — Basic quotas tolerate low tens of
//! concurrent calls.
//!
//! # Selection order
//!
//! Candidates of the hinted class that are not disabled and not cooling
//! off, ordered by
//!
//! 1. least-recently-used first (round-robin fairness),
//! 2. highest observed remaining quota,
//! 3. fewest consecutive failures.
//!
//! A lazy binary heap keyed on that tuple gives O(log N) selection:
//! entries carry a per-token generation stamp and are discarded on pop
//! when the stamp is stale.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sluice_config::PoolConfig;
use sluice_store::{StoreError, TokenStore};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::record::{mask_token, ClassHint, QuotaWindow, TokenClass, TokenRecord};

/// An exclusive lease handle with a snapshot of the record at acquisition.
///
/// Exclusive to the caller, not to the token: concurrent leases on the same
/// token are legal.
#[derive(Debug, Clone)]
pub struct TokenLease {
    pub lease_id: Uuid,
    pub token_id: String,
    pub class: TokenClass,
    /// Set when a `SuperPreferred` hint fell back to a Basic token.
    pub fell_back: bool,
    /// Record snapshot taken at acquisition; may be stale by release time.
    pub record: TokenRecord,
}

/// What happened with a leased token.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Structurally valid response.  Resets the failure counter; the hint,
    /// when present, updates one quota window.
    Success {
        quota_hint: Option<(String, QuotaWindow)>,
    },
    /// Retryable upstream failure.  Counts toward the disable threshold.
    TransientFailure { status: Option<u16> },
    /// Credential is dead (auth revoked).  Disables immediately.
    TerminalFailure { reason: String },
    /// Upstream window exhausted.  Cools the token until `reset_at`
    /// without penalising its failure counter.
    QuotaExhausted { reset_at: DateTime<Utc> },
    /// The client went away before the request proved anything about the
    /// token.  No state change either way.
    Cancelled,
}

/// Change notifications for the admin UI and batch progress.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Updated { id: String },
    Disabled { id: String, reason: String },
    Removed { id: String },
    Imported { count: usize },
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no selectable token for class hint {hint}")]
    NoToken { hint: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Operator patch applied by `replace_record`.  Absent fields are left
/// untouched.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct RecordPatch {
    pub class: Option<TokenClass>,
    pub disabled: Option<bool>,
    #[serde(default)]
    pub add_tags: Vec<String>,
    #[serde(default)]
    pub remove_tags: Vec<String>,
}

/// Aggregate counts for the admin snapshot endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub selectable_basic: usize,
    pub selectable_super: usize,
    pub disabled: usize,
    pub cooling: usize,
}

// ── Heap entry ────────────────────────────────────────────────────────────────

/// Selection key.  Smaller is better; `Ord` encodes the selection tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    seq: u64,
    remaining: i64,
    failures: u32,
    id: String,
    gen: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq
            .cmp(&other.seq)
            // higher remaining quota wins the tie
            .then(other.remaining.cmp(&self.remaining))
            .then(self.failures.cmp(&other.failures))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ── Inner state ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct PoolInner {
    records: HashMap<String, TokenRecord>,
    /// Persisted version per id, as last observed by this worker.
    versions: HashMap<String, u64>,
    /// Generation stamp per id; heap entries with an older stamp are dead.
    gens: HashMap<String, u64>,
    /// Monotonic use counter per id.  Drives round-robin ordering without
    /// depending on wall-clock resolution.
    use_seq: HashMap<String, u64>,
    next_seq: u64,
    heaps: HashMap<TokenClass, BinaryHeap<Reverse<HeapEntry>>>,
    dirty: HashSet<String>,
    pending_deletes: HashSet<String>,
}

impl PoolInner {
    fn entry_for(&self, id: &str) -> Option<HeapEntry> {
        let rec = self.records.get(id)?;
        Some(HeapEntry {
            seq: self.use_seq.get(id).copied().unwrap_or(0),
            remaining: rec.best_remaining(),
            failures: rec.consecutive_failures,
            id: id.to_string(),
            gen: self.gens.get(id).copied().unwrap_or(0),
        })
    }

    /// Bump the generation stamp and push a fresh heap entry.
    fn bump(&mut self, id: &str) {
        *self.gens.entry(id.to_string()).or_insert(0) += 1;
        if let Some(entry) = self.entry_for(id) {
            let class = match self.records.get(id) {
                Some(r) => r.class,
                None => return,
            };
            self.heaps.entry(class).or_default().push(Reverse(entry));
        }
    }

    /// Seed the use counter for a record discovered at load/reload time.
    /// Never-used tokens go to the front of the rotation.
    fn assign_seq(&mut self, id: &str, last_used_at: Option<DateTime<Utc>>) {
        let seq = if last_used_at.is_none() {
            0
        } else {
            self.next_seq += 1;
            self.next_seq
        };
        self.use_seq.insert(id.to_string(), seq);
    }

    /// Pop the best selectable id of `class` that is not in `exclude`.
    /// Entries that are currently cooling, disabled or excluded are parked
    /// and re-pushed so they come back once their state changes;
    /// stale-generation entries are discarded.
    fn pop_best(
        &mut self,
        class: TokenClass,
        now: DateTime<Utc>,
        exclude: &HashSet<String>,
    ) -> Option<String> {
        let mut parked = Vec::new();
        let mut chosen = None;
        loop {
            let entry = match self.heaps.entry(class).or_default().pop() {
                Some(Reverse(e)) => e,
                None => break,
            };
            let Some(rec) = self.records.get(&entry.id) else {
                continue; // removed
            };
            if rec.class != class {
                continue; // reclassified; lives in the other heap now
            }
            if entry.gen != self.gens.get(&entry.id).copied().unwrap_or(0) {
                continue; // superseded by a newer entry
            }
            if rec.selectable(now) && !exclude.contains(&entry.id) {
                chosen = Some(entry.id);
                break;
            }
            parked.push(Reverse(entry));
        }
        let heap = self.heaps.entry(class).or_default();
        for p in parked {
            heap.push(p);
        }
        chosen
    }
}

// ── Pool ──────────────────────────────────────────────────────────────────────

struct Shared {
    inner: Mutex<PoolInner>,
    events: broadcast::Sender<PoolEvent>,
    store: Arc<dyn TokenStore>,
    config: PoolConfig,
    dirty_tx: mpsc::Sender<()>,
    /// Receiver half, taken exactly once by [`TokenPool::start`].
    dirty_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

/// Cheap-to-clone handle to the pool.  All components hold one of these.
#[derive(Clone)]
pub struct TokenPool {
    shared: Arc<Shared>,
}

impl TokenPool {
    /// Load the catalog from the store, reconcile stale transient state,
    /// and build the in-memory selection structures.
    pub async fn load(store: Arc<dyn TokenStore>, config: PoolConfig) -> Result<Self, PoolError> {
        let listed = store.list().await?;
        let now = Utc::now();

        let mut inner = PoolInner::default();
        // Oldest-used first so the seeded rotation matches history.
        let mut loaded: Vec<(String, u64, TokenRecord)> = Vec::new();
        for (id, vrec) in listed {
            match serde_json::from_value::<TokenRecord>(vrec.record) {
                Ok(mut rec) => {
                    reconcile(&mut rec, now);
                    loaded.push((id, vrec.version, rec));
                }
                Err(e) => warn!(token = %mask_token(&id), "skipping unreadable record: {e}"),
            }
        }
        loaded.sort_by_key(|(_, _, rec)| rec.last_used_at);
        for (id, version, rec) in loaded {
            inner.versions.insert(id.clone(), version);
            inner.assign_seq(&id, rec.last_used_at);
            inner.records.insert(id.clone(), rec);
            inner.bump(&id);
        }
        info!(tokens = inner.records.len(), "token pool loaded");

        let (events, _) = broadcast::channel(1024);
        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                events,
                store,
                config,
                dirty_tx,
                dirty_rx: Mutex::new(Some(dirty_rx)),
            }),
        })
    }

    /// Spawn the background saver and the cross-worker reload tick.
    pub async fn start(&self) {
        if let Some(rx) = self.shared.dirty_rx.lock().await.take() {
            tokio::spawn(run_saver(self.clone(), rx));
            tokio::spawn(run_reload(self.clone()));
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    // ── Selection ─────────────────────────────────────────────────────────────

    /// Lease the best token for a request with the given class hint.
    pub async fn acquire(&self, hint: ClassHint, purpose: &str) -> Result<TokenLease, PoolError> {
        self.acquire_excluding(hint, purpose, &HashSet::new()).await
    }

    /// [`acquire`](Self::acquire), but never returning a token in
    /// `exclude`.  The pipeline uses this so a retry within one client
    /// request cannot land on a token that already failed it.
    pub async fn acquire_excluding(
        &self,
        hint: ClassHint,
        purpose: &str,
        exclude: &HashSet<String>,
    ) -> Result<TokenLease, PoolError> {
        let now = Utc::now();
        let classes: &[TokenClass] = match hint {
            ClassHint::Basic => &[TokenClass::Basic],
            ClassHint::Super => &[TokenClass::Super],
            ClassHint::SuperPreferred => &[TokenClass::Super, TokenClass::Basic],
        };

        let mut inner = self.shared.inner.lock().await;
        for (i, class) in classes.iter().enumerate() {
            let Some(id) = inner.pop_best(*class, now, exclude) else {
                continue;
            };
            let fell_back = matches!(hint, ClassHint::SuperPreferred) && i > 0;
            if fell_back {
                warn!(
                    token = %mask_token(&id),
                    %purpose,
                    "no super token selectable, falling back to basic"
                );
            }

            inner.next_seq += 1;
            let seq = inner.next_seq;
            inner.use_seq.insert(id.clone(), seq);
            if let Some(rec) = inner.records.get_mut(&id) {
                rec.last_used_at = Some(now);
            }
            inner.bump(&id);
            inner.dirty.insert(id.clone());
            let record = match inner.records.get(&id) {
                Some(r) => r.clone(),
                None => continue,
            };
            drop(inner);
            self.notify_dirty();

            debug!(token = %mask_token(&id), class = %class, %purpose, "token leased");
            return Ok(TokenLease {
                lease_id: Uuid::new_v4(),
                token_id: id,
                class: *class,
                fell_back,
                record,
            });
        }

        Err(PoolError::NoToken {
            hint: format!("{hint:?}"),
        })
    }

    /// Report the outcome of a leased request.
    pub async fn release(&self, lease: &TokenLease, outcome: Outcome) {
        let threshold = self.shared.config.fail_threshold;
        let mut inner = self.shared.inner.lock().await;
        let id = lease.token_id.clone();
        let Some(rec) = inner.records.get_mut(&id) else {
            return; // removed while leased
        };

        let event = match outcome {
            Outcome::Success { quota_hint } => {
                rec.consecutive_failures = 0;
                if let Some((kind, window)) = quota_hint {
                    rec.quota_snapshot.insert(kind, window);
                }
                PoolEvent::Updated { id: id.clone() }
            }
            Outcome::TransientFailure { status } => {
                rec.consecutive_failures += 1;
                warn!(
                    token = %mask_token(&id),
                    failures = rec.consecutive_failures,
                    ?status,
                    "transient upstream failure"
                );
                if rec.consecutive_failures >= threshold && !rec.disabled {
                    rec.disabled = true;
                    PoolEvent::Disabled {
                        id: id.clone(),
                        reason: format!("{threshold} consecutive failures"),
                    }
                } else {
                    PoolEvent::Updated { id: id.clone() }
                }
            }
            Outcome::TerminalFailure { reason } => {
                rec.disabled = true;
                warn!(token = %mask_token(&id), %reason, "token disabled");
                PoolEvent::Disabled {
                    id: id.clone(),
                    reason,
                }
            }
            Outcome::QuotaExhausted { reset_at } => {
                rec.cooldown_until = Some(reset_at);
                debug!(token = %mask_token(&id), %reset_at, "token cooling off");
                PoolEvent::Updated { id: id.clone() }
            }
            Outcome::Cancelled => {
                debug!(token = %mask_token(&id), "lease released without outcome");
                return;
            }
        };

        inner.bump(&id);
        inner.dirty.insert(id);
        drop(inner);
        self.notify_dirty();
        let _ = self.shared.events.send(event);
    }

    // ── Refresh integration ───────────────────────────────────────────────────

    /// Apply the result of a quota refresh probe.  A healthy report
    /// re-enables the token and clears transient failure state.
    pub async fn apply_refresh(
        &self,
        id: &str,
        windows: BTreeMap<String, QuotaWindow>,
        healthy: bool,
    ) {
        let mut inner = self.shared.inner.lock().await;
        let Some(rec) = inner.records.get_mut(id) else {
            return;
        };
        rec.quota_snapshot = windows;
        rec.last_refreshed_at = Some(Utc::now());
        if healthy {
            rec.disabled = false;
            rec.consecutive_failures = 0;
            rec.cooldown_until = None;
        }
        inner.bump(id);
        inner.dirty.insert(id.to_string());
        drop(inner);
        self.notify_dirty();
        let _ = self.shared.events.send(PoolEvent::Updated { id: id.to_string() });
    }

    /// Record ids due for a quota refresh, oldest refresh first.
    pub async fn due_for_refresh(&self, class: TokenClass, older_than: Duration) -> Vec<String> {
        let cutoff = Utc::now() - older_than;
        let inner = self.shared.inner.lock().await;
        let mut due: Vec<(Option<DateTime<Utc>>, String)> = inner
            .records
            .values()
            .filter(|r| r.class == class)
            .filter(|r| r.last_refreshed_at.map_or(true, |t| t < cutoff))
            .map(|r| (r.last_refreshed_at, r.id.clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Stamp an operator-initiated asset purge.
    pub async fn mark_cleared(&self, id: &str) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(rec) = inner.records.get_mut(id) {
            rec.last_cleared_at = Some(Utc::now());
            inner.bump(id);
            inner.dirty.insert(id.to_string());
        }
        drop(inner);
        self.notify_dirty();
    }

    /// Add an operator tag to a record (e.g. after enabling content mode).
    pub async fn add_tag(&self, id: &str, tag: &str) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(rec) = inner.records.get_mut(id) {
            if rec.tags.insert(tag.to_string()) {
                inner.dirty.insert(id.to_string());
            }
        }
        drop(inner);
        self.notify_dirty();
        let _ = self.shared.events.send(PoolEvent::Updated { id: id.to_string() });
    }

    // ── Operator surface ──────────────────────────────────────────────────────

    pub async fn list_all(&self) -> Vec<TokenRecord> {
        let inner = self.shared.inner.lock().await;
        let mut all: Vec<TokenRecord> = inner.records.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn get(&self, id: &str) -> Option<TokenRecord> {
        self.shared.inner.lock().await.records.get(id).cloned()
    }

    /// Import records, skipping ids that already exist.  Returns the number
    /// actually added.
    pub async fn import(&self, records: Vec<TokenRecord>) -> usize {
        let mut inner = self.shared.inner.lock().await;
        let mut added = 0;
        for rec in records {
            if inner.records.contains_key(&rec.id) {
                continue;
            }
            let id = rec.id.clone();
            inner.pending_deletes.remove(&id);
            inner.assign_seq(&id, rec.last_used_at);
            inner.records.insert(id.clone(), rec);
            inner.bump(&id);
            inner.dirty.insert(id);
            added += 1;
        }
        drop(inner);
        if added > 0 {
            self.notify_dirty();
            let _ = self.shared.events.send(PoolEvent::Imported { count: added });
            info!(count = added, "tokens imported");
        }
        added
    }

    /// Remove records by id.  Returns the number removed.
    pub async fn remove(&self, ids: &[String]) -> usize {
        let mut inner = self.shared.inner.lock().await;
        let mut removed = 0;
        for id in ids {
            if inner.records.remove(id).is_some() {
                inner.dirty.remove(id);
                inner.pending_deletes.insert(id.clone());
                removed += 1;
                let _ = self.shared.events.send(PoolEvent::Removed { id: id.clone() });
            }
        }
        drop(inner);
        if removed > 0 {
            self.notify_dirty();
            info!(count = removed, "tokens removed");
        }
        removed
    }

    /// Apply an operator patch.  Returns `false` when the id is unknown.
    /// Setting `disabled: false` also clears failure state so the token
    /// rejoins the rotation cleanly.
    pub async fn replace_record(&self, id: &str, patch: RecordPatch) -> bool {
        let mut inner = self.shared.inner.lock().await;
        let Some(rec) = inner.records.get_mut(id) else {
            return false;
        };
        if let Some(class) = patch.class {
            rec.class = class;
        }
        if let Some(disabled) = patch.disabled {
            rec.disabled = disabled;
            if !disabled {
                rec.consecutive_failures = 0;
                rec.cooldown_until = None;
            }
        }
        for tag in patch.add_tags {
            rec.tags.insert(tag);
        }
        for tag in &patch.remove_tags {
            rec.tags.remove(tag);
        }
        inner.bump(id);
        inner.dirty.insert(id.to_string());
        drop(inner);
        self.notify_dirty();
        let _ = self.shared.events.send(PoolEvent::Updated { id: id.to_string() });
        true
    }

    pub async fn stats(&self) -> PoolStats {
        let now = Utc::now();
        let inner = self.shared.inner.lock().await;
        let mut stats = PoolStats {
            total: inner.records.len(),
            selectable_basic: 0,
            selectable_super: 0,
            disabled: 0,
            cooling: 0,
        };
        for rec in inner.records.values() {
            if rec.disabled {
                stats.disabled += 1;
            } else if !rec.selectable(now) {
                stats.cooling += 1;
            } else {
                match rec.class {
                    TokenClass::Basic => stats.selectable_basic += 1,
                    TokenClass::Super => stats.selectable_super += 1,
                }
            }
        }
        stats
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    fn notify_dirty(&self) {
        // Capacity 1: a pending wakeup already covers this mutation.
        let _ = self.shared.dirty_tx.try_send(());
    }

    /// Flush all dirty records and pending deletes to the store.
    ///
    /// On an optimistic conflict the write is retried once against the
    /// stored version — this worker's in-memory record wins, and the
    /// periodic reload resolves anything further.
    pub async fn flush_now(&self) {
        let (dirty, deletes) = {
            let mut inner = self.shared.inner.lock().await;
            let dirty: Vec<(String, serde_json::Value, u64)> = inner
                .dirty
                .iter()
                .filter_map(|id| {
                    let rec = inner.records.get(id)?;
                    let value = serde_json::to_value(rec).ok()?;
                    Some((id.clone(), value, inner.versions.get(id).copied().unwrap_or(0)))
                })
                .collect();
            inner.dirty.clear();
            let deletes: Vec<String> = inner.pending_deletes.drain().collect();
            (dirty, deletes)
        };

        for id in deletes {
            if let Err(e) = self.shared.store.delete(&id).await {
                warn!(token = %mask_token(&id), "delete failed: {e}");
            } else {
                self.shared.inner.lock().await.versions.remove(&id);
            }
        }

        for (id, value, expected) in dirty {
            match self.shared.store.put(&id, value.clone(), expected).await {
                Ok(version) => {
                    self.shared.inner.lock().await.versions.insert(id, version);
                }
                Err(StoreError::Conflict { actual, .. }) => {
                    warn!(
                        token = %mask_token(&id),
                        expected,
                        actual,
                        "persistence conflict, retrying against stored version"
                    );
                    match self.shared.store.put(&id, value, actual).await {
                        Ok(version) => {
                            self.shared.inner.lock().await.versions.insert(id, version);
                        }
                        Err(e) => warn!(token = %mask_token(&id), "conflict retry failed: {e}"),
                    }
                }
                Err(e) => warn!(token = %mask_token(&id), "flush failed: {e}"),
            }
        }
    }

    /// Pull records whose persisted version moved under us (another worker
    /// wrote them).  Locally dirty records are skipped — our pending write
    /// wins and the next tick converges.
    pub async fn reload_from_store(&self) -> Result<(), PoolError> {
        let listed = self.shared.store.list().await?;
        let mut inner = self.shared.inner.lock().await;

        // Removed elsewhere.
        let gone: Vec<String> = inner
            .records
            .keys()
            .filter(|id| {
                !listed.contains_key(*id)
                    && !inner.dirty.contains(*id)
                    && inner.versions.contains_key(*id)
            })
            .cloned()
            .collect();
        for id in gone {
            inner.records.remove(&id);
            inner.versions.remove(&id);
            let _ = self.shared.events.send(PoolEvent::Removed { id });
        }

        for (id, vrec) in listed {
            if inner.dirty.contains(&id) || inner.pending_deletes.contains(&id) {
                continue;
            }
            if inner.versions.get(&id).copied() == Some(vrec.version) {
                continue;
            }
            match serde_json::from_value::<TokenRecord>(vrec.record) {
                Ok(rec) => {
                    debug!(token = %mask_token(&id), version = vrec.version, "record reloaded");
                    if !inner.records.contains_key(&id) {
                        inner.assign_seq(&id, rec.last_used_at);
                    }
                    inner.versions.insert(id.clone(), vrec.version);
                    inner.records.insert(id.clone(), rec);
                    inner.bump(&id);
                    let _ = self.shared.events.send(PoolEvent::Updated { id });
                }
                Err(e) => warn!(token = %mask_token(&id), "ignoring unreadable record: {e}"),
            }
        }
        Ok(())
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.shared.config
    }
}

/// Reset transient fields on records that have sat unused for a day.
/// Disabled-by-auth records stay disabled — only an operator or a healthy
/// refresh brings those back.
fn reconcile(rec: &mut TokenRecord, now: DateTime<Utc>) {
    let stale = rec
        .last_used_at
        .map_or(false, |t| now - t > Duration::hours(24));
    if stale {
        rec.consecutive_failures = 0;
        rec.cooldown_until = None;
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn run_saver(pool: TokenPool, mut rx: mpsc::Receiver<()>) {
    let delay = std::time::Duration::from_millis(pool.config().save_delay_ms);
    while rx.recv().await.is_some() {
        tokio::time::sleep(delay).await;
        // Coalesce every wakeup that arrived during the debounce window.
        while rx.try_recv().is_ok() {}
        pool.flush_now().await;
    }
}

async fn run_reload(pool: TokenPool) {
    let period = std::time::Duration::from_secs(pool.config().reload_interval_secs.max(1));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it, we just loaded.
    tick.tick().await;
    loop {
        tick.tick().await;
        if let Err(e) = pool.reload_from_store().await {
            warn!("pool reload failed: {e}");
        }
    }
}
