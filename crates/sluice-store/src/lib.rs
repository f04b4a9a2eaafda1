// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pluggable persistence for the token catalog.
//!
//! The gateway persists exactly two things per token: the record itself
//! (opaque JSON from the store's point of view) and a monotonic version.
//! In multi-worker deployments the store is the only shared source of
//! truth; workers converge by rereading records whose version moved.
//!
//! # Contract
//!
//! - `put` uses optimistic concurrency: the caller passes the version it
//!   last observed and the write fails with [`StoreError::Conflict`] when
//!   the stored version differs.  A fresh record is written with
//!   `expected_version = 0`.
//! - Record payloads round-trip byte-for-byte at the JSON level, so fields
//!   this build does not understand survive a load/save cycle.
//! - `watch` is optional; backends without change notification return
//!   `None` and callers fall back to interval reloads.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// A stored record together with its persistence version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionedRecord {
    pub version: u64,
    pub record: serde_json::Value,
}

/// Change notification from backends that support [`TokenStore::watch`].
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub id: String,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic version check failed; `actual` is the version on disk.
    #[error("version conflict on {id}: expected {expected}, stored {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt store document: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fetch one record by id, `None` when absent.
    async fn get(&self, id: &str) -> Result<Option<VersionedRecord>, StoreError>;

    /// Write a record.  `expected_version` must match the stored version
    /// (0 for a record that does not exist yet); on success the new version
    /// (`expected_version + 1`) is returned.
    async fn put(
        &self,
        id: &str,
        record: serde_json::Value,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// All records keyed by id.
    async fn list(&self) -> Result<BTreeMap<String, VersionedRecord>, StoreError>;

    /// Remove a record.  Returns `true` when it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Change notifications, when the backend supports push.  The default
    /// is `None`; callers then rely on interval-based reload.
    fn watch(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        None
    }
}
