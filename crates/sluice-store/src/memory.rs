// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-memory backend for tests and ephemeral deployments.
//!
//! Also implements `watch` (the file backend does not), for backends-with-
//! notifications parity testing of the store contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::{StoreError, StoreEvent, TokenStore, VersionedRecord};

pub struct MemoryStore {
    records: Mutex<BTreeMap<String, VersionedRecord>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records: Mutex::new(BTreeMap::new()),
            events,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<VersionedRecord>, StoreError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn put(
        &self,
        id: &str,
        record: serde_json::Value,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let actual = records.get(id).map(|r| r.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let version = expected_version + 1;
        records.insert(id.to_string(), VersionedRecord { version, record });
        let _ = self.events.send(StoreEvent {
            id: id.to_string(),
            version,
        });
        Ok(version)
    }

    async fn list(&self) -> Result<BTreeMap<String, VersionedRecord>, StoreError> {
        Ok(self.records.lock().await.clone())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.remove(id).is_some())
    }

    fn watch(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        Some(self.events.subscribe())
    }
}
