// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Single-file JSON backend.
//!
//! The whole catalog lives in one document:
//!
//! ```json
//! { "records": { "<token id>": { "version": 3, "record": { ... } } } }
//! ```
//!
//! Every operation rereads the document under the lock, so a sibling
//! worker's writes are observed on the next call.  Writes go through a
//! temp file + rename so a crash never leaves a half-written catalog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{StoreError, TokenStore, VersionedRecord};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    records: BTreeMap<String, VersionedRecord>,
}

pub struct FileStore {
    path: PathBuf,
    /// Serialises read-modify-write cycles within this process.  Cross
    /// process races are resolved by the version check, not by this lock.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Document, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, doc: &Document) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_path(&self.path);
        let bytes = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), records = doc.records.len(), "catalog flushed");
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl TokenStore for FileStore {
    async fn get(&self, id: &str) -> Result<Option<VersionedRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.records.remove(id))
    }

    async fn put(
        &self,
        id: &str,
        record: serde_json::Value,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let actual = doc.records.get(id).map(|r| r.version).unwrap_or(0);
        if actual != expected_version {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let version = expected_version + 1;
        doc.records
            .insert(id.to_string(), VersionedRecord { version, record });
        self.save(&doc).await?;
        Ok(version)
    }

    async fn list(&self) -> Result<BTreeMap<String, VersionedRecord>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.records)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let existed = doc.records.remove(id).is_some();
        if existed {
            self.save(&doc).await?;
        }
        Ok(existed)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_in(dir: &tempfile::TempDir) -> FileStore {
        FileStore::new(dir.path().join("tokens.json"))
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let rec = json!({"id": "sso-a", "class": "basic"});
        let v = store.put("sso-a", rec.clone(), 0).await.unwrap();
        assert_eq!(v, 1);
        let got = store.get("sso-a").await.unwrap().unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.record, rec);
    }

    #[tokio::test]
    async fn unknown_fields_survive_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let rec = json!({
            "id": "sso-b",
            "class": "super",
            "some_future_field": {"nested": [1, 2, 3]},
        });
        store.put("sso-b", rec.clone(), 0).await.unwrap();

        // Reopen from the same path: simulates a process restart.
        let reopened = FileStore::new(dir.path().join("tokens.json"));
        let got = reopened.get("sso-b").await.unwrap().unwrap();
        assert_eq!(got.record["some_future_field"]["nested"][2], json!(3));
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.put("sso-c", json!({}), 0).await.unwrap();
        store.put("sso-c", json!({"x": 1}), 1).await.unwrap();

        // A writer that still believes version 1 must lose.
        let err = store.put("sso-c", json!({"x": 2}), 1).await.unwrap_err();
        match err {
            StoreError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.put("sso-d", json!({}), 0).await.unwrap();
        assert!(store.delete("sso-d").await.unwrap());
        assert!(!store.delete("sso-d").await.unwrap());
        assert!(store.get("sso-d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_is_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.list().await.unwrap().is_empty());
    }
}
