// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Indirection between the translator and asset storage.
//!
//! The translator never touches disk: asset events are resolved through
//! this trait, and the emitted URL always points at the local gateway so
//! clients are never handed an upstream URL that 403s later.

use async_trait::async_trait;
use sluice_upstream::AssetKind;

/// A stored asset: the gateway-local URL plus the raw bytes (needed when
/// the client asked for `b64_json`).
#[derive(Debug, Clone)]
pub struct StoredAsset {
    pub url: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Store inline bytes, returning a stable local URL.
    async fn put(&self, bytes: Vec<u8>, kind: AssetKind) -> anyhow::Result<StoredAsset>;

    /// Fetch a remote upstream asset with the generating credential and
    /// store it under a content-addressed name.
    async fn fetch_and_put(
        &self,
        url: &str,
        kind: AssetKind,
        token: &str,
    ) -> anyhow::Result<StoredAsset>;
}

/// In-memory sink for tests: content-addressed by a cheap hash, remote
/// fetches resolve to a fixed marker payload.
#[derive(Default)]
pub struct MemoryMediaSink;

#[async_trait]
impl MediaSink for MemoryMediaSink {
    async fn put(&self, bytes: Vec<u8>, kind: AssetKind) -> anyhow::Result<StoredAsset> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        bytes.hash(&mut hasher);
        Ok(StoredAsset {
            url: format!("/v1/files/{}/{:016x}", kind.as_str(), hasher.finish()),
            bytes,
        })
    }

    async fn fetch_and_put(
        &self,
        url: &str,
        kind: AssetKind,
        _token: &str,
    ) -> anyhow::Result<StoredAsset> {
        self.put(format!("fetched:{url}").into_bytes(), kind).await
    }
}
