// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Content-addressed media cache.
//!
//! Generated images and videos are stored on disk under a name derived
//! from the SHA-256 of their bytes, so identical content always maps to
//! the same URL and repeat generations cost nothing.  The cache is
//! size-capped: once `max_bytes` is exceeded, least-recently-touched
//! assets are deleted.  This process is the only writer to the storage
//! root; recency bookkeeping and deletion are serialised by one lock.
//!
//! Served `Content-Type` is always inferred from file magic, never from
//! the request.

use std::path::PathBuf;

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("asset not found")]
    NotFound,

    #[error("invalid asset name")]
    BadName,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaStats {
    pub files: usize,
    pub bytes: u64,
}

struct CacheState {
    /// `"<kind>/<name>"` → file size.  Recency order drives eviction.
    recency: LruCache<String, u64>,
    total_bytes: u64,
}

pub struct MediaCache {
    root: PathBuf,
    max_bytes: u64,
    state: Mutex<CacheState>,
}

impl MediaCache {
    /// Open (and create) the cache root, indexing any assets already on
    /// disk in modification-time order so eviction picks the oldest first.
    pub fn open(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, MediaError> {
        let root = root.into();
        let mut existing: Vec<(std::time::SystemTime, String, u64)> = Vec::new();
        for kind in ["image", "video"] {
            let dir = root.join(kind);
            std::fs::create_dir_all(&dir)?;
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
                existing.push((mtime, format!("{kind}/{name}"), meta.len()));
            }
        }
        existing.sort();

        let mut recency = LruCache::unbounded();
        let mut total_bytes = 0u64;
        for (_, key, size) in existing {
            recency.put(key, size);
            total_bytes += size;
        }
        info!(
            root = %root.display(),
            files = recency.len(),
            bytes = total_bytes,
            "media cache opened"
        );
        Ok(Self {
            root,
            max_bytes,
            state: Mutex::new(CacheState {
                recency,
                total_bytes,
            }),
        })
    }

    /// Store bytes, returning the stable asset name (`<sha>.<ext>`).
    /// Storing identical bytes twice returns the identical name.
    pub async fn put(&self, bytes: &[u8], kind: MediaKind) -> Result<String, MediaError> {
        let digest = Sha256::digest(bytes);
        let (ext, _) = sniff(bytes);
        let name = format!("{}.{ext}", &hex::encode(digest)[..32]);
        let path = self.root.join(kind.as_str()).join(&name);

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let tmp = path.with_extension(format!("{ext}.tmp"));
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            debug!(name = %name, bytes = bytes.len(), "asset cached");
        }

        let mut state = self.state.lock().await;
        let key = format!("{}/{name}", kind.as_str());
        if state.recency.put(key, bytes.len() as u64).is_none() {
            state.total_bytes += bytes.len() as u64;
        }
        self.evict_locked(&mut state).await;
        Ok(name)
    }

    /// Read an asset for serving; returns its bytes and sniffed mime type.
    pub async fn read(&self, kind: MediaKind, name: &str) -> Result<(Vec<u8>, &'static str), MediaError> {
        // Names are generated hex + extension; reject anything that could
        // escape the root.
        if name.contains('/') || name.contains("..") {
            return Err(MediaError::BadName);
        }
        let path = self.root.join(kind.as_str()).join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(MediaError::NotFound),
            Err(e) => return Err(e.into()),
        };
        let mime = sniff(&bytes).1;

        let mut state = self.state.lock().await;
        let key = format!("{}/{name}", kind.as_str());
        state.recency.get(&key); // touch
        Ok((bytes, mime))
    }

    pub async fn stat(&self) -> MediaStats {
        let state = self.state.lock().await;
        MediaStats {
            files: state.recency.len(),
            bytes: state.total_bytes,
        }
    }

    /// Delete every cached asset of `kind` (or all kinds).  Returns the
    /// number of files removed.
    pub async fn clear(&self, kind: Option<MediaKind>) -> Result<usize, MediaError> {
        let mut state = self.state.lock().await;
        let prefix = kind.map(|k| format!("{}/", k.as_str()));
        let keys: Vec<String> = state
            .recency
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| prefix.as_ref().map_or(true, |p| k.starts_with(p)))
            .collect();
        let mut removed = 0;
        for key in keys {
            if let Some(size) = state.recency.pop(&key) {
                state.total_bytes = state.total_bytes.saturating_sub(size);
            }
            if tokio::fs::remove_file(self.root.join(&key)).await.is_ok() {
                removed += 1;
            }
        }
        info!(removed, "media cache cleared");
        Ok(removed)
    }

    /// Drop least-recently-used assets until the cache fits the cap.
    async fn evict_locked(&self, state: &mut CacheState) {
        while state.total_bytes > self.max_bytes {
            let Some((key, size)) = state.recency.pop_lru() else {
                break;
            };
            state.total_bytes = state.total_bytes.saturating_sub(size);
            if let Err(e) = tokio::fs::remove_file(self.root.join(&key)).await {
                warn!(asset = %key, "eviction unlink failed: {e}");
            } else {
                debug!(asset = %key, size, "asset evicted");
            }
        }
    }
}

/// Infer `(extension, mime type)` from file magic.
pub fn sniff(bytes: &[u8]) -> (&'static str, &'static str) {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        ("jpg", "image/jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        ("png", "image/png")
    } else if bytes.starts_with(b"GIF8") {
        ("gif", "image/gif")
    } else if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        ("webp", "image/webp")
    } else if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
        ("mp4", "video/mp4")
    } else {
        ("bin", "application/octet-stream")
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(n: usize) -> Vec<u8> {
        let mut b = vec![0x89, b'P', b'N', b'G'];
        b.extend(std::iter::repeat(7u8).take(n));
        b
    }

    #[tokio::test]
    async fn identical_bytes_identical_name() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path(), 1024 * 1024).unwrap();
        let a = cache.put(&png_bytes(100), MediaKind::Image).await.unwrap();
        let b = cache.put(&png_bytes(100), MediaKind::Image).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.stat().await.files, 1, "no duplicate entry");
    }

    #[tokio::test]
    async fn extension_follows_magic() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path(), 1024 * 1024).unwrap();
        let name = cache
            .put(&[0xFF, 0xD8, 0xFF, 0xE0, 1, 2], MediaKind::Image)
            .await
            .unwrap();
        assert!(name.ends_with(".jpg"), "got {name}");
    }

    #[tokio::test]
    async fn read_serves_sniffed_mime() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path(), 1024 * 1024).unwrap();
        let name = cache.put(&png_bytes(10), MediaKind::Image).await.unwrap();
        let (bytes, mime) = cache.read(MediaKind::Image, &name).await.unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, png_bytes(10));
    }

    #[tokio::test]
    async fn missing_asset_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path(), 1024).unwrap();
        assert!(matches!(
            cache.read(MediaKind::Image, "deadbeef.png").await,
            Err(MediaError::NotFound)
        ));
    }

    #[tokio::test]
    async fn path_escapes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path(), 1024).unwrap();
        assert!(matches!(
            cache.read(MediaKind::Image, "../secrets").await,
            Err(MediaError::BadName)
        ));
    }

    #[tokio::test]
    async fn size_cap_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path(), 250).unwrap();

        let first = cache.put(&png_bytes(96), MediaKind::Image).await.unwrap();
        let _second = cache.put(&png_bytes(97), MediaKind::Image).await.unwrap();
        // Third put exceeds the 250-byte cap; the first asset must go.
        let third = cache.put(&png_bytes(98), MediaKind::Image).await.unwrap();

        assert!(matches!(
            cache.read(MediaKind::Image, &first).await,
            Err(MediaError::NotFound)
        ));
        assert!(cache.read(MediaKind::Image, &third).await.is_ok());
        assert!(cache.stat().await.bytes <= 250);
    }

    #[tokio::test]
    async fn clear_by_kind_leaves_other_kind() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MediaCache::open(dir.path(), 1024 * 1024).unwrap();
        let img = cache.put(&png_bytes(10), MediaKind::Image).await.unwrap();
        let vid = cache.put(b"\x00\x00\x00\x18ftypmp42....", MediaKind::Video).await.unwrap();

        let removed = cache.clear(Some(MediaKind::Image)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.read(MediaKind::Image, &img).await.is_err());
        assert!(cache.read(MediaKind::Video, &vid).await.is_ok());
    }

    #[tokio::test]
    async fn reopen_reindexes_existing_assets() {
        let dir = tempfile::tempdir().unwrap();
        let name;
        {
            let cache = MediaCache::open(dir.path(), 1024 * 1024).unwrap();
            name = cache.put(&png_bytes(10), MediaKind::Image).await.unwrap();
        }
        let cache = MediaCache::open(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(cache.stat().await.files, 1);
        assert!(cache.read(MediaKind::Image, &name).await.is_ok());
    }

    #[test]
    fn sniff_covers_known_magics() {
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0x00]).1, "image/jpeg");
        assert_eq!(sniff(b"GIF89a...").1, "image/gif");
        assert_eq!(sniff(b"RIFF\x00\x00\x00\x00WEBPVP8 ").1, "image/webp");
        assert_eq!(sniff(b"\x00\x00\x00\x18ftypisom....").1, "video/mp4");
        assert_eq!(sniff(b"plain text").1, "application/octet-stream");
    }
}
