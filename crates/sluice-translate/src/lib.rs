// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Upstream event streams → OpenAI-compatible chunks.
//!
//! Two translators live here: [`ChatTranslator`] for the NDJSON chat/video
//! protocol (tag filtering, reasoning-trace routing, asset rewriting) and
//! the WebSocket image state machine in [`image_ws`].  Both are pure state
//! machines fed by the request pipeline, which owns the timeouts and the
//! connection.

mod chat;
mod chunks;
mod error;
mod image_ws;
mod media;
mod tagfilter;

pub use chat::{ChatOptions, ChatTranslator};
pub use chunks::{ChatChunk, ChunkChoice, ChunkDelta, MediaChunk, MediaDatum, OpenAiChunk};
pub use error::TranslateError;
pub use image_ws::{collect_final_image, ImageWsTranslator, WsPhase, WsStep};
pub use media::{MediaSink, MemoryMediaSink, StoredAsset};
pub use tagfilter::TagFilter;
