// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Typed client for the proprietary upstream.
//!
//! The upstream speaks three dialects:
//! - newline-delimited JSON events over chunked HTTP for chat and video,
//! - binary WebSocket frames for streamed image generation,
//! - plain JSON request/response for rate limits, asset management and
//!   account settings.
//!
//! Every call authenticates with a pooled credential, carries the anti-bot
//! fingerprint header, and (optionally) a Cloudflare clearance cookie.  The
//! [`Transport`] trait is the seam the request pipeline talks through, so
//! tests substitute [`ScriptedTransport`] and never touch the network.

mod client;
mod error;
mod events;
mod fingerprint;
mod payload;
mod scripted;
mod transport;

pub use client::UpstreamClient;
pub use error::UpstreamError;
pub use events::{drain_complete_lines, parse_event_line, AssetKind, DoneReason, UpstreamEvent};
pub use fingerprint::fingerprint_for;
pub use payload::{ChatPayload, ImagePayload, RateLimitWindow, RemoteAsset, VideoParams};
pub use scripted::{ChatScript, ScriptedTransport, WsScript};
pub use transport::{EventStream, FrameStream, Transport, WsFrame};
