// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire event parsing.
//!
//! Chat and video responses arrive as newline-delimited JSON, one event per
//! line, each wrapped in `{"result":{"response":{...}}}`.  A single event
//! may be split across TCP packets, so a persistent line buffer is kept
//! across chunks and only complete `\n`-terminated lines are parsed.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde_json::Value;

use crate::UpstreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Video,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    Stop,
    Length,
}

/// One upstream event, already lifted out of its wire envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Incremental assistant text.
    Delta { text: String },
    /// Incremental thinking trace, emitted on a separate channel.
    Reasoning { text: String },
    /// Structural tool-usage marker; suppressed from client output.
    ToolCard { payload: Value },
    /// Generated media.  Exactly one of `url` / `bytes` is set.
    Asset {
        kind: AssetKind,
        url: Option<String>,
        bytes: Option<Vec<u8>>,
        seq: u32,
        elapsed_ms: u64,
    },
    /// Terminal marker.
    Done { reason: DoneReason },
    /// In-band upstream error.
    Error {
        kind: String,
        message: String,
        http_status: Option<u16>,
    },
}

/// Drain all complete `\n`-terminated lines from `buf` and parse each into
/// an event.  Any trailing incomplete line stays in `buf` so the next TCP
/// chunk can extend it.
pub fn drain_complete_lines(buf: &mut String) -> Vec<Result<UpstreamEvent, UpstreamError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_event_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse one complete line.  Returns `None` for blank lines (keep-alives).
pub fn parse_event_line(line: &str) -> Option<Result<UpstreamEvent, UpstreamError>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let v: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            return Some(Err(UpstreamError::Protocol(format!(
                "unparseable event line: {e}"
            ))))
        }
    };
    Some(parse_event(&v))
}

fn parse_event(v: &Value) -> Result<UpstreamEvent, UpstreamError> {
    // In-band errors come outside the result envelope.
    if let Some(err) = v.get("error") {
        return Ok(UpstreamEvent::Error {
            kind: err["kind"].as_str().unwrap_or("upstream_error").to_string(),
            message: err["message"].as_str().unwrap_or_default().to_string(),
            http_status: err["httpStatus"].as_u64().map(|s| s as u16),
        });
    }

    let resp = &v["result"]["response"];
    if resp.is_null() {
        return Err(UpstreamError::Protocol(
            "event has neither result.response nor error".into(),
        ));
    }

    if let Some(card) = resp.get("toolUsageCard") {
        return Ok(UpstreamEvent::ToolCard {
            payload: card.clone(),
        });
    }

    if let Some(img) = resp.get("imageAttachment") {
        return parse_asset(img, AssetKind::Image);
    }
    if let Some(vid) = resp.get("videoAttachment") {
        return parse_asset(vid, AssetKind::Video);
    }

    // Terminal markers: an explicit soft stop, or the final metadata blob
    // that closes every conversation turn.
    if resp["isSoftStop"].as_bool() == Some(true) || resp.get("finalMetadata").is_some() {
        let reason = match resp["stopReason"].as_str() {
            Some("length") => DoneReason::Length,
            _ => DoneReason::Stop,
        };
        return Ok(UpstreamEvent::Done { reason });
    }

    if let Some(token) = resp["token"].as_str() {
        let text = token.to_string();
        return Ok(if resp["isThinking"].as_bool() == Some(true) {
            UpstreamEvent::Reasoning { text }
        } else {
            UpstreamEvent::Delta { text }
        });
    }

    // Unknown-but-well-formed responses (user metadata echoes etc.) are
    // tolerated as empty deltas rather than killing the stream.
    Ok(UpstreamEvent::Delta {
        text: String::new(),
    })
}

fn parse_asset(v: &Value, kind: AssetKind) -> Result<UpstreamEvent, UpstreamError> {
    let url = v["url"].as_str().map(str::to_string);
    let bytes = match v["blob"].as_str() {
        Some(b64) => Some(
            B64.decode(b64)
                .map_err(|e| UpstreamError::Protocol(format!("bad asset blob: {e}")))?,
        ),
        None => None,
    };
    if url.is_none() && bytes.is_none() {
        return Err(UpstreamError::Protocol(
            "asset event carries neither url nor blob".into(),
        ));
    }
    Ok(UpstreamEvent::Asset {
        kind,
        url,
        bytes,
        seq: v["seq"].as_u64().unwrap_or(0) as u32,
        elapsed_ms: v["elapsedMs"].as_u64().unwrap_or(0),
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────
