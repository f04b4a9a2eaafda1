// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! WebSocket image protocol.
//!
//! The upstream streams progressively better renders of the same image:
//! tiny previews first, a "medium" checkpoint, then the final frame.  The
//! tiers are distinguished purely by decoded byte size.  A medium frame
//! that is never followed by a final frame within the deadline is the
//! upstream's content-policy block signal — there is no explicit error
//! frame for it.
//!
//! ```text
//! AwaitingPreview ──frame──► AwaitingMedium ──≥medium──► AwaitingFinal ──≥final──► Closed
//!                                                 │
//!                                                 └── final_timeout ──► Blocked
//! ```

use std::time::Duration;

use futures::StreamExt;
use sluice_config::ImageWsConfig;
use tracing::debug;

use sluice_upstream::{FrameStream, WsFrame};

use crate::TranslateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsPhase {
    AwaitingPreview,
    AwaitingMedium,
    AwaitingFinal,
    Closed,
}

/// Frame classification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsStep {
    /// Preview or repeat checkpoint; nothing to emit.
    Ignore,
    /// First frame at or above the medium threshold; the final-frame
    /// deadline starts now.
    Medium,
    /// Final image.
    Final,
}

/// Size-threshold state machine, pure and synchronous so it can be unit
/// tested without a socket.
pub struct ImageWsTranslator {
    medium_min: usize,
    final_min: usize,
    phase: WsPhase,
}

impl ImageWsTranslator {
    pub fn new(config: &ImageWsConfig) -> Self {
        Self {
            medium_min: config.medium_min_bytes,
            final_min: config.final_min_bytes,
            phase: WsPhase::AwaitingPreview,
        }
    }

    pub fn phase(&self) -> WsPhase {
        self.phase
    }

    pub fn awaiting_final(&self) -> bool {
        self.phase == WsPhase::AwaitingFinal
    }

    pub fn on_frame(&mut self, frame: &WsFrame) -> WsStep {
        if self.phase == WsPhase::Closed {
            return WsStep::Ignore;
        }
        let len = frame.bytes.len();
        if len >= self.final_min {
            self.phase = WsPhase::Closed;
            return WsStep::Final;
        }
        if len >= self.medium_min {
            let first_medium = self.phase != WsPhase::AwaitingFinal;
            self.phase = WsPhase::AwaitingFinal;
            return if first_medium { WsStep::Medium } else { WsStep::Ignore };
        }
        if self.phase == WsPhase::AwaitingPreview {
            self.phase = WsPhase::AwaitingMedium;
        }
        WsStep::Ignore
    }
}

/// Drive a frame stream to its final image.
///
/// `idle` bounds the wait for *any* frame; once a medium frame has been
/// seen, the wait is additionally bounded by `final_timeout` — expiry of
/// that deadline is reported as [`TranslateError::Blocked`].
pub async fn collect_final_image(
    mut frames: FrameStream,
    config: &ImageWsConfig,
    idle: Duration,
    final_timeout: Duration,
) -> Result<Vec<u8>, TranslateError> {
    let mut machine = ImageWsTranslator::new(config);
    let mut final_deadline: Option<tokio::time::Instant> = None;

    loop {
        let wait = match final_deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                remaining.min(idle)
            }
            None => idle,
        };

        let item = match tokio::time::timeout(wait, frames.next()).await {
            Ok(item) => item,
            Err(_) => {
                return Err(if machine.awaiting_final() {
                    TranslateError::Blocked
                } else {
                    TranslateError::IdleTimeout(idle)
                });
            }
        };

        match item {
            Some(Ok(frame)) => match machine.on_frame(&frame) {
                WsStep::Final => {
                    debug!(bytes = frame.bytes.len(), "final image frame received");
                    return Ok(frame.bytes);
                }
                WsStep::Medium => {
                    debug!(bytes = frame.bytes.len(), "medium checkpoint received");
                    final_deadline = Some(tokio::time::Instant::now() + final_timeout);
                }
                WsStep::Ignore => {}
            },
            Some(Err(e)) => return Err(TranslateError::Upstream(e)),
            None => {
                // Upstream closed without a final frame.  After a medium
                // checkpoint that is the same signal as the timeout.
                return Err(if machine.awaiting_final() {
                    TranslateError::Blocked
                } else {
                    TranslateError::Protocol("websocket closed before any usable frame".into())
                });
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
