// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use sluice_upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum TranslateError {
    /// No upstream byte/frame arrived within the per-kind idle window.
    #[error("upstream went silent for {0:?}")]
    IdleTimeout(std::time::Duration),

    /// The WebSocket image protocol produced a medium frame but no final
    /// frame before the deadline — the upstream's content-policy signal.
    #[error("generation blocked by upstream content policy")]
    Blocked,

    /// Malformed events; raised on the second occurrence in one request
    /// (the first is skipped with a warning).
    #[error("upstream protocol error: {0}")]
    Protocol(String),

    /// In-band error event from the upstream.
    #[error("upstream error ({kind}): {message}")]
    InBand {
        kind: String,
        message: String,
        http_status: Option<u16>,
    },

    /// Transport-level failure mid-stream.
    #[error(transparent)]
    Upstream(UpstreamError),

    #[error("media store failure: {0}")]
    Media(String),
}
