// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Non-success HTTP status.  `retry_after` carries the upstream's
    /// `Retry-After` hint in seconds when it sent one (429s usually do).
    #[error("upstream returned status {status}")]
    Status {
        status: u16,
        retry_after: Option<u64>,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    Ws(String),

    /// An event line that is not valid JSON or has no recognised shape.
    #[error("malformed upstream event: {0}")]
    Protocol(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
