// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Request-level error taxonomy.
//!
//! Internal kinds are stable strings (they appear in logs and metrics);
//! the OpenAI-facing `type` and HTTP status mappings live here so every
//! surface reports errors identically.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No selectable token for the requested class.
    #[error("no upstream capacity for this model")]
    PoolEmpty,

    /// Non-retryable HTTP failure from the upstream.
    #[error("upstream returned HTTP {status}")]
    UpstreamHttp { status: u16 },

    /// The upstream could not be reached at all.
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Credential rejected twice across distinct tokens.
    #[error("upstream rejected the gateway's credentials")]
    AuthRevoked,

    #[error("upstream quota exhausted")]
    QuotaExhausted { reset_at: Option<DateTime<Utc>> },

    /// Retry budget or stream idle window exceeded.
    #[error("upstream timed out")]
    UpstreamTimeout,

    /// Repeated malformed upstream events.
    #[error("upstream protocol violation: {0}")]
    TranslatorProtocol(String),

    /// Content-policy block signalled by the image protocol.
    #[error("generation blocked by upstream content policy")]
    TranslatorBlocked,

    /// Client disconnected or stopped the request.  Never surfaced; the
    /// variant exists so logs can tell it apart from real failures.
    #[error("client cancelled")]
    ClientCancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable internal kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PoolEmpty => "pool_empty",
            Self::UpstreamHttp { status } if *status < 500 => "upstream_http_4xx",
            Self::UpstreamHttp { .. } => "upstream_http_5xx",
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::AuthRevoked => "upstream_auth_revoked",
            Self::QuotaExhausted { .. } => "upstream_quota_exhausted",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::TranslatorProtocol(_) => "translator_protocol_error",
            Self::TranslatorBlocked => "translator_blocked",
            Self::ClientCancelled => "client_cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// OpenAI-style error `type`.
    pub fn openai_type(&self) -> &'static str {
        match self {
            Self::PoolEmpty | Self::AuthRevoked => "upstream_unavailable",
            Self::QuotaExhausted { .. } => "rate_limit_exceeded",
            Self::UpstreamTimeout => "timeout",
            Self::TranslatorProtocol(_) | Self::TranslatorBlocked => "bad_gateway",
            Self::UpstreamHttp { .. } | Self::UpstreamUnreachable(_) => "bad_gateway",
            Self::ClientCancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for the response envelope: 429 for quota, 504 for
    /// timeout, 502 otherwise.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::QuotaExhausted { .. } => 429,
            Self::UpstreamTimeout => 504,
            _ => 502,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(GatewayError::PoolEmpty.http_status(), 502);
        assert_eq!(
            GatewayError::QuotaExhausted { reset_at: None }.http_status(),
            429
        );
        assert_eq!(GatewayError::UpstreamTimeout.http_status(), 504);
        assert_eq!(
            GatewayError::TranslatorBlocked.http_status(),
            502
        );
    }

    #[test]
    fn openai_types_are_stable() {
        assert_eq!(GatewayError::PoolEmpty.openai_type(), "upstream_unavailable");
        assert_eq!(GatewayError::AuthRevoked.openai_type(), "upstream_unavailable");
        assert_eq!(
            GatewayError::QuotaExhausted { reset_at: None }.openai_type(),
            "rate_limit_exceeded"
        );
        assert_eq!(GatewayError::UpstreamTimeout.openai_type(), "timeout");
        assert_eq!(
            GatewayError::TranslatorProtocol("x".into()).openai_type(),
            "bad_gateway"
        );
    }

    #[test]
    fn http_kind_splits_4xx_5xx() {
        assert_eq!(
            GatewayError::UpstreamHttp { status: 418 }.kind(),
            "upstream_http_4xx"
        );
        assert_eq!(
            GatewayError::UpstreamHttp { status: 503 }.kind(),
            "upstream_http_5xx"
        );
    }
}
