// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bearer-key middleware for the public and admin surfaces.
//!
//! The public OpenAI-compatible routes require `server.api_key` when one
//! is configured and are open otherwise (for deployments behind a trusted
//! reverse proxy).  Admin routes are the opposite: without a configured
//! `server.admin_key` they are refused outright.
//!
//! Key comparison is constant-time.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::AppState;

pub async fn public_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = &state.config.server.api_key else {
        return next.run(req).await;
    };
    match extract_bearer(req.headers()) {
        Some(got) if constant_time_eq(got, expected) => next.run(req).await,
        _ => {
            warn!("public request with missing or wrong API key");
            unauthorized("Invalid or missing API key")
        }
    }
}

pub async fn admin_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = &state.config.server.admin_key else {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": {
                    "message": "admin surface disabled: no admin_key configured",
                    "type": "permission_error",
                    "code": "admin_disabled",
                }
            })),
        )
            .into_response();
    };
    match extract_bearer(req.headers()) {
        Some(got) if constant_time_eq(got, expected) => next.run(req).await,
        _ => {
            warn!("admin request with missing or wrong key");
            unauthorized("Invalid or missing admin key")
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": message,
                "type": "invalid_api_key",
                "code": "unauthorized",
            }
        })),
    )
        .into_response()
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    auth.strip_prefix("Bearer ")
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_from_valid_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer sk-sluice-123".parse().unwrap(),
        );
        assert_eq!(extract_bearer(&headers), Some("sk-sluice-123"));
    }

    #[test]
    fn extract_bearer_missing_header() {
        assert!(extract_bearer(&HeaderMap::new()).is_none());
    }

    #[test]
    fn extract_bearer_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcjpwYXNz".parse().unwrap(),
        );
        assert!(extract_bearer(&headers).is_none());
    }

    #[test]
    fn constant_time_eq_matches_equal_keys() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc123", "abc1234"));
        assert!(!constant_time_eq("", "x"));
    }
}
