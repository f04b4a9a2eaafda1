// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-style error envelopes.
//!
//! Every failure leaves the gateway as
//! `{"error": {"message", "type", "code"}}` with the status mapping from
//! the core taxonomy (429 quota, 504 timeout, 502 otherwise).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use sluice_core::GatewayError;

/// Newtype so `GatewayError` can flow out of handlers as a response.
pub struct ApiError(pub GatewayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
        (status, Json(error_body(&self.0))).into_response()
    }
}

pub fn error_body(err: &GatewayError) -> serde_json::Value {
    json!({
        "error": {
            "message": err.to_string(),
            "type": err.openai_type(),
            "code": err.kind(),
        }
    })
}

/// Request-validation failure (pre-pipeline).
pub fn invalid_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": {
                "message": message.into(),
                "type": "invalid_request_error",
                "code": "invalid_request",
            }
        })),
    )
        .into_response()
}

pub fn not_found(message: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": {
                "message": message.into(),
                "type": "invalid_request_error",
                "code": "not_found",
            }
        })),
    )
        .into_response()
}
