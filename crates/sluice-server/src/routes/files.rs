// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `GET /v1/files/{image|video}/{name}` — the media proxy.
//!
//! Serves from the cache root only; `Content-Type` comes from file magic,
//! never from the request.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use sluice_core::GatewayError;
use sluice_media::{MediaError, MediaKind};

use crate::error::{not_found, ApiError};
use crate::AppState;

pub async fn media_file(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Response {
    let Some(kind) = MediaKind::parse(&kind) else {
        return not_found("unknown media kind");
    };
    match state.media.read(kind, &name).await {
        Ok((bytes, mime)) => ([(header::CONTENT_TYPE, mime)], bytes).into_response(),
        Err(MediaError::NotFound | MediaError::BadName) => not_found("no such asset"),
        Err(e) => ApiError(GatewayError::Internal(e.to_string())).into_response(),
    }
}
