// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Operator surface under `/api/v1/admin/...`.
//!
//! Pool snapshot and mutation, batch task submit/stream/cancel, media
//! cache maintenance.  Guarded by the admin bearer key (see `auth.rs`);
//! the contract here is JSON plus SSE — the web UI that consumes it lives
//! elsewhere.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use sluice_batch::{TaskEvent, TaskKind};
use sluice_media::MediaKind;
use sluice_pool::{RecordPatch, TokenClass, TokenRecord};

use crate::error::{invalid_request, not_found};
use crate::AppState;

// ── Pool ──────────────────────────────────────────────────────────────────────

pub async fn pool_snapshot(State(state): State<AppState>) -> Response {
    let stats = state.pool.stats().await;
    let tokens = state.pool.list_all().await;
    Json(json!({ "stats": stats, "tokens": tokens })).into_response()
}

/// Live pool change events as SSE.
pub async fn pool_events(State(state): State<AppState>) -> Response {
    let rx = state.pool.subscribe_changes();
    let stream = BroadcastStream::new(rx)
        .filter_map(|item| async move { item.ok() })
        .map(|event| {
            Ok::<Event, Infallible>(
                Event::default().data(serde_json::to_string(&event).unwrap_or_default()),
            )
        });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub tokens: Vec<ImportToken>,
}

#[derive(Debug, Deserialize)]
pub struct ImportToken {
    pub id: String,
    #[serde(default)]
    pub class: Option<TokenClass>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn import_tokens(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> Response {
    if req.tokens.is_empty() {
        return invalid_request("tokens must not be empty");
    }
    let records: Vec<TokenRecord> = req
        .tokens
        .into_iter()
        .filter(|t| !t.id.trim().is_empty())
        .map(|t| {
            let mut rec = TokenRecord::new(t.id, t.class.unwrap_or(TokenClass::Basic));
            rec.tags = t.tags.into_iter().collect();
            rec
        })
        .collect();
    let added = state.pool.import(records).await;
    Json(json!({ "added": added })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub ids: Vec<String>,
}

pub async fn delete_tokens(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Response {
    let removed = state.pool.remove(&req.ids).await;
    Json(json!({ "removed": removed })).into_response()
}

pub async fn patch_token(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<RecordPatch>,
) -> Response {
    if state.pool.replace_record(&id, patch).await {
        Json(json!({ "ok": true })).into_response()
    } else {
        not_found("no such token")
    }
}

// ── Batch tasks ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SubmitBatchRequest {
    pub kind: TaskKind,
    /// Token ids to operate on; the whole pool when absent.
    #[serde(default)]
    pub tokens: Option<Vec<String>>,
}

pub async fn submit_batch(
    State(state): State<AppState>,
    Json(req): Json<SubmitBatchRequest>,
) -> Response {
    let task_id = state.batch.submit(req.kind, req.tokens).await;
    Json(json!({ "task_id": task_id })).into_response()
}

/// Task event stream: one snapshot, then live progress until the terminal
/// event.
pub async fn batch_events(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let Some((snapshot, rx)) = state.batch.subscribe(id).await else {
        return not_found("no such task");
    };

    let already_finished = matches!(&snapshot, TaskEvent::Snapshot { terminal: Some(_), .. });
    let head = futures::stream::iter([snapshot]);

    let events: futures::stream::BoxStream<'static, TaskEvent> = if already_finished {
        Box::pin(head)
    } else {
        let live = BroadcastStream::new(rx)
            .filter_map(|item| async move { item.ok() })
            .scan(false, |done, event| {
                let item = if *done {
                    None
                } else {
                    if matches!(
                        event,
                        TaskEvent::Done { .. } | TaskEvent::Cancelled { .. } | TaskEvent::Error { .. }
                    ) {
                        *done = true;
                    }
                    Some(event)
                };
                async move { item }
            });
        Box::pin(head.chain(live))
    };

    let stream = events.map(|event| {
        Ok::<Event, Infallible>(
            Event::default().data(serde_json::to_string(&event).unwrap_or_default()),
        )
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

pub async fn cancel_batch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    if state.batch.cancel(id).await {
        Json(json!({ "cancelled": true })).into_response()
    } else {
        not_found("no such task")
    }
}

// ── Media cache ───────────────────────────────────────────────────────────────

pub async fn media_stat(State(state): State<AppState>) -> Response {
    Json(state.media.stat().await).into_response()
}

#[derive(Debug, Deserialize, Default)]
pub struct MediaClearRequest {
    #[serde(default)]
    pub kind: Option<String>,
}

pub async fn media_clear(
    State(state): State<AppState>,
    Json(req): Json<MediaClearRequest>,
) -> Response {
    let kind = match req.kind.as_deref() {
        None | Some("all") => None,
        Some(other) => match MediaKind::parse(other) {
            Some(kind) => Some(kind),
            None => return invalid_request("kind must be image, video or all"),
        },
    };
    match state.media.clear(kind).await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => invalid_request(format!("clear failed: {e}")),
    }
}
