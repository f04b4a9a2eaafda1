// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP handlers and the SSE plumbing they share.

pub mod admin;
pub mod chat;
pub mod files;
pub mod images;
pub mod models;

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;

use sluice_core::ChunkStream;
use sluice_translate::{MediaDatum, OpenAiChunk};

use crate::error::{error_body, ApiError};

/// Stream pipeline chunks as `data:`-framed SSE, terminated by
/// `data: [DONE]`.
///
/// The first item is peeked before committing to the SSE content type: a
/// request that fails before producing anything keeps its proper HTTP
/// status instead of a 200 with an error event.
pub async fn chunk_sse(mut stream: ChunkStream) -> Response {
    let first = match stream.next().await {
        Some(Err(e)) => return ApiError(e).into_response(),
        other => other,
    };

    let body = futures::stream::iter(first)
        .chain(stream)
        .map(|item| {
            let event = match item {
                Ok(chunk) => {
                    Event::default().data(serde_json::to_string(&chunk).unwrap_or_default())
                }
                // Mid-stream failure: the error rides the stream, then the
                // stream ends.
                Err(e) => Event::default().data(error_body(&e).to_string()),
            };
            Ok::<Event, Infallible>(event)
        })
        .chain(futures::stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }));

    Sse::new(body).keep_alive(KeepAlive::default()).into_response()
}

/// Collect a chat stream into the blocking `chat.completion` shape.
pub async fn aggregate_chat(stream: ChunkStream, model: &str) -> Response {
    let items: Vec<_> = stream.collect().await;

    let mut id = None;
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut finish_reason = "stop";
    let mut error = None;

    for item in items {
        match item {
            Ok(OpenAiChunk::Chat(chunk)) => {
                if id.is_none() {
                    id = Some(chunk.id.clone());
                }
                for choice in &chunk.choices {
                    if let Some(text) = &choice.delta.content {
                        content.push_str(text);
                    }
                    if let Some(text) = &choice.delta.reasoning_content {
                        reasoning.push_str(text);
                    }
                    if let Some(reason) = choice.finish_reason {
                        finish_reason = reason;
                    }
                }
            }
            // Video results arrive as media chunks; in blocking mode the
            // asset URL becomes the message text.
            Ok(OpenAiChunk::Media(media)) => {
                for datum in &media.data {
                    if let Some(url) = &datum.url {
                        if !content.is_empty() {
                            content.push('\n');
                        }
                        content.push_str(url);
                    }
                }
            }
            Err(e) => error = Some(e),
        }
    }

    // Blocking mode never returns partial output: a failure anywhere in
    // the stream becomes the error response.
    if let Some(e) = error {
        return ApiError(e).into_response();
    }

    let mut message = json!({ "role": "assistant", "content": content });
    if !reasoning.is_empty() {
        message["reasoning_content"] = json!(reasoning);
    }
    Json(json!({
        "id": id.unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": { "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 },
    }))
    .into_response()
}

/// Collect an image stream into the blocking `{created, data}` shape.
pub async fn aggregate_images(stream: ChunkStream) -> Response {
    let items: Vec<_> = stream.collect().await;

    let mut data: Vec<MediaDatum> = Vec::new();
    let mut error = None;
    for item in items {
        match item {
            Ok(OpenAiChunk::Media(media)) => data.extend(media.data),
            Ok(OpenAiChunk::Chat(_)) => {}
            Err(e) => error = Some(e),
        }
    }

    if let Some(e) = error {
        return ApiError(e).into_response();
    }
    Json(json!({
        "created": Utc::now().timestamp(),
        "data": data,
    }))
    .into_response()
}
