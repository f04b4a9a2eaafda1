// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `POST /v1/chat/completions`.
//!
//! Requests with a `video_config` run through the video pipeline; the
//! response surface is the same chat-completion shape either way.

use axum::extract::State;
use axum::response::Response;
use axum::Json;

use sluice_core::{ChatCall, VideoCall};

use crate::error::invalid_request;
use crate::openai::{flatten_messages, ChatCompletionRequest};
use crate::routes::{aggregate_chat, chunk_sse};
use crate::AppState;

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    let prompt = match flatten_messages(&req.messages) {
        Ok(prompt) => prompt,
        Err(message) => return invalid_request(message),
    };

    let stream = match req.video_config {
        Some(video) => state.pipeline.run_video(VideoCall {
            model: req.model.clone(),
            prompt,
            resolution_name: video.resolution_name,
            video_length: video.video_length,
        }),
        None => state.pipeline.run_chat(ChatCall {
            model: req.model.clone(),
            prompt,
            reasoning_effort: req.reasoning_effort,
        }),
    };

    if req.stream {
        chunk_sse(stream).await
    } else {
        aggregate_chat(stream, &req.model).await
    }
}
