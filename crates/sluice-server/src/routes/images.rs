// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `POST /v1/images/generations` and `POST /v1/images/edits`.

use axum::extract::{Multipart, State};
use axum::response::Response;
use axum::Json;

use sluice_core::ImageCall;

use crate::error::invalid_request;
use crate::openai::{cap_n, ImageGenerationRequest};
use crate::routes::{aggregate_images, chunk_sse};
use crate::AppState;

pub async fn generations(
    State(state): State<AppState>,
    Json(req): Json<ImageGenerationRequest>,
) -> Response {
    if req.prompt.trim().is_empty() {
        return invalid_request("prompt must not be empty");
    }
    let call = ImageCall {
        model: req.model,
        prompt: req.prompt,
        n: cap_n(req.n, req.stream),
        b64_json: req.response_format.as_deref() == Some("b64_json"),
        source_image: None,
    };
    let stream = state.pipeline.run_image(call);
    if req.stream {
        chunk_sse(stream).await
    } else {
        aggregate_images(stream).await
    }
}

/// Same fields as generation, as multipart form data, plus the `image`
/// file to edit.
pub async fn edits(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut model = "grok-imagine".to_string();
    let mut prompt = None;
    let mut n = 1u32;
    let mut response_format = None;
    let mut stream = false;
    let mut image = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return invalid_request(format!("bad multipart body: {e}")),
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => match field.bytes().await {
                Ok(bytes) => image = Some(bytes.to_vec()),
                Err(e) => return invalid_request(format!("unreadable image field: {e}")),
            },
            "prompt" => match field.text().await {
                Ok(text) => prompt = Some(text),
                Err(e) => return invalid_request(format!("unreadable prompt field: {e}")),
            },
            "model" => {
                if let Ok(text) = field.text().await {
                    model = text;
                }
            }
            "n" => {
                if let Ok(text) = field.text().await {
                    n = text.trim().parse().unwrap_or(1);
                }
            }
            "response_format" => {
                if let Ok(text) = field.text().await {
                    response_format = Some(text);
                }
            }
            "stream" => {
                if let Ok(text) = field.text().await {
                    stream = text.trim() == "true";
                }
            }
            _ => {} // unknown fields ignored
        }
    }

    let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) else {
        return invalid_request("prompt field is required");
    };
    let Some(image) = image else {
        return invalid_request("image field is required");
    };

    let call = ImageCall {
        model,
        prompt,
        n: cap_n(n, stream),
        b64_json: response_format.as_deref() == Some("b64_json"),
        source_image: Some(image),
    };
    let chunk_stream = state.pipeline.run_image(call);
    if stream {
        chunk_sse(chunk_stream).await
    } else {
        aggregate_images(chunk_stream).await
    }
}
