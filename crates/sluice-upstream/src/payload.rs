// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Canonical upstream request payloads and small response DTOs.
//!
//! Payloads are canonicalised here — one shape per call, independent of
//! whatever the client sent — so fingerprinting stays stable and the
//! pipeline never hand-assembles JSON.

use serde::{Deserialize, Serialize};

/// Chat / video conversation request.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub model_name: String,
    pub message: String,
    /// Ask the model for a thinking trace alongside the answer.
    pub enable_thinking: bool,
    /// Present when the request is a video generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoParams>,
    /// Number of images to generate, when the request is an image
    /// generation routed over HTTP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_count: Option<u32>,
    /// Base64 source image for edit requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

impl ChatPayload {
    pub fn text(model: impl Into<String>, message: impl Into<String>, thinking: bool) -> Self {
        Self {
            model_name: model.into(),
            message: message.into(),
            enable_thinking: thinking,
            video: None,
            image_count: None,
            source_image: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoParams {
    /// Upstream resolution preset, e.g. `"480p"` or `"720p"`.
    pub resolution_name: String,
    /// Clip length in seconds.
    pub video_length: u32,
}

/// Image generation request for the WebSocket transport.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub model_name: String,
    pub prompt: String,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
}

/// One quota window from the rate-limits endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    pub remaining_queries: i64,
    /// Seconds until the window resets.
    #[serde(default)]
    pub window_size_seconds: Option<i64>,
}

/// A generated asset as listed by the upstream's asset repository.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAsset {
    pub asset_id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
}
