// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Request pipeline: the orchestration layer between the OpenAI-compatible
//! HTTP surface and the token pool / upstream client / stream translator.

mod error;
mod pipeline;
mod routing;


pub use error::GatewayError;
pub use pipeline::{ChatCall, ChunkStream, ImageCall, Pipeline, VideoCall};
pub use routing::{class_hint, wants_reasoning, RequestKind, VideoShape};
