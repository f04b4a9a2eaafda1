// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{ChatPayload, ImagePayload, UpstreamError, UpstreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WsFrame, UpstreamError>> + Send>>;

/// One decoded WebSocket image frame.
#[derive(Debug, Clone, PartialEq)]
pub struct WsFrame {
    pub bytes: Vec<u8>,
}

/// The seam between the request pipeline and the network.
///
/// [`crate::UpstreamClient`] is the production implementation;
/// [`crate::ScriptedTransport`] replaces it in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a chat/video conversation and stream its events.
    ///
    /// A connect-level failure (HTTP status, network error) is returned
    /// from this call; failures after the stream is established surface as
    /// stream items.
    async fn chat_stream(
        &self,
        token: &str,
        payload: ChatPayload,
    ) -> Result<EventStream, UpstreamError>;

    /// Open the image-generation WebSocket and stream its frames.
    async fn image_ws(
        &self,
        token: &str,
        payload: ImagePayload,
    ) -> Result<FrameStream, UpstreamError>;
}
