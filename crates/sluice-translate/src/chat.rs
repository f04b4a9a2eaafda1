// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Upstream chat/video events → OpenAI chat-completion chunks.
//!
//! The translator is a per-request state machine fed one upstream event at
//! a time by the pipeline.  It applies the container-tag filter to text
//! deltas, routes thinking traces to `delta.reasoning_content` (or drops
//! them), resolves asset events through the media sink, and closes the
//! stream with a `finish_reason` chunk.
//!
//! Malformed events are tolerated once per request; the second one is
//! terminal.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use tracing::warn;

use sluice_upstream::{DoneReason, UpstreamError, UpstreamEvent};

use crate::{
    ChatChunk, MediaChunk, MediaDatum, MediaSink, OpenAiChunk, TagFilter, TranslateError,
};

/// Per-request translation options, frozen at request start.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    /// `chatcmpl-…` id stamped on every chunk.
    pub request_id: String,
    /// Model id echoed back to the client.
    pub model: String,
    /// Unix timestamp stamped on every chunk.
    pub created: i64,
    /// Forward thinking traces; when false they are dropped.
    pub show_reasoning: bool,
    /// Container tags to suppress.
    pub filtered_tags: Vec<String>,
    /// Emit assets as `b64_json` instead of a gateway URL.
    pub b64_media: bool,
}

pub struct ChatTranslator<'a> {
    opts: ChatOptions,
    filter: TagFilter,
    media: &'a dyn MediaSink,
    /// Credential used for authenticated asset fetches.
    token: String,
    protocol_strikes: u32,
    saw_output: bool,
    sent_role: bool,
    finished: bool,
}

impl<'a> ChatTranslator<'a> {
    pub fn new(opts: ChatOptions, media: &'a dyn MediaSink, token: impl Into<String>) -> Self {
        let filter = TagFilter::new(&opts.filtered_tags);
        Self {
            opts,
            filter,
            media,
            token: token.into(),
            protocol_strikes: 0,
            saw_output: false,
            sent_role: false,
            finished: false,
        }
    }

    /// The request produced at least one delta, asset or terminal `Done` —
    /// the pipeline's definition of a structurally valid response.
    pub fn saw_output(&self) -> bool {
        self.saw_output
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Translate one upstream stream item into zero or more client chunks.
    pub async fn on_event(
        &mut self,
        item: Result<UpstreamEvent, UpstreamError>,
    ) -> Result<Vec<OpenAiChunk>, TranslateError> {
        let event = match item {
            Ok(ev) => ev,
            Err(UpstreamError::Protocol(msg)) => {
                self.protocol_strikes += 1;
                if self.protocol_strikes >= 2 {
                    return Err(TranslateError::Protocol(msg));
                }
                warn!("skipping malformed upstream event: {msg}");
                return Ok(Vec::new());
            }
            Err(other) => return Err(TranslateError::Upstream(other)),
        };

        match event {
            UpstreamEvent::Delta { text } => {
                self.saw_output = true;
                let visible = self.filter.push(&text);
                Ok(self.text_chunks(visible))
            }
            UpstreamEvent::Reasoning { text } => {
                if !self.opts.show_reasoning || text.is_empty() {
                    return Ok(Vec::new());
                }
                let role = !self.sent_role;
                self.sent_role = true;
                Ok(vec![OpenAiChunk::Chat(ChatChunk::reasoning(
                    &self.opts.request_id,
                    &self.opts.model,
                    self.opts.created,
                    text,
                    role,
                ))])
            }
            UpstreamEvent::ToolCard { .. } => Ok(Vec::new()),
            UpstreamEvent::Asset {
                kind, url, bytes, ..
            } => {
                self.saw_output = true;
                let stored = match (bytes, url) {
                    (Some(bytes), _) => self
                        .media
                        .put(bytes, kind)
                        .await
                        .map_err(|e| TranslateError::Media(e.to_string()))?,
                    (None, Some(url)) => self
                        .media
                        .fetch_and_put(&url, kind, &self.token)
                        .await
                        .map_err(|e| TranslateError::Media(e.to_string()))?,
                    (None, None) => {
                        return Err(TranslateError::Protocol("asset without payload".into()))
                    }
                };
                let datum = if self.opts.b64_media {
                    MediaDatum {
                        url: None,
                        b64_json: Some(B64.encode(&stored.bytes)),
                    }
                } else {
                    MediaDatum {
                        url: Some(stored.url),
                        b64_json: None,
                    }
                };
                Ok(vec![OpenAiChunk::Media(MediaChunk {
                    created: self.opts.created,
                    data: vec![datum],
                })])
            }
            UpstreamEvent::Done { reason } => {
                self.saw_output = true;
                Ok(self.close(match reason {
                    DoneReason::Stop => "stop",
                    DoneReason::Length => "length",
                }))
            }
            UpstreamEvent::Error {
                kind,
                message,
                http_status,
            } => Err(TranslateError::InBand {
                kind,
                message,
                http_status,
            }),
        }
    }

    /// End-of-stream without an explicit `Done` — tolerated: flush the tag
    /// filter and finish with `stop`.
    pub fn finish(&mut self) -> Vec<OpenAiChunk> {
        if self.finished {
            return Vec::new();
        }
        self.close("stop")
    }

    fn close(&mut self, reason: &'static str) -> Vec<OpenAiChunk> {
        self.finished = true;
        let tail = self.filter.flush();
        let mut chunks = self.text_chunks(tail);
        chunks.push(OpenAiChunk::Chat(ChatChunk::finish(
            &self.opts.request_id,
            &self.opts.model,
            self.opts.created,
            reason,
        )));
        chunks
    }

    fn text_chunks(&mut self, visible: String) -> Vec<OpenAiChunk> {
        if visible.is_empty() {
            return Vec::new();
        }
        let role = !self.sent_role;
        self.sent_role = true;
        vec![OpenAiChunk::Chat(ChatChunk::content(
            &self.opts.request_id,
            &self.opts.model,
            self.opts.created,
            visible,
            role,
        ))]
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryMediaSink;
    use sluice_upstream::AssetKind;

    fn opts() -> ChatOptions {
        ChatOptions {
            request_id: "chatcmpl-test".into(),
            model: "grok-4".into(),
            created: 1_700_000_000,
            show_reasoning: true,
            filtered_tags: vec!["xaiartifact".into()],
            b64_media: false,
        }
    }

    fn content_of(chunks: &[OpenAiChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match c {
                OpenAiChunk::Chat(c) => c.choices[0].delta.content.clone(),
                OpenAiChunk::Media(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn deltas_concatenate_byte_identical() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let mut all = Vec::new();
        for part in ["Hel", "lo ", "wor", "ld"] {
            all.extend(
                tr.on_event(Ok(UpstreamEvent::Delta { text: part.into() }))
                    .await
                    .unwrap(),
            );
        }
        all.extend(tr.finish());
        assert_eq!(content_of(&all), "Hello world");
        assert!(tr.saw_output());
    }

    #[tokio::test]
    async fn first_chunk_carries_role() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let chunks = tr
            .on_event(Ok(UpstreamEvent::Delta { text: "hi".into() }))
            .await
            .unwrap();
        match &chunks[0] {
            OpenAiChunk::Chat(c) => assert_eq!(c.choices[0].delta.role, Some("assistant")),
            other => panic!("unexpected chunk: {other:?}"),
        }
        let chunks = tr
            .on_event(Ok(UpstreamEvent::Delta { text: "!".into() }))
            .await
            .unwrap();
        match &chunks[0] {
            OpenAiChunk::Chat(c) => assert_eq!(c.choices[0].delta.role, None),
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[tokio::test]
    async fn done_emits_finish_reason() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let chunks = tr
            .on_event(Ok(UpstreamEvent::Done {
                reason: DoneReason::Stop,
            }))
            .await
            .unwrap();
        let last = chunks.last().unwrap();
        match last {
            OpenAiChunk::Chat(c) => assert_eq!(c.choices[0].finish_reason, Some("stop")),
            other => panic!("unexpected chunk: {other:?}"),
        }
        assert!(tr.is_finished());
        assert!(tr.finish().is_empty(), "finish after Done is a no-op");
    }

    #[tokio::test]
    async fn reasoning_routes_to_reasoning_content() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let chunks = tr
            .on_event(Ok(UpstreamEvent::Reasoning {
                text: "thinking...".into(),
            }))
            .await
            .unwrap();
        match &chunks[0] {
            OpenAiChunk::Chat(c) => {
                assert_eq!(c.choices[0].delta.reasoning_content.as_deref(), Some("thinking..."));
                assert!(c.choices[0].delta.content.is_none());
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reasoning_dropped_when_disabled() {
        let sink = MemoryMediaSink;
        let mut options = opts();
        options.show_reasoning = false;
        let mut tr = ChatTranslator::new(options, &sink, "tok");
        let chunks = tr
            .on_event(Ok(UpstreamEvent::Reasoning {
                text: "secret chain".into(),
            }))
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn filtered_tag_content_suppressed_across_deltas() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let mut all = Vec::new();
        for part in ["ok<xaiart", "ifact>HIDDEN</xaiartifact", ">done"] {
            all.extend(
                tr.on_event(Ok(UpstreamEvent::Delta { text: part.into() }))
                    .await
                    .unwrap(),
            );
        }
        all.extend(tr.finish());
        assert_eq!(content_of(&all), "okdone");
    }

    #[tokio::test]
    async fn tool_cards_are_dropped() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let chunks = tr
            .on_event(Ok(UpstreamEvent::ToolCard {
                payload: serde_json::json!({"tool": "web_search"}),
            }))
            .await
            .unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn inline_asset_bytes_become_local_url() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let chunks = tr
            .on_event(Ok(UpstreamEvent::Asset {
                kind: AssetKind::Image,
                url: None,
                bytes: Some(vec![1, 2, 3]),
                seq: 0,
                elapsed_ms: 100,
            }))
            .await
            .unwrap();
        match &chunks[0] {
            OpenAiChunk::Media(m) => {
                let url = m.data[0].url.as_deref().unwrap();
                assert!(url.starts_with("/v1/files/image/"), "got {url}");
                assert!(m.data[0].b64_json.is_none());
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_asset_url_is_rewritten_locally() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let chunks = tr
            .on_event(Ok(UpstreamEvent::Asset {
                kind: AssetKind::Video,
                url: Some("https://upstream/assets/v.mp4".into()),
                bytes: None,
                seq: 0,
                elapsed_ms: 0,
            }))
            .await
            .unwrap();
        match &chunks[0] {
            OpenAiChunk::Media(m) => {
                let url = m.data[0].url.as_deref().unwrap();
                assert!(
                    url.starts_with("/v1/files/video/"),
                    "client must never see an upstream URL, got {url}"
                );
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[tokio::test]
    async fn b64_mode_inlines_bytes() {
        let sink = MemoryMediaSink;
        let mut options = opts();
        options.b64_media = true;
        let mut tr = ChatTranslator::new(options, &sink, "tok");
        let chunks = tr
            .on_event(Ok(UpstreamEvent::Asset {
                kind: AssetKind::Image,
                url: None,
                bytes: Some(b"png-bytes".to_vec()),
                seq: 0,
                elapsed_ms: 0,
            }))
            .await
            .unwrap();
        match &chunks[0] {
            OpenAiChunk::Media(m) => {
                assert_eq!(m.data[0].b64_json.as_deref(), Some("cG5nLWJ5dGVz"));
                assert!(m.data[0].url.is_none());
            }
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_protocol_error_skipped_second_terminal() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let first = tr
            .on_event(Err(UpstreamError::Protocol("bad line".into())))
            .await;
        assert!(first.unwrap().is_empty(), "first strike is skipped");

        let second = tr
            .on_event(Err(UpstreamError::Protocol("bad line again".into())))
            .await;
        assert!(matches!(second, Err(TranslateError::Protocol(_))));
    }

    #[tokio::test]
    async fn inband_error_is_terminal() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let result = tr
            .on_event(Ok(UpstreamEvent::Error {
                kind: "quota".into(),
                message: "window exhausted".into(),
                http_status: Some(429),
            }))
            .await;
        assert!(matches!(result, Err(TranslateError::InBand { .. })));
    }

    #[tokio::test]
    async fn unterminated_tag_flushed_at_finish() {
        let sink = MemoryMediaSink;
        let mut tr = ChatTranslator::new(opts(), &sink, "tok");
        let mut all = tr
            .on_event(Ok(UpstreamEvent::Delta {
                text: "a<xaiartifact>lost".into(),
            }))
            .await
            .unwrap();
        all.extend(tr.finish());
        assert_eq!(content_of(&all), "a<xaiartifact>lost");
    }
}
