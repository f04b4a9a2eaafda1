// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible wire shapes emitted by the translator.
//!
//! Only the streaming chunk side lives here; the non-streaming aggregates
//! are assembled by the HTTP layer from these chunks.

use serde::Serialize;

/// One item of translator output.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OpenAiChunk {
    Chat(ChatChunk),
    Media(MediaChunk),
}

// ── Chat ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChatChunk {
    fn empty(id: &str, model: &str, created: i64) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk",
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: None,
            }],
        }
    }

    pub fn content(id: &str, model: &str, created: i64, text: String, role: bool) -> Self {
        let mut chunk = Self::empty(id, model, created);
        chunk.choices[0].delta.content = Some(text);
        if role {
            chunk.choices[0].delta.role = Some("assistant");
        }
        chunk
    }

    pub fn reasoning(id: &str, model: &str, created: i64, text: String, role: bool) -> Self {
        let mut chunk = Self::empty(id, model, created);
        chunk.choices[0].delta.reasoning_content = Some(text);
        if role {
            chunk.choices[0].delta.role = Some("assistant");
        }
        chunk
    }

    pub fn finish(id: &str, model: &str, created: i64, reason: &'static str) -> Self {
        let mut chunk = Self::empty(id, model, created);
        chunk.choices[0].finish_reason = Some(reason);
        chunk
    }
}

// ── Media ─────────────────────────────────────────────────────────────────────

/// Image/video generation result chunk.  Streaming mode emits one per
/// asset; non-streaming mode aggregates the `data` arrays.
#[derive(Debug, Clone, Serialize)]
pub struct MediaChunk {
    pub created: i64,
    pub data: Vec<MediaDatum>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaDatum {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_chunk_shape() {
        let c = ChatChunk::content("chatcmpl-1", "grok-4", 1700000000, "hi".into(), true);
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["object"], "chat.completion.chunk");
        assert_eq!(v["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(v["choices"][0]["delta"]["content"], "hi");
        assert!(v["choices"][0]["delta"].get("reasoning_content").is_none());
        assert!(v["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn finish_chunk_has_no_delta_fields() {
        let c = ChatChunk::finish("chatcmpl-1", "grok-4", 0, "stop");
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["choices"][0]["finish_reason"], "stop");
        assert!(v["choices"][0]["delta"].get("content").is_none());
    }

    #[test]
    fn media_datum_serializes_one_of() {
        let d = MediaDatum {
            url: Some("/v1/files/image/abc.jpg".into()),
            b64_json: None,
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["url"], "/v1/files/image/abc.jpg");
        assert!(v.get("b64_json").is_none());
    }
}
