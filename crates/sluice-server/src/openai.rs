// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-compatible request DTOs.
//!
//! Deserialization is tolerant: unknown top-level fields and unrecognised
//! content-block types are ignored, matching what real OpenAI clients
//! expect from a compatible endpoint.

use serde::Deserialize;

// ── Chat ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub video_config: Option<VideoConfig>,
}

#[derive(Debug, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_resolution")]
    pub resolution_name: String,
    #[serde(default = "default_video_length")]
    pub video_length: u32,
}

fn default_resolution() -> String {
    "480p".into()
}

fn default_video_length() -> u32 {
    6
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// `content` is either a plain string or an array of typed blocks.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrlBlock },
    InputAudio { input_audio: InputAudioBlock },
    File { file: FileBlock },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct ImageUrlBlock {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct InputAudioBlock {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct FileBlock {
    pub file_data: String,
}

/// Flatten a conversation into the single prompt string the upstream's
/// conversation endpoint expects.  Attachment blocks contribute their
/// payload reference inline.
///
/// Returns `Err` with a client-facing message when a block is invalid
/// (relative URL, empty messages).
pub fn flatten_messages(messages: &[ChatMessage]) -> Result<String, String> {
    if messages.is_empty() {
        return Err("messages must not be empty".into());
    }
    let mut out = String::new();
    for msg in messages {
        let text = match &msg.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => parts.push(text.clone()),
                        ContentBlock::ImageUrl { image_url } => {
                            if !is_acceptable_url(&image_url.url) {
                                return Err(format!(
                                    "image_url must be absolute or a data: URI, got {:.64}",
                                    image_url.url
                                ));
                            }
                            parts.push(image_url.url.clone());
                        }
                        ContentBlock::InputAudio { input_audio } => {
                            parts.push(format!("data:audio/unknown;base64,{}", input_audio.data));
                        }
                        ContentBlock::File { file } => parts.push(file.file_data.clone()),
                        ContentBlock::Unknown => {}
                    }
                }
                parts.join("\n")
            }
        };
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&msg.role);
        out.push_str(": ");
        out.push_str(&text);
    }
    Ok(out)
}

fn is_acceptable_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://") || url.starts_with("data:")
}

// ── Images ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ImageGenerationRequest {
    #[serde(default = "default_image_model")]
    pub model: String,
    pub prompt: String,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

fn default_image_model() -> String {
    "grok-imagine".into()
}

fn default_n() -> u32 {
    1
}

/// `n` is capped at 10 for blocking calls and 2 when streaming.
pub fn cap_n(n: u32, stream: bool) -> u32 {
    let cap = if stream { 2 } else { 10 };
    n.clamp(1, cap)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_content_parses() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"grok-4","messages":[{"role":"user","content":"Hi"}],"stream":true}"#,
        )
        .unwrap();
        assert_eq!(req.model, "grok-4");
        assert!(req.stream);
        assert_eq!(flatten_messages(&req.messages).unwrap(), "user: Hi");
    }

    #[test]
    fn unknown_top_level_fields_ignored() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"grok-4","messages":[{"role":"user","content":"x"}],
                "temperature":0.7,"max_tokens":100,"tool_choice":"auto"}"#,
        )
        .unwrap();
        assert_eq!(req.model, "grok-4");
        assert!(!req.stream, "stream defaults to false");
    }

    #[test]
    fn multimodal_blocks_flatten() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"grok-4","messages":[{"role":"user","content":[
                {"type":"text","text":"describe"},
                {"type":"image_url","image_url":{"url":"data:image/png;base64,AAAA"}}
            ]}]}"#,
        )
        .unwrap();
        let prompt = flatten_messages(&req.messages).unwrap();
        assert!(prompt.contains("describe"));
        assert!(prompt.contains("data:image/png;base64,AAAA"));
    }

    #[test]
    fn unknown_block_type_is_tolerated() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"grok-4","messages":[{"role":"user","content":[
                {"type":"text","text":"hello"},
                {"type":"refusal","refusal":"nope"}
            ]}]}"#,
        )
        .unwrap();
        assert_eq!(flatten_messages(&req.messages).unwrap(), "user: hello");
    }

    #[test]
    fn relative_image_url_rejected() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"grok-4","messages":[{"role":"user","content":[
                {"type":"image_url","image_url":{"url":"../../etc/passwd"}}
            ]}]}"#,
        )
        .unwrap();
        assert!(flatten_messages(&req.messages).is_err());
    }

    #[test]
    fn empty_messages_rejected() {
        assert!(flatten_messages(&[]).is_err());
    }

    #[test]
    fn video_config_defaults() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"grok-video","messages":[{"role":"user","content":"a cat"}],
                "video_config":{}}"#,
        )
        .unwrap();
        let video = req.video_config.unwrap();
        assert_eq!(video.resolution_name, "480p");
        assert_eq!(video.video_length, 6);
    }

    #[test]
    fn image_request_defaults_and_caps() {
        let req: ImageGenerationRequest =
            serde_json::from_str(r#"{"prompt":"a boat"}"#).unwrap();
        assert_eq!(req.model, "grok-imagine");
        assert_eq!(req.n, 1);

        assert_eq!(cap_n(7, false), 7);
        assert_eq!(cap_n(15, false), 10);
        assert_eq!(cap_n(7, true), 2);
        assert_eq!(cap_n(0, true), 1);
    }
}
