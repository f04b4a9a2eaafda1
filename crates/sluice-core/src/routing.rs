// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model id → token class routing.
//!
//! The mapping is authoritative (see the model table in the README):
//! - `*-heavy` models require a Super token, strictly.
//! - `*-thinking` models, 720p video and clips longer than 6 s prefer
//!   Super but may fall back to Basic.
//! - Everything else runs on Basic.

use sluice_pool::ClassHint;

/// What a request is, for quota accounting and log purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    Image,
    Video,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

/// Video parameters that affect routing.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoShape {
    pub resolution_name: String,
    pub video_length: u32,
}

pub fn class_hint(model: &str, video: Option<&VideoShape>) -> ClassHint {
    if model.ends_with("-heavy") {
        return ClassHint::Super;
    }
    if model.ends_with("-thinking") {
        return ClassHint::SuperPreferred;
    }
    if let Some(v) = video {
        if v.resolution_name == "720p" || v.video_length > 6 {
            return ClassHint::SuperPreferred;
        }
    }
    ClassHint::Basic
}

/// Thinking-capable models get their reasoning trace forwarded unless the
/// client set `reasoning_effort` to `none`.
pub fn wants_reasoning(model: &str, reasoning_effort: Option<&str>) -> bool {
    model.ends_with("-thinking") && reasoning_effort != Some("none")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heavy_is_strict_super() {
        assert_eq!(class_hint("grok-4-heavy", None), ClassHint::Super);
    }

    #[test]
    fn thinking_prefers_super() {
        assert_eq!(
            class_hint("grok-3-thinking", None),
            ClassHint::SuperPreferred
        );
    }

    #[test]
    fn plain_models_run_basic() {
        assert_eq!(class_hint("grok-4", None), ClassHint::Basic);
        assert_eq!(class_hint("grok-imagine", None), ClassHint::Basic);
    }

    #[test]
    fn hd_video_prefers_super() {
        let v = VideoShape {
            resolution_name: "720p".into(),
            video_length: 6,
        };
        assert_eq!(class_hint("grok-video", Some(&v)), ClassHint::SuperPreferred);
    }

    #[test]
    fn long_video_prefers_super() {
        let v = VideoShape {
            resolution_name: "480p".into(),
            video_length: 10,
        };
        assert_eq!(class_hint("grok-video", Some(&v)), ClassHint::SuperPreferred);
    }

    #[test]
    fn short_sd_video_runs_basic() {
        let v = VideoShape {
            resolution_name: "480p".into(),
            video_length: 6,
        };
        assert_eq!(class_hint("grok-video", Some(&v)), ClassHint::Basic);
    }

    #[test]
    fn reasoning_follows_model_and_effort() {
        assert!(wants_reasoning("grok-3-thinking", None));
        assert!(wants_reasoning("grok-3-thinking", Some("high")));
        assert!(!wants_reasoning("grok-3-thinking", Some("none")));
        assert!(!wants_reasoning("grok-4", Some("high")));
    }
}
