// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `GET /v1/models` — the gateway's model catalog.

use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde_json::json;

/// Model ids the translator and router understand.
pub const MODELS: &[&str] = &[
    "grok-3",
    "grok-3-thinking",
    "grok-4",
    "grok-4-thinking",
    "grok-4-heavy",
    "grok-imagine",
    "grok-video",
];

pub async fn list_models() -> Response {
    let created = Utc::now().timestamp();
    let data: Vec<_> = MODELS
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "sluice",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_all_routing_classes() {
        use sluice_core::class_hint;
        use sluice_pool::ClassHint;

        let hints: Vec<_> = MODELS.iter().map(|m| class_hint(m, None)).collect();
        assert!(hints.contains(&ClassHint::Basic));
        assert!(hints.contains(&ClassHint::Super));
        assert!(hints.contains(&ClassHint::SuperPreferred));
    }
}
