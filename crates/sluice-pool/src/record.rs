// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two upstream account tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenClass {
    Basic,
    Super,
}

impl std::fmt::Display for TokenClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Super => write!(f, "super"),
        }
    }
}

/// Soft tier preference attached to a request.
///
/// `SuperPreferred` takes a Super token when one is selectable and falls
/// back to Basic (with a warning) otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassHint {
    Basic,
    Super,
    SuperPreferred,
}

/// Best-effort view of one quota window as last reported by the upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaWindow {
    /// Requests remaining in the current window.  Advisory only.
    pub remaining: i64,
    /// When the window resets, if the upstream said.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_reset_at: Option<DateTime<Utc>>,
}

/// One pooled upstream credential and its operational state.
///
/// The credential string doubles as the record id.  Everything else is
/// bookkeeping the pool maintains; `extra` and `unknown` ride along opaquely
/// so records written by newer builds survive a load/save cycle here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: String,
    pub class: TokenClass,
    /// Free-form operator flags, e.g. `content-mode-enabled`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub disabled: bool,
    /// Selection is suppressed until this instant after a quota exhaustion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cleared_at: Option<DateTime<Utc>>,
    /// Per model-kind quota snapshot (`chat`, `image`, `video`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub quota_snapshot: BTreeMap<String, QuotaWindow>,
    /// Upstream-specific blob: cookies, fingerprint hints.  Never
    /// interpreted by the pool.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
    /// Fields written by builds this one does not know about.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl TokenRecord {
    pub fn new(id: impl Into<String>, class: TokenClass) -> Self {
        Self {
            id: id.into(),
            class,
            tags: BTreeSet::new(),
            consecutive_failures: 0,
            disabled: false,
            cooldown_until: None,
            last_used_at: None,
            last_refreshed_at: None,
            last_cleared_at: None,
            quota_snapshot: BTreeMap::new(),
            extra: serde_json::Value::Null,
            unknown: BTreeMap::new(),
        }
    }

    /// Whether this record may be handed out right now.
    pub fn selectable(&self, now: DateTime<Utc>) -> bool {
        if self.disabled {
            return false;
        }
        match self.cooldown_until {
            Some(until) => until <= now,
            None => true,
        }
    }

    /// Largest remaining count across quota windows; 0 when no snapshot
    /// exists.  Used only as a selection tie-break, so staleness is fine.
    pub fn best_remaining(&self) -> i64 {
        self.quota_snapshot
            .values()
            .map(|w| w.remaining)
            .max()
            .unwrap_or(0)
    }
}

/// Mask a credential for logs: first 8 chars + ellipsis.
///
/// Full credentials never appear in log output at any level.
pub fn mask_token(id: &str) -> String {
    let prefix: String = id.chars().take(8).collect();
    if id.chars().count() > 8 {
        format!("{prefix}…")
    } else {
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn disabled_is_never_selectable() {
        let mut r = TokenRecord::new("sso-x", TokenClass::Basic);
        r.disabled = true;
        assert!(!r.selectable(Utc::now()));
    }

    #[test]
    fn cooldown_expires() {
        let now = Utc::now();
        let mut r = TokenRecord::new("sso-x", TokenClass::Basic);
        r.cooldown_until = Some(now + Duration::seconds(30));
        assert!(!r.selectable(now));
        assert!(r.selectable(now + Duration::seconds(31)));
    }

    #[test]
    fn unknown_fields_roundtrip() {
        let json = serde_json::json!({
            "id": "sso-y",
            "class": "super",
            "shiny_new_field": true,
        });
        let rec: TokenRecord = serde_json::from_value(json).unwrap();
        let back = serde_json::to_value(&rec).unwrap();
        assert_eq!(back["shiny_new_field"], serde_json::json!(true));
    }

    #[test]
    fn mask_hides_tail() {
        assert_eq!(mask_token("sso=abcdef123456"), "sso=abcd…");
        assert_eq!(mask_token("short"), "short");
    }
}
