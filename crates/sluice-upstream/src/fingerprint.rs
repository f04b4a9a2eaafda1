// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anti-bot fingerprint header.
//!
//! The upstream expects an `x-statsig-id` header whose value it correlates
//! with the user agent.  Two modes:
//!
//! - **static** (default): the operator scrapes a known-good value from a
//!   real browser session and configures it as `upstream.statsig_id`.
//! - **dynamic**: a deterministic per-request derivation seeded by the
//!   token id and a one-minute time bucket.  Deterministic so the same
//!   request in the same minute produces the same header, which keeps the
//!   path testable.  Enabled with `upstream.dynamic_fingerprint`.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sluice_config::UpstreamConfig;

/// Fallback static value used when the operator configured nothing.  Known
/// to pass as of the last scrape; operators should supply their own.
const DEFAULT_STATIC_ID: &str = "ZTpkZWZhdWx0LXNsdWljZS1maW5nZXJwcmludA==";

/// Produce the fingerprint header value for one request.
pub fn fingerprint_for(config: &UpstreamConfig, token_id: &str, now: DateTime<Utc>) -> String {
    if !config.dynamic_fingerprint {
        return config
            .statsig_id
            .clone()
            .unwrap_or_else(|| DEFAULT_STATIC_ID.to_string());
    }

    let bucket = now.timestamp() / 60;
    let mut hasher = Sha256::new();
    hasher.update(token_id.as_bytes());
    hasher.update(bucket.to_be_bytes());
    hasher.update(config.user_agent.as_bytes());
    let digest = hasher.finalize();
    // The upstream only checks shape (base64, fixed length), not content.
    B64.encode(&digest[..24])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(dynamic: bool) -> UpstreamConfig {
        UpstreamConfig {
            dynamic_fingerprint: dynamic,
            ..UpstreamConfig::default()
        }
    }

    #[test]
    fn static_mode_uses_configured_value() {
        let mut cfg = config(false);
        cfg.statsig_id = Some("operator-value".into());
        assert_eq!(fingerprint_for(&cfg, "sso-a", Utc::now()), "operator-value");
    }

    #[test]
    fn static_mode_falls_back_to_default() {
        let fp = fingerprint_for(&config(false), "sso-a", Utc::now());
        assert_eq!(fp, DEFAULT_STATIC_ID);
    }

    #[test]
    fn dynamic_mode_is_deterministic_within_a_minute() {
        let cfg = config(true);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 55).unwrap();
        assert_eq!(
            fingerprint_for(&cfg, "sso-a", t0),
            fingerprint_for(&cfg, "sso-a", t1)
        );
    }

    #[test]
    fn dynamic_mode_varies_by_token_and_bucket() {
        let cfg = config(true);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap();
        let t_next = Utc.with_ymd_and_hms(2026, 3, 1, 12, 31, 5).unwrap();
        assert_ne!(
            fingerprint_for(&cfg, "sso-a", t0),
            fingerprint_for(&cfg, "sso-b", t0)
        );
        assert_ne!(
            fingerprint_for(&cfg, "sso-a", t0),
            fingerprint_for(&cfg, "sso-a", t_next)
        );
    }
}
