//! Identity records.
//!
//! An identity is an externally-meaningful sending handle (an E.164 phone
//! number for the current chat service, treated as opaque everywhere except
//! country derivation). Identities are created on first successful pairing
//! and never destroyed by the core; misbehaving ones are only marked blocked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Durable per-identity record, mirrored into the accounts store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Unique key: the sending handle (`+<digits>`).
    pub phone: String,
    /// Country tag derived from the handle prefix; used for quota routing
    /// and humanizer locale.
    pub country: String,
    /// First successful pairing.
    pub created_at: DateTime<Utc>,
    /// Set when the service permanently restricts the identity.
    #[serde(default)]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_today: u32,
    #[serde(default)]
    pub sent_this_minute: u32,
    #[serde(default)]
    pub sent_this_hour: u32,
    #[serde(default)]
    pub total_sent: u64,
    #[serde(default)]
    pub successful: u64,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl IdentityRecord {
    pub fn new(phone: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        let phone = phone.into();
        let country = country_for_handle(&phone);
        Self {
            phone,
            country,
            created_at,
            blocked_at: None,
            sent_today: 0,
            sent_this_minute: 0,
            sent_this_hour: 0,
            total_sent: 0,
            successful: 0,
            last_message_at: None,
        }
    }

    /// Whole days elapsed since first pairing, at `now`.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.created_at).num_days()
    }

    /// Warmup stage at `now`.
    pub fn stage(&self, now: DateTime<Utc>) -> Stage {
        Stage::for_age_days(self.age_days(now))
    }

    /// Blocked within the last 48 hours. A blocked identity becomes
    /// available again once the cooldown expires.
    pub fn blocked(&self, now: DateTime<Utc>) -> bool {
        match self.blocked_at {
            Some(at) => now.signed_duration_since(at).num_hours() < 48,
            None => false,
        }
    }

    /// Fraction of sends that succeeded, in [0, 1]. 1.0 when nothing sent yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_sent == 0 {
            1.0
        } else {
            self.successful as f64 / self.total_sent as f64
        }
    }
}

/// Country calling-code prefixes we route on, ordered longest-first so the
/// first match is the most specific. Anything unmatched falls into the
/// catch-all bucket.
const COUNTRY_PREFIXES: &[(&str, &str)] = &[
    ("972", "IL"),
    ("971", "AE"),
    ("966", "SA"),
    ("91", "IN"),
    ("86", "CN"),
    ("81", "JP"),
    ("61", "AU"),
    ("55", "BR"),
    ("52", "MX"),
    ("49", "DE"),
    ("48", "PL"),
    ("44", "GB"),
    ("39", "IT"),
    ("34", "ES"),
    ("33", "FR"),
    ("31", "NL"),
    ("27", "ZA"),
    ("20", "EG"),
    ("7", "RU"),
    ("1", "US"),
];

/// Derive the country tag for a handle from its E.164 calling-code prefix.
pub fn country_for_handle(handle: &str) -> String {
    let digits: String = handle.chars().filter(|c| c.is_ascii_digit()).collect();
    COUNTRY_PREFIXES
        .iter()
        .find(|(prefix, _)| digits.starts_with(prefix))
        .map(|(_, tag)| *tag)
        .unwrap_or("XX")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn country_derivation() {
        assert_eq!(country_for_handle("+15550001111"), "US");
        assert_eq!(country_for_handle("+447700900000"), "GB");
        assert_eq!(country_for_handle("+972541112222"), "IL");
        assert_eq!(country_for_handle("+9715012345"), "AE");
        assert_eq!(country_for_handle("+79161234567"), "RU");
        assert_eq!(country_for_handle("00000"), "XX");
    }

    #[test]
    fn longest_prefix_wins_over_shorter() {
        // "972" must not be captured by any shorter rule.
        assert_eq!(country_for_handle("+972000000"), "IL");
        // "91" (IN) vs "9" (no rule): fine either way, but must be IN.
        assert_eq!(country_for_handle("+919999999999"), "IN");
    }

    #[test]
    fn blocked_cooldown_window() {
        let now = Utc::now();
        let mut rec = IdentityRecord::new("+15550001111", now - Duration::days(40));
        assert!(!rec.blocked(now));

        rec.blocked_at = Some(now - Duration::hours(47));
        assert!(rec.blocked(now));

        rec.blocked_at = Some(now - Duration::hours(49));
        assert!(!rec.blocked(now), "48h cooldown expired");
    }

    #[test]
    fn stage_from_age() {
        let now = Utc::now();
        let rec = IdentityRecord::new("+15550001111", now - Duration::days(20));
        assert_eq!(rec.stage(now), Stage::Teen);
    }

    #[test]
    fn success_rate_defaults_to_one() {
        let rec = IdentityRecord::new("+15550001111", Utc::now());
        assert_eq!(rec.success_rate(), 1.0);
    }
}
