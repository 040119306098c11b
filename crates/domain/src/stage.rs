//! Warmup stage table.
//!
//! A freshly-paired identity must not send at full throughput: quotas and
//! delays scale with the identity's age. The table is a closed enumeration of
//! constants; nothing here is runtime state.

use serde::{Deserialize, Serialize};

/// Per-minute ceiling applied to every sender regardless of stage.
///
/// At full throughput this is the binding constraint.
pub const MINUTE_CEILING: u32 = 15;

/// Minimum gap between two sends by the same identity, in seconds.
pub const SEND_COOLDOWN_SECS: i64 = 4;

/// Warmup stage, derived from days since the identity's first pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Newborn,
    Baby,
    Toddler,
    Teen,
    Adult,
    Veteran,
}

impl Stage {
    /// Resolve the stage for an identity that is `age_days` old.
    pub fn for_age_days(age_days: i64) -> Self {
        match age_days {
            i64::MIN..=3 => Stage::Newborn,
            4..=7 => Stage::Baby,
            8..=14 => Stage::Toddler,
            15..=30 => Stage::Teen,
            31..=60 => Stage::Adult,
            _ => Stage::Veteran,
        }
    }

    /// Maximum successful sends per UTC calendar day.
    pub fn daily_cap(self) -> u32 {
        match self {
            Stage::Newborn => 5,
            Stage::Baby => 15,
            Stage::Toddler => 30,
            Stage::Teen => 50,
            Stage::Adult => 100,
            Stage::Veteran => 200,
        }
    }

    /// Maximum successful sends per wall-clock hour.
    pub fn hourly_cap(self) -> u32 {
        match self {
            Stage::Newborn => 2,
            Stage::Baby => 5,
            Stage::Toddler => 10,
            Stage::Teen => 15,
            Stage::Adult => 25,
            Stage::Veteran => 50,
        }
    }

    /// Inclusive range of the base delay between sends, in milliseconds.
    pub fn base_delay_ms(self) -> (u64, u64) {
        match self {
            Stage::Newborn => (30_000, 60_000),
            Stage::Baby => (20_000, 40_000),
            Stage::Toddler => (10_000, 20_000),
            Stage::Teen => (5_000, 10_000),
            Stage::Adult => (3_000, 7_000),
            Stage::Veteran => (1_000, 5_000),
        }
    }

    /// Per-day internal-warmup budget as (messages, activities).
    pub fn warmup_budget(self) -> (u32, u32) {
        match self {
            Stage::Newborn => (3, 5),
            Stage::Baby => (8, 10),
            Stage::Toddler => (15, 15),
            Stage::Teen => (25, 20),
            Stage::Adult => (40, 25),
            Stage::Veteran => (60, 30),
        }
    }

    /// Whether warmup traffic from this stage may leave the local deployment.
    /// Newborn and Baby identities talk only to co-located identities.
    pub fn warmup_may_go_external(self) -> bool {
        self >= Stage::Toddler
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Newborn => "newborn",
            Stage::Baby => "baby",
            Stage::Toddler => "toddler",
            Stage::Teen => "teen",
            Stage::Adult => "adult",
            Stage::Veteran => "veteran",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_boundaries() {
        assert_eq!(Stage::for_age_days(0), Stage::Newborn);
        assert_eq!(Stage::for_age_days(3), Stage::Newborn);
        assert_eq!(Stage::for_age_days(4), Stage::Baby);
        assert_eq!(Stage::for_age_days(7), Stage::Baby);
        assert_eq!(Stage::for_age_days(8), Stage::Toddler);
        assert_eq!(Stage::for_age_days(14), Stage::Toddler);
        assert_eq!(Stage::for_age_days(15), Stage::Teen);
        assert_eq!(Stage::for_age_days(30), Stage::Teen);
        assert_eq!(Stage::for_age_days(31), Stage::Adult);
        assert_eq!(Stage::for_age_days(60), Stage::Adult);
        assert_eq!(Stage::for_age_days(61), Stage::Veteran);
        assert_eq!(Stage::for_age_days(10_000), Stage::Veteran);
    }

    #[test]
    fn caps_grow_with_age() {
        let stages = [
            Stage::Newborn,
            Stage::Baby,
            Stage::Toddler,
            Stage::Teen,
            Stage::Adult,
            Stage::Veteran,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].daily_cap() < pair[1].daily_cap());
            assert!(pair[0].hourly_cap() < pair[1].hourly_cap());
            assert!(pair[0].base_delay_ms().0 >= pair[1].base_delay_ms().0);
        }
    }

    #[test]
    fn warmup_locality() {
        assert!(!Stage::Newborn.warmup_may_go_external());
        assert!(!Stage::Baby.warmup_may_go_external());
        assert!(Stage::Toddler.warmup_may_go_external());
        assert!(Stage::Veteran.warmup_may_go_external());
    }

    #[test]
    fn serde_lowercase() {
        assert_eq!(serde_json::to_string(&Stage::Newborn).unwrap(), "\"newborn\"");
        let s: Stage = serde_json::from_str("\"veteran\"").unwrap();
        assert_eq!(s, Stage::Veteran);
    }
}
