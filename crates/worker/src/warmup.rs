//! Internal warmup traffic.
//!
//! Newly-provisioned identities build a believable footprint before they
//! carry campaign traffic: short greeting-style messages among identities on
//! the same worker (or to themselves), under per-stage daily budgets.
//! Newborn and Baby identities stay strictly co-located; older stages may
//! also draw from a configured external-target list.

use chrono::{DateTime, NaiveDate, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

use dr_domain::Stage;

/// Cadence of the warmup sweep over all owned identities.
pub const WARMUP_SWEEP_SECS: u64 = 30 * 60;

/// Greeting templates; spin tags are resolved by the variator at send time.
pub const GREETINGS: &[&str] = &[
    "{Hey|Hi|Hello}! {How are you|How's it going|All good}?",
    "{Good morning|Morning}! {Have a great day|Hope your day goes well}",
    "{Thanks|Thank you} for the other day!",
    "{Long time|Been a while}! {How have you been|What's new}?",
    "Just checking in {🙂|👋|}",
];

/// Per-identity, per-day warmup consumption.
#[derive(Debug, Clone)]
pub struct WarmupLedger {
    day: NaiveDate,
    messages: u32,
    activities: u32,
}

impl WarmupLedger {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            day: now.date_naive(),
            messages: 0,
            activities: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        if day != self.day {
            self.day = day;
            self.messages = 0;
            self.activities = 0;
        }
    }

    /// Remaining (messages, activities) for the stage's daily budget.
    pub fn remaining(&mut self, stage: Stage, now: DateTime<Utc>) -> (u32, u32) {
        self.roll(now);
        let (msg_budget, act_budget) = stage.warmup_budget();
        (
            msg_budget.saturating_sub(self.messages),
            act_budget.saturating_sub(self.activities),
        )
    }

    pub fn note_message(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        self.messages += 1;
    }

    pub fn note_activity(&mut self, now: DateTime<Utc>) {
        self.roll(now);
        self.activities += 1;
    }
}

/// Choose a warmup target for `phone`. Co-located siblings come first;
/// stages past Baby may also draw from the configured external list; an
/// identity with no one to talk to messages itself.
pub fn pick_target(
    phone: &str,
    stage: Stage,
    co_located: &[String],
    external: &[String],
    rng: &mut impl Rng,
) -> String {
    let mut candidates: Vec<&String> = co_located.iter().filter(|p| p.as_str() != phone).collect();
    if stage.warmup_may_go_external() {
        candidates.extend(external.iter());
    }
    match candidates.choose(rng) {
        Some(target) => (*target).clone(),
        None => phone.to_owned(),
    }
}

/// Pick a greeting template.
pub fn pick_greeting(rng: &mut impl Rng) -> &'static str {
    GREETINGS.choose(rng).copied().unwrap_or(GREETINGS[0])
}
