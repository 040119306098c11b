//! Per-identity send throttle.
//!
//! The pacer is the critical section that totally orders one identity's
//! sends. `admit` is consulted before every intended send and is
//! deterministic in (state, now) — only the magnitude of an allowed delay is
//! random. Counters reset lazily when a wall-clock boundary is crossed.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use rand::Rng;

use dr_domain::config::PacingConfig;
use dr_domain::{Stage, MINUTE_CEILING, SEND_COOLDOWN_SECS};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session-length break: every N sends, pause 15–30 minutes. Unlike the
/// short/long breaks this one has no env knobs.
const SESSION_BREAK_INTERVAL: u64 = 100;
const SESSION_BREAK_MIN_MS: u64 = 900_000;
const SESSION_BREAK_MAX_MS: u64 = 1_800_000;

/// Why a send was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    DailyLimit,
    HourlyLimit,
    MinuteLimit,
    Cooldown,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::DailyLimit => "daily_limit",
            DenyReason::HourlyLimit => "hourly_limit",
            DenyReason::MinuteLimit => "minute_limit",
            DenyReason::Cooldown => "cooldown",
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { delay_ms: u64 },
    Denied { reason: DenyReason },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pacer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct Pacer {
    cfg: PacingConfig,
    created_at: DateTime<Utc>,

    sent_this_minute: u32,
    minute_window_start: DateTime<Utc>,
    sent_this_hour: u32,
    hour_start: (NaiveDate, u32),
    sent_today: u32,
    day: NaiveDate,

    total_sent: u64,
    last_send_at: Option<DateTime<Utc>>,
}

impl Pacer {
    pub fn new(cfg: PacingConfig, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            cfg,
            created_at,
            sent_this_minute: 0,
            minute_window_start: now,
            sent_this_hour: 0,
            hour_start: (now.date_naive(), now.hour()),
            sent_today: 0,
            day: now.date_naive(),
            total_sent: 0,
            last_send_at: None,
        }
    }

    /// Restore persisted counters after a worker restart.
    pub fn restore(
        &mut self,
        sent_today: u32,
        sent_this_hour: u32,
        total_sent: u64,
        last_send_at: Option<DateTime<Utc>>,
    ) {
        self.sent_today = sent_today;
        self.sent_this_hour = sent_this_hour;
        self.total_sent = total_sent;
        self.last_send_at = last_send_at;
    }

    pub fn stage(&self, now: DateTime<Utc>) -> Stage {
        Stage::for_age_days(now.signed_duration_since(self.created_at).num_days())
    }

    fn daily_cap(&self, stage: Stage) -> u32 {
        match self.cfg.max_messages_per_day {
            Some(clamp) => stage.daily_cap().min(clamp),
            None => stage.daily_cap(),
        }
    }

    fn hourly_cap(&self, stage: Stage) -> u32 {
        match self.cfg.max_messages_per_hour {
            Some(clamp) => stage.hourly_cap().min(clamp),
            None => stage.hourly_cap(),
        }
    }

    /// Decide whether a send may proceed at `now`, and with what delay.
    pub fn admit(&mut self, now: DateTime<Utc>) -> Admission {
        self.roll_windows(now);
        let stage = self.stage(now);

        if self.sent_today >= self.daily_cap(stage) {
            return Admission::Denied {
                reason: DenyReason::DailyLimit,
            };
        }
        if self.sent_this_hour >= self.hourly_cap(stage) {
            return Admission::Denied {
                reason: DenyReason::HourlyLimit,
            };
        }
        if self.sent_this_minute >= MINUTE_CEILING {
            return Admission::Denied {
                reason: DenyReason::MinuteLimit,
            };
        }
        if let Some(last) = self.last_send_at {
            if now.signed_duration_since(last) < Duration::seconds(SEND_COOLDOWN_SECS) {
                return Admission::Denied {
                    reason: DenyReason::Cooldown,
                };
            }
        }

        Admission::Allowed {
            delay_ms: self.next_delay_ms(stage),
        }
    }

    /// Record one successful send at `now`.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.roll_windows(now);
        self.sent_this_minute += 1;
        self.sent_this_hour += 1;
        self.sent_today += 1;
        self.total_sent += 1;
        self.last_send_at = Some(now);
    }

    // ── counter views (lazy-reset on read) ───────────────────────────

    pub fn sent_today(&mut self, now: DateTime<Utc>) -> u32 {
        self.roll_windows(now);
        self.sent_today
    }

    pub fn sent_this_hour(&mut self, now: DateTime<Utc>) -> u32 {
        self.roll_windows(now);
        self.sent_this_hour
    }

    pub fn sent_this_minute(&mut self, now: DateTime<Utc>) -> u32 {
        self.roll_windows(now);
        self.sent_this_minute
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn last_send_at(&self) -> Option<DateTime<Utc>> {
        self.last_send_at
    }

    // ── internals ────────────────────────────────────────────────────

    fn roll_windows(&mut self, now: DateTime<Utc>) {
        if now.signed_duration_since(self.minute_window_start) >= Duration::seconds(60) {
            self.sent_this_minute = 0;
            self.minute_window_start = now;
        }
        let hour = (now.date_naive(), now.hour());
        if hour != self.hour_start {
            self.sent_this_hour = 0;
            self.hour_start = hour;
        }
        let day = now.date_naive();
        if day != self.day {
            self.sent_today = 0;
            self.day = day;
        }
    }

    /// Base delay with ±10% jitter, plus any break due before the next send.
    /// Breaks compose additively.
    fn next_delay_ms(&self, stage: Stage) -> u64 {
        let mut rng = rand::thread_rng();

        let (stage_min, stage_max) = stage.base_delay_ms();
        let min = self.cfg.min_delay_ms.unwrap_or(stage_min);
        let max = self.cfg.max_delay_ms.unwrap_or(stage_max).max(min);
        let base = rng.gen_range(min..=max) as f64;
        let jitter = 1.0 + rng.gen_range(-0.1..=0.1);
        let mut delay = (base * jitter) as u64;

        let upcoming = self.total_sent + 1;
        if upcoming % self.cfg.short_break_interval == 0 {
            delay += rng.gen_range(self.cfg.short_break_min_ms..=self.cfg.short_break_max_ms);
        }
        if upcoming % self.cfg.long_break_interval == 0 {
            delay += rng.gen_range(self.cfg.long_break_min_ms..=self.cfg.long_break_max_ms);
        }
        if upcoming % SESSION_BREAK_INTERVAL == 0 {
            delay += rng.gen_range(SESSION_BREAK_MIN_MS..=SESSION_BREAK_MAX_MS);
        }
        delay
    }
}
