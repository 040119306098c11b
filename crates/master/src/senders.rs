//! Sender availability and scoring.
//!
//! Availability is the hard gate (connected, logged in, unblocked, under
//! the per-minute ceiling, cooled down); the score ranks the survivors
//! when no chat-history edge decides the pick.

use chrono::{DateTime, Duration, Utc};

use dr_domain::{MINUTE_CEILING, SEND_COOLDOWN_SECS};
use dr_protocol::AccountStatus;

/// Still inside a service-imposed block window.
pub fn is_blocked(s: &AccountStatus, now: DateTime<Utc>) -> bool {
    s.blocked_until.map_or(false, |until| until > now)
}

/// Whether this sender may carry a message right now.
pub fn is_available(s: &AccountStatus, now: DateTime<Utc>) -> bool {
    if !s.connected || !s.logged_in || is_blocked(s, now) {
        return false;
    }
    if s.messages_last_minute >= MINUTE_CEILING {
        return false;
    }
    match s.last_message_at {
        Some(last) => now.signed_duration_since(last) >= Duration::seconds(SEND_COOLDOWN_SECS),
        None => true,
    }
}

/// Rank an available sender:
/// `min(30, age) + min(20, total/100) + recency − 2·minute + 20·success`.
/// The recency bonus favors senders that have been idle longest, capped at
/// ten minutes.
pub fn score(s: &AccountStatus, now: DateTime<Utc>) -> f64 {
    let age = (s.age_days.max(0) as f64).min(30.0);
    let volume = (s.total_messages_sent as f64 / 100.0).min(20.0);
    let recency = match s.last_message_at {
        Some(last) => (now.signed_duration_since(last).num_minutes() as f64).clamp(0.0, 10.0),
        None => 10.0,
    };
    let success_rate = if s.total_messages_sent == 0 {
        1.0
    } else {
        s.successful_messages as f64 / s.total_messages_sent as f64
    };
    age + volume + recency - 2.0 * s.messages_last_minute as f64 + 20.0 * success_rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use dr_domain::Stage;

    fn sender(phone: &str) -> AccountStatus {
        AccountStatus {
            phone: phone.to_owned(),
            logged_in: true,
            connected: true,
            stage: Stage::Adult,
            age_days: 40,
            messages_today: 0,
            messages_last_minute: 0,
            last_message_at: None,
            total_messages_sent: 1_000,
            successful_messages: 1_000,
            blocked_until: None,
            slots: vec![],
            needs_manual_attention: false,
        }
    }

    #[test]
    fn availability_gates() {
        let now = Utc::now();
        let mut s = sender("+1555");
        assert!(is_available(&s, now));

        s.connected = false;
        assert!(!is_available(&s, now));
        s.connected = true;

        s.logged_in = false;
        assert!(!is_available(&s, now));
        s.logged_in = true;

        s.messages_last_minute = 15;
        assert!(!is_available(&s, now));
        s.messages_last_minute = 14;
        assert!(is_available(&s, now));

        s.last_message_at = Some(now - Duration::seconds(3));
        assert!(!is_available(&s, now), "cooldown");
        s.last_message_at = Some(now - Duration::seconds(4));
        assert!(is_available(&s, now));

        s.blocked_until = Some(now + Duration::hours(1));
        assert!(!is_available(&s, now));
        s.blocked_until = Some(now - Duration::hours(1));
        assert!(is_available(&s, now), "expired block clears");
    }

    #[test]
    fn score_prefers_age_volume_idleness_and_success() {
        let now = Utc::now();
        let seasoned = sender("+1001");

        let mut young = sender("+1002");
        young.age_days = 2;
        assert!(score(&seasoned, now) > score(&young, now));

        let mut busy_this_minute = sender("+1003");
        busy_this_minute.messages_last_minute = 10;
        busy_this_minute.last_message_at = Some(now - Duration::seconds(10));
        assert!(score(&seasoned, now) > score(&busy_this_minute, now));

        let mut failing = sender("+1004");
        failing.successful_messages = 200; // 20% success
        assert!(score(&seasoned, now) > score(&failing, now));
    }

    #[test]
    fn score_caps_age_and_volume_contributions() {
        let now = Utc::now();
        let mut ancient = sender("+1001");
        ancient.age_days = 5_000;
        ancient.total_messages_sent = 1_000_000;
        ancient.successful_messages = 1_000_000;
        // 30 (age) + 20 (volume) + 10 (recency) + 20 (success) = 80.
        assert!((score(&ancient, now) - 80.0).abs() < f64::EPSILON);
    }
}
