//! Batch distribution.
//!
//! A batch of (recipient, template) pairs becomes one queue record per
//! pair. The pre-plan groups recipients by destination country and checks
//! them against the eligible capacity of co-located identities; recipients
//! without capacity are still enqueued, flagged deferred, and wait for
//! capacity to open. The actual sender is chosen at dispatch time by the
//! queue processor — nothing here is a routing commitment.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use dr_domain::{country_for_handle, Campaign, Priority, QueuedMessage};
use dr_protocol::AccountStatus;

use crate::state::AppState;

/// Per-batch share: one identity is pre-planned for at most this many
/// messages of a single batch.
pub const PER_IDENTITY_BATCH_SHARE: u32 = 20;

/// One entry of an inbound batch.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchContact {
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// What admission produced.
pub struct DistributionOutcome {
    pub campaign: Campaign,
    pub queued: u32,
    pub deferred: u32,
}

/// Effective capacity an identity contributes to one batch:
/// `min(remaining daily, per-batch share)`.
fn effective_power(status: &AccountStatus) -> u32 {
    let remaining = status
        .stage
        .daily_cap()
        .saturating_sub(status.messages_today);
    remaining.min(PER_IDENTITY_BATCH_SHARE)
}

/// Pre-plan: country → total batch capacity of eligible co-located
/// identities. Eligible = connected, logged in, not blocked, with daily
/// room left.
pub fn plan_capacity(
    senders: &[AccountStatus],
    now: DateTime<Utc>,
) -> HashMap<String, u32> {
    let mut capacity: HashMap<String, u32> = HashMap::new();
    for status in senders {
        if !status.connected || !status.logged_in {
            continue;
        }
        if status.blocked_until.map_or(false, |until| until > now) {
            continue;
        }
        let power = effective_power(status);
        if power == 0 {
            continue;
        }
        let country = country_for_handle(&status.phone);
        *capacity.entry(country).or_default() += power;
    }
    capacity
}

/// Admit a batch: create the campaign and enqueue one record per contact.
/// Duplicate contacts within the batch collapse onto one record.
pub async fn distribute(
    state: &AppState,
    contacts: &[BatchContact],
    template: &str,
    priority: Priority,
    now: DateTime<Utc>,
) -> DistributionOutcome {
    let senders: Vec<AccountStatus> = state
        .pool
        .snapshot(now)
        .await
        .into_iter()
        .map(|v| v.status)
        .collect();
    let mut capacity = plan_capacity(&senders, now);

    let campaign = state.campaigns.create(0, now);
    let mut queued = 0u32;
    let mut deferred = 0u32;

    for contact in contacts {
        let mut record = QueuedMessage::new(
            campaign.id,
            contact.phone.clone(),
            template,
            priority,
            now,
        );
        record.recipient_name = contact.name.clone();

        let country = country_for_handle(&contact.phone);
        match capacity.get_mut(&country) {
            Some(room) if *room > 0 => {
                *room -= 1;
            }
            _ => {
                record.deferred = true;
            }
        }

        let was_deferred = record.deferred;
        if state.queue.enqueue(record) {
            queued += 1;
            if was_deferred {
                deferred += 1;
            }
        }
    }

    state.campaigns.update(&campaign.id, |c| c.total = queued);
    tracing::info!(
        campaign = %campaign.id,
        queued,
        deferred,
        contacts = contacts.len(),
        "batch admitted"
    );

    let campaign = state.campaigns.get(&campaign.id).unwrap_or(campaign);
    DistributionOutcome {
        campaign,
        queued,
        deferred,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dr_domain::Stage;

    fn sender(phone: &str, stage: Stage, today: u32) -> AccountStatus {
        AccountStatus {
            phone: phone.to_owned(),
            logged_in: true,
            connected: true,
            stage,
            age_days: 40,
            messages_today: today,
            messages_last_minute: 0,
            last_message_at: None,
            total_messages_sent: 0,
            successful_messages: 0,
            blocked_until: None,
            slots: vec![],
            needs_manual_attention: false,
        }
    }

    #[test]
    fn capacity_groups_by_country_and_caps_share() {
        let now = Utc::now();
        let senders = vec![
            // US Adult with nothing sent: 20 (batch share caps 100).
            sender("+15550001111", Stage::Adult, 0),
            // US Newborn with 3 of 5 sent: 2 remaining.
            sender("+15550002222", Stage::Newborn, 3),
            // GB Veteran: 20 via share cap.
            sender("+447700900000", Stage::Veteran, 0),
        ];
        let capacity = plan_capacity(&senders, now);
        assert_eq!(capacity.get("US"), Some(&22));
        assert_eq!(capacity.get("GB"), Some(&20));
    }

    #[test]
    fn exhausted_and_disconnected_senders_contribute_nothing() {
        let now = Utc::now();
        let mut spent = sender("+15550001111", Stage::Newborn, 5);
        let mut offline = sender("+15550002222", Stage::Adult, 0);
        offline.connected = false;
        let mut blocked = sender("+15550003333", Stage::Adult, 0);
        blocked.blocked_until = Some(now + chrono::Duration::hours(1));
        spent.messages_today = 5;

        let capacity = plan_capacity(&[spent, offline, blocked], now);
        assert!(capacity.is_empty());
    }
}
