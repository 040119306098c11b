//! The queue processor: a single polling loop that turns pending records
//! into dispatched sends.
//!
//! Every 500 ms one tick runs: enumerate available senders, read a slice of
//! pending records (chat-history recipients first), pick the best sender
//! per record, dispatch over the worker RPC, record the result. Retry
//! lives here and only here — sessions never retry, pacer denials are
//! decisions. A record moves `pending → processing → (pending →
//! processing)* → (sent | failed)` and nothing else.

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;

use dr_protocol::{SendErrorKind, SendRequest};
use dr_store::QueueStore;

use crate::senders;
use crate::state::AppState;
use crate::workers::{SendReply, SenderView};

/// Tick cadence.
pub const TICK_INTERVAL_MS: u64 = 500;

/// Cap on records examined per tick.
const MAX_BATCH: usize = 50;

/// Immediate in-tick retries per record, after the first attempt.
const MAX_IMMEDIATE_RETRIES: u32 = 2;

/// What one tick did; tests assert on this.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub examined: usize,
    pub sent: u32,
    pub failed: u32,
    pub requeued: u32,
    pub completed_campaigns: u32,
}

/// Run the processor until cancelled.
pub async fn run(state: AppState, cancel: CancellationToken) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(TICK_INTERVAL_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!("queue processor started ({TICK_INTERVAL_MS}ms tick)");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let report = tick(&state, Utc::now()).await;
                if report.sent + report.failed + report.requeued > 0 {
                    tracing::debug!(?report, "tick");
                }
            }
        }
    }
    tracing::info!("queue processor stopped");
}

/// One processor tick.
pub async fn tick(state: &AppState, now: DateTime<Utc>) -> TickReport {
    let mut report = TickReport::default();

    // 1. Skip the sender enumeration entirely on an empty queue. (A
    // stricter low-water gate would amortize polling further but starves
    // the last record of a batch, so emptiness is the only short-circuit.)
    if state.queue.pending_count() == 0 {
        sweep_campaigns(state, now, &mut report);
        return report;
    }

    // 2–3. Available senders across the fleet.
    let mut available: Vec<SenderView> = state
        .pool
        .snapshot(now)
        .await
        .into_iter()
        .filter(|v| senders::is_available(&v.status, now))
        .collect();
    if available.is_empty() {
        sweep_campaigns(state, now, &mut report);
        return report;
    }

    // 4. A slice of pending records, edge-holders first.
    let limit = (2 * available.len()).min(MAX_BATCH);
    let available_phones: Vec<String> =
        available.iter().map(|v| v.status.phone.clone()).collect();
    let records = state
        .queue
        .read_pending(limit, |recipient| {
            state.history.any_edge(&available_phones, recipient)
        });
    report.examined = records.len();

    // 5–7. Dispatch each record with bounded immediate retries.
    for record in records {
        // Senders may have hit the minute ceiling or the cooldown on a
        // previous record of this very tick.
        available.retain(|v| senders::is_available(&v.status, now));
        if available.is_empty() {
            break;
        }
        let mut attempts = 0u32;
        loop {
            let Some(pick) = pick_sender(state, &available, &record.recipient, now) else {
                break; // stays pending for a later tick
            };
            let sender_phone = available[pick].status.phone.clone();
            let worker = available[pick].worker;

            if let Err(e) = state.queue.mark_processing(&record.id, &sender_phone) {
                tracing::warn!(record = %record.id, error = %e, "claim failed");
                break;
            }

            let req = SendRequest {
                from_phone: sender_phone.clone(),
                to_phone: record.recipient.clone(),
                message: record.template.clone(),
                name: record.recipient_name.clone(),
            };
            let reply = state.pool.send(worker, &req).await;

            match reply {
                Ok(SendReply::Sent(resp)) => {
                    if let Err(e) = state.queue.mark_sent(&record.id, now) {
                        tracing::warn!(record = %record.id, error = %e, "sent-mark failed");
                    }
                    state
                        .history
                        .record(&sender_phone, &record.recipient, resp.timestamp);
                    state.pool.note_send(&sender_phone, resp.timestamp);
                    bump_local(&mut available, pick, resp.timestamp);
                    report.sent += 1;
                    break;
                }
                Ok(SendReply::Failed(err)) => {
                    tracing::debug!(
                        record = %record.id,
                        sender = %sender_phone,
                        kind = ?err.kind,
                        error = %err.error,
                        "worker refused send"
                    );
                    match err.kind {
                        SendErrorKind::PermanentlyBlocked => {
                            mark_record_failed(&state.queue, &record.id, now, &mut report);
                            state
                                .pool
                                .note_blocked_until(&sender_phone, now + Duration::hours(48));
                            available.remove(pick);
                            break;
                        }
                        SendErrorKind::InvalidRecipient => {
                            mark_record_failed(&state.queue, &record.id, now, &mut report);
                            break;
                        }
                        SendErrorKind::NotLoggedIn | SendErrorKind::NotConnected => {
                            // The sender is unusable, not the record: no
                            // retry consumed.
                            if let Err(e) = state.queue.release(&record.id) {
                                tracing::warn!(record = %record.id, error = %e, "release failed");
                            }
                            available.remove(pick);
                        }
                        SendErrorKind::TempBlocked => {
                            requeue(&state.queue, &record.id, now, &mut report);
                            state
                                .pool
                                .note_blocked_until(&sender_phone, now + Duration::hours(5));
                            available.remove(pick);
                        }
                        SendErrorKind::RateLimited => {
                            requeue(&state.queue, &record.id, now, &mut report);
                            // Park the sender until its minute window rolls.
                            available[pick].status.messages_last_minute =
                                dr_domain::MINUTE_CEILING;
                        }
                        SendErrorKind::TransportError => {
                            requeue(&state.queue, &record.id, now, &mut report);
                        }
                    }
                }
                Err(e) => {
                    // RPC-level trouble (timeout, unreachable worker):
                    // temporary failure, requeue with the rest.
                    tracing::warn!(record = %record.id, worker, error = %e, "send RPC failed");
                    requeue(&state.queue, &record.id, now, &mut report);
                }
            }

            attempts += 1;
            let still_pending = state
                .queue
                .get(&record.id)
                .map(|r| r.status == dr_domain::QueueStatus::Pending)
                .unwrap_or(false);
            if !still_pending || attempts > MAX_IMMEDIATE_RETRIES {
                break;
            }
            // Drop availability of senders that no longer pass the gate
            // before the immediate retry.
            available.retain(|v| senders::is_available(&v.status, now));
            if available.is_empty() {
                break;
            }
        }
        if available.is_empty() {
            break;
        }
    }

    // 8. Campaign completion sweep.
    sweep_campaigns(state, now, &mut report);
    report
}

/// Best sender for a recipient: any available sender with a chat-history
/// edge wins (most recent edge first); otherwise the highest score.
fn pick_sender(
    state: &AppState,
    available: &[SenderView],
    recipient: &str,
    now: DateTime<Utc>,
) -> Option<usize> {
    if available.is_empty() {
        return None;
    }
    let phones: Vec<String> = available.iter().map(|v| v.status.phone.clone()).collect();
    if let Some(edge_holder) = state.history.most_recent_sender(&phones, recipient) {
        return available
            .iter()
            .position(|v| v.status.phone == edge_holder);
    }
    available
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            senders::score(&a.status, now)
                .partial_cmp(&senders::score(&b.status, now))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(idx, _)| idx)
}

fn bump_local(available: &mut [SenderView], pick: usize, at: DateTime<Utc>) {
    let status = &mut available[pick].status;
    status.messages_last_minute += 1;
    status.messages_today += 1;
    status.total_messages_sent += 1;
    status.successful_messages += 1;
    status.last_message_at = Some(at);
}

fn requeue(queue: &QueueStore, id: &uuid::Uuid, now: DateTime<Utc>, report: &mut TickReport) {
    match queue.requeue(id, now) {
        Ok(dr_domain::QueueStatus::Failed) => report.failed += 1,
        Ok(_) => report.requeued += 1,
        Err(e) => tracing::warn!(record = %id, error = %e, "requeue failed"),
    }
}

fn mark_record_failed(
    queue: &QueueStore,
    id: &uuid::Uuid,
    now: DateTime<Utc>,
    report: &mut TickReport,
) {
    match queue.mark_failed(id, now) {
        Ok(()) => report.failed += 1,
        Err(e) => tracing::warn!(record = %id, error = %e, "failed-mark failed"),
    }
}

/// Mark completed every campaign whose non-terminal record count is zero.
fn sweep_campaigns(state: &AppState, now: DateTime<Utc>, report: &mut TickReport) {
    for campaign_id in state.queue.campaign_ids() {
        let (pending, processing, sent, failed) = state.queue.campaign_counts(&campaign_id);
        if state
            .campaigns
            .reconcile(&campaign_id, pending, processing, sent, failed, now)
        {
            tracing::info!(campaign = %campaign_id, sent, failed, "campaign completed");
            report.completed_campaigns += 1;
        }
    }
}
