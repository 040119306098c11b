//! Session group: the up-to-four redundant sessions of one identity, the
//! active-slot selector, failover, and the bounded revival loop.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use dr_chatwire::{
    BlockClassifier, BlockVerdict, Credential, Dialer, ProxyPool, SendOutcome, WireEventStream,
};
use dr_protocol::{SendErrorKind, SlotStatus};

use crate::session::{Session, SessionDial, SessionEvent, SessionStatus};

/// Redundant sessions per identity. The service tolerates four linked
/// devices; how many we actually keep is the runtime's choice.
pub const MAX_SLOTS: u8 = 4;

/// The revival window: how long disconnected identities are retried on the
/// tight cadence before dropping to hourly attempts.
pub const REVIVAL_WINDOW_HOURS: i64 = 48;

/// Redial cadence for a fully-disconnected group, by time since the last
/// Connected moment. After the window closes we keep trying hourly,
/// forever.
pub fn revival_interval(elapsed: Duration) -> Duration {
    if elapsed < Duration::hours(2) {
        Duration::minutes(5)
    } else if elapsed < Duration::hours(12) {
        Duration::minutes(15)
    } else if elapsed < Duration::hours(REVIVAL_WINDOW_HOURS) {
        Duration::minutes(30)
    } else {
        Duration::hours(1)
    }
}

/// Cadence (minutes) for restoring redundancy while the group still has a
/// connected slot.
const PARTIAL_REDIAL_MINUTES: i64 = 5;

/// Aggregate identity status. The BLOCKED view is computed by the store
/// from the identity's blocked-until field, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Connected,
    Disconnected,
}

pub struct SessionGroup {
    pub phone: String,
    slots: Vec<Session>,
    /// 1-based active slot; 0 = none connected.
    active_slot: u8,
    last_connected_at: Option<DateTime<Utc>>,
    last_revival_round: Option<DateTime<Utc>>,
    known_contacts: HashSet<String>,
    alerted_no_slots: bool,
}

impl SessionGroup {
    /// Build a group with `slot_count` sessions, each drawing a sticky
    /// proxy from the pool.
    pub fn new(
        phone: impl Into<String>,
        slot_count: u8,
        proxies: &dyn ProxyPool,
        now: DateTime<Utc>,
    ) -> Self {
        let phone = phone.into();
        let slot_count = slot_count.clamp(1, MAX_SLOTS);
        let slots = (1..=slot_count)
            .map(|slot| {
                let proxy = proxies.draw().unwrap_or_else(dr_chatwire::proxy::direct);
                Session::new(phone.clone(), slot, proxy, now)
            })
            .collect();
        Self {
            phone,
            slots,
            active_slot: 0,
            last_connected_at: None,
            last_revival_round: None,
            known_contacts: HashSet::new(),
            alerted_no_slots: false,
        }
    }

    // ── views ────────────────────────────────────────────────────────

    pub fn status(&self) -> GroupStatus {
        if self.slots.iter().any(Session::is_connected) {
            GroupStatus::Connected
        } else {
            GroupStatus::Disconnected
        }
    }

    pub fn active_slot(&self) -> u8 {
        self.active_slot
    }

    pub fn slot_statuses(&self) -> Vec<SlotStatus> {
        self.slots
            .iter()
            .map(|s| s.status().to_slot_status())
            .collect()
    }

    pub fn all_logged_out(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.status() == SessionStatus::LoggedOut)
    }

    /// Past the revival window with nothing connected: flagged for a human.
    pub fn needs_manual_attention(&self, now: DateTime<Utc>) -> bool {
        if self.status() == GroupStatus::Connected {
            return false;
        }
        match self.last_connected_at {
            Some(at) => now.signed_duration_since(at) > Duration::hours(REVIVAL_WINDOW_HOURS),
            None => false,
        }
    }

    /// The earliest temp-block expiry among blocked slots, for status
    /// reporting.
    pub fn temp_blocked_until(&self) -> Option<DateTime<Utc>> {
        self.slots
            .iter()
            .filter_map(Session::temp_blocked_until)
            .min()
    }

    // ── failover ─────────────────────────────────────────────────────

    /// Re-select the active slot. Sticky: a Connected active slot is never
    /// abandoned. Otherwise the lowest-numbered Connected slot wins, with
    /// stable slots preferred over unstable ones.
    pub fn refresh_active(&mut self, now: DateTime<Utc>) {
        if self.active_slot > 0 {
            if let Some(s) = self.slots.get(self.active_slot as usize - 1) {
                if s.is_connected() {
                    return;
                }
            }
        }

        let pick = self
            .slots
            .iter()
            .find(|s| s.is_connected() && !s.unstable(now))
            .or_else(|| self.slots.iter().find(|s| s.is_connected()))
            .map(|s| s.slot)
            .unwrap_or(0);

        if pick != self.active_slot {
            if pick == 0 {
                if !self.alerted_no_slots {
                    tracing::error!(phone = %self.phone, "all sessions down, entering revival");
                    self.alerted_no_slots = true;
                }
            } else {
                tracing::info!(phone = %self.phone, slot = pick, "active slot changed");
                self.alerted_no_slots = false;
            }
            self.active_slot = pick;
        }
    }

    // ── event handling ───────────────────────────────────────────────

    /// Apply one session event. Called by the identity driver as it drains
    /// the per-identity mailbox.
    pub fn handle_event(&mut self, slot: u8, event: SessionEvent, now: DateTime<Utc>) {
        let Some(idx) = self.slot_index(slot) else {
            return;
        };
        match event {
            SessionEvent::Connected => {
                self.last_connected_at = Some(now);
                self.refresh_active(now);
            }
            SessionEvent::Disconnected => {
                self.slots[idx].note_disconnected(now);
                if self.slots[idx].unstable(now) {
                    tracing::warn!(phone = %self.phone, slot, "session unstable (>10 disconnects today)");
                }
                self.refresh_active(now);
            }
            SessionEvent::LoggedOut => {
                self.slots[idx].note_logged_out();
                self.refresh_active(now);
            }
            SessionEvent::KeepAliveTimeout => {
                if self.slots[idx].note_keepalive_missed() {
                    tracing::warn!(phone = %self.phone, slot, "keep-alive lost, transport reset");
                    self.refresh_active(now);
                }
            }
            SessionEvent::KeepAliveRestored => {
                if self.slots[idx].note_keepalive_ok(now) {
                    tracing::debug!(phone = %self.phone, slot, "keep-alive restored");
                }
                self.last_connected_at = Some(now);
            }
            SessionEvent::TempBlocked { expires } => {
                tracing::warn!(phone = %self.phone, slot, until = %expires, "temp block reported");
            }
            SessionEvent::Receipt { kind, message_id } => {
                tracing::debug!(phone = %self.phone, slot, ?kind, message_id = %message_id, "receipt");
                self.slots[idx].last_activity = now;
            }
            SessionEvent::ContactSeen { handle } => {
                self.known_contacts.insert(handle);
            }
        }
    }

    // ── sending ──────────────────────────────────────────────────────

    /// Send through the active session. On a temporary failure the failing
    /// session is marked Disconnected and the send retries once on the
    /// next Connected slot. While every usable slot is temp-blocked, only
    /// recipients with an existing chat edge are accepted.
    pub async fn send_active(
        &mut self,
        recipient: &str,
        body: &str,
        classifier: &BlockClassifier,
        now: DateTime<Utc>,
    ) -> std::result::Result<String, (SendErrorKind, String)> {
        let mut retried = false;
        loop {
            let idx = self.sending_slot_index(recipient)?;

            let outcome = {
                let conn = match self.slots[idx].connection() {
                    Some(c) => c,
                    None => {
                        self.slots[idx].note_disconnected(now);
                        self.refresh_active(now);
                        return Err((
                            SendErrorKind::NotConnected,
                            "session lost its transport".to_owned(),
                        ));
                    }
                };
                conn.send(recipient, body).await
            };

            match outcome {
                Ok(SendOutcome::Delivered { message_id }) => {
                    self.slots[idx].last_activity = now;
                    self.last_connected_at = Some(now);
                    self.known_contacts.insert(recipient.to_owned());
                    return Ok(message_id);
                }
                Ok(SendOutcome::RateLimited) => {
                    return Err((
                        SendErrorKind::RateLimited,
                        "service refused for velocity".to_owned(),
                    ));
                }
                Ok(SendOutcome::Refused { reason }) => match classifier.classify(&reason) {
                    BlockVerdict::Permanent => {
                        return Err((SendErrorKind::PermanentlyBlocked, reason));
                    }
                    BlockVerdict::Temporary => {
                        let until = self.slots[idx].set_temp_blocked(now);
                        self.refresh_active(now);
                        return Err((
                            SendErrorKind::TempBlocked,
                            format!("{reason} (until {until})"),
                        ));
                    }
                    BlockVerdict::None => {
                        self.slots[idx].note_disconnected(now);
                        self.refresh_active(now);
                        if retried || self.active_slot == 0 {
                            return Err((SendErrorKind::TransportError, reason));
                        }
                        retried = true;
                    }
                },
                Err(e) => {
                    self.slots[idx].note_disconnected(now);
                    self.refresh_active(now);
                    if retried || self.active_slot == 0 {
                        return Err((SendErrorKind::TransportError, e.to_string()));
                    }
                    retried = true;
                }
            }
        }
    }

    /// Slot to send through: the active Connected slot, or — when nothing
    /// is Connected — a temp-blocked slot for recipients we already chat
    /// with.
    fn sending_slot_index(
        &self,
        recipient: &str,
    ) -> std::result::Result<usize, (SendErrorKind, String)> {
        if self.active_slot > 0 {
            return Ok(self.active_slot as usize - 1);
        }
        let blocked = self
            .slots
            .iter()
            .position(|s| s.status() == SessionStatus::TempBlocked && s.connection().is_some());
        match blocked {
            Some(idx) if self.known_contacts.contains(recipient) => Ok(idx),
            Some(_) => Err((
                SendErrorKind::TempBlocked,
                "temporarily restricted; new recipients refused".to_owned(),
            )),
            None => Err((
                SendErrorKind::NotConnected,
                "no connected session".to_owned(),
            )),
        }
    }

    // ── keep-alive ───────────────────────────────────────────────────

    /// Ping every connected session. Sessions that exhaust the keep-alive
    /// tolerance get a transport reset and are picked up by revival.
    pub async fn keepalive_tick(&mut self, now: DateTime<Utc>) {
        let mut any_ok = false;
        for idx in 0..self.slots.len() {
            if !self.slots[idx].is_connected() {
                continue;
            }
            let ok = match self.slots[idx].connection() {
                Some(conn) => conn.ping().await.is_ok(),
                None => false,
            };
            if ok {
                self.slots[idx].note_keepalive_ok(now);
                any_ok = true;
            } else if self.slots[idx].note_keepalive_missed() {
                tracing::warn!(phone = %self.phone, slot = self.slots[idx].slot, "keep-alive lost, transport reset");
            }
        }
        if any_ok {
            self.last_connected_at = Some(now);
        }
        self.refresh_active(now);
    }

    // ── temp-block probing ───────────────────────────────────────────

    /// Hourly probe of temp-blocked slots.
    pub async fn probe_temp_blocked(&mut self, now: DateTime<Utc>) {
        for idx in 0..self.slots.len() {
            if self.slots[idx].probe_temp_block(now).await {
                self.last_connected_at = Some(now);
            }
        }
        self.refresh_active(now);
    }

    // ── revival ──────────────────────────────────────────────────────

    /// Whether a redial round is due at `now`.
    pub fn revival_round_due(&self, now: DateTime<Utc>) -> bool {
        let needs_redial = self.slots.iter().any(|s| s.redial_due(now));
        if !needs_redial {
            return false;
        }
        let cadence = match self.status() {
            GroupStatus::Connected => Duration::minutes(PARTIAL_REDIAL_MINUTES),
            GroupStatus::Disconnected => {
                let elapsed = self
                    .last_connected_at
                    .map(|at| now.signed_duration_since(at))
                    .unwrap_or_else(Duration::zero);
                revival_interval(elapsed)
            }
        };
        match self.last_revival_round {
            Some(at) => now.signed_duration_since(at) >= cadence,
            None => true,
        }
    }

    /// Redial every due slot once. Returns the event streams of newly
    /// connected sessions so the caller can pump them into the mailbox.
    pub async fn revival_round(
        &mut self,
        dialer: &dyn Dialer,
        proxies: &dyn ProxyPool,
        credential: &Credential,
        now: DateTime<Utc>,
    ) -> Vec<(u8, WireEventStream)> {
        self.last_revival_round = Some(now);
        let mut streams = Vec::new();

        for idx in 0..self.slots.len() {
            if !self.slots[idx].redial_due(now) {
                continue;
            }
            // Sticky proxy: reuse while still pooled, otherwise draw fresh.
            if !proxies.contains(&self.slots[idx].proxy.id) {
                if let Some(fresh) = proxies.draw() {
                    tracing::info!(
                        phone = %self.phone,
                        slot = self.slots[idx].slot,
                        proxy = %fresh.id,
                        "sticky proxy left the pool, drew a fresh one"
                    );
                    self.slots[idx].proxy = fresh;
                }
            }
            match self.slots[idx].dial(dialer, Some(credential), now).await {
                Ok(SessionDial::Connected(stream)) => {
                    self.last_connected_at = Some(now);
                    streams.push((self.slots[idx].slot, stream));
                }
                Ok(SessionDial::Pairing(_)) => {
                    // Credential no longer honored: pairing required again.
                    self.slots[idx].note_logged_out();
                }
                Err(_) => {}
            }
        }
        self.refresh_active(now);
        streams
    }

    /// The active session's live connection, for humanizer traffic.
    pub fn active_connection(&self) -> Option<&dyn dr_chatwire::Connection> {
        if self.active_slot == 0 {
            return None;
        }
        self.slots
            .get(self.active_slot as usize - 1)
            .and_then(|s| s.connection())
    }

    /// Dial one specific slot (the pairing flow drives slot 1 directly).
    pub async fn dial_slot(
        &mut self,
        slot: u8,
        dialer: &dyn Dialer,
        credential: Option<&Credential>,
        now: DateTime<Utc>,
    ) -> dr_domain::Result<SessionDial> {
        let Some(idx) = self.slot_index(slot) else {
            return Err(dr_domain::Error::Other(format!("no slot {slot}")));
        };
        let result = self.slots[idx].dial(dialer, credential, now).await;
        if matches!(result, Ok(SessionDial::Connected(_))) {
            self.last_connected_at = Some(now);
        }
        self.refresh_active(now);
        result
    }

    /// Close every session (graceful shutdown or operator disconnect).
    pub async fn disconnect_all(&mut self, now: DateTime<Utc>) {
        for idx in 0..self.slots.len() {
            self.slots[idx].close().await;
        }
        self.refresh_active(now);
    }

    fn slot_index(&self, slot: u8) -> Option<usize> {
        self.slots.iter().position(|s| s.slot == slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dr_chatwire::fake::FakeService;
    use dr_chatwire::StaticProxyPool;

    async fn connected_group(svc: &FakeService, phone: &str, slots: u8) -> SessionGroup {
        let pool = StaticProxyPool::new(vec![]);
        let cred = svc.pair(phone);
        let now = Utc::now();
        let mut group = SessionGroup::new(phone, slots, &pool, now);
        let streams = group.revival_round(svc, &pool, &cred, now).await;
        assert_eq!(streams.len(), slots as usize);
        group
    }

    #[test]
    fn revival_cadence_table() {
        assert_eq!(revival_interval(Duration::minutes(1)), Duration::minutes(5));
        assert_eq!(
            revival_interval(Duration::minutes(119)),
            Duration::minutes(5)
        );
        assert_eq!(revival_interval(Duration::hours(2)), Duration::minutes(15));
        assert_eq!(
            revival_interval(Duration::hours(11)),
            Duration::minutes(15)
        );
        assert_eq!(revival_interval(Duration::hours(12)), Duration::minutes(30));
        assert_eq!(
            revival_interval(Duration::hours(47)),
            Duration::minutes(30)
        );
        assert_eq!(revival_interval(Duration::hours(48)), Duration::hours(1));
        assert_eq!(revival_interval(Duration::days(30)), Duration::hours(1));
    }

    #[tokio::test]
    async fn active_slot_is_lowest_connected() {
        let svc = FakeService::new();
        let group = connected_group(&svc, "+1555", 2).await;
        assert_eq!(group.active_slot(), 1);
        assert_eq!(group.status(), GroupStatus::Connected);
    }

    #[tokio::test]
    async fn failover_to_next_slot_on_disconnect() {
        let svc = FakeService::new();
        let mut group = connected_group(&svc, "+1555", 2).await;
        let now = Utc::now();

        group.handle_event(1, SessionEvent::Disconnected, now);
        assert_eq!(group.active_slot(), 2);
        assert_eq!(group.status(), GroupStatus::Connected, "aggregate stays connected");

        // Sends keep working through slot 2.
        let out = group
            .send_active("+1666", "hi", &BlockClassifier::default(), now)
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn stickiness_never_switches_away_from_connected_active() {
        let svc = FakeService::new();
        let mut group = connected_group(&svc, "+1555", 3).await;
        let now = Utc::now();

        group.handle_event(1, SessionEvent::Disconnected, now);
        assert_eq!(group.active_slot(), 2);

        // Slot 1 comes back: active stays 2.
        group.handle_event(1, SessionEvent::Connected, now);
        let pool = StaticProxyPool::new(vec![]);
        let cred = svc.pair("+1555");
        let _ = group.revival_round(&svc, &pool, &cred, now).await;
        assert_eq!(group.active_slot(), 2, "sticky active slot");
    }

    #[tokio::test]
    async fn all_slots_down_sets_active_zero() {
        let svc = FakeService::new();
        let mut group = connected_group(&svc, "+1555", 2).await;
        let now = Utc::now();

        group.handle_event(1, SessionEvent::Disconnected, now);
        group.handle_event(2, SessionEvent::Disconnected, now);
        assert_eq!(group.active_slot(), 0);
        assert_eq!(group.status(), GroupStatus::Disconnected);

        let err = group
            .send_active("+1666", "hi", &BlockClassifier::default(), now)
            .await
            .unwrap_err();
        assert_eq!(err.0, SendErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn temporary_send_failure_fails_over_and_retries_once() {
        let svc = FakeService::new();
        let mut group = connected_group(&svc, "+1555", 2).await;
        let now = Utc::now();

        // First send refused with an unclassified reason: slot 1 is marked
        // disconnected and the retry goes through slot 2.
        svc.script_sends(
            "+1555",
            vec![SendOutcome::Refused {
                reason: "io glitch".into(),
            }],
        );
        let out = group
            .send_active("+1666", "hi", &BlockClassifier::default(), now)
            .await;
        assert!(out.is_ok(), "retry on next slot should deliver");
        assert_eq!(group.active_slot(), 2);
    }

    #[tokio::test]
    async fn temp_block_refuses_new_recipients_but_allows_known() {
        let svc = FakeService::new();
        let mut group = connected_group(&svc, "+1555", 1).await;
        let now = Utc::now();

        // Establish chat history with +1666.
        assert!(group
            .send_active("+1666", "hi", &BlockClassifier::default(), now)
            .await
            .is_ok());

        // Service temp-blocks the sender.
        svc.script_sends(
            "+1555",
            vec![SendOutcome::Refused {
                reason: "try again later".into(),
            }],
        );
        let err = group
            .send_active("+1777", "hi", &BlockClassifier::default(), now)
            .await
            .unwrap_err();
        assert_eq!(err.0, SendErrorKind::TempBlocked);
        assert_eq!(group.active_slot(), 0);

        // Known recipient still goes through the blocked session.
        assert!(group
            .send_active("+1666", "hello again", &BlockClassifier::default(), now)
            .await
            .is_ok());

        // Unknown recipient is refused while blocked.
        let err = group
            .send_active("+1888", "hi", &BlockClassifier::default(), now)
            .await
            .unwrap_err();
        assert_eq!(err.0, SendErrorKind::TempBlocked);
    }

    #[tokio::test]
    async fn permanent_refusal_is_reported_as_blocked() {
        let svc = FakeService::new();
        let mut group = connected_group(&svc, "+1555", 1).await;
        svc.script_sends(
            "+1555",
            vec![SendOutcome::Refused {
                reason: "account suspended".into(),
            }],
        );
        let err = group
            .send_active("+1666", "hi", &BlockClassifier::default(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.0, SendErrorKind::PermanentlyBlocked);
    }

    #[tokio::test]
    async fn revival_rounds_follow_cadence() {
        let svc = FakeService::new();
        let pool = StaticProxyPool::new(vec![]);
        let cred = svc.pair("+1555");
        let t0 = Utc::now();
        let mut group = SessionGroup::new("+1555", 1, &pool, t0);

        // Simulate a connected-then-lost group.
        svc.fail_next_dials(100);
        let _ = group.revival_round(&svc, &pool, &cred, t0).await;
        group.last_connected_at = Some(t0);

        // Inside the first 2 h: 5-minute cadence (slot backoff allowing).
        assert!(!group.revival_round_due(t0 + Duration::minutes(3)));
        assert!(group.revival_round_due(t0 + Duration::minutes(6)));

        // Deep into the window the cadence stretches to 30 minutes.
        group.last_revival_round = Some(t0 + Duration::hours(13));
        group.slots[0].note_disconnected(t0);
        assert!(!group.revival_round_due(t0 + Duration::hours(13) + Duration::minutes(20)));
        assert!(group.revival_round_due(t0 + Duration::hours(13) + Duration::minutes(30)));

        // Past 48 h: hourly, and the group is flagged for a human.
        group.last_revival_round = Some(t0 + Duration::hours(49));
        assert!(!group.revival_round_due(t0 + Duration::hours(49) + Duration::minutes(45)));
        assert!(group.revival_round_due(t0 + Duration::hours(50)));
        assert!(group.needs_manual_attention(t0 + Duration::hours(49)));
    }

    #[tokio::test]
    async fn revival_reconnects_and_restores_active() {
        let svc = FakeService::new();
        let pool = StaticProxyPool::new(vec![]);
        let cred = svc.pair("+1555");
        let now = Utc::now();
        let mut group = connected_group(&svc, "+1555", 2).await;

        group.handle_event(1, SessionEvent::Disconnected, now);
        group.handle_event(2, SessionEvent::Disconnected, now);
        assert_eq!(group.status(), GroupStatus::Disconnected);

        let streams = group.revival_round(&svc, &pool, &cred, now).await;
        assert_eq!(streams.len(), 2);
        assert_eq!(group.status(), GroupStatus::Connected);
        assert_eq!(group.active_slot(), 1);
    }
}
