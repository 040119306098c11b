//! One session: a single attempt to keep a persistent connection to the
//! chat service on behalf of an identity.
//!
//! A session never heals itself past LoggedOut and never retries on its
//! own: on disconnection it signals its group and waits to be redialed.
//! Slot numbers are fixed for the session's lifetime.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use dr_chatwire::{
    Connection, Credential, DialOutcome, Dialer, PairingMaterial, ProxyEndpoint, ReceiptKind,
    WireEventStream,
};
use dr_domain::Result;
use dr_protocol::SlotStatus;

/// Default length of a service-imposed temporary block.
pub const TEMP_BLOCK_HOURS: i64 = 5;

/// Disconnects per UTC day after which a session is considered unstable.
pub const UNSTABLE_DISCONNECTS_PER_DAY: u32 = 10;

/// Keep-alive failures tolerated before a forced transport reset.
pub const MAX_KEEPALIVE_FAILURES: u32 = 3;

/// Cap on a single slot's redial backoff.
const MAX_REDIAL_BACKOFF_SECS: i64 = 1_800;
const BASE_REDIAL_BACKOFF_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Disconnected,
    TempBlocked,
    LoggedOut,
}

impl SessionStatus {
    pub fn to_slot_status(self) -> SlotStatus {
        match self {
            SessionStatus::Connecting => SlotStatus::Connecting,
            SessionStatus::Connected => SlotStatus::Connected,
            SessionStatus::Disconnected => SlotStatus::Disconnected,
            SessionStatus::TempBlocked => SlotStatus::TempBlocked,
            SessionStatus::LoggedOut => SlotStatus::LoggedOut,
        }
    }
}

/// Session-level events consumed by the group. Wire events are translated
/// into these by the per-session pump; the session also emits them from its
/// own state transitions.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    LoggedOut,
    KeepAliveTimeout,
    KeepAliveRestored,
    TempBlocked { expires: DateTime<Utc> },
    Receipt { kind: ReceiptKind, message_id: String },
    /// A peer initiated or continued a chat; the group learns contacts
    /// from these.
    ContactSeen { handle: String },
}

/// Result of a dial attempt at the session level.
pub enum SessionDial {
    Connected(WireEventStream),
    Pairing(PairingMaterial),
}

pub struct Session {
    pub phone: String,
    pub slot: u8,
    status: SessionStatus,
    conn: Option<Box<dyn Connection>>,
    /// Proxy drawn at creation; sticky for the session's lifetime.
    pub proxy: ProxyEndpoint,

    temp_blocked_until: Option<DateTime<Utc>>,
    keepalive_failures: u32,
    disconnects_today: u32,
    disconnect_day: NaiveDate,
    consecutive_dial_failures: u32,
    next_redial_at: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(phone: impl Into<String>, slot: u8, proxy: ProxyEndpoint, now: DateTime<Utc>) -> Self {
        debug_assert!((1..=4).contains(&slot));
        Self {
            phone: phone.into(),
            slot,
            status: SessionStatus::Connecting,
            conn: None,
            proxy,
            temp_blocked_until: None,
            keepalive_failures: 0,
            disconnects_today: 0,
            disconnect_day: now.date_naive(),
            consecutive_dial_failures: 0,
            next_redial_at: None,
            last_activity: now,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    /// More than ten disconnects within the current UTC day.
    pub fn unstable(&self, now: DateTime<Utc>) -> bool {
        self.disconnect_day == now.date_naive()
            && self.disconnects_today > UNSTABLE_DISCONNECTS_PER_DAY
    }

    pub fn temp_blocked_until(&self) -> Option<DateTime<Utc>> {
        self.temp_blocked_until
    }

    /// Whether a redial may be attempted now, honoring this slot's backoff.
    pub fn redial_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            SessionStatus::Connecting | SessionStatus::Disconnected
        ) && self.next_redial_at.map_or(true, |at| now >= at)
    }

    /// Dial the service. On success the session holds the connection and
    /// returns the wire event stream for the caller to pump into the group
    /// mailbox. Transport errors back off exponentially, capped at 30 min.
    pub async fn dial(
        &mut self,
        dialer: &dyn Dialer,
        credential: Option<&Credential>,
        now: DateTime<Utc>,
    ) -> Result<SessionDial> {
        self.status = SessionStatus::Connecting;
        match dialer.dial(&self.phone, credential, &self.proxy).await {
            Ok(DialOutcome::Connected(conn)) => {
                let events = conn.subscribe();
                self.conn = Some(conn);
                self.status = SessionStatus::Connected;
                self.keepalive_failures = 0;
                self.consecutive_dial_failures = 0;
                self.next_redial_at = None;
                self.last_activity = now;
                tracing::info!(phone = %self.phone, slot = self.slot, "session connected");
                match events {
                    Some(stream) => Ok(SessionDial::Connected(stream)),
                    None => Ok(SessionDial::Connected(tokio::sync::mpsc::channel(1).1)),
                }
            }
            Ok(DialOutcome::Pairing(material)) => {
                self.status = SessionStatus::Disconnected;
                Ok(SessionDial::Pairing(material))
            }
            Err(e) => {
                self.consecutive_dial_failures += 1;
                let backoff = (BASE_REDIAL_BACKOFF_SECS
                    << self.consecutive_dial_failures.min(16).saturating_sub(1))
                .min(MAX_REDIAL_BACKOFF_SECS);
                self.next_redial_at = Some(now + Duration::seconds(backoff));
                self.status = SessionStatus::Disconnected;
                tracing::warn!(
                    phone = %self.phone,
                    slot = self.slot,
                    failures = self.consecutive_dial_failures,
                    backoff_secs = backoff,
                    error = %e,
                    "dial failed"
                );
                Err(e)
            }
        }
    }

    pub fn connection(&self) -> Option<&dyn Connection> {
        self.conn.as_deref()
    }

    /// Record a disconnect: drop the transport, bump the per-day counter.
    pub fn note_disconnected(&mut self, now: DateTime<Utc>) {
        if self.status == SessionStatus::LoggedOut {
            return;
        }
        let today = now.date_naive();
        if self.disconnect_day != today {
            self.disconnect_day = today;
            self.disconnects_today = 0;
        }
        self.disconnects_today += 1;
        self.conn = None;
        self.status = SessionStatus::Disconnected;
        self.keepalive_failures = 0;
    }

    /// Terminal until new credential material arrives.
    pub fn note_logged_out(&mut self) {
        self.conn = None;
        self.status = SessionStatus::LoggedOut;
        tracing::warn!(phone = %self.phone, slot = self.slot, "session logged out");
    }

    /// One missed keep-alive. Past the tolerance the session forces a
    /// transport reset and returns to Connecting; the caller redials.
    pub fn note_keepalive_missed(&mut self) -> bool {
        self.keepalive_failures += 1;
        if self.keepalive_failures > MAX_KEEPALIVE_FAILURES {
            self.conn = None;
            self.status = SessionStatus::Connecting;
            self.keepalive_failures = 0;
            true
        } else {
            false
        }
    }

    pub fn note_keepalive_ok(&mut self, now: DateTime<Utc>) -> bool {
        let restored = self.keepalive_failures > 0;
        self.keepalive_failures = 0;
        self.last_activity = now;
        restored
    }

    /// Enter the temporarily-blocked state. The connection is kept so the
    /// session can answer existing chats and emit presence.
    pub fn set_temp_blocked(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let until = now + Duration::hours(TEMP_BLOCK_HOURS);
        self.temp_blocked_until = Some(until);
        self.status = SessionStatus::TempBlocked;
        tracing::warn!(phone = %self.phone, slot = self.slot, until = %until, "session temp-blocked");
        until
    }

    /// Hourly probe while temp-blocked: a lightweight presence ping. On
    /// success past the block window the session returns to Connected.
    pub async fn probe_temp_block(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != SessionStatus::TempBlocked {
            return false;
        }
        let expired = self.temp_blocked_until.map_or(true, |until| now >= until);
        let Some(conn) = self.conn.as_deref() else {
            // Transport gone while blocked; the revival path owns redialing.
            if expired {
                self.temp_blocked_until = None;
                self.status = SessionStatus::Disconnected;
            }
            return false;
        };
        match conn.ping().await {
            Ok(()) if expired => {
                self.temp_blocked_until = None;
                self.status = SessionStatus::Connected;
                self.last_activity = now;
                tracing::info!(phone = %self.phone, slot = self.slot, "temp block lifted");
                true
            }
            Ok(()) => false,
            Err(_) => {
                self.note_disconnected(now);
                false
            }
        }
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        if self.status != SessionStatus::LoggedOut {
            self.status = SessionStatus::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dr_chatwire::fake::FakeService;
    use dr_chatwire::proxy::direct;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn dial_unpaired_returns_pairing_material() {
        let svc = FakeService::new();
        let mut s = Session::new("+1555", 1, direct(), now());
        match s.dial(&svc, None, now()).await.unwrap() {
            SessionDial::Pairing(_) => {}
            SessionDial::Connected(_) => panic!("expected pairing"),
        }
        assert_eq!(s.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn dial_failure_backs_off_exponentially() {
        let svc = FakeService::new();
        svc.pair("+1555");
        svc.fail_next_dials(3);
        let t0 = now();
        let mut s = Session::new("+1555", 1, direct(), t0);

        assert!(s.dial(&svc, None, t0).await.is_err());
        assert!(!s.redial_due(t0 + Duration::seconds(30)));
        assert!(s.redial_due(t0 + Duration::seconds(60)));

        assert!(s.dial(&svc, None, t0).await.is_err());
        assert!(!s.redial_due(t0 + Duration::seconds(100)));
        assert!(s.redial_due(t0 + Duration::seconds(120)));

        // Backoff never exceeds 30 minutes.
        svc.fail_next_dials(10);
        for _ in 0..10 {
            assert!(s.dial(&svc, None, t0).await.is_err());
        }
        assert!(!s.redial_due(t0 + Duration::seconds(1_799)));
        assert!(s.redial_due(t0 + Duration::seconds(1_800)));
    }

    #[tokio::test]
    async fn keepalive_reset_after_tolerance() {
        let svc = FakeService::new();
        svc.pair("+1555");
        let mut s = Session::new("+1555", 1, direct(), now());
        let _ = s.dial(&svc, None, now()).await.unwrap();
        assert!(s.is_connected());

        assert!(!s.note_keepalive_missed());
        assert!(!s.note_keepalive_missed());
        assert!(!s.note_keepalive_missed());
        // Fourth miss crosses the > 3 threshold: transport reset.
        assert!(s.note_keepalive_missed());
        assert_eq!(s.status(), SessionStatus::Connecting);
        assert!(s.connection().is_none());
    }

    #[test]
    fn unstable_after_ten_disconnects_in_a_day() {
        let t = now();
        let mut s = Session::new("+1555", 1, direct(), t);
        for _ in 0..10 {
            s.note_disconnected(t);
        }
        assert!(!s.unstable(t), "exactly ten is still stable");
        s.note_disconnected(t);
        assert!(s.unstable(t));

        // Counter is per-UTC-day.
        let tomorrow = t + Duration::days(1);
        s.note_disconnected(tomorrow);
        assert!(!s.unstable(tomorrow));
    }

    #[tokio::test]
    async fn temp_block_probe_lifts_only_after_expiry() {
        let svc = FakeService::new();
        svc.pair("+1555");
        let t0 = now();
        let mut s = Session::new("+1555", 1, direct(), t0);
        let _ = s.dial(&svc, None, t0).await.unwrap();

        let until = s.set_temp_blocked(t0);
        assert_eq!(until, t0 + Duration::hours(5));
        assert_eq!(s.status(), SessionStatus::TempBlocked);

        // Probe an hour in: ping succeeds but the window is still open.
        assert!(!s.probe_temp_block(t0 + Duration::hours(1)).await);
        assert_eq!(s.status(), SessionStatus::TempBlocked);

        // Past the window the probe restores Connected.
        assert!(s.probe_temp_block(t0 + Duration::hours(5)).await);
        assert_eq!(s.status(), SessionStatus::Connected);
    }

    #[test]
    fn logged_out_is_terminal_for_disconnect_noting() {
        let t = now();
        let mut s = Session::new("+1555", 1, direct(), t);
        s.note_logged_out();
        s.note_disconnected(t);
        assert_eq!(s.status(), SessionStatus::LoggedOut);
    }
}
