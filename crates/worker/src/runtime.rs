//! The worker runtime: owns every identity assigned to this process and
//! the per-identity {SessionGroup, Pacer, Humanizer} trio.
//!
//! Concurrency model: each identity has one `IdentityCell` whose inner
//! state sits behind a `tokio::sync::Mutex` — the per-identity critical
//! section. All pacer decisions, counter updates, and sends happen under
//! that lock, which is what totally orders one identity's sends. The
//! cross-identity map takes a reader-writer lock; writers (provisioning,
//! cleanup) are rare.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use dr_chatwire::{
    BlockClassifier, Credential, Dialer, ProxyPool, WireEvent, WireEventStream,
};
use dr_domain::config::PacingConfig;
use dr_domain::{Error, Result};
use dr_protocol::{
    AccountStatus, ConnectResponse, ConnectStatus, SendErrorKind, SendResponse,
};
use dr_store::{AccountStore, SessionFiles, SessionMeta};

use crate::group::{GroupStatus, SessionGroup};
use crate::humanizer::{self, PauseRange};
use crate::pacer::{Admission, Pacer};
use crate::session::{SessionDial, SessionEvent};
use crate::variator;
use crate::warmup::{self, WarmupLedger};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub pacing: PacingConfig,
    /// Redundant sessions per identity (1..=4).
    pub slot_count: u8,
    /// External warmup targets for Toddler+ identities.
    pub warmup_external: Vec<String>,
    /// Humanizer in-action pause.
    pub pause: PauseRange,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pacing: PacingConfig::default(),
            slot_count: 2,
            warmup_external: Vec::new(),
            pause: PauseRange::default(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity cell
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct IdentityCell {
    pub phone: String,
    inner: Mutex<CellInner>,
    mailbox_tx: mpsc::Sender<(u8, SessionEvent)>,
}

struct CellInner {
    group: SessionGroup,
    pacer: Pacer,
    meta: SessionMeta,
    warmup: WarmupLedger,
    credential: Option<Credential>,
    /// Taken by the identity driver at spawn time.
    mailbox_rx: Option<mpsc::Receiver<(u8, SessionEvent)>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WorkerRuntime {
    dialer: Arc<dyn Dialer>,
    proxies: Arc<dyn ProxyPool>,
    classifier: BlockClassifier,
    files: Arc<SessionFiles>,
    accounts: Arc<AccountStore>,
    cfg: RuntimeConfig,
    cells: RwLock<HashMap<String, Arc<IdentityCell>>>,
    cancel: CancellationToken,
}

impl WorkerRuntime {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        proxies: Arc<dyn ProxyPool>,
        files: Arc<SessionFiles>,
        accounts: Arc<AccountStore>,
        cfg: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            dialer,
            proxies,
            classifier: BlockClassifier::default(),
            files,
            accounts,
            cfg,
            cells: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    // ── startup ──────────────────────────────────────────────────────

    /// Scan the session directory, rebuild groups, and reconnect only the
    /// identities that were previously logged in. Never-paired identities
    /// are loaded but left idle until re-paired.
    pub async fn startup(self: &Arc<Self>, now: DateTime<Utc>) -> Result<()> {
        let stored = self.files.scan(now)?;
        let mut restored = 0usize;
        let mut idle = 0usize;

        for identity in stored {
            let logged_in = identity.credential.is_some();
            let cell = self.insert_cell(
                &identity.phone,
                identity.credential,
                identity.meta,
                now,
            );
            if logged_in {
                let account = self.accounts.get_or_create(&identity.phone, now);
                {
                    let mut inner = cell.inner.lock().await;
                    inner.pacer.restore(
                        account.sent_today,
                        account.sent_this_hour,
                        account.total_sent,
                        account.last_message_at,
                    );
                }
                // First reconnect attempt happens right away; the driver
                // takes over the cadence from here.
                self.revival_pass(&cell).await;
                restored += 1;
            } else {
                idle += 1;
            }
            self.clone().spawn_identity_driver(cell);
        }

        tracing::info!(restored, idle, "worker runtime started");
        Ok(())
    }

    fn insert_cell(
        self: &Arc<Self>,
        phone: &str,
        credential: Option<Credential>,
        meta: SessionMeta,
        now: DateTime<Utc>,
    ) -> Arc<IdentityCell> {
        let (tx, rx) = mpsc::channel(256);
        let group = SessionGroup::new(phone, self.cfg.slot_count, self.proxies.as_ref(), now);
        let mut pacer = Pacer::new(self.cfg.pacing.clone(), meta.created_at, now);
        if let Some(account) = self.accounts.get(phone) {
            pacer.restore(
                account.sent_today,
                account.sent_this_hour,
                account.total_sent,
                account.last_message_at,
            );
        }
        let cell = Arc::new(IdentityCell {
            phone: phone.to_owned(),
            inner: Mutex::new(CellInner {
                group,
                pacer,
                meta,
                warmup: WarmupLedger::new(now),
                credential,
                mailbox_rx: Some(rx),
            }),
            mailbox_tx: tx,
        });
        self.cells.write().insert(phone.to_owned(), cell.clone());
        cell
    }

    fn cell(&self, phone: &str) -> Option<Arc<IdentityCell>> {
        self.cells.read().get(phone).cloned()
    }

    pub fn phones(&self) -> Vec<String> {
        let mut phones: Vec<String> = self.cells.read().keys().cloned().collect();
        phones.sort();
        phones
    }

    // ── identity driver ──────────────────────────────────────────────

    /// Per-identity background task: drains the event mailbox, pings
    /// keep-alives, probes temp blocks hourly, runs revival rounds, and
    /// wakes the humanizer.
    fn spawn_identity_driver(self: Arc<Self>, cell: Arc<IdentityCell>) {
        tokio::spawn(async move {
            let mut mailbox = match cell.inner.lock().await.mailbox_rx.take() {
                Some(rx) => rx,
                None => return, // driver already running
            };

            let mut keepalive = tokio::time::interval(std::time::Duration::from_secs(30));
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut probe = tokio::time::interval(std::time::Duration::from_secs(3_600));
            probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut revive = tokio::time::interval(std::time::Duration::from_secs(60));
            revive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut humanize = Box::pin(tokio::time::sleep(std::time::Duration::from_millis(
                humanizer::next_wake_ms(&mut rand::thread_rng()),
            )));

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,

                    Some((slot, event)) = mailbox.recv() => {
                        let mut inner = cell.inner.lock().await;
                        inner.group.handle_event(slot, event, Utc::now());
                    }

                    _ = keepalive.tick() => {
                        let mut inner = cell.inner.lock().await;
                        inner.group.keepalive_tick(Utc::now()).await;
                    }

                    _ = probe.tick() => {
                        let mut inner = cell.inner.lock().await;
                        inner.group.probe_temp_blocked(Utc::now()).await;
                    }

                    _ = revive.tick() => {
                        self.revival_pass(&cell).await;
                    }

                    _ = &mut humanize => {
                        self.humanize_once(&cell).await;
                        humanize = Box::pin(tokio::time::sleep(
                            std::time::Duration::from_millis(
                                humanizer::next_wake_ms(&mut rand::thread_rng()),
                            ),
                        ));
                    }
                }
            }
        });
    }

    async fn revival_pass(self: &Arc<Self>, cell: &Arc<IdentityCell>) {
        let now = Utc::now();
        let streams = {
            let mut inner = cell.inner.lock().await;
            let Some(credential) = inner.credential.clone() else {
                return;
            };
            if inner.group.all_logged_out() || !inner.group.revival_round_due(now) {
                return;
            }
            inner
                .group
                .revival_round(
                    self.dialer.as_ref(),
                    self.proxies.as_ref(),
                    &credential,
                    now,
                )
                .await
        };
        for (slot, stream) in streams {
            spawn_event_pump(slot, stream, cell.mailbox_tx.clone());
        }
    }

    async fn humanize_once(self: &Arc<Self>, cell: &Arc<IdentityCell>) {
        let peers: Vec<String> = self
            .phones()
            .into_iter()
            .filter(|p| p != &cell.phone)
            .collect();
        let now = Utc::now();
        let mut inner = cell.inner.lock().await;
        if inner.group.status() != GroupStatus::Connected {
            return;
        }
        let stage = inner.pacer.stage(now);
        let (_, activities_left) = inner.warmup.remaining(stage, now);
        if activities_left == 0 {
            return;
        }
        let action = humanizer::pick_action(&mut rand::thread_rng());
        let pause = self.cfg.pause;
        if let Some(conn) = inner.group.active_connection() {
            if let Err(e) = humanizer::perform(action, conn, &peers, pause).await {
                tracing::debug!(phone = %cell.phone, error = %e, "humanizer action failed");
                return;
            }
        }
        inner.warmup.note_activity(now);
    }

    // ── send ─────────────────────────────────────────────────────────

    /// Send one message on behalf of `from`. The identity lock is held for
    /// the whole operation — pacer admission, the computed delay, the wire
    /// send — so two sends by one identity can never overlap.
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        message: &str,
    ) -> std::result::Result<SendResponse, (SendErrorKind, String)> {
        if !valid_handle(to) {
            return Err((
                SendErrorKind::InvalidRecipient,
                format!("malformed recipient {to:?}"),
            ));
        }
        let Some(cell) = self.cell(from) else {
            return Err((
                SendErrorKind::NotLoggedIn,
                format!("{from} is not managed by this worker"),
            ));
        };

        let mut inner = cell.inner.lock().await;
        if inner.credential.is_none() {
            return Err((SendErrorKind::NotLoggedIn, format!("{from} has no credential")));
        }

        let now = Utc::now();
        let delay_ms = match inner.pacer.admit(now) {
            Admission::Allowed { delay_ms } => delay_ms,
            Admission::Denied { reason } => {
                return Err((
                    SendErrorKind::RateLimited,
                    format!("pacer denied: {}", reason.as_str()),
                ));
            }
        };
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }

        let body = variator::vary(message);
        let sent_at = Utc::now();
        match inner
            .group
            .send_active(to, &body, &self.classifier, sent_at)
            .await
        {
            Ok(message_id) => {
                inner.pacer.record(sent_at);
                let (today, minute, hour) = (
                    inner.pacer.sent_today(sent_at),
                    inner.pacer.sent_this_minute(sent_at),
                    inner.pacer.sent_this_hour(sent_at),
                );
                self.accounts.get_or_create(from, sent_at);
                self.accounts.update(from, |rec| {
                    rec.sent_today = today;
                    rec.sent_this_minute = minute;
                    rec.sent_this_hour = hour;
                    rec.total_sent += 1;
                    rec.successful += 1;
                    rec.last_message_at = Some(sent_at);
                });
                Ok(SendResponse {
                    success: true,
                    message_id,
                    timestamp: sent_at,
                })
            }
            Err((kind, message)) => {
                self.accounts.get_or_create(from, sent_at);
                self.accounts.update(from, |rec| rec.total_sent += 1);
                if kind == SendErrorKind::PermanentlyBlocked {
                    self.accounts.mark_blocked(from, sent_at);
                }
                Err((kind, message))
            }
        }
    }

    // ── status ───────────────────────────────────────────────────────

    /// Snapshot of every managed identity, for the Master's refresh RPC.
    pub async fn accounts_snapshot(&self, now: DateTime<Utc>) -> Vec<AccountStatus> {
        let cells: Vec<Arc<IdentityCell>> = self.cells.read().values().cloned().collect();
        let mut out = Vec::with_capacity(cells.len());
        for cell in cells {
            let mut inner = cell.inner.lock().await;
            let account = self.accounts.get(&cell.phone);
            let logged_in = inner.credential.is_some() && !inner.group.all_logged_out();
            let connected = inner.group.status() == GroupStatus::Connected;
            let stage = inner.pacer.stage(now);
            // Permanent blocks dominate; otherwise surface the earliest
            // temp-block expiry among the slots.
            let blocked_until = account
                .as_ref()
                .and_then(|a| a.blocked_at)
                .map(|at| at + ChronoDuration::hours(48))
                .filter(|until| *until > now)
                .or_else(|| {
                    if connected {
                        None
                    } else {
                        inner.group.temp_blocked_until()
                    }
                });
            let age_days = account
                .as_ref()
                .map(|a| a.age_days(now))
                .unwrap_or_else(|| {
                    now.signed_duration_since(inner.meta.created_at).num_days()
                });
            out.push(AccountStatus {
                phone: cell.phone.clone(),
                logged_in,
                connected,
                stage,
                age_days,
                messages_today: inner.pacer.sent_today(now),
                messages_last_minute: inner.pacer.sent_this_minute(now),
                last_message_at: inner.pacer.last_send_at(),
                total_messages_sent: inner.pacer.total_sent(),
                successful_messages: account.map(|a| a.successful).unwrap_or_default(),
                blocked_until,
                slots: inner.group.slot_statuses(),
                needs_manual_attention: inner.group.needs_manual_attention(now),
            });
        }
        out.sort_by(|a, b| a.phone.cmp(&b.phone));
        out
    }

    // ── pairing ──────────────────────────────────────────────────────

    /// Connect (or pair) an identity. Short-circuits when a session is
    /// already connected; otherwise dials slot 1 and either finishes with
    /// a live session or returns pairing material for the operator.
    pub async fn connect(self: &Arc<Self>, phone: &str) -> Result<ConnectResponse> {
        if !valid_handle(phone) {
            return Err(Error::InvalidRecipient(phone.to_owned()));
        }
        let now = Utc::now();
        let cell = match self.cell(phone) {
            Some(cell) => cell,
            None => {
                let cell =
                    self.insert_cell(phone, None, SessionMeta::new(now), now);
                self.clone().spawn_identity_driver(cell.clone());
                cell
            }
        };

        let mut inner = cell.inner.lock().await;
        if inner.group.status() == GroupStatus::Connected {
            return Ok(ConnectResponse {
                status: ConnectStatus::Connected,
                qr_code: None,
                pairing_code: None,
                device_id: None,
            });
        }

        let credential = inner.credential.clone();
        match inner
            .group
            .dial_slot(1, self.dialer.as_ref(), credential.as_ref(), now)
            .await
        {
            Ok(SessionDial::Connected(stream)) => {
                spawn_event_pump(1, stream, cell.mailbox_tx.clone());
                // First successful pairing mints the durable credential.
                if inner.credential.is_none() {
                    let credential = inner
                        .group
                        .active_connection()
                        .and_then(|c| c.export_credential())
                        .unwrap_or_else(|| Credential {
                            phone: phone.to_owned(),
                            blob: serde_json::Value::Null,
                            proxy_id: None,
                            created_at: now,
                        });
                    self.files.save_credential(&credential)?;
                    inner.credential = Some(credential);
                    self.accounts.get_or_create(phone, now);
                    self.files.save_meta(phone, &inner.meta)?;
                }
                Ok(ConnectResponse {
                    status: ConnectStatus::Connected,
                    qr_code: None,
                    pairing_code: None,
                    device_id: None,
                })
            }
            Ok(SessionDial::Pairing(material)) => Ok(ConnectResponse {
                status: if material.qr_code.is_some() {
                    ConnectStatus::QrCode
                } else if material.pairing_code.is_some() {
                    ConnectStatus::PairingCode
                } else {
                    ConnectStatus::Pending
                },
                qr_code: material.qr_code,
                pairing_code: material.pairing_code,
                device_id: material.device_id,
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn disconnect(&self, phone: &str) -> Result<()> {
        let cell = self
            .cell(phone)
            .ok_or_else(|| Error::Other(format!("unknown identity {phone}")))?;
        let mut inner = cell.inner.lock().await;
        inner.group.disconnect_all(Utc::now()).await;
        Ok(())
    }

    /// Drop idle never-paired identities from memory. Their on-disk meta
    /// sidecars stay; identities are never destroyed by the core.
    pub async fn cleanup_idle(&self) -> usize {
        let cells: Vec<Arc<IdentityCell>> = self.cells.read().values().cloned().collect();
        let mut purge = Vec::new();
        for cell in cells {
            let inner = cell.inner.lock().await;
            if inner.credential.is_none() && inner.group.status() == GroupStatus::Disconnected {
                purge.push(cell.phone.clone());
            }
        }
        let mut cells = self.cells.write();
        for phone in &purge {
            cells.remove(phone);
        }
        if !purge.is_empty() {
            tracing::info!(purged = purge.len(), "idle unpaired identities dropped");
        }
        purge.len()
    }

    // ── warmup sweep ─────────────────────────────────────────────────

    /// One pass of the internal-warmup loop: every owned identity with
    /// remaining budget sends one greeting to a sibling (or itself).
    pub async fn warmup_sweep(&self, now: DateTime<Utc>) {
        let phones = self.phones();
        let cells: Vec<Arc<IdentityCell>> = self.cells.read().values().cloned().collect();

        for cell in cells {
            let mut inner = cell.inner.lock().await;
            if inner.credential.is_none() || inner.group.status() != GroupStatus::Connected {
                continue;
            }
            let stage = inner.pacer.stage(now);
            let (messages_left, _) = inner.warmup.remaining(stage, now);
            if messages_left == 0 {
                continue;
            }
            // Warmup traffic still honors the pacer's quotas.
            if !matches!(inner.pacer.admit(now), Admission::Allowed { .. }) {
                continue;
            }

            let (target, greeting) = {
                let mut rng = rand::thread_rng();
                (
                    warmup::pick_target(
                        &cell.phone,
                        stage,
                        &phones,
                        &self.cfg.warmup_external,
                        &mut rng,
                    ),
                    warmup::pick_greeting(&mut rng),
                )
            };
            let body = variator::vary(greeting);

            match inner
                .group
                .send_active(&target, &body, &self.classifier, now)
                .await
            {
                Ok(_) => {
                    inner.pacer.record(now);
                    inner.warmup.note_message(now);
                    inner.meta.last_warmup_sent = Some(now);
                    inner.meta.warmup_stage = stage;
                    inner.meta.warmup_complete = stage == dr_domain::Stage::Veteran;
                    if let Err(e) = self.files.save_meta(&cell.phone, &inner.meta) {
                        tracing::warn!(phone = %cell.phone, error = %e, "meta sidecar write failed");
                    }
                    tracing::debug!(phone = %cell.phone, target = %target, "warmup message sent");
                }
                Err((kind, message)) => {
                    tracing::debug!(phone = %cell.phone, ?kind, %message, "warmup send failed");
                }
            }
        }
    }

    // ── shutdown ─────────────────────────────────────────────────────

    /// Graceful shutdown: stop the drivers, then disconnect sessions in
    /// parallel.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let cells: Vec<Arc<IdentityCell>> = self.cells.read().values().cloned().collect();
        let mut tasks = Vec::new();
        for cell in cells {
            tasks.push(tokio::spawn(async move {
                let mut inner = cell.inner.lock().await;
                inner.group.disconnect_all(Utc::now()).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.accounts.flush() {
            tracing::warn!(error = %e, "account store flush failed on shutdown");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Forward wire events into the group mailbox as session events. When the
/// stream ends (transport dropped without a word) a synthetic Disconnected
/// is delivered so the group notices.
fn spawn_event_pump(
    slot: u8,
    mut stream: WireEventStream,
    tx: mpsc::Sender<(u8, SessionEvent)>,
) {
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            let mapped = match event {
                WireEvent::KeepAliveOk => SessionEvent::KeepAliveRestored,
                WireEvent::KeepAliveMissed => SessionEvent::KeepAliveTimeout,
                WireEvent::Disconnected { reason } => {
                    tracing::debug!(slot, reason = %reason, "wire disconnect");
                    SessionEvent::Disconnected
                }
                WireEvent::LoggedOut => SessionEvent::LoggedOut,
                WireEvent::Receipt { kind, message_id } => {
                    SessionEvent::Receipt { kind, message_id }
                }
                WireEvent::Incoming { from } => SessionEvent::ContactSeen { handle: from },
            };
            let terminal = matches!(
                mapped,
                SessionEvent::Disconnected | SessionEvent::LoggedOut
            );
            if tx.send((slot, mapped)).await.is_err() || terminal {
                return;
            }
        }
        let _ = tx.send((slot, SessionEvent::Disconnected)).await;
    });
}

/// A plausible E.164 handle: optional `+`, 7–15 digits, nothing else
/// besides separators.
pub fn valid_handle(handle: &str) -> bool {
    let digits: String = handle
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    let allowed = handle
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')'));
    allowed && (7..=15).contains(&digits.len())
}
