//! End-to-end worker runtime tests against the in-memory fake service.

use std::sync::Arc;

use chrono::Utc;

use dr_chatwire::fake::FakeService;
use dr_chatwire::{Dialer, StaticProxyPool};
use dr_domain::config::PacingConfig;
use dr_protocol::{ConnectStatus, SendErrorKind, SlotStatus};
use dr_store::{AccountStore, SessionFiles, SessionMeta};
use dr_worker::humanizer::PauseRange;
use dr_worker::runtime::{RuntimeConfig, WorkerRuntime};

const SENDER: &str = "+15550001111";
const NEVER_PAIRED: &str = "+15550009999";
const RECIPIENT: &str = "+15550002222";

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        pacing: PacingConfig {
            min_delay_ms: Some(0),
            max_delay_ms: Some(0),
            ..PacingConfig::default()
        },
        slot_count: 2,
        warmup_external: Vec::new(),
        pause: PauseRange { min_ms: 0, max_ms: 0 },
    }
}

struct Harness {
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    svc: FakeService,
    files: Arc<SessionFiles>,
    accounts: Arc<AccountStore>,
    runtime: Arc<WorkerRuntime>,
}

/// Build a runtime with one previously-logged-in identity and one
/// never-paired identity on disk.
async fn harness() -> Harness {
    let sessions_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let now = Utc::now();

    let svc = FakeService::new();
    let files = Arc::new(SessionFiles::new(sessions_dir.path()).unwrap());
    let accounts = Arc::new(AccountStore::new(state_dir.path()).unwrap());

    // Previously logged in: credential + sidecar on disk.
    let cred = svc.pair(SENDER);
    files.save_credential(&cred).unwrap();
    files.save_meta(SENDER, &SessionMeta::new(now)).unwrap();

    // Known but never paired: sidecar only.
    files
        .save_meta(NEVER_PAIRED, &SessionMeta::new(now))
        .unwrap();

    let dialer: Arc<dyn Dialer> = Arc::new(svc.clone());
    let runtime = WorkerRuntime::new(
        dialer,
        Arc::new(StaticProxyPool::new(vec![])),
        files.clone(),
        accounts.clone(),
        test_config(),
    );
    runtime.startup(now).await.unwrap();

    Harness {
        _dirs: (sessions_dir, state_dir),
        svc,
        files,
        accounts,
        runtime,
    }
}

#[tokio::test]
async fn startup_reconnects_only_previously_logged_in() {
    let h = harness().await;
    let snapshot = h.runtime.accounts_snapshot(Utc::now()).await;
    assert_eq!(snapshot.len(), 2);

    let sender = snapshot.iter().find(|a| a.phone == SENDER).unwrap();
    assert!(sender.logged_in);
    assert!(sender.connected);
    assert_eq!(sender.slots.len(), 2);
    assert!(sender.slots.iter().all(|s| *s == SlotStatus::Connected));

    let idle = snapshot.iter().find(|a| a.phone == NEVER_PAIRED).unwrap();
    assert!(!idle.logged_in);
    assert!(!idle.connected);
}

#[tokio::test]
async fn send_happy_path_updates_counters() {
    let h = harness().await;

    let resp = h.runtime.send(SENDER, RECIPIENT, "Hi there").await.unwrap();
    assert!(resp.success);
    assert!(!resp.message_id.is_empty());

    let delivered = h.svc.delivered_by(SENDER);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].to, RECIPIENT);

    let account = h.accounts.get(SENDER).unwrap();
    assert_eq!(account.sent_today, 1);
    assert_eq!(account.successful, 1);
    assert!(account.last_message_at.is_some());

    let snapshot = h.runtime.accounts_snapshot(Utc::now()).await;
    let sender = snapshot.iter().find(|a| a.phone == SENDER).unwrap();
    assert_eq!(sender.messages_today, 1);
    assert_eq!(sender.messages_last_minute, 1);
}

#[tokio::test]
async fn send_rejects_malformed_recipients_and_unknown_senders() {
    let h = harness().await;

    let err = h.runtime.send(SENDER, "bogus", "hi").await.unwrap_err();
    assert_eq!(err.0, SendErrorKind::InvalidRecipient);

    let err = h
        .runtime
        .send("+15559998888", RECIPIENT, "hi")
        .await
        .unwrap_err();
    assert_eq!(err.0, SendErrorKind::NotLoggedIn);

    // The never-paired identity is loaded but cannot send.
    let err = h
        .runtime
        .send(NEVER_PAIRED, RECIPIENT, "hi")
        .await
        .unwrap_err();
    assert_eq!(err.0, SendErrorKind::NotLoggedIn);
}

#[tokio::test]
async fn second_send_within_cooldown_is_denied() {
    let h = harness().await;
    h.runtime.send(SENDER, RECIPIENT, "one").await.unwrap();
    let err = h.runtime.send(SENDER, RECIPIENT, "two").await.unwrap_err();
    assert_eq!(err.0, SendErrorKind::RateLimited);
    assert!(err.1.contains("cooldown"));
}

#[tokio::test]
async fn permanent_refusal_marks_account_blocked() {
    let h = harness().await;
    h.svc.script_sends(
        SENDER,
        vec![dr_chatwire::SendOutcome::Refused {
            reason: "account suspended for unusual activity".into(),
        }],
    );

    let err = h.runtime.send(SENDER, RECIPIENT, "hi").await.unwrap_err();
    assert_eq!(err.0, SendErrorKind::PermanentlyBlocked);

    let account = h.accounts.get(SENDER).unwrap();
    assert!(account.blocked_at.is_some());

    let snapshot = h.runtime.accounts_snapshot(Utc::now()).await;
    let sender = snapshot.iter().find(|a| a.phone == SENDER).unwrap();
    assert!(sender.blocked_until.is_some());
}

#[tokio::test]
async fn pairing_flow_mints_credential_on_success() {
    let h = harness().await;
    let newcomer = "+15550003333";

    // Not yet paired with the service: connect hands back a QR code.
    let resp = h.runtime.connect(newcomer).await.unwrap();
    assert_eq!(resp.status, ConnectStatus::QrCode);
    assert!(resp.qr_code.is_some());
    assert!(h.files.load_credential(newcomer).unwrap().is_none());

    // Operator scans the code; the service now accepts the device.
    h.svc.pair(newcomer);
    let resp = h.runtime.connect(newcomer).await.unwrap();
    assert_eq!(resp.status, ConnectStatus::Connected);
    assert!(h.files.load_credential(newcomer).unwrap().is_some());

    // Connecting again short-circuits.
    let resp = h.runtime.connect(newcomer).await.unwrap();
    assert_eq!(resp.status, ConnectStatus::Connected);
}

#[tokio::test]
async fn cleanup_purges_idle_unpaired_identities() {
    let h = harness().await;
    assert_eq!(h.runtime.phones().len(), 2);

    let purged = h.runtime.cleanup_idle().await;
    assert_eq!(purged, 1);
    assert_eq!(h.runtime.phones(), vec![SENDER.to_owned()]);

    // The sidecar survives: identities are never destroyed on disk.
    assert!(h.files.load_meta(NEVER_PAIRED).unwrap().is_some());
}

#[tokio::test]
async fn warmup_sweep_sends_greetings_within_budget() {
    let h = harness().await;

    h.runtime.warmup_sweep(Utc::now()).await;
    let delivered = h.svc.delivered_by(SENDER);
    assert_eq!(delivered.len(), 1, "one warmup greeting per sweep");
    // Newborn warmup stays co-located: the only other identity on this
    // worker is the valid target.
    assert_eq!(delivered[0].to, NEVER_PAIRED);

    let meta = h.files.load_meta(SENDER).unwrap().unwrap();
    assert!(meta.last_warmup_sent.is_some());
    assert!(!meta.warmup_complete);
}
