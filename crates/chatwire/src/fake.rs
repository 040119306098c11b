//! In-memory fake chat service for tests.
//!
//! `FakeService` implements [`Dialer`] and hands out [`FakeConnection`]s that
//! record every send and follow per-sender scripted outcomes. Tests can
//! inject wire events (disconnects, logouts, receipts) into any live
//! connection through the service handle.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use dr_domain::{Error, Result};

use crate::proxy::ProxyEndpoint;
use crate::traits::{
    Connection, Credential, DialOutcome, Dialer, PairingMaterial, SendOutcome, WireEvent,
    WireEventStream,
};

/// One message accepted by the fake service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    pub from: String,
    pub to: String,
    pub body: String,
    pub voice_note: bool,
}

#[derive(Default)]
struct FakeState {
    /// Phones the service will connect without fresh pairing.
    paired: Mutex<HashSet<String>>,
    /// Scripted send outcomes per sender; exhausted scripts deliver.
    scripts: Mutex<HashMap<String, VecDeque<SendOutcome>>>,
    /// Dials to fail with a timeout before succeeding again.
    failing_dials: Mutex<u32>,
    /// Event injectors for live connections, newest last.
    event_taps: Mutex<HashMap<String, Vec<mpsc::Sender<WireEvent>>>>,
    delivered: Mutex<Vec<SentRecord>>,
    next_id: AtomicU64,
}

/// Scriptable in-memory chat service.
#[derive(Clone, Default)]
pub struct FakeService {
    state: Arc<FakeState>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `phone` as already paired: dials with or without a credential
    /// connect immediately.
    pub fn pair(&self, phone: &str) -> Credential {
        self.state.paired.lock().insert(phone.to_owned());
        Credential {
            phone: phone.to_owned(),
            blob: serde_json::json!({ "device": format!("fake-{phone}") }),
            proxy_id: None,
            created_at: Utc::now(),
        }
    }

    /// Queue outcomes for the next sends from `phone`, in order.
    pub fn script_sends(&self, phone: &str, outcomes: Vec<SendOutcome>) {
        self.state
            .scripts
            .lock()
            .entry(phone.to_owned())
            .or_default()
            .extend(outcomes);
    }

    /// Fail the next `n` dial attempts with a timeout.
    pub fn fail_next_dials(&self, n: u32) {
        *self.state.failing_dials.lock() = n;
    }

    /// Push a wire event into every live connection of `phone`.
    pub fn emit(&self, phone: &str, event: WireEvent) {
        let taps = self.state.event_taps.lock();
        if let Some(senders) = taps.get(phone) {
            for tx in senders {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    /// Everything delivered so far, in order.
    pub fn delivered(&self) -> Vec<SentRecord> {
        self.state.delivered.lock().clone()
    }

    /// Messages delivered by `phone`.
    pub fn delivered_by(&self, phone: &str) -> Vec<SentRecord> {
        self.state
            .delivered
            .lock()
            .iter()
            .filter(|r| r.from == phone)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl Dialer for FakeService {
    async fn dial(
        &self,
        phone: &str,
        credential: Option<&Credential>,
        _proxy: &ProxyEndpoint,
    ) -> Result<DialOutcome> {
        {
            let mut failing = self.state.failing_dials.lock();
            if *failing > 0 {
                *failing -= 1;
                return Err(Error::Timeout(format!("dial {phone}")));
            }
        }

        let paired = credential.is_some() || self.state.paired.lock().contains(phone);
        if !paired {
            return Ok(DialOutcome::Pairing(PairingMaterial {
                qr_code: Some(format!("fake-qr-{phone}")),
                pairing_code: None,
                device_id: None,
            }));
        }

        let (tx, rx) = mpsc::channel(64);
        self.state
            .event_taps
            .lock()
            .entry(phone.to_owned())
            .or_default()
            .push(tx.clone());

        Ok(DialOutcome::Connected(Box::new(FakeConnection {
            phone: phone.to_owned(),
            service: self.state.clone(),
            events: Mutex::new(Some(rx)),
            contacts: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        })))
    }
}

/// A live connection handed out by [`FakeService`].
pub struct FakeConnection {
    phone: String,
    service: Arc<FakeState>,
    events: Mutex<Option<WireEventStream>>,
    contacts: Mutex<Vec<String>>,
    open: AtomicBool,
}

impl FakeConnection {
    fn next_outcome(&self) -> SendOutcome {
        let mut scripts = self.service.scripts.lock();
        if let Some(queue) = scripts.get_mut(&self.phone) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        let n = self.service.next_id.fetch_add(1, Ordering::Relaxed);
        SendOutcome::Delivered {
            message_id: format!("msg-{n}"),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::Chat {
                handle: self.phone.clone(),
                message: "connection closed".to_owned(),
            })
        }
    }

    fn record(&self, to: &str, body: &str, voice_note: bool) {
        self.service.delivered.lock().push(SentRecord {
            from: self.phone.clone(),
            to: to.to_owned(),
            body: body.to_owned(),
            voice_note,
        });
        let mut contacts = self.contacts.lock();
        if !contacts.iter().any(|c| c == to) {
            contacts.push(to.to_owned());
        }
    }
}

#[async_trait::async_trait]
impl Connection for FakeConnection {
    async fn send(&self, recipient: &str, body: &str) -> Result<SendOutcome> {
        self.ensure_open()?;
        let outcome = self.next_outcome();
        if matches!(outcome, SendOutcome::Delivered { .. }) {
            self.record(recipient, body, false);
        }
        Ok(outcome)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn set_presence(&self, _online: bool) -> Result<()> {
        self.ensure_open()
    }

    async fn typing(&self, _recipient: &str, _active: bool) -> Result<()> {
        self.ensure_open()
    }

    async fn mark_read(&self, _chat: &str) -> Result<()> {
        self.ensure_open()
    }

    async fn view_status(&self, _contact: &str) -> Result<()> {
        self.ensure_open()
    }

    async fn send_voice_note(&self, recipient: &str, seconds: u32) -> Result<SendOutcome> {
        self.ensure_open()?;
        let outcome = self.next_outcome();
        if matches!(outcome, SendOutcome::Delivered { .. }) {
            self.record(recipient, &format!("[voice {seconds}s]"), true);
        }
        Ok(outcome)
    }

    fn contacts(&self) -> Vec<String> {
        self.contacts.lock().clone()
    }

    fn subscribe(&self) -> Option<WireEventStream> {
        self.events.lock().take()
    }

    fn export_credential(&self) -> Option<Credential> {
        None
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::direct;

    #[tokio::test]
    async fn unpaired_dial_yields_pairing_material() {
        let svc = FakeService::new();
        match svc.dial("+15550001111", None, &direct()).await.unwrap() {
            DialOutcome::Pairing(mat) => assert!(mat.qr_code.unwrap().contains("+15550001111")),
            DialOutcome::Connected(_) => panic!("expected pairing"),
        }
    }

    #[tokio::test]
    async fn paired_dial_connects_and_sends() {
        let svc = FakeService::new();
        let cred = svc.pair("+15550001111");
        let conn = match svc
            .dial("+15550001111", Some(&cred), &direct())
            .await
            .unwrap()
        {
            DialOutcome::Connected(c) => c,
            DialOutcome::Pairing(_) => panic!("expected connection"),
        };

        let outcome = conn.send("+15550002222", "hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Delivered { .. }));
        assert_eq!(svc.delivered().len(), 1);
        assert_eq!(conn.contacts(), vec!["+15550002222".to_owned()]);
    }

    #[tokio::test]
    async fn scripted_refusal_then_delivery() {
        let svc = FakeService::new();
        let cred = svc.pair("+1555");
        let conn = match svc.dial("+1555", Some(&cred), &direct()).await.unwrap() {
            DialOutcome::Connected(c) => c,
            _ => unreachable!(),
        };
        svc.script_sends(
            "+1555",
            vec![SendOutcome::Refused {
                reason: "try again later".into(),
            }],
        );

        let first = conn.send("+1666", "a").await.unwrap();
        assert!(matches!(first, SendOutcome::Refused { .. }));
        let second = conn.send("+1666", "b").await.unwrap();
        assert!(matches!(second, SendOutcome::Delivered { .. }));
        assert_eq!(svc.delivered().len(), 1, "refused send not recorded");
    }

    #[tokio::test]
    async fn injected_events_reach_subscriber() {
        let svc = FakeService::new();
        let cred = svc.pair("+1555");
        let conn = match svc.dial("+1555", Some(&cred), &direct()).await.unwrap() {
            DialOutcome::Connected(c) => c,
            _ => unreachable!(),
        };
        let mut events = conn.subscribe().unwrap();
        svc.emit(
            "+1555",
            WireEvent::Disconnected {
                reason: "tcp reset".into(),
            },
        );
        match events.recv().await.unwrap() {
            WireEvent::Disconnected { reason } => assert_eq!(reason, "tcp reset"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(conn.subscribe().is_none(), "mailbox is single-take");
    }

    #[tokio::test]
    async fn failing_dials_time_out() {
        let svc = FakeService::new();
        svc.pair("+1555");
        svc.fail_next_dials(1);
        assert!(svc.dial("+1555", None, &direct()).await.is_err());
        assert!(svc.dial("+1555", None, &direct()).await.is_ok());
    }
}
