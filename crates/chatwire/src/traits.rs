//! Core capability traits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use dr_domain::Result;

use crate::proxy::ProxyEndpoint;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credential
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque persisted credential blob for one identity, plus the sticky proxy
/// assignment recorded at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub phone: String,
    /// Vendor-specific auth state; the core never looks inside.
    pub blob: serde_json::Value,
    /// Proxy assigned when the session was first created. Reused across
    /// reconnects while still in the pool.
    #[serde(default)]
    pub proxy_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dialer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pairing material returned when the service wants a new device linked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingMaterial {
    #[serde(default)]
    pub qr_code: Option<String>,
    #[serde(default)]
    pub pairing_code: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Result of a dial attempt. Timeouts and transport failures surface as
/// `Err`; a healthy dial either connects or asks for pairing.
pub enum DialOutcome {
    Connected(Box<dyn Connection>),
    Pairing(PairingMaterial),
}

/// Opens authenticated connections to the chat service.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// Dial on behalf of `phone`. With a credential this resumes the
    /// existing device; without one the service answers with pairing
    /// material. May suspend up to 180 s waiting for pairing.
    async fn dial(
        &self,
        phone: &str,
        credential: Option<&Credential>,
        proxy: &ProxyEndpoint,
    ) -> Result<DialOutcome>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a single send on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { message_id: String },
    /// The service refused for velocity reasons; retry after the window.
    RateLimited,
    /// The service refused with a reason text. The session classifies it
    /// into a temporary or permanent restriction.
    Refused { reason: String },
}

/// Delivery receipt kinds reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    ServerAck,
    Delivered,
    Read,
}

/// Events pushed by the service over a live connection.
#[derive(Debug, Clone)]
pub enum WireEvent {
    /// Periodic keep-alive answered by the service.
    KeepAliveOk,
    /// A keep-alive went unanswered.
    KeepAliveMissed,
    /// Transport dropped.
    Disconnected { reason: String },
    /// Service de-authorized this device.
    LoggedOut,
    Receipt { kind: ReceiptKind, message_id: String },
    /// Inbound message; carries the peer handle so sessions learn contacts.
    Incoming { from: String },
}

pub type WireEventStream = mpsc::Receiver<WireEvent>;

/// One live authenticated connection.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, recipient: &str, body: &str) -> Result<SendOutcome>;

    /// Lightweight presence ping; used by keep-alive and temp-block probes.
    async fn ping(&self) -> Result<()>;

    async fn set_presence(&self, online: bool) -> Result<()>;

    async fn typing(&self, recipient: &str, active: bool) -> Result<()>;

    async fn mark_read(&self, chat: &str) -> Result<()>;

    async fn view_status(&self, contact: &str) -> Result<()>;

    /// Short silent voice note; humanizer traffic only.
    async fn send_voice_note(&self, recipient: &str, seconds: u32) -> Result<SendOutcome>;

    /// Contacts known to this device, for humanizer target selection.
    fn contacts(&self) -> Vec<String>;

    /// Take the event mailbox. Yields `None` after the first call.
    fn subscribe(&self) -> Option<WireEventStream>;

    /// Updated credential blob to persist, when the service rotated keys.
    fn export_credential(&self) -> Option<Credential>;

    async fn close(&self);
}
