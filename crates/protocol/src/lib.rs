//! Master ↔ Worker wire protocol: HTTP+JSON request/response types.
//!
//! Workers expose a small RPC surface (`/accounts`, `/send`,
//! `/accounts/connect`, `/accounts/disconnect`, `/health`); the Master is the
//! only caller. Every type here is a plain serde DTO — no behavior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dr_domain::Stage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Accounts snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `GET {worker}/accounts` response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountsResponse {
    pub accounts: Vec<AccountStatus>,
}

/// One identity as reported by its owning Worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatus {
    pub phone: String,
    pub logged_in: bool,
    pub connected: bool,
    pub stage: Stage,
    /// Whole days since first pairing; drives sender scoring.
    pub age_days: i64,
    pub messages_today: u32,
    pub messages_last_minute: u32,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    pub total_messages_sent: u64,
    pub successful_messages: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,
    /// Status of slots 1..=4, in slot order.
    pub slots: Vec<SlotStatus>,
    /// Set after 48 hours of failed revival; surfaced on dashboards.
    #[serde(default)]
    pub needs_manual_attention: bool,
}

/// Connection state of one session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Connecting,
    Connected,
    Disconnected,
    TempBlocked,
    LoggedOut,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `POST {worker}/send` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub from_phone: String,
    pub to_phone: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `POST {worker}/send` success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// `POST {worker}/send` failure response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendError {
    pub error: String,
    pub kind: SendErrorKind,
}

/// Failure taxonomy carried across the RPC boundary. Kinds, not types:
/// the Master decides retry/requeue/block purely from this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorKind {
    NotLoggedIn,
    NotConnected,
    RateLimited,
    TempBlocked,
    PermanentlyBlocked,
    TransportError,
    InvalidRecipient,
}

impl SendErrorKind {
    /// Whether the record should go back to pending for another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            SendErrorKind::NotConnected
                | SendErrorKind::RateLimited
                | SendErrorKind::TempBlocked
                | SendErrorKind::TransportError
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connect / disconnect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `POST {worker}/accounts/connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub phone: String,
}

/// `POST {worker}/accounts/connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub status: ConnectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStatus {
    Connected,
    QrCode,
    PairingCode,
    Pending,
}

/// `POST {worker}/accounts/disconnect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub phone: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_kind_wire_names() {
        let kinds = [
            (SendErrorKind::NotLoggedIn, "not_logged_in"),
            (SendErrorKind::NotConnected, "not_connected"),
            (SendErrorKind::RateLimited, "rate_limited"),
            (SendErrorKind::TempBlocked, "temp_blocked"),
            (SendErrorKind::PermanentlyBlocked, "permanently_blocked"),
            (SendErrorKind::TransportError, "transport_error"),
            (SendErrorKind::InvalidRecipient, "invalid_recipient"),
        ];
        for (kind, wire) in kinds {
            assert_eq!(
                serde_json::to_string(&kind).unwrap(),
                format!("\"{wire}\"")
            );
        }
    }

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(SendErrorKind::TransportError.is_retryable());
        assert!(SendErrorKind::RateLimited.is_retryable());
        assert!(SendErrorKind::TempBlocked.is_retryable());
        assert!(SendErrorKind::NotConnected.is_retryable());
        assert!(!SendErrorKind::PermanentlyBlocked.is_retryable());
        assert!(!SendErrorKind::InvalidRecipient.is_retryable());
        assert!(!SendErrorKind::NotLoggedIn.is_retryable());
    }

    #[test]
    fn connect_response_omits_absent_material() {
        let resp = ConnectResponse {
            status: ConnectStatus::Connected,
            qr_code: None,
            pairing_code: None,
            device_id: Some("dev-1".into()),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "connected");
        assert!(json.get("qr_code").is_none());
        assert_eq!(json["device_id"], "dev-1");
    }
}
