//! Queue and campaign records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dispatch priority of a queued message. Orders high before normal before
/// low when the processor reads candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Lifecycle of a queue record. The only legal path is
/// `Pending → Processing → (Pending → Processing)* → (Sent | Failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Sent | QueueStatus::Failed)
    }
}

/// Maximum number of dispatch attempts before a record is marked failed.
pub const MAX_RETRIES: u32 = 3;

/// One queued (recipient, template) pair belonging to a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient: String,
    #[serde(default)]
    pub recipient_name: Option<String>,
    /// Message template, possibly carrying `{a|b}` variation tags.
    pub template: String,
    #[serde(default)]
    pub priority: Priority,
    pub status: QueueStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub assigned_sender: Option<String>,
    /// Enqueued without a free sender; waits for capacity to open.
    #[serde(default)]
    pub deferred: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    pub fn new(
        campaign_id: Uuid,
        recipient: impl Into<String>,
        template: impl Into<String>,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            recipient: recipient.into(),
            recipient_name: None,
            template: template.into(),
            priority,
            status: QueueStatus::Pending,
            retry_count: 0,
            assigned_sender: None,
            deferred: false,
            created_at: now,
            processed_at: None,
        }
    }
}

/// Aggregate status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A batch of queued messages tracked as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub total: u32,
    #[serde(default)]
    pub sent: u32,
    #[serde(default)]
    pub failed: u32,
    pub status: CampaignStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(id: Uuid, total: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            total,
            sent: 0,
            failed: 0,
            status: CampaignStatus::Pending,
            started_at: now,
            completed_at: None,
        }
    }
}
