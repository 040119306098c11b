use std::sync::Arc;

use dr_domain::config::Config;
use dr_store::{CampaignStore, ChatHistoryStore, QueueStore};

use crate::workers::WorkerPool;

/// Shared application state passed to all Master API handlers and the
/// queue processor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<QueueStore>,
    pub history: Arc<ChatHistoryStore>,
    pub campaigns: Arc<CampaignStore>,
    pub pool: Arc<WorkerPool>,
    /// SHA-256 of the ingress API key (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_key_hash: Option<Vec<u8>>,
}
