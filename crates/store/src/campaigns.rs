//! Campaign bookkeeping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use dr_domain::{Campaign, CampaignStatus, Error, Result};

/// Campaign store backed by `campaigns.json`.
pub struct CampaignStore {
    path: PathBuf,
    campaigns: RwLock<HashMap<Uuid, Campaign>>,
}

impl CampaignStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("campaigns.json");

        let campaigns = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            campaigns: RwLock::new(campaigns),
        })
    }

    pub fn create(&self, total: u32, now: DateTime<Utc>) -> Campaign {
        let campaign = Campaign::new(Uuid::new_v4(), total, now);
        self.campaigns
            .write()
            .insert(campaign.id, campaign.clone());
        campaign
    }

    pub fn get(&self, id: &Uuid) -> Option<Campaign> {
        self.campaigns.read().get(id).cloned()
    }

    /// Apply `f` to the campaign, if present.
    pub fn update(&self, id: &Uuid, f: impl FnOnce(&mut Campaign)) {
        if let Some(c) = self.campaigns.write().get_mut(id) {
            f(c);
        }
    }

    /// Reconcile a campaign against current queue counts and mark it
    /// terminal when nothing non-terminal remains. Returns `true` when the
    /// campaign just completed.
    pub fn reconcile(
        &self,
        id: &Uuid,
        pending: u32,
        processing: u32,
        sent: u32,
        failed: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let mut campaigns = self.campaigns.write();
        let Some(c) = campaigns.get_mut(id) else {
            return false;
        };
        c.sent = sent;
        c.failed = failed;

        if c.status == CampaignStatus::Pending && (processing > 0 || sent > 0 || failed > 0) {
            c.status = CampaignStatus::InProgress;
        }

        let done = pending == 0 && processing == 0;
        if done && !matches!(c.status, CampaignStatus::Completed | CampaignStatus::Failed) {
            c.status = if sent == 0 && failed > 0 {
                CampaignStatus::Failed
            } else {
                CampaignStatus::Completed
            };
            c.completed_at = Some(now);
            return true;
        }
        false
    }

    pub fn flush(&self) -> Result<()> {
        let campaigns = self.campaigns.read();
        let json = serde_json::to_string_pretty(&*campaigns)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_completes_when_all_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CampaignStore::new(dir.path()).unwrap();
        let c = store.create(2, Utc::now());

        assert!(!store.reconcile(&c.id, 1, 1, 0, 0, Utc::now()));
        assert_eq!(store.get(&c.id).unwrap().status, CampaignStatus::InProgress);

        assert!(store.reconcile(&c.id, 0, 0, 1, 1, Utc::now()));
        let done = store.get(&c.id).unwrap();
        assert_eq!(done.status, CampaignStatus::Completed);
        assert_eq!((done.sent, done.failed), (1, 1));
        assert!(done.completed_at.is_some());

        // Idempotent: a second sweep does not re-complete.
        assert!(!store.reconcile(&c.id, 0, 0, 1, 1, Utc::now()));
    }

    #[test]
    fn all_failed_marks_campaign_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CampaignStore::new(dir.path()).unwrap();
        let c = store.create(2, Utc::now());
        store.reconcile(&c.id, 0, 0, 0, 2, Utc::now());
        assert_eq!(store.get(&c.id).unwrap().status, CampaignStatus::Failed);
    }
}
