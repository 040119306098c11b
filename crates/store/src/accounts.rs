//! Identity (account) persistence on the worker side.
//!
//! Counters here mirror what the pacer tracks in memory; they are flushed
//! so a restarted worker resumes quota accounting instead of starting the
//! day at zero.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use dr_domain::{Error, IdentityRecord, Result};

/// Account store backed by `accounts.json`.
pub struct AccountStore {
    path: PathBuf,
    accounts: RwLock<HashMap<String, IdentityRecord>>,
}

impl AccountStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("accounts.json");

        let accounts = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(accounts = accounts.len(), path = %path.display(), "account store loaded");

        Ok(Self {
            path,
            accounts: RwLock::new(accounts),
        })
    }

    /// Fetch the record, creating it on first sight (first pairing).
    pub fn get_or_create(&self, phone: &str, now: DateTime<Utc>) -> IdentityRecord {
        let mut accounts = self.accounts.write();
        accounts
            .entry(phone.to_owned())
            .or_insert_with(|| IdentityRecord::new(phone, now))
            .clone()
    }

    pub fn get(&self, phone: &str) -> Option<IdentityRecord> {
        self.accounts.read().get(phone).cloned()
    }

    /// Apply `f` to the record, if present.
    pub fn update(&self, phone: &str, f: impl FnOnce(&mut IdentityRecord)) {
        if let Some(rec) = self.accounts.write().get_mut(phone) {
            f(rec);
        }
    }

    pub fn mark_blocked(&self, phone: &str, now: DateTime<Utc>) {
        self.update(phone, |rec| rec.blocked_at = Some(now));
        tracing::warn!(phone = %phone, "identity marked blocked");
    }

    pub fn flush(&self) -> Result<()> {
        let accounts = self.accounts.read();
        let json = serde_json::to_string_pretty(&*accounts)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_once_then_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path()).unwrap();
        let created = store.get_or_create("+15550001111", Utc::now());
        assert_eq!(created.country, "US");

        store.update("+15550001111", |r| r.total_sent = 7);
        let again = store.get_or_create("+15550001111", Utc::now());
        assert_eq!(again.total_sent, 7, "existing record is not recreated");
    }

    #[test]
    fn counters_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = AccountStore::new(dir.path()).unwrap();
            store.get_or_create("+15550001111", Utc::now());
            store.update("+15550001111", |r| {
                r.sent_today = 4;
                r.successful = 4;
            });
            store.flush().unwrap();
        }
        let store = AccountStore::new(dir.path()).unwrap();
        assert_eq!(store.get("+15550001111").unwrap().sent_today, 4);
    }
}
