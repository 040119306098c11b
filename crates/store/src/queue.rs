//! The durable send queue.
//!
//! Backed by `queue.json` under the state path. The enqueue key is
//! (campaign, recipient, template): re-enqueueing the same pair within a
//! campaign is a no-op, which is what makes Distributor admission safe to
//! retry after a crash mid-batch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use dr_domain::queue::MAX_RETRIES;
use dr_domain::{Error, QueueStatus, QueuedMessage, Result};

/// Queue store. All mutation goes through status-transition methods so the
/// `pending → processing → (pending → processing)* → (sent | failed)` path
/// is the only one possible.
pub struct QueueStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, QueuedMessage>,
    /// Dedup index: (campaign, recipient, template-hash) → record id.
    index: HashMap<(Uuid, String, u64), Uuid>,
}

fn template_key(template: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut h = DefaultHasher::new();
    template.hash(&mut h);
    h.finish()
}

impl QueueStore {
    /// Load or create the queue at `state_path/queue.json`. Records left
    /// `processing` by a crash are reverted to `pending` on load.
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("queue.json");

        let mut records: HashMap<Uuid, QueuedMessage> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        let mut recovered = 0usize;
        for rec in records.values_mut() {
            if rec.status == QueueStatus::Processing {
                rec.status = QueueStatus::Pending;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(recovered, "reverted in-flight records to pending after restart");
        }

        let index = records
            .values()
            .map(|r| {
                (
                    (r.campaign_id, r.recipient.clone(), template_key(&r.template)),
                    r.id,
                )
            })
            .collect();

        tracing::info!(records = records.len(), path = %path.display(), "queue store loaded");

        Ok(Self {
            path,
            inner: RwLock::new(Inner { records, index }),
        })
    }

    /// Insert a record unless the (campaign, recipient, template) triple
    /// already exists. Returns `true` when inserted.
    pub fn enqueue(&self, record: QueuedMessage) -> bool {
        let key = (
            record.campaign_id,
            record.recipient.clone(),
            template_key(&record.template),
        );
        let mut inner = self.inner.write();
        if inner.index.contains_key(&key) {
            return false;
        }
        inner.index.insert(key, record.id);
        inner.records.insert(record.id, record);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<QueuedMessage> {
        self.inner.read().records.get(id).cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| r.status == QueueStatus::Pending)
            .count()
    }

    /// Read up to `limit` pending records ordered by: recipients with a
    /// chat-history edge to any available sender first, then priority,
    /// then enqueue time.
    pub fn read_pending(
        &self,
        limit: usize,
        has_edge: impl Fn(&str) -> bool,
    ) -> Vec<QueuedMessage> {
        let inner = self.inner.read();
        let mut pending: Vec<&QueuedMessage> = inner
            .records
            .values()
            .filter(|r| r.status == QueueStatus::Pending)
            .collect();
        pending.sort_by_key(|r| (!has_edge(&r.recipient), r.priority, r.created_at));
        pending.into_iter().take(limit).cloned().collect()
    }

    /// `pending → processing`, recording the chosen sender.
    pub fn mark_processing(&self, id: &Uuid, sender: &str) -> Result<()> {
        self.transition(id, QueueStatus::Pending, |rec| {
            rec.status = QueueStatus::Processing;
            rec.assigned_sender = Some(sender.to_owned());
        })
    }

    /// `processing → sent`.
    pub fn mark_sent(&self, id: &Uuid, now: DateTime<Utc>) -> Result<()> {
        self.transition(id, QueueStatus::Processing, |rec| {
            rec.status = QueueStatus::Sent;
            rec.processed_at = Some(now);
        })
    }

    /// `processing → failed` (terminal).
    pub fn mark_failed(&self, id: &Uuid, now: DateTime<Utc>) -> Result<()> {
        self.transition(id, QueueStatus::Processing, |rec| {
            rec.status = QueueStatus::Failed;
            rec.processed_at = Some(now);
        })
    }

    /// `processing → pending` after a temporary failure, bumping the retry
    /// count. When the record has exhausted its retries it is marked
    /// failed instead. Returns the resulting status.
    pub fn requeue(&self, id: &Uuid, now: DateTime<Utc>) -> Result<QueueStatus> {
        let mut inner = self.inner.write();
        let rec = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::Store(format!("no queue record {id}")))?;
        if rec.status != QueueStatus::Processing {
            return Err(Error::Store(format!(
                "requeue of record {id} in {:?}",
                rec.status
            )));
        }
        rec.retry_count += 1;
        if rec.retry_count >= MAX_RETRIES {
            rec.status = QueueStatus::Failed;
            rec.processed_at = Some(now);
        } else {
            rec.status = QueueStatus::Pending;
            rec.assigned_sender = None;
        }
        Ok(rec.status)
    }

    /// `processing → pending` without consuming a retry. Used when the
    /// chosen sender turned out to be unusable (not paired, not
    /// connected) — that is the sender's fault, not the record's.
    pub fn release(&self, id: &Uuid) -> Result<()> {
        self.transition(id, QueueStatus::Processing, |rec| {
            rec.status = QueueStatus::Pending;
            rec.assigned_sender = None;
        })
    }

    /// Per-campaign counts: (pending, processing, sent, failed).
    pub fn campaign_counts(&self, campaign_id: &Uuid) -> (u32, u32, u32, u32) {
        let inner = self.inner.read();
        let mut counts = (0, 0, 0, 0);
        for rec in inner.records.values().filter(|r| r.campaign_id == *campaign_id) {
            match rec.status {
                QueueStatus::Pending => counts.0 += 1,
                QueueStatus::Processing => counts.1 += 1,
                QueueStatus::Sent => counts.2 += 1,
                QueueStatus::Failed => counts.3 += 1,
            }
        }
        counts
    }

    /// Recipients whose record failed, for campaign status reporting.
    pub fn failed_recipients(&self, campaign_id: &Uuid) -> Vec<String> {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| r.campaign_id == *campaign_id && r.status == QueueStatus::Failed)
            .map(|r| r.recipient.clone())
            .collect()
    }

    /// Campaign ids that still have at least one record, for the
    /// completion sweep.
    pub fn campaign_ids(&self) -> Vec<Uuid> {
        let inner = self.inner.read();
        let mut ids: Vec<Uuid> = inner.records.values().map(|r| r.campaign_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Persist the queue to disk.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.read();
        let json = serde_json::to_string_pretty(&inner.records)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }

    fn transition(
        &self,
        id: &Uuid,
        expect: QueueStatus,
        apply: impl FnOnce(&mut QueuedMessage),
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let rec = inner
            .records
            .get_mut(id)
            .ok_or_else(|| Error::Store(format!("no queue record {id}")))?;
        if rec.status != expect {
            return Err(Error::Store(format!(
                "record {id}: expected {:?}, found {:?}",
                expect, rec.status
            )));
        }
        apply(rec);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dr_domain::Priority;

    fn store() -> (tempfile::TempDir, QueueStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn msg(campaign: Uuid, recipient: &str, template: &str) -> QueuedMessage {
        QueuedMessage::new(campaign, recipient, template, Priority::Normal, Utc::now())
    }

    #[test]
    fn enqueue_deduplicates_per_campaign() {
        let (_dir, store) = store();
        let campaign = Uuid::new_v4();
        assert!(store.enqueue(msg(campaign, "+1555", "hi")));
        assert!(!store.enqueue(msg(campaign, "+1555", "hi")));
        // Different template is a distinct record.
        assert!(store.enqueue(msg(campaign, "+1555", "yo")));
        // Same pair under another campaign is distinct.
        assert!(store.enqueue(msg(Uuid::new_v4(), "+1555", "hi")));
        assert_eq!(store.pending_count(), 3);
    }

    #[test]
    fn lifecycle_transitions_enforced() {
        let (_dir, store) = store();
        let m = msg(Uuid::new_v4(), "+1555", "hi");
        let id = m.id;
        store.enqueue(m);

        assert!(store.mark_sent(&id, Utc::now()).is_err(), "pending cannot jump to sent");
        store.mark_processing(&id, "+1999").unwrap();
        assert!(store.mark_processing(&id, "+1999").is_err());
        store.mark_sent(&id, Utc::now()).unwrap();
        assert!(store.requeue(&id, Utc::now()).is_err(), "terminal records stay terminal");
    }

    #[test]
    fn requeue_caps_at_three_attempts() {
        let (_dir, store) = store();
        let m = msg(Uuid::new_v4(), "+1555", "hi");
        let id = m.id;
        store.enqueue(m);

        store.mark_processing(&id, "+1999").unwrap();
        assert_eq!(store.requeue(&id, Utc::now()).unwrap(), QueueStatus::Pending);
        store.mark_processing(&id, "+1999").unwrap();
        assert_eq!(store.requeue(&id, Utc::now()).unwrap(), QueueStatus::Pending);
        store.mark_processing(&id, "+1999").unwrap();
        assert_eq!(store.requeue(&id, Utc::now()).unwrap(), QueueStatus::Failed);
        assert_eq!(store.get(&id).unwrap().retry_count, 3);
    }

    #[test]
    fn read_pending_orders_edge_then_priority_then_age() {
        let (_dir, store) = store();
        let campaign = Uuid::new_v4();
        let now = Utc::now();

        let mut a = QueuedMessage::new(campaign, "+1001", "t", Priority::Low, now);
        a.created_at = now - chrono::Duration::seconds(30);
        let b = QueuedMessage::new(campaign, "+1002", "t", Priority::High, now);
        let c = QueuedMessage::new(campaign, "+1003", "t", Priority::Normal, now);
        store.enqueue(a.clone());
        store.enqueue(b.clone());
        store.enqueue(c.clone());

        // +1003 has history with a sender: it goes first despite priority.
        let out = store.read_pending(10, |r| r == "+1003");
        let order: Vec<&str> = out.iter().map(|m| m.recipient.as_str()).collect();
        assert_eq!(order, vec!["+1003", "+1002", "+1001"]);
    }

    #[test]
    fn crash_recovery_reverts_processing() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let store = QueueStore::new(dir.path()).unwrap();
            let m = msg(Uuid::new_v4(), "+1555", "hi");
            id = m.id;
            store.enqueue(m);
            store.mark_processing(&id, "+1999").unwrap();
            store.flush().unwrap();
        }
        let store = QueueStore::new(dir.path()).unwrap();
        assert_eq!(store.get(&id).unwrap().status, QueueStatus::Pending);
        // The dedup index survives the reload.
        assert!(!store.enqueue(msg(store.get(&id).unwrap().campaign_id, "+1555", "hi")));
    }

    #[test]
    fn campaign_counts_and_failed_recipients() {
        let (_dir, store) = store();
        let campaign = Uuid::new_v4();
        let a = msg(campaign, "+1001", "t");
        let b = msg(campaign, "+1002", "t");
        let (ida, idb) = (a.id, b.id);
        store.enqueue(a);
        store.enqueue(b);

        store.mark_processing(&ida, "+1999").unwrap();
        store.mark_sent(&ida, Utc::now()).unwrap();
        store.mark_processing(&idb, "+1999").unwrap();
        store.mark_failed(&idb, Utc::now()).unwrap();

        assert_eq!(store.campaign_counts(&campaign), (0, 0, 1, 1));
        assert_eq!(store.failed_recipients(&campaign), vec!["+1002".to_owned()]);
    }
}
