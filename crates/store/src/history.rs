//! Chat-history edges.
//!
//! An edge (sender, recipient) exists once the sender has successfully
//! delivered to the recipient. Edges are only ever created or refreshed;
//! the core never deletes them. The distributor and processor use them to
//! route repeat traffic through the identity the recipient already knows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use dr_domain::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRow {
    sender: String,
    recipient: String,
    last_message_at: DateTime<Utc>,
}

/// Edge store backed by `chat_history.json`.
pub struct ChatHistoryStore {
    path: PathBuf,
    edges: RwLock<HashMap<(String, String), DateTime<Utc>>>,
}

impl ChatHistoryStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("chat_history.json");

        let edges = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            let rows: Vec<EdgeRow> = serde_json::from_str(&raw).unwrap_or_default();
            rows.into_iter()
                .map(|r| ((r.sender, r.recipient), r.last_message_at))
                .collect()
        } else {
            HashMap::new()
        };

        tracing::info!(edges = edges.len(), path = %path.display(), "chat history loaded");

        Ok(Self {
            path,
            edges: RwLock::new(edges),
        })
    }

    /// Create or refresh the edge. `last_message_at` only moves forward.
    pub fn record(&self, sender: &str, recipient: &str, at: DateTime<Utc>) {
        let mut edges = self.edges.write();
        let entry = edges
            .entry((sender.to_owned(), recipient.to_owned()))
            .or_insert(at);
        if *entry < at {
            *entry = at;
        }
    }

    pub fn has_edge(&self, sender: &str, recipient: &str) -> bool {
        self.edges
            .read()
            .contains_key(&(sender.to_owned(), recipient.to_owned()))
    }

    /// Whether any of `senders` has an edge to `recipient`.
    pub fn any_edge(&self, senders: &[String], recipient: &str) -> bool {
        let edges = self.edges.read();
        senders
            .iter()
            .any(|s| edges.contains_key(&(s.clone(), recipient.to_owned())))
    }

    /// Among `candidates`, the sender with the most recent edge to
    /// `recipient`, if any.
    pub fn most_recent_sender(&self, candidates: &[String], recipient: &str) -> Option<String> {
        let edges = self.edges.read();
        candidates
            .iter()
            .filter_map(|s| {
                edges
                    .get(&(s.clone(), recipient.to_owned()))
                    .map(|at| (s.clone(), *at))
            })
            .max_by_key(|(_, at)| *at)
            .map(|(s, _)| s)
    }

    pub fn edge_time(&self, sender: &str, recipient: &str) -> Option<DateTime<Utc>> {
        self.edges
            .read()
            .get(&(sender.to_owned(), recipient.to_owned()))
            .copied()
    }

    pub fn flush(&self) -> Result<()> {
        let rows: Vec<EdgeRow> = self
            .edges
            .read()
            .iter()
            .map(|((sender, recipient), at)| EdgeRow {
                sender: sender.clone(),
                recipient: recipient.clone(),
                last_message_at: *at,
            })
            .collect();
        let json = serde_json::to_string_pretty(&rows)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn record_and_refresh_moves_forward_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatHistoryStore::new(dir.path()).unwrap();
        let now = Utc::now();

        store.record("+1999", "+1555", now);
        store.record("+1999", "+1555", now - Duration::hours(1));
        assert_eq!(store.edge_time("+1999", "+1555"), Some(now));

        store.record("+1999", "+1555", now + Duration::hours(1));
        assert_eq!(
            store.edge_time("+1999", "+1555"),
            Some(now + Duration::hours(1))
        );
    }

    #[test]
    fn most_recent_sender_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatHistoryStore::new(dir.path()).unwrap();
        let now = Utc::now();

        store.record("+1001", "+1555", now - Duration::days(3));
        store.record("+1002", "+1555", now - Duration::hours(1));

        let candidates = vec!["+1001".to_owned(), "+1002".to_owned(), "+1003".to_owned()];
        assert_eq!(
            store.most_recent_sender(&candidates, "+1555"),
            Some("+1002".to_owned())
        );
        assert_eq!(store.most_recent_sender(&candidates, "+1556"), None);
        assert!(store.any_edge(&candidates, "+1555"));
    }

    #[test]
    fn edges_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let store = ChatHistoryStore::new(dir.path()).unwrap();
            store.record("+1999", "+1555", now);
            store.flush().unwrap();
        }
        let store = ChatHistoryStore::new(dir.path()).unwrap();
        assert!(store.has_edge("+1999", "+1555"));
    }
}
