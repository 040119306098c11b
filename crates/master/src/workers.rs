//! Worker fleet access.
//!
//! [`WorkerRpc`] is the seam between the Master and one worker process; the
//! HTTP implementation wraps a `reqwest::Client` with bounded retry on
//! transient failures. [`WorkerPool`] aggregates the fleet and keeps a
//! 60-second cache of the accounts snapshot, overlaid with the Master's own
//! since-refresh send bookkeeping so availability stays honest between
//! refreshes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;

use dr_domain::{Error, Result, MINUTE_CEILING};
use dr_protocol::{
    AccountsResponse, ConnectRequest, ConnectResponse, DisconnectRequest, SendError, SendRequest,
    SendResponse,
};

/// Seconds the cached accounts snapshot stays fresh.
const SNAPSHOT_MAX_AGE_SECS: i64 = 60;

/// RPC deadlines: 30 s for sends, 5 s for status refreshes.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a send RPC that reached the worker.
#[derive(Debug, Clone)]
pub enum SendReply {
    Sent(SendResponse),
    Failed(SendError),
}

/// One worker process, as seen from the Master.
#[async_trait::async_trait]
pub trait WorkerRpc: Send + Sync {
    /// Stable identifier (the base URL for HTTP workers).
    fn id(&self) -> &str;

    async fn accounts(&self) -> Result<AccountsResponse>;

    /// Returns `Err` only for transport-level trouble; worker-reported
    /// failures come back as `SendReply::Failed`.
    async fn send(&self, req: &SendRequest) -> Result<SendReply>;

    async fn connect(&self, phone: &str) -> Result<ConnectResponse>;

    async fn disconnect(&self, phone: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// reqwest-backed worker client. Created once per worker and reused; the
/// underlying client maintains a connection pool.
pub struct HttpWorkerRpc {
    http: Client,
    base_url: String,
}

impl HttpWorkerRpc {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait::async_trait]
impl WorkerRpc for HttpWorkerRpc {
    fn id(&self) -> &str {
        &self.base_url
    }

    async fn accounts(&self) -> Result<AccountsResponse> {
        // Status refreshes are cheap and frequent: tighter deadline, one
        // retry on a transient failure.
        let mut last_err = None;
        for attempt in 0..2u32 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let result = self
                .http
                .get(self.url("/accounts"))
                .timeout(STATUS_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<AccountsResponse>()
                        .await
                        .map_err(|e| Error::Http(e.to_string()));
                }
                Ok(resp) => {
                    last_err = Some(Error::Http(format!(
                        "{} /accounts returned {}",
                        self.base_url,
                        resp.status()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(Error::Timeout(format!("{} /accounts", self.base_url)));
                }
                Err(e) => last_err = Some(Error::Http(e.to_string())),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Http("accounts refresh failed".into())))
    }

    async fn send(&self, req: &SendRequest) -> Result<SendReply> {
        let resp = self
            .http
            .post(self.url("/send"))
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("{} /send", self.base_url))
                } else {
                    Error::Http(e.to_string())
                }
            })?;

        if resp.status().is_success() {
            let sent = resp
                .json::<SendResponse>()
                .await
                .map_err(|e| Error::Http(e.to_string()))?;
            return Ok(SendReply::Sent(sent));
        }
        match resp.json::<SendError>().await {
            Ok(failed) => Ok(SendReply::Failed(failed)),
            Err(e) => Err(Error::Http(format!(
                "{} /send: undecodable failure: {e}",
                self.base_url
            ))),
        }
    }

    async fn connect(&self, phone: &str) -> Result<ConnectResponse> {
        let resp = self
            .http
            .post(self.url("/accounts/connect"))
            .json(&ConnectRequest {
                phone: phone.to_owned(),
            })
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "{} /accounts/connect returned {}",
                self.base_url,
                resp.status()
            )));
        }
        resp.json().await.map_err(|e| Error::Http(e.to_string()))
    }

    async fn disconnect(&self, phone: &str) -> Result<()> {
        self.http
            .post(self.url("/accounts/disconnect"))
            .json(&DisconnectRequest {
                phone: phone.to_owned(),
            })
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker pool + accounts cache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One identity plus the worker that owns it.
#[derive(Debug, Clone)]
pub struct SenderView {
    pub worker: usize,
    pub status: dr_protocol::AccountStatus,
}

struct Snapshot {
    fetched_at: DateTime<Utc>,
    senders: HashMap<String, SenderView>,
}

pub struct WorkerPool {
    rpcs: Vec<Arc<dyn WorkerRpc>>,
    cache: RwLock<Option<Snapshot>>,
}

impl WorkerPool {
    pub fn new(rpcs: Vec<Arc<dyn WorkerRpc>>) -> Self {
        Self {
            rpcs,
            cache: RwLock::new(None),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.rpcs.len()
    }

    /// Current fleet view, refreshed from the workers when older than 60 s.
    /// A worker that fails to answer keeps its identities out of this
    /// round rather than failing the whole snapshot.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> Vec<SenderView> {
        let fresh = {
            let cache = self.cache.read();
            match cache.as_ref() {
                Some(snap)
                    if now.signed_duration_since(snap.fetched_at).num_seconds()
                        < SNAPSHOT_MAX_AGE_SECS =>
                {
                    Some(snap.senders.values().cloned().collect::<Vec<_>>())
                }
                _ => None,
            }
        };
        if let Some(senders) = fresh {
            return senders;
        }
        self.refresh(now).await
    }

    /// Force a refresh from every worker.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Vec<SenderView> {
        let mut senders = HashMap::new();
        for (idx, rpc) in self.rpcs.iter().enumerate() {
            match rpc.accounts().await {
                Ok(resp) => {
                    for status in resp.accounts {
                        senders.insert(
                            status.phone.clone(),
                            SenderView {
                                worker: idx,
                                status,
                            },
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = %rpc.id(), error = %e, "accounts refresh failed");
                }
            }
        }
        let views: Vec<SenderView> = senders.values().cloned().collect();
        *self.cache.write() = Some(Snapshot {
            fetched_at: now,
            senders,
        });
        views
    }

    /// Dispatch a send through the worker owning `from_phone`.
    pub async fn send(&self, worker: usize, req: &SendRequest) -> Result<SendReply> {
        let rpc = self
            .rpcs
            .get(worker)
            .ok_or_else(|| Error::Other(format!("no worker {worker}")))?;
        rpc.send(req).await
    }

    /// Record a successful dispatch in the cached view so availability
    /// holds between refreshes.
    pub fn note_send(&self, phone: &str, at: DateTime<Utc>) {
        let mut cache = self.cache.write();
        if let Some(snap) = cache.as_mut() {
            if let Some(view) = snap.senders.get_mut(phone) {
                view.status.messages_last_minute =
                    (view.status.messages_last_minute + 1).min(MINUTE_CEILING);
                view.status.messages_today += 1;
                view.status.total_messages_sent += 1;
                view.status.successful_messages += 1;
                view.status.last_message_at = Some(at);
            }
        }
    }

    /// Mark a sender unusable in the cached view (temp or permanent block).
    pub fn note_blocked_until(&self, phone: &str, until: DateTime<Utc>) {
        let mut cache = self.cache.write();
        if let Some(snap) = cache.as_mut() {
            if let Some(view) = snap.senders.get_mut(phone) {
                view.status.blocked_until = Some(until);
            }
        }
    }
}
