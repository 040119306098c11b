//! Per-identity on-disk session files.
//!
//! One credential file per identity under the sessions directory (filename
//! is the handle with non-digits stripped, `.session.json` extension), plus
//! a `{phone}.meta.json` sidecar carrying warmup progress. A worker scans
//! this directory at startup to learn which identities it owns and which of
//! them were previously logged in.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dr_chatwire::Credential;
use dr_domain::{Error, Result, Stage};

/// Warmup sidecar: `{phone}.meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_warmup_sent: Option<DateTime<Utc>>,
    #[serde(default)]
    pub warmup_complete: bool,
    pub warmup_stage: Stage,
}

impl SessionMeta {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            last_warmup_sent: None,
            warmup_complete: false,
            warmup_stage: Stage::Newborn,
        }
    }
}

/// One identity found on disk.
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub phone: String,
    /// Present iff the identity was previously logged in.
    pub credential: Option<Credential>,
    pub meta: SessionMeta,
}

/// Accessor for the sessions directory.
pub struct SessionFiles {
    dir: PathBuf,
}

fn digits(handle: &str) -> String {
    handle.chars().filter(|c| c.is_ascii_digit()).collect()
}

impl SessionFiles {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn credential_path(&self, phone: &str) -> PathBuf {
        self.dir.join(format!("{}.session.json", digits(phone)))
    }

    fn meta_path(&self, phone: &str) -> PathBuf {
        self.dir.join(format!("{phone}.meta.json"))
    }

    pub fn save_credential(&self, credential: &Credential) -> Result<()> {
        let json = serde_json::to_string_pretty(credential)?;
        std::fs::write(self.credential_path(&credential.phone), json).map_err(Error::Io)?;
        Ok(())
    }

    pub fn load_credential(&self, phone: &str) -> Result<Option<Credential>> {
        let path = self.credential_path(phone);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save_meta(&self, phone: &str, meta: &SessionMeta) -> Result<()> {
        let json = serde_json::to_string_pretty(meta)?;
        std::fs::write(self.meta_path(phone), json).map_err(Error::Io)?;
        Ok(())
    }

    pub fn load_meta(&self, phone: &str) -> Result<Option<SessionMeta>> {
        let path = self.meta_path(phone);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Scan the directory for identities. Every meta sidecar names an
    /// identity; the credential file may or may not exist for it. A
    /// credential without a sidecar gets a fresh meta dated now.
    pub fn scan(&self, now: DateTime<Utc>) -> Result<Vec<StoredIdentity>> {
        let mut found = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(Error::Io)?;
        let mut phones: Vec<String> = Vec::new();

        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(phone) = name.strip_suffix(".meta.json") {
                phones.push(phone.to_owned());
            } else if let Some(stripped) = name.strip_suffix(".session.json") {
                // Credential without sidecar: reconstruct a handle from digits.
                let phone = format!("+{stripped}");
                if !self.meta_path(&phone).exists() {
                    phones.push(phone);
                }
            }
        }
        phones.sort();
        phones.dedup();

        for phone in phones {
            let credential = self.load_credential(&phone)?;
            let meta = match self.load_meta(&phone)? {
                Some(meta) => meta,
                None => {
                    let meta = SessionMeta::new(
                        credential.as_ref().map(|c| c.created_at).unwrap_or(now),
                    );
                    self.save_meta(&phone, &meta)?;
                    meta
                }
            };
            found.push(StoredIdentity {
                phone,
                credential,
                meta,
            });
        }
        Ok(found)
    }
}
