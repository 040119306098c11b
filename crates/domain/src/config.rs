//! Environment-driven configuration.
//!
//! The deployment's secrets/config loader is external to the core; what the
//! core recognizes is a flat set of environment options with defaults that
//! work out of the box. `Config::from_env()` reads the process environment;
//! `Config::from_lookup` takes any resolver so tests never touch global env.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
        }
    }
}

/// Knobs for the per-identity pacer. `None` means "use the stage table".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Override of the stage base-delay lower bound.
    pub min_delay_ms: Option<u64>,
    /// Override of the stage base-delay upper bound.
    pub max_delay_ms: Option<u64>,
    /// A short break is inserted every N sends.
    pub short_break_interval: u64,
    pub short_break_min_ms: u64,
    pub short_break_max_ms: u64,
    /// A long break is inserted every N sends.
    pub long_break_interval: u64,
    pub long_break_min_ms: u64,
    pub long_break_max_ms: u64,
    /// Global clamp on the per-stage daily cap.
    pub max_messages_per_day: Option<u32>,
    /// Global clamp on the per-stage hourly cap.
    pub max_messages_per_hour: Option<u32>,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: None,
            max_delay_ms: None,
            short_break_interval: 10,
            short_break_min_ms: 30_000,
            short_break_max_ms: 120_000,
            long_break_interval: 50,
            long_break_min_ms: 300_000,
            long_break_max_ms: 900_000,
            max_messages_per_day: None,
            max_messages_per_hour: None,
        }
    }
}

/// Master-side view of the worker fleet.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetConfig {
    pub worker_count: usize,
    /// One base URL per worker, index-aligned with `WORKER_{n}_URL` (1-based).
    pub worker_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Ingress API key. `None` = dev mode (no auth enforced).
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for the JSON-backed stores (queue, campaigns, accounts, edges).
    pub state_path: PathBuf,
    /// Directory of per-identity session credential files + meta sidecars.
    pub sessions_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("./data"),
            sessions_path: PathBuf::from("./sessions"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WarmupConfig {
    /// Handles outside this deployment that Toddler+ identities may warm
    /// up against. Empty = co-located targets only, all stages.
    pub external_targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    /// Proxy endpoints (`host:port`) handed out round-robin to new
    /// sessions. Empty = direct connections.
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Redundant sessions kept per identity (1..=4).
    pub slots_per_identity: u8,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            slots_per_identity: 2,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary resolver. Unset keys fall
    /// back to defaults; set-but-unparsable keys are hard errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(host) = lookup("HOST") {
            cfg.server.host = host;
        }
        cfg.server.port = parse_opt(&lookup, "PORT")?.unwrap_or(cfg.server.port);

        cfg.pacing.min_delay_ms = parse_opt(&lookup, "MIN_DELAY_MS")?;
        cfg.pacing.max_delay_ms = parse_opt(&lookup, "MAX_DELAY_MS")?;
        if let Some(v) = parse_opt(&lookup, "SHORT_BREAK_INTERVAL")? {
            cfg.pacing.short_break_interval = v;
        }
        if let Some(v) = parse_opt(&lookup, "SHORT_BREAK_MIN_MS")? {
            cfg.pacing.short_break_min_ms = v;
        }
        if let Some(v) = parse_opt(&lookup, "SHORT_BREAK_MAX_MS")? {
            cfg.pacing.short_break_max_ms = v;
        }
        if let Some(v) = parse_opt(&lookup, "LONG_BREAK_INTERVAL")? {
            cfg.pacing.long_break_interval = v;
        }
        if let Some(v) = parse_opt(&lookup, "LONG_BREAK_MIN_MS")? {
            cfg.pacing.long_break_min_ms = v;
        }
        if let Some(v) = parse_opt(&lookup, "LONG_BREAK_MAX_MS")? {
            cfg.pacing.long_break_max_ms = v;
        }
        cfg.pacing.max_messages_per_day = parse_opt(&lookup, "MAX_MESSAGES_PER_DAY")?;
        cfg.pacing.max_messages_per_hour = parse_opt(&lookup, "MAX_MESSAGES_PER_HOUR")?;

        cfg.fleet.worker_count = parse_opt(&lookup, "WORKER_COUNT")?.unwrap_or(0);
        for n in 1..=cfg.fleet.worker_count {
            match lookup(&format!("WORKER_{n}_URL")) {
                Some(url) => cfg.fleet.worker_urls.push(url),
                None => {
                    return Err(Error::Config(format!(
                        "WORKER_COUNT is {} but WORKER_{}_URL is not set",
                        cfg.fleet.worker_count, n
                    )))
                }
            }
        }

        cfg.auth.api_key = lookup("API_KEY").filter(|k| !k.is_empty());

        if let Some(p) = lookup("STATE_PATH") {
            cfg.storage.state_path = PathBuf::from(p);
        }
        if let Some(p) = lookup("SESSIONS_PATH") {
            cfg.storage.sessions_path = PathBuf::from(p);
        }

        if let Some(v) = parse_opt(&lookup, "SLOTS_PER_IDENTITY")? {
            cfg.worker.slots_per_identity = v;
        }

        if let Some(targets) = lookup("WARMUP_EXTERNAL_TARGETS") {
            cfg.warmup.external_targets = targets
                .split(',')
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty())
                .collect();
        }

        if let Some(endpoints) = lookup("PROXY_LIST") {
            cfg.proxy.endpoints = endpoints
                .split(',')
                .map(|e| e.trim().to_owned())
                .filter(|e| !e.is_empty())
                .collect();
        }

        Ok(cfg)
    }

    /// Validate the loaded configuration. Errors abort startup; warnings
    /// are logged and tolerated.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("PORT must be non-zero"));
        }

        if let (Some(min), Some(max)) = (self.pacing.min_delay_ms, self.pacing.max_delay_ms) {
            if min > max {
                issues.push(ConfigIssue::error("MIN_DELAY_MS exceeds MAX_DELAY_MS"));
            }
        }
        if self.pacing.short_break_min_ms > self.pacing.short_break_max_ms {
            issues.push(ConfigIssue::error(
                "SHORT_BREAK_MIN_MS exceeds SHORT_BREAK_MAX_MS",
            ));
        }
        if self.pacing.long_break_min_ms > self.pacing.long_break_max_ms {
            issues.push(ConfigIssue::error(
                "LONG_BREAK_MIN_MS exceeds LONG_BREAK_MAX_MS",
            ));
        }
        if self.pacing.short_break_interval == 0 || self.pacing.long_break_interval == 0 {
            issues.push(ConfigIssue::error("break intervals must be non-zero"));
        }

        for url in &self.fleet.worker_urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                issues.push(ConfigIssue::error(format!(
                    "worker URL {url:?} must be http(s)"
                )));
            }
        }

        if !(1..=4).contains(&self.worker.slots_per_identity) {
            issues.push(ConfigIssue::error(
                "SLOTS_PER_IDENTITY must be between 1 and 4",
            ));
        }

        if self.auth.api_key.is_none() {
            issues.push(ConfigIssue::warning(
                "API_KEY not set — ingress auth disabled (dev mode)",
            ));
        }

        issues
    }
}

fn parse_opt<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: cannot parse {raw:?}"))),
        None => Ok(None),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == ConfigSeverity::Error
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Convenience for tests and embedding: build a lookup over a map.
pub fn map_lookup<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
    move |key| map.get(key).map(|v| (*v).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.pacing.short_break_interval, 10);
        assert_eq!(cfg.pacing.long_break_interval, 50);
        assert!(cfg.pacing.min_delay_ms.is_none());
        assert!(cfg.fleet.worker_urls.is_empty());
        assert!(cfg.auth.api_key.is_none());
    }

    #[test]
    fn worker_urls_must_match_count() {
        let mut map = HashMap::new();
        map.insert("WORKER_COUNT", "2");
        map.insert("WORKER_1_URL", "http://10.0.0.1:8081");
        let err = Config::from_lookup(map_lookup(&map)).unwrap_err();
        assert!(err.to_string().contains("WORKER_2_URL"));
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let mut map = HashMap::new();
        map.insert("MIN_DELAY_MS", "soon");
        assert!(Config::from_lookup(map_lookup(&map)).is_err());
    }

    #[test]
    fn validate_flags_inverted_ranges() {
        let mut map = HashMap::new();
        map.insert("MIN_DELAY_MS", "5000");
        map.insert("MAX_DELAY_MS", "1000");
        let cfg = Config::from_lookup(map_lookup(&map)).unwrap();
        assert!(cfg.validate().iter().any(|i| i.is_error()));
    }

    #[test]
    fn missing_api_key_is_only_a_warning() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| !i.is_error()));
        assert!(!issues.iter().any(|i| i.is_error()));
    }

    #[test]
    fn full_fleet_parses() {
        let mut map = HashMap::new();
        map.insert("WORKER_COUNT", "2");
        map.insert("WORKER_1_URL", "http://10.0.0.1:8081");
        map.insert("WORKER_2_URL", "http://10.0.0.2:8081");
        map.insert("API_KEY", "sekrit");
        let cfg = Config::from_lookup(map_lookup(&map)).unwrap();
        assert_eq!(cfg.fleet.worker_urls.len(), 2);
        assert_eq!(cfg.auth.api_key.as_deref(), Some("sekrit"));
        assert!(!cfg.validate().iter().any(|i| i.is_error()));
    }
}
