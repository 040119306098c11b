//! Proxy-pool seam.
//!
//! Fleet-wide proxy provisioning and rotation are external; the core only
//! needs to draw an endpoint at session creation and check whether a sticky
//! assignment is still in the pool on reconnect.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One usable proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub id: String,
    /// `host:port`, scheme-less; the vendor adapter knows what to do.
    pub addr: String,
}

/// Source of proxy endpoints for new sessions.
pub trait ProxyPool: Send + Sync {
    /// Draw an endpoint for a new session.
    fn draw(&self) -> Option<ProxyEndpoint>;

    /// Whether the endpoint with this id is still in the pool.
    fn contains(&self, id: &str) -> bool;

    /// Fetch a specific endpoint by id, if still pooled.
    fn get(&self, id: &str) -> Option<ProxyEndpoint>;
}

/// Fixed round-robin pool over a configured endpoint list. Also the "no
/// proxy" pool: with zero endpoints it always hands out the direct route.
pub struct StaticProxyPool {
    endpoints: Vec<ProxyEndpoint>,
    cursor: Mutex<usize>,
}

/// Sentinel endpoint meaning "connect directly".
pub fn direct() -> ProxyEndpoint {
    ProxyEndpoint {
        id: "direct".to_owned(),
        addr: String::new(),
    }
}

impl StaticProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        Self {
            endpoints,
            cursor: Mutex::new(0),
        }
    }
}

impl ProxyPool for StaticProxyPool {
    fn draw(&self) -> Option<ProxyEndpoint> {
        if self.endpoints.is_empty() {
            return Some(direct());
        }
        let mut cursor = self.cursor.lock();
        let ep = self.endpoints[*cursor % self.endpoints.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(ep)
    }

    fn contains(&self, id: &str) -> bool {
        id == "direct" && self.endpoints.is_empty()
            || self.endpoints.iter().any(|e| e.id == id)
    }

    fn get(&self, id: &str) -> Option<ProxyEndpoint> {
        if id == "direct" && self.endpoints.is_empty() {
            return Some(direct());
        }
        self.endpoints.iter().find(|e| e.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(id: &str) -> ProxyEndpoint {
        ProxyEndpoint {
            id: id.into(),
            addr: format!("{id}.proxy.local:1080"),
        }
    }

    #[test]
    fn round_robin_draw() {
        let pool = StaticProxyPool::new(vec![ep("a"), ep("b")]);
        assert_eq!(pool.draw().unwrap().id, "a");
        assert_eq!(pool.draw().unwrap().id, "b");
        assert_eq!(pool.draw().unwrap().id, "a");
    }

    #[test]
    fn empty_pool_hands_out_direct() {
        let pool = StaticProxyPool::new(vec![]);
        assert_eq!(pool.draw().unwrap().id, "direct");
        assert!(pool.contains("direct"));
    }

    #[test]
    fn sticky_lookup_after_rotation() {
        let pool = StaticProxyPool::new(vec![ep("a"), ep("b")]);
        assert!(pool.contains("b"));
        assert!(!pool.contains("gone"));
        assert_eq!(pool.get("a").unwrap().addr, "a.proxy.local:1080");
    }
}
