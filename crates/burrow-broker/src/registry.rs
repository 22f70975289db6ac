//! Process-wide tunnel registry.
//!
//! Maps tunnel id to its live session. At most one session per id exists at
//! any instant: insert is atomic per key, so concurrent connects with the
//! same id resolve to exactly one winner. Removal drives the session's
//! teardown and then sweeps any routing caches keyed by the id.

use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::TunnelSession;

/// Notified after a tunnel is removed so host-based routing caches can drop
/// entries that resolve to it.
pub trait RouteInvalidator: Send + Sync {
    fn invalidate(&self, tunnel_id: &str);
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tunnel id already in use: {0}")]
    Duplicate(String),
}

pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<TunnelSession>>,
    invalidator: OnceLock<Arc<dyn RouteInvalidator>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
            invalidator: OnceLock::new(),
        }
    }

    /// Wire the cache invalidation hook. Set once at startup.
    pub fn set_invalidator(&self, invalidator: Arc<dyn RouteInvalidator>) {
        if self.invalidator.set(invalidator).is_err() {
            warn!("route invalidator already configured");
        }
    }

    /// Insert a session under `id`. Exactly one concurrent insert for a given
    /// id succeeds; the rest observe [`RegistryError::Duplicate`].
    pub fn insert(&self, id: &str, session: Arc<TunnelSession>) -> Result<(), RegistryError> {
        match self.tunnels.entry(id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(session);
                info!(tunnel_id = id, total_tunnels = self.tunnels.len(), "tunnel registered");
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<TunnelSession>> {
        self.tunnels.get(id).map(|entry| entry.value().clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.tunnels.contains_key(id)
    }

    /// Remove `id`, tear its session down, and invalidate cached routes.
    /// Idempotent: removing an absent id is a no-op.
    pub fn remove(&self, id: &str) {
        match self.tunnels.remove(id) {
            Some((_, session)) => {
                session.teardown();
                if let Some(invalidator) = self.invalidator.get() {
                    invalidator.invalidate(id);
                }
                info!(
                    tunnel_id = id,
                    remaining_tunnels = self.tunnels.len(),
                    "tunnel removed"
                );
            }
            None => debug!(tunnel_id = id, "remove of unregistered tunnel"),
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
