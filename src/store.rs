// =============================================================================
// store.rs — THE PERSISTENCE AIRLOCK
// =============================================================================
//
// The core never talks to a database. It talks to this trait: get/set/
// delete with TTL, JSON values, string keys. Whether the other side is a
// HashMap, Redis, or a filing cabinet staffed by interns is somebody
// else's integration problem.
//
// The reference implementation is in-memory with explicit expiry
// bookkeeping. Entries carry their own deadline; reads past the deadline
// act like the entry never existed, and a periodic sweep (driven by the
// maintenance loop) reclaims the corpses.
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::MonitorError;

/// Key-value persistence with TTL. Values are JSON strings — the typed
/// helpers below handle the serde round trip so call sites stay clean.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>);
    async fn delete(&self, key: &str) -> bool;
    /// Reclaim expired entries. Returns how many were swept.
    async fn purge_expired(&self) -> usize;
}

/// Typed convenience layer over the string trait. Blanket-implemented so
/// every store gets it for free.
#[async_trait]
pub trait TypedStore: KeyValueStore {
    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MonitorError> {
        match self.get(key).await {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| MonitorError::Configuration(format!("corrupt record at '{key}': {e}"))),
        }
    }

    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), MonitorError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| MonitorError::Configuration(format!("unserializable value for '{key}': {e}")))?;
        self.set(key, raw, ttl).await;
        Ok(())
    }
}

impl<S: KeyValueStore + ?Sized> TypedStore for S {}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Instant::now() >= at).unwrap_or(false)
    }
}

/// The in-memory reference store. parking_lot RwLock over a HashMap —
/// reads vastly outnumber writes here, and the lock is never held across
/// an await (the async methods are async only to satisfy the trait).
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(stored) if !stored.is_expired() => Some(stored.value.clone()),
            // Expired-but-unswept reads as absent. The sweep will get to it.
            _ => None,
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let stored = StoredValue {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.write().insert(key.to_string(), stored);
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, stored| !stored.is_expired());
        let swept = before - entries.len();
        if swept > 0 {
            debug!(swept, "Store expiry sweep reclaimed entries");
        }
        swept
    }
}

/// Key namespaces, so a monitor record and a change archive can never
/// collide no matter what the IDs look like.
pub mod keys {
    use uuid::Uuid;

    pub fn case(monitor_id: Uuid) -> String {
        format!("case:{monitor_id}")
    }

    pub fn rule(rule_id: Uuid) -> String {
        format!("rule:{rule_id}")
    }

    pub fn change(change_id: Uuid) -> String {
        format!("change:{change_id}")
    }
}
