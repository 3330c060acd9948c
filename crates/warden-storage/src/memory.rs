//! In-memory key-value store
//!
//! Used when no durable storage can be opened, and in tests to emulate storage
//! that is unavailable or out of quota.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::StorageError;
use crate::events::{ContextId, StorageEvent};
use crate::{KeyValueStore, Result, EVENT_CHANNEL_CAPACITY};

pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, String>>>,
    events: broadcast::Sender<StorageEvent>,
    available: Arc<AtomicBool>,
    /// Maximum total size of keys and values, in bytes
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            events,
            available: Arc::new(AtomicBool::new(true)),
            quota: None,
        }
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            quota: Some(quota),
            ..Self::new()
        }
    }

    /// Make every operation fail with [`StorageError::Unavailable`] (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("storage is disabled".to_string()))
        }
    }

    fn check_quota(&self, entries: &HashMap<String, String>, key: &str, value: &str) -> Result<()> {
        let Some(limit) = self.quota else {
            return Ok(());
        };

        let needed: usize = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
            + key.len()
            + value.len();

        if needed > limit {
            return Err(StorageError::QuotaExceeded { needed, limit });
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str, origin: ContextId) -> Result<()> {
        self.ensure_available()?;
        let mut entries = self.entries.write();
        self.check_quota(&entries, key, value)?;
        entries.insert(key.to_string(), value.to_string());

        // Sent under the write lock so events follow write order.
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            value: Some(value.to_string()),
            origin,
        });
        Ok(())
    }

    fn remove(&self, key: &str, origin: ContextId) -> Result<()> {
        self.ensure_available()?;
        let mut entries = self.entries.write();

        if entries.remove(key).is_some() {
            let _ = self.events.send(StorageEvent {
                key: key.to_string(),
                value: None,
                origin,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            events: self.events.clone(),
            available: Arc::clone(&self.available),
            quota: self.quota,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_store_fails_every_operation() {
        let store = MemoryStore::new();
        let origin = ContextId::new();
        store.set("k", "v", origin).unwrap();

        store.set_available(false);
        assert!(matches!(store.get("k"), Err(StorageError::Unavailable(_))));
        assert!(matches!(
            store.set("k", "v2", origin),
            Err(StorageError::Unavailable(_))
        ));
        assert!(matches!(
            store.remove("k", origin),
            Err(StorageError::Unavailable(_))
        ));

        store.set_available(true);
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_quota_exceeded() {
        let store = MemoryStore::with_quota(8);
        let origin = ContextId::new();

        store.set("k", "1234", origin).unwrap();
        // Replacing a value only counts the new size
        store.set("k", "1234567", origin).unwrap();

        let err = store.set("k", "12345678", origin).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { needed: 9, limit: 8 }));
        assert_eq!(store.get("k").unwrap().as_deref(), Some("1234567"));
    }

    #[test]
    fn test_concurrent_writers_publish_in_write_order() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        std::thread::scope(|scope| {
            for writer in 0..4 {
                let store = store.clone();
                scope.spawn(move || {
                    let origin = ContextId::new();
                    for n in 0..10 {
                        store.set("session", &format!("{writer}-{n}"), origin).unwrap();
                    }
                });
            }
        });

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = event.value;
        }
        assert_eq!(last, store.get("session").unwrap());
    }

    #[test]
    fn test_clones_share_entries_and_events() {
        let store = MemoryStore::new();
        let clone = store.clone();
        let mut rx = clone.subscribe();
        let origin = ContextId::new();

        store.set("k", "v", origin).unwrap();
        assert_eq!(clone.get("k").unwrap().as_deref(), Some("v"));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, origin);
    }
}
