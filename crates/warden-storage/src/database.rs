//! SQLite-backed key-value store

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::events::{ContextId, StorageEvent};
use crate::migrations::run_migrations;
use crate::{KeyValueStore, Result, EVENT_CHANNEL_CAPACITY};

/// Durable store backed by one SQLite file.
///
/// Clones share the connection and the change channel, so every context of a
/// process that holds a clone sees the writes of the others.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<StorageEvent>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for better concurrent performance
        let _: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        run_migrations(&conn)?;

        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;

        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            conn: Arc::new(Mutex::new(conn)),
            events,
        }
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    fn publish(&self, key: &str, value: Option<&str>, origin: ContextId) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            value: value.map(str::to_string),
            origin,
        });
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    fn set(&self, key: &str, value: &str, origin: ContextId) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        // Publish while still holding the connection so events follow write order.
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO kv_store (key, value, updated_at, updated_by)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![key, value, updated_at, origin.to_string()],
            )?;
            self.publish(key, Some(value), origin);
            Ok(())
        })?;

        tracing::trace!(key = %key, origin = %origin, "Stored value");
        Ok(())
    }

    fn remove(&self, key: &str, origin: ContextId) -> Result<()> {
        let removed = self.with_connection(|conn| {
            let removed = conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
            if removed > 0 {
                self.publish(key, None, origin);
            }
            Ok(removed)
        })?;

        if removed > 0 {
            tracing::trace!(key = %key, origin = %origin, "Removed value");
        }

        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            events: self.events.clone(),
        }
    }
}
