//! Warden Storage Layer
//!
//! Durable key-value storage shared by every session context of one profile.
//! Every committed write or removal is broadcast as a [`StorageEvent`] tagged with
//! the [`ContextId`] that caused it, so other contexts can follow along.

mod database;
mod error;
mod events;
mod memory;
mod migrations;

pub use database::Database;
pub use error::StorageError;
pub use events::{ContextId, StorageEvent};
pub use memory::MemoryStore;

use tokio::sync::broadcast;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Capacity of the change-notification channel of each store.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A client-side key-value store with cross-context change notifications.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` under `key` on behalf of `origin`.
    fn set(&self, key: &str, value: &str, origin: ContextId) -> Result<()>;

    /// Remove `key` on behalf of `origin`. Removing a missing key is not an error.
    fn remove(&self, key: &str, origin: ContextId) -> Result<()>;

    /// Receive every change committed after this call, from any context.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}
