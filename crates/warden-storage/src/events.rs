//! Change notifications

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one open context (window, tab, process) attached to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A committed change to one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEvent {
    pub key: String,
    /// New value, or `None` when the key was removed
    pub value: Option<String>,
    /// Context whose write produced this event
    pub origin: ContextId,
}

impl StorageEvent {
    pub fn is_removal(&self) -> bool {
        self.value.is_none()
    }
}
