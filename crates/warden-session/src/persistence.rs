//! Session persistence
//!
//! Reads and writes the session snapshot under one versioned key. Storage
//! failures never leave this module: the in-memory store stays authoritative and
//! the context silently degrades to memory-only persistence.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use warden_storage::{ContextId, KeyValueStore};

use crate::credential::fingerprint;
use crate::error::SessionError;
use crate::identity::Identity;
use crate::session::Session;
use crate::Result;

/// Storage key of the session snapshot
pub const SESSION_KEY: &str = "warden.session.v1";

/// Version written into, and required from, every snapshot
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSnapshot {
    version: u32,
    access_token: Option<String>,
    refresh_token: Option<String>,
    identity: Option<Identity>,
    is_authenticated: bool,
}

#[derive(Clone)]
pub struct PersistenceAdapter {
    storage: Arc<dyn KeyValueStore>,
    /// Context on whose behalf writes are made
    origin: ContextId,
    key: String,
}

impl PersistenceAdapter {
    pub fn new(storage: Arc<dyn KeyValueStore>, origin: ContextId) -> Self {
        Self::with_key(storage, origin, SESSION_KEY)
    }

    pub fn with_key(storage: Arc<dyn KeyValueStore>, origin: ContextId, key: impl Into<String>) -> Self {
        Self {
            storage,
            origin,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn origin(&self) -> ContextId {
        self.origin
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStore> {
        &self.storage
    }

    /// Write the full session. Failures are logged and swallowed.
    pub fn save(&self, session: &Session) {
        let result = encode(session).and_then(|raw| {
            self.storage
                .set(&self.key, &raw, self.origin)
                .map_err(SessionError::from)
        });

        match result {
            Ok(()) => tracing::debug!(
                key = %self.key,
                context_id = %self.origin,
                authenticated = session.is_authenticated(),
                access_token = ?session.access_token.as_deref().map(fingerprint),
                "Persisted session"
            ),
            Err(e) => tracing::warn!(
                key = %self.key,
                context_id = %self.origin,
                error = %e,
                "Failed to persist session, continuing memory-only"
            ),
        }
    }

    /// Read the stored session, falling back to [`Session::anonymous`] on any problem.
    pub fn load(&self) -> Session {
        match self.try_load() {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!(key = %self.key, "No persisted session");
                Session::anonymous()
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Discarding persisted session");
                Session::anonymous()
            }
        }
    }

    fn try_load(&self) -> Result<Option<Session>> {
        match self.storage.get(&self.key)? {
            Some(raw) => decode(&raw).map(Some),
            None => Ok(None),
        }
    }

    /// Remove the stored session. Failures are logged and swallowed.
    pub fn clear(&self) {
        if let Err(e) = self.storage.remove(&self.key, self.origin) {
            tracing::warn!(
                key = %self.key,
                context_id = %self.origin,
                error = %e,
                "Failed to clear persisted session"
            );
        }
    }

    /// Parse a raw snapshot, as found in storage or in a change notification.
    pub fn decode(&self, raw: &str) -> Result<Session> {
        decode(raw)
    }
}

fn encode(session: &Session) -> Result<String> {
    let snapshot = PersistedSnapshot {
        version: SNAPSHOT_VERSION,
        access_token: session.access_token.clone(),
        refresh_token: session.refresh_token.clone(),
        identity: session.identity.clone(),
        is_authenticated: session.is_authenticated(),
    };
    Ok(serde_json::to_string(&snapshot)?)
}

fn decode(raw: &str) -> Result<Session> {
    let snapshot: PersistedSnapshot = serde_json::from_str(raw)
        .map_err(|e| SessionError::MalformedPersistedState(e.to_string()))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(SessionError::MalformedPersistedState(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }

    let session = Session {
        access_token: snapshot.access_token.filter(|t| !t.is_empty()),
        refresh_token: snapshot.refresh_token.filter(|t| !t.is_empty()),
        identity: snapshot.identity,
    };

    if session.is_authenticated() != snapshot.is_authenticated {
        return Err(SessionError::MalformedPersistedState(
            "isAuthenticated contradicts stored credentials".to_string(),
        ));
    }

    Ok(session)
}
