//! Cross-context synchronization
//!
//! Follows the change notifications of the shared storage and mirrors sessions
//! written by other contexts into the local store. Reconciling never writes back
//! to storage, so two contexts cannot ping-pong the same change.

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use warden_storage::{ContextId, StorageEvent};

use crate::persistence::PersistenceAdapter;
use crate::session::Session;
use crate::store::SessionStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Another context committed this session
    SessionChanged(Session),
    /// Another context removed the session
    SessionCleared,
}

pub struct CrossContextSync {
    store: SessionStore,
    persistence: PersistenceAdapter,
}

impl CrossContextSync {
    /// Returns `None` for memory-only stores, which have nothing to follow.
    pub fn new(store: SessionStore) -> Option<Self> {
        let persistence = store.persistence()?.clone();
        Some(Self { store, persistence })
    }

    /// Translate a storage event into a message for this context, if it concerns it.
    pub fn interpret(&self, event: &StorageEvent) -> Option<SyncMessage> {
        if event.key != self.persistence.key() {
            return None;
        }
        if event.origin == self.persistence.origin() {
            // Our own write
            return None;
        }

        match &event.value {
            None => Some(SyncMessage::SessionCleared),
            Some(raw) => match self.persistence.decode(raw) {
                Ok(session) => Some(SyncMessage::SessionChanged(session)),
                Err(e) => {
                    tracing::warn!(
                        context_id = %self.persistence.origin(),
                        origin = %event.origin,
                        error = %e,
                        "Malformed session from another context, treating as cleared"
                    );
                    Some(SyncMessage::SessionCleared)
                }
            },
        }
    }

    /// Bring the local store in line with `message`.
    pub fn apply(&self, message: SyncMessage) -> Session {
        let observed = match message {
            SyncMessage::SessionChanged(session) => session,
            SyncMessage::SessionCleared => Session::anonymous(),
        };
        self.adopt(observed)
    }

    /// Re-read the shared snapshot and adopt it.
    pub fn resync(&self) -> Session {
        self.adopt(self.persistence.load())
    }

    fn adopt(&self, observed: Session) -> Session {
        let current = self.store.snapshot();
        if current == observed {
            return current;
        }
        self.store.reconcile(observed)
    }

    /// Follow storage changes on the current tokio runtime until stopped.
    pub fn spawn(self) -> SyncHandle {
        let context_id = self.persistence.origin();
        // Subscribe before spawning so no change after this call is missed.
        let mut events = self.persistence.storage().subscribe();

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(message) = self.interpret(&event) {
                            self.apply(message);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            context_id = %context_id,
                            skipped,
                            "Missed storage notifications, re-reading session"
                        );
                        self.resync();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!(context_id = %context_id, "Storage notifications closed");
        });

        tracing::debug!(context_id = %context_id, "Started cross-context sync");

        SyncHandle { task, context_id }
    }
}

pub struct SyncHandle {
    task: JoinHandle<()>,
    context_id: ContextId,
}

impl SyncHandle {
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
        tracing::debug!(context_id = %self.context_id, "Stopped cross-context sync");
    }
}
