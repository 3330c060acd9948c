//! Session Store
//!
//! In-memory authority over the current session. All mutations go through the
//! transition methods below; each one runs to completion under the transition
//! gate, is written through to persistence, and is then announced to subscribers.

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use warden_storage::ContextId;

use crate::credential::fingerprint;
use crate::error::SessionError;
use crate::identity::Identity;
use crate::persistence::PersistenceAdapter;
use crate::session::Session;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Loaded from persistence at startup
    Hydrate,
    Login,
    /// Credentials replaced after a refresh; identity untouched
    SetTokens,
    Logout,
    /// Adopted a session written by another context
    Reconcile,
}

impl Transition {
    /// Whether this transition replaces the whole session (and so starts a new epoch).
    pub fn replaces_session(&self) -> bool {
        !matches!(self, Transition::SetTokens)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Hydrate => "hydrate",
            Transition::Login => "login",
            Transition::SetTokens => "set_tokens",
            Transition::Logout => "logout",
            Transition::Reconcile => "reconcile",
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivered to subscribers after a transition has been committed.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub transition: Transition,
    pub session: Session,
    /// Epoch the session belongs to after the transition
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Inner {
    session: RwLock<Session>,
    /// Advanced by every transition that replaces the session
    epoch: AtomicU64,
    /// Serializes transitions and their notifications. Reentrant so that a
    /// subscriber may itself trigger a transition.
    gate: ReentrantMutex<()>,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    /// Committed events not yet delivered, oldest first
    pending: Mutex<VecDeque<SessionEvent>>,
    /// Set while the outermost commit is delivering `pending`
    delivering: AtomicBool,
    next_subscription: AtomicU64,
    persistence: Option<PersistenceAdapter>,
    initialized: AtomicBool,
    context_id: ContextId,
}

pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    /// A store that writes every transition through `persistence`.
    pub fn new(persistence: PersistenceAdapter) -> Self {
        let context_id = persistence.origin();
        Self::build(Some(persistence), context_id)
    }

    /// A store with no persistence at all.
    pub fn in_memory() -> Self {
        Self::build(None, ContextId::new())
    }

    fn build(persistence: Option<PersistenceAdapter>, context_id: ContextId) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: RwLock::new(Session::anonymous()),
                epoch: AtomicU64::new(0),
                gate: ReentrantMutex::new(()),
                listeners: RwLock::new(Vec::new()),
                pending: Mutex::new(VecDeque::new()),
                delivering: AtomicBool::new(false),
                next_subscription: AtomicU64::new(1),
                persistence,
                initialized: AtomicBool::new(false),
                context_id,
            }),
        }
    }

    /// Hydrate from persistence. Runs once; later calls return the current session.
    pub fn initialize(&self) -> Session {
        let _gate = self.inner.gate.lock();

        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            tracing::debug!(context_id = %self.inner.context_id, "Session store already initialized");
            return self.snapshot();
        }

        let session = self
            .inner
            .persistence
            .as_ref()
            .map(PersistenceAdapter::load)
            .unwrap_or_else(Session::anonymous);

        let session = self.commit(Transition::Hydrate, session);

        tracing::info!(
            context_id = %self.inner.context_id,
            state = %session.state(),
            user_id = ?session.user_id(),
            "Initialized session store"
        );

        session
    }

    /// Replace any current session with a fully authenticated one.
    pub fn login(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        identity: Identity,
    ) -> Result<Session> {
        let access_token = non_empty(access_token.into()).ok_or(SessionError::EmptyAccessToken)?;
        let refresh_token = non_empty(refresh_token.into());

        let _gate = self.inner.gate.lock();
        let user_id = identity.id;
        let session = self.commit(
            Transition::Login,
            Session::authenticated(access_token, refresh_token, identity),
        );

        tracing::info!(
            context_id = %self.inner.context_id,
            user_id,
            access_token = ?session.access_token.as_deref().map(fingerprint),
            "Logged in"
        );

        Ok(session)
    }

    /// Replace the credentials, keeping the identity.
    ///
    /// On an anonymous store this only records the tokens; it never
    /// authenticates on its own.
    pub fn set_tokens(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Session> {
        let access_token = non_empty(access_token.into()).ok_or(SessionError::EmptyAccessToken)?;
        let refresh_token = non_empty(refresh_token.into());

        let _gate = self.inner.gate.lock();
        Ok(self.apply_tokens(access_token, refresh_token))
    }

    /// Like [`set_tokens`](Self::set_tokens), but only if no session-replacing
    /// transition happened since `epoch`. Returns `None` when superseded.
    pub fn set_tokens_if_epoch(
        &self,
        epoch: u64,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<Option<Session>> {
        let access_token = non_empty(access_token.into()).ok_or(SessionError::EmptyAccessToken)?;
        let refresh_token = non_empty(refresh_token.into());

        let _gate = self.inner.gate.lock();
        if self.epoch() != epoch {
            tracing::debug!(
                context_id = %self.inner.context_id,
                expected_epoch = epoch,
                current_epoch = self.epoch(),
                "Discarding tokens for a superseded session"
            );
            return Ok(None);
        }

        Ok(Some(self.apply_tokens(access_token, refresh_token)))
    }

    fn apply_tokens(&self, access_token: String, refresh_token: Option<String>) -> Session {
        let mut next = self.snapshot();
        next.access_token = Some(access_token);
        next.refresh_token = refresh_token;

        if next.identity.is_none() {
            tracing::debug!(
                context_id = %self.inner.context_id,
                "Storing tokens without an identity; session stays anonymous"
            );
        }

        let session = self.commit(Transition::SetTokens, next);

        tracing::debug!(
            context_id = %self.inner.context_id,
            access_token = ?session.access_token.as_deref().map(fingerprint),
            "Replaced session tokens"
        );

        session
    }

    /// Clear everything and purge the persisted snapshot. Safe to repeat.
    pub fn logout(&self) -> Session {
        let _gate = self.inner.gate.lock();
        let previous_user = self.inner.session.read().user_id();
        let session = self.commit(Transition::Logout, Session::anonymous());

        tracing::info!(
            context_id = %self.inner.context_id,
            user_id = ?previous_user,
            "Logged out"
        );

        session
    }

    /// Log out only if no session-replacing transition happened since `epoch`.
    pub fn logout_if_epoch(&self, epoch: u64) -> bool {
        let _gate = self.inner.gate.lock();
        if self.epoch() != epoch {
            return false;
        }
        self.logout();
        true
    }

    /// Adopt a session observed in shared storage without writing it back.
    pub(crate) fn reconcile(&self, session: Session) -> Session {
        let _gate = self.inner.gate.lock();
        let session = self.commit(Transition::Reconcile, session);

        tracing::info!(
            context_id = %self.inner.context_id,
            state = %session.state(),
            user_id = ?session.user_id(),
            "Reconciled session from another context"
        );

        session
    }

    fn commit(&self, transition: Transition, next: Session) -> Session {
        if transition.replaces_session() {
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }
        *self.inner.session.write() = next.clone();

        if let Some(persistence) = &self.inner.persistence {
            match transition {
                Transition::Login | Transition::SetTokens => persistence.save(&next),
                Transition::Logout => persistence.clear(),
                Transition::Hydrate | Transition::Reconcile => {}
            }
        }

        self.notify(SessionEvent {
            transition,
            session: next.clone(),
            epoch: self.epoch(),
        });

        next
    }

    /// Queue `event` and, unless a delivery is already running further up the
    /// stack, deliver every queued event in commit order.
    ///
    /// Called with the gate held, so only a re-entrant transition on this thread
    /// can observe `delivering` set.
    fn notify(&self, event: SessionEvent) {
        self.inner.pending.lock().push_back(event);

        if self.inner.delivering.swap(true, Ordering::SeqCst) {
            return;
        }
        let _delivering = DeliveryGuard(&self.inner.delivering);

        loop {
            let Some(event) = self.inner.pending.lock().pop_front() else {
                break;
            };

            // Snapshot the list so listeners may subscribe or unsubscribe re-entrantly.
            let listeners: Vec<Listener> = self
                .inner
                .listeners
                .read()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();

            for listener in listeners {
                listener(&event);
            }
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Drop every subscriber. The session itself is left as is.
    pub fn dispose(&self) {
        let _gate = self.inner.gate.lock();
        self.inner.listeners.write().clear();
        tracing::debug!(context_id = %self.inner.context_id, "Disposed session store");
    }

    pub fn snapshot(&self) -> Session {
        self.inner.session.read().clone()
    }

    /// The current epoch and session, read together.
    pub fn versioned(&self) -> (u64, Session) {
        let _gate = self.inner.gate.lock();
        (self.epoch(), self.snapshot())
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.session.read().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.session.read().refresh_token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.session.read().is_authenticated()
    }

    pub fn context_id(&self) -> ContextId {
        self.inner.context_id
    }

    pub fn persistence(&self) -> Option<&PersistenceAdapter> {
        self.inner.persistence.as_ref()
    }
}

impl Clone for SessionStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Clears the delivery flag even if a listener panics.
struct DeliveryGuard<'a>(&'a AtomicBool);

impl Drop for DeliveryGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
