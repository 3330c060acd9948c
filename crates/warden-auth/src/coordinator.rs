//! Credential Refresh Coordinator
//!
//! Single-flight renewal of the access token. The first caller to notice an
//! expired token starts one refresh call; everyone arriving while it is pending
//! attaches to the same shared result instead of starting another. Starting a
//! second refresh would send a refresh token the first one is about to rotate.
//!
//! A refresh belongs to the session epoch it was started in. Any transition that
//! replaces the session (login, logout, a change from another context) retires
//! the in-flight marker, and the refresh result is then discarded instead of
//! being applied to a session it was never meant for.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use warden_session::{fingerprint, SessionStore, SubscriptionId};

use crate::backend::{AuthBackend, TokenGrant};
use crate::error::AuthError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no refresh token")]
    MissingRefreshToken,

    #[error("refresh rejected: {0}")]
    Rejected(String),

    #[error("refresh request failed: {0}")]
    Network(String),

    #[error("session changed while refreshing")]
    Superseded,
}

impl RefreshFailure {
    fn from_error(error: &AuthError) -> Self {
        match error {
            AuthError::Network(e) => RefreshFailure::Network(e.to_string()),
            AuthError::Rejected { message, .. } => RefreshFailure::Rejected(message.clone()),
            other => RefreshFailure::Rejected(other.to_string()),
        }
    }
}

/// New access token on success; shared by every caller of one refresh.
pub type RefreshOutcome = std::result::Result<String, RefreshFailure>;

type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
    generation: u64,
    epoch: u64,
    outcome: PendingRefresh,
}

struct Inner {
    store: SessionStore,
    backend: Arc<dyn AuthBackend>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    next_generation: AtomicU64,
    subscription: SubscriptionId,
}

pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(store: SessionStore, backend: Arc<dyn AuthBackend>) -> Self {
        let in_flight: Arc<Mutex<Option<InFlight>>> = Arc::new(Mutex::new(None));

        let marker = Arc::clone(&in_flight);
        let subscription = store.subscribe(move |event| {
            if event.transition.replaces_session() {
                if let Some(retired) = marker.lock().take() {
                    tracing::debug!(
                        generation = retired.generation,
                        transition = %event.transition,
                        "Retired in-flight refresh"
                    );
                }
            }
        });

        Self {
            inner: Arc::new(Inner {
                store,
                backend,
                in_flight,
                next_generation: AtomicU64::new(1),
                subscription,
            }),
        }
    }

    /// Renew the access token, joining a refresh already in flight if there is one.
    ///
    /// Must be called from within a tokio runtime: the refresh itself runs as a
    /// spawned task so it completes even if every caller goes away.
    pub async fn refresh(&self) -> RefreshOutcome {
        // Read the session before taking the marker lock: transitions hold the
        // store gate while they retire the marker.
        let (epoch, session) = self.inner.store.versioned();

        let pending = {
            let mut slot = self.inner.in_flight.lock();

            let joinable = slot
                .as_ref()
                .filter(|current| current.epoch == epoch)
                .map(|current| (current.generation, current.outcome.clone()));

            match joinable {
                Some((generation, outcome)) => {
                    tracing::debug!(generation, "Joining in-flight refresh");
                    outcome
                }
                None => {
                    let in_flight = self.start(epoch, session.refresh_token);
                    let outcome = in_flight.outcome.clone();
                    *slot = Some(in_flight);
                    outcome
                }
            }
        };

        pending.await
    }

    /// Whether a refresh is currently pending.
    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    fn start(&self, epoch: u64, refresh_token: Option<String>) -> InFlight {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        tracing::info!(generation, epoch, "Starting credential refresh");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.run(generation, epoch, refresh_token).await });

        let outcome = async move {
            task.await
                .unwrap_or_else(|e| Err(RefreshFailure::Network(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared();

        InFlight {
            generation,
            epoch,
            outcome,
        }
    }

    /// Stop following session transitions.
    pub fn dispose(&self) {
        self.inner.store.unsubscribe(self.inner.subscription);
        self.inner.in_flight.lock().take();
    }
}

impl Inner {
    async fn run(&self, generation: u64, epoch: u64, refresh_token: Option<String>) -> RefreshOutcome {
        let result = match refresh_token {
            None => Err(RefreshFailure::MissingRefreshToken),
            Some(token) => {
                tracing::debug!(generation, refresh_token = %fingerprint(&token), "Calling refresh endpoint");
                self.backend
                    .refresh(&token)
                    .await
                    .map_err(|e| RefreshFailure::from_error(&e))
            }
        };

        let outcome = self.resolve(generation, epoch, result);

        // Release the marker only if it is still ours; a newer refresh may own it.
        let mut slot = self.in_flight.lock();
        if slot.as_ref().map(|f| f.generation) == Some(generation) {
            *slot = None;
        }

        outcome
    }

    fn resolve(
        &self,
        generation: u64,
        epoch: u64,
        result: std::result::Result<TokenGrant, RefreshFailure>,
    ) -> RefreshOutcome {
        let still_current = self
            .in_flight
            .lock()
            .as_ref()
            .is_some_and(|f| f.generation == generation);

        if !still_current {
            tracing::info!(generation, "Discarding result of a retired refresh");
            return Err(RefreshFailure::Superseded);
        }

        match result {
            Ok(grant) => {
                match self
                    .store
                    .set_tokens_if_epoch(epoch, grant.access_token.clone(), grant.refresh_token)
                {
                    Ok(Some(_)) => {
                        tracing::info!(
                            generation,
                            access_token = %fingerprint(&grant.access_token),
                            expires_at = ?grant.expires_at,
                            "Credential refresh succeeded"
                        );
                        Ok(grant.access_token)
                    }
                    Ok(None) => Err(RefreshFailure::Superseded),
                    Err(e) => {
                        tracing::warn!(generation, error = %e, "Refresh returned unusable tokens");
                        self.store.logout_if_epoch(epoch);
                        Err(RefreshFailure::Rejected(e.to_string()))
                    }
                }
            }
            Err(failure) => {
                if self.store.logout_if_epoch(epoch) {
                    tracing::warn!(generation, error = %failure, "Credential refresh failed, logged out");
                    Err(failure)
                } else {
                    Err(RefreshFailure::Superseded)
                }
            }
        }
    }
}

impl Clone for RefreshCoordinator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LoginRequest;
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;
    use warden_session::{Identity, RoleRef, Session};

    /// Backend whose refresh endpoint can be held open and scripted to fail.
    struct ScriptedBackend {
        calls: AtomicUsize,
        hold: bool,
        release: Notify,
        fail_with: Option<u16>,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                hold: false,
                release: Notify::new(),
                fail_with: None,
            }
        }

        fn held() -> Self {
            Self {
                hold: true,
                ..Self::new()
            }
        }

        fn failing(status: u16) -> Self {
            Self {
                fail_with: Some(status),
                ..Self::new()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AuthBackend for ScriptedBackend {
        async fn login(&self, _request: &LoginRequest) -> crate::Result<TokenGrant> {
            unreachable!("login is not used by the coordinator")
        }

        async fn refresh(&self, refresh_token: &str) -> crate::Result<TokenGrant> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.hold {
                self.release.notified().await;
            }
            if let Some(status) = self.fail_with {
                return Err(AuthError::Rejected {
                    status,
                    message: "invalid refresh token".to_string(),
                });
            }
            Ok(TokenGrant {
                access_token: format!("AT_NEW_{call}"),
                refresh_token: format!("{refresh_token}_rotated"),
                expires_at: None,
                user: None,
            })
        }

        async fn logout(&self, _access_token: &str) -> crate::Result<()> {
            Ok(())
        }
    }

    fn identity() -> Identity {
        Identity {
            id: 1,
            email: "test@example.com".to_string(),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            role: RoleRef {
                id: 1,
                name: "User".to_string(),
            },
            is_active: true,
        }
    }

    fn signed_in_store() -> SessionStore {
        let store = SessionStore::in_memory();
        store.login("AT_OLD", "RT1", identity()).unwrap();
        store
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_call() {
        let store = signed_in_store();
        let backend = Arc::new(ScriptedBackend::new());
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone());

        let outcomes = join_all((0..3).map(|_| coordinator.refresh())).await;

        assert_eq!(backend.calls(), 1);
        for outcome in outcomes {
            assert_eq!(outcome, Ok("AT_NEW_1".to_string()));
        }
        assert_eq!(store.access_token().as_deref(), Some("AT_NEW_1"));
        assert_eq!(store.refresh_token().as_deref(), Some("RT1_rotated"));
        assert_eq!(store.snapshot().identity, Some(identity()));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_late_joiners_attach_to_pending_refresh() {
        let store = signed_in_store();
        let backend = Arc::new(ScriptedBackend::held());
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone());

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        wait_for(|| backend.calls() == 1).await;
        assert!(coordinator.is_refreshing());

        let joiners: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.refresh().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        backend.release.notify_one();

        assert_eq!(first.await.unwrap(), Ok("AT_NEW_1".to_string()));
        for joiner in joiners {
            assert_eq!(joiner.await.unwrap(), Ok("AT_NEW_1".to_string()));
        }
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_sequential_expiries_refresh_again() {
        let store = signed_in_store();
        let backend = Arc::new(ScriptedBackend::new());
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone());

        assert_eq!(coordinator.refresh().await, Ok("AT_NEW_1".to_string()));
        assert_eq!(coordinator.refresh().await, Ok("AT_NEW_2".to_string()));
        assert_eq!(backend.calls(), 2);
        assert_eq!(store.refresh_token().as_deref(), Some("RT1_rotated_rotated"));
    }

    #[tokio::test]
    async fn test_rejected_refresh_logs_out_every_caller() {
        let store = signed_in_store();
        let backend = Arc::new(ScriptedBackend::failing(401));
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone());

        let outcomes = join_all((0..3).map(|_| coordinator.refresh())).await;

        assert_eq!(backend.calls(), 1);
        for outcome in outcomes {
            assert_eq!(
                outcome,
                Err(RefreshFailure::Rejected("invalid refresh token".to_string()))
            );
        }
        assert_eq!(store.snapshot(), Session::anonymous());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_logs_out_without_calling_backend() {
        let store = SessionStore::in_memory();
        store.login("AT_OLD", "", identity()).unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone());

        assert_eq!(coordinator.refresh().await, Err(RefreshFailure::MissingRefreshToken));
        assert_eq!(backend.calls(), 0);
        assert!(!store.is_authenticated());
    }

    #[tokio::test]
    async fn test_logout_during_refresh_is_not_undone() {
        let store = signed_in_store();
        let backend = Arc::new(ScriptedBackend::held());
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone());

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        wait_for(|| backend.calls() == 1).await;

        store.logout();
        assert!(!coordinator.is_refreshing());

        backend.release.notify_one();
        assert_eq!(pending.await.unwrap(), Err(RefreshFailure::Superseded));
        assert_eq!(store.snapshot(), Session::anonymous());
    }

    #[tokio::test]
    async fn test_failed_refresh_does_not_log_out_newer_session() {
        let store = signed_in_store();
        let backend = Arc::new(ScriptedBackend {
            hold: true,
            ..ScriptedBackend::failing(401)
        });
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone());

        let pending = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        wait_for(|| backend.calls() == 1).await;

        // The user signs in again while the old refresh is still out.
        store.login("AT_FRESH", "RT_FRESH", identity()).unwrap();

        backend.release.notify_one();
        assert_eq!(pending.await.unwrap(), Err(RefreshFailure::Superseded));
        assert!(store.is_authenticated());
        assert_eq!(store.access_token().as_deref(), Some("AT_FRESH"));
    }

    #[tokio::test]
    async fn test_refresh_after_logout_starts_fresh() {
        let store = signed_in_store();
        let backend = Arc::new(ScriptedBackend::held());
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone());

        let stale = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        wait_for(|| backend.calls() == 1).await;

        store.logout();
        store.login("AT_2", "RT_2", identity()).unwrap();

        let fresh = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh().await }
        });
        wait_for(|| backend.calls() == 2).await;

        backend.release.notify_one();
        backend.release.notify_one();

        assert_eq!(stale.await.unwrap(), Err(RefreshFailure::Superseded));
        let fresh = fresh.await.unwrap().unwrap();
        assert!(fresh.starts_with("AT_NEW_"));
        assert_eq!(store.access_token().as_deref(), Some(fresh.as_str()));
        assert_eq!(store.refresh_token().as_deref(), Some("RT_2_rotated"));
    }

    #[tokio::test]
    async fn test_dispose_stops_following_transitions() {
        let store = signed_in_store();
        let backend = Arc::new(ScriptedBackend::new());
        let coordinator = RefreshCoordinator::new(store.clone(), backend.clone());

        coordinator.dispose();
        store.logout();
        assert!(!coordinator.is_refreshing());
    }
}
