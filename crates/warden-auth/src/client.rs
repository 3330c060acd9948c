//! Request layer
//!
//! What the rest of the application talks to: reads the current credential for
//! outgoing requests, turns a rejected request into (at most) one retry after a
//! coordinated refresh, and exposes sign-in / sign-out on top of the store.

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use std::sync::Arc;

use warden_session::{fingerprint, Identity, Session, SessionEvent, SessionStore, SubscriptionId};

use crate::backend::{AuthBackend, LoginRequest};
use crate::coordinator::{RefreshCoordinator, RefreshFailure};
use crate::error::AuthError;
use crate::Result;

pub struct AuthClient {
    http: reqwest::Client,
    store: SessionStore,
    backend: Arc<dyn AuthBackend>,
    coordinator: RefreshCoordinator,
}

impl AuthClient {
    pub fn new(http: reqwest::Client, store: SessionStore, backend: Arc<dyn AuthBackend>) -> Self {
        let coordinator = RefreshCoordinator::new(store.clone(), Arc::clone(&backend));
        Self {
            http,
            store,
            backend,
            coordinator,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// The access token to attach to the next request, if any.
    pub fn get_credential(&self) -> Option<String> {
        self.store.access_token()
    }

    /// Attach the current credential as a bearer token; anonymous requests carry none.
    pub fn authorize(&self, request: &mut reqwest::Request) {
        let headers = request.headers_mut();
        headers.remove(AUTHORIZATION);

        let Some(token) = self.get_credential() else {
            return;
        };

        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Err(e) => tracing::warn!(
                access_token = %fingerprint(&token),
                error = %e,
                "Access token is not a valid header value"
            ),
        }
    }

    /// Handle a 401 for `original`: renew the credential through the coordinator
    /// and return the request re-stamped for its single retry.
    ///
    /// If the credential already changed since `original` was sent (another
    /// request refreshed it meanwhile), no new refresh is started.
    pub async fn on_unauthenticated_response(
        &self,
        mut original: reqwest::Request,
    ) -> Result<reqwest::Request> {
        let sent_with = bearer_token(&original);

        if sent_with.is_none() {
            // Sent anonymously; there is nothing to renew.
            return Err(AuthError::Unauthenticated);
        }

        let current = self.get_credential();
        let renewed_meanwhile = current.is_some() && current != sent_with;

        let mut superseded = false;
        if !renewed_meanwhile {
            match self.coordinator.refresh().await {
                Ok(_) => {}
                Err(RefreshFailure::Superseded) => {
                    // The session moved on while refreshing; retry with whatever it holds now.
                    tracing::debug!(url = %original.url(), "Refresh superseded, using current credential");
                    superseded = true;
                }
                Err(failure) => {
                    tracing::info!(
                        url = %original.url(),
                        error = %failure,
                        "Request rejected and credential could not be renewed"
                    );
                    return Err(AuthError::RefreshExpired(failure));
                }
            }
        }

        self.authorize(&mut original);
        match bearer_token(&original) {
            None => Err(AuthError::Unauthenticated),
            Some(token) if superseded && Some(&token) == sent_with.as_ref() => {
                Err(AuthError::Unauthenticated)
            }
            Some(_) => Ok(original),
        }
    }

    /// Send `request` with the current credential, renewing it and retrying
    /// once if the server rejects it as unauthenticated.
    pub async fn execute(&self, mut request: reqwest::Request) -> Result<reqwest::Response> {
        self.authorize(&mut request);
        let replay = request.try_clone();
        let url = request.url().clone();

        let response = self.http.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!(url = %url, "Request rejected as unauthenticated");

        let retry = match replay {
            Some(replay) => self.on_unauthenticated_response(replay).await?,
            None => {
                // Still renew so later requests succeed, but this one cannot be resent.
                match self.coordinator.refresh().await {
                    Err(failure) if failure != RefreshFailure::Superseded => {
                        return Err(AuthError::RefreshExpired(failure));
                    }
                    _ => return Err(AuthError::NotReplayable),
                }
            }
        };

        let response = self.http.execute(retry).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(url = %url, "Request rejected again after credential renewal");
            return Err(AuthError::Unauthenticated);
        }

        Ok(response)
    }

    /// Exchange email and password for a session.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };

        let grant = match self.backend.login(&request).await {
            Ok(grant) => grant,
            Err(e) => {
                tracing::info!(email = %email, error = %e, "Sign-in failed");
                return Err(e);
            }
        };

        let user = grant
            .user
            .ok_or_else(|| AuthError::MalformedResponse("login response has no user".to_string()))?;

        Ok(self
            .store
            .login(grant.access_token, grant.refresh_token, user.into())?)
    }

    pub fn login(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        identity: Identity,
    ) -> Result<Session> {
        Ok(self.store.login(access_token, refresh_token, identity)?)
    }

    /// Tell the server, then drop the local session whatever the server says.
    pub async fn sign_out(&self) -> Session {
        if let Some(token) = self.get_credential() {
            if let Err(e) = self.backend.logout(&token).await {
                tracing::debug!(error = %e, "Server-side logout failed");
            }
        }
        self.logout()
    }

    pub fn logout(&self) -> Session {
        self.store.logout()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn dispose(&self) {
        self.coordinator.dispose();
    }
}

fn bearer_token(request: &reqwest::Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}
