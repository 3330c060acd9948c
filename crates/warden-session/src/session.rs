//! Session data structure
//!
//! ```text
//! Anonymous ──login──▶ Authenticated ──login / setTokens──▶ Authenticated
//!     ▲                      │
//!     └────────logout────────┘   (logout is valid from either state)
//! ```

use serde::{Deserialize, Serialize};

use crate::credential::fingerprint;
use crate::identity::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthState {
    /// No usable credential and identity pair
    Anonymous,
    /// Access token and identity are both present
    Authenticated,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Anonymous => "anonymous",
            AuthState::Authenticated => "authenticated",
        }
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Short-lived credential attached to outgoing requests
    pub access_token: Option<String>,
    /// Longer-lived credential, only ever sent to the refresh endpoint
    pub refresh_token: Option<String>,
    /// The signed-in user
    pub identity: Option<Identity>,
}

impl Session {
    /// The canonical empty session
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(access_token: String, refresh_token: Option<String>, identity: Identity) -> Self {
        Self {
            access_token: Some(access_token),
            refresh_token,
            identity: Some(identity),
        }
    }

    /// Derived, never stored: both an access token and an identity are present.
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some() && self.identity.is_some()
    }

    pub fn state(&self) -> AuthState {
        if self.is_authenticated() {
            AuthState::Authenticated
        } else {
            AuthState::Anonymous
        }
    }

    pub fn user_id(&self) -> Option<u64> {
        self.identity.as_ref().map(|identity| identity.id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &self.access_token.as_deref().map(fingerprint))
            .field("refresh_token", &self.refresh_token.as_deref().map(fingerprint))
            .field("identity", &self.identity)
            .finish()
    }
}
