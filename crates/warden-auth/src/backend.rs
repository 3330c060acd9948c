//! Admin API authentication endpoints

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use warden_session::{Identity, RoleRef};

use crate::error::AuthError;
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleResponse {
    pub id: u64,
    pub name: String,
}

/// User record as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct UserResponse {
    pub id: u64,
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub role: RoleResponse,
    pub is_active: bool,
}

impl From<UserResponse> for Identity {
    fn from(user: UserResponse) -> Self {
        Identity {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            role: RoleRef {
                id: user.role.id,
                name: user.role.name,
            },
            is_active: user.is_active,
        }
    }
}

/// Credentials issued by the login and refresh endpoints.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry of the access token, when the server reports it
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user: Option<UserResponse>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &warden_session::fingerprint(&self.access_token))
            .field("refresh_token", &warden_session::fingerprint(&self.refresh_token))
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

/// The credential-issuing side of the admin API.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> Result<TokenGrant>;

    /// Exchange a refresh token for a new token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    async fn logout(&self, access_token: &str) -> Result<()>;
}

/// Response wrapper used by every API endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
    error: Option<String>,
}

pub struct HttpAuthBackend {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpAuthBackend {
    /// `base_url` is the API root, e.g. `http://localhost:8080/api/`.
    pub fn new(http: reqwest::Client, base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn post<B, T>(&self, path: &str, body: &B, bearer: Option<&str>) -> Result<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let mut request = self.http.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        parse_envelope(status, &text)
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, request: &LoginRequest) -> Result<TokenGrant> {
        let grant: Option<TokenGrant> = match self.post("auth/login", request, None).await {
            Err(AuthError::Rejected { status: 400 | 401 | 403, message }) => {
                return Err(AuthError::InvalidCredentials(message));
            }
            other => other?,
        };

        let grant = grant.ok_or_else(|| AuthError::MalformedResponse("login response has no data".to_string()))?;
        if grant.user.is_none() {
            return Err(AuthError::MalformedResponse("login response has no user".to_string()));
        }

        tracing::debug!(
            base_url = %self.base_url,
            expires_at = ?grant.expires_at,
            "Login endpoint issued tokens"
        );

        Ok(grant)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let grant: Option<TokenGrant> = self
            .post("auth/refresh", &RefreshRequest { refresh_token }, None)
            .await?;

        grant.ok_or_else(|| AuthError::MalformedResponse("refresh response has no data".to_string()))
    }

    async fn logout(&self, access_token: &str) -> Result<()> {
        let _: Option<serde_json::Value> = self
            .post("auth/logout", &serde_json::json!({}), Some(access_token))
            .await?;
        Ok(())
    }
}

/// Unwrap the API envelope of a response with the given status and body.
fn parse_envelope<T: DeserializeOwned>(status: u16, body: &str) -> Result<Option<T>> {
    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<Envelope<serde_json::Value>>(body)
            .ok()
            .map(|envelope| {
                if envelope.message.is_empty() {
                    envelope.error.unwrap_or_default()
                } else {
                    envelope.message
                }
            })
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| format!("HTTP {}", status));

        return Err(AuthError::Rejected { status, message });
    }

    let envelope: Envelope<T> =
        serde_json::from_str(body).map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

    if !envelope.success {
        return Err(AuthError::Rejected {
            status,
            message: envelope.message,
        });
    }

    Ok(envelope.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_BODY: &str = r#"{
        "success": true,
        "message": "Login successful",
        "data": {
            "access_token": "access123",
            "refresh_token": "refresh123",
            "expires_at": "2026-10-17T12:00:00.123456789Z",
            "user": {
                "id": 1,
                "email": "test@example.com",
                "username": "testuser",
                "first_name": "Test",
                "last_name": "User",
                "role": {"id": 1, "name": "User", "permissions": []},
                "is_active": true,
                "created_at": "2026-01-01T00:00:00Z",
                "last_login_at": null
            }
        }
    }"#;

    #[test]
    fn test_parse_login_envelope() {
        let grant: TokenGrant = parse_envelope(200, LOGIN_BODY).unwrap().unwrap();
        assert_eq!(grant.access_token, "access123");
        assert_eq!(grant.refresh_token, "refresh123");
        assert!(grant.expires_at.is_some());

        let identity: Identity = grant.user.unwrap().into();
        assert_eq!(identity.id, 1);
        assert_eq!(identity.first_name, "Test");
        assert_eq!(identity.role.name, "User");
        assert!(identity.is_active);
    }

    #[test]
    fn test_parse_error_envelope() {
        let body = r#"{"success":false,"error":"login_failed","message":"invalid credentials"}"#;
        let err = parse_envelope::<TokenGrant>(401, body).unwrap_err();
        match err {
            AuthError::Rejected { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "invalid credentials");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_non_json_error() {
        let err = parse_envelope::<TokenGrant>(502, "Bad Gateway").unwrap_err();
        assert!(matches!(err, AuthError::Rejected { status: 502, ref message } if message == "HTTP 502"));
    }

    #[test]
    fn test_parse_success_without_data() {
        let body = r#"{"success":true,"message":"Logout successful","data":null}"#;
        let data: Option<serde_json::Value> = parse_envelope(200, body).unwrap();
        assert!(data.is_none());
    }

    #[test]
    fn test_parse_malformed_success_body() {
        let err = parse_envelope::<TokenGrant>(200, "{").unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let backend = HttpAuthBackend::new(reqwest::Client::new(), "http://localhost:8080/api").unwrap();
        assert_eq!(
            backend.endpoint("auth/login").unwrap().as_str(),
            "http://localhost:8080/api/auth/login"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let err = HttpAuthBackend::new(reqwest::Client::new(), "not a url").err().unwrap();
        assert!(matches!(err, AuthError::InvalidUrl(_)));
    }

    #[test]
    fn test_token_grant_debug_hides_tokens() {
        let grant: TokenGrant = parse_envelope(200, LOGIN_BODY).unwrap().unwrap();
        let debug = format!("{:?}", grant);
        assert!(!debug.contains("access123"));
        assert!(!debug.contains("refresh123"));
    }
}
