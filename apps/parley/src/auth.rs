//! HTTP client for the relay's account endpoints.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid handle or secret")]
    InvalidCredentials,
    /// One live session per handle; a second login is refused until the
    /// first logs out or its session expires.
    #[error("this account is already logged in elsewhere")]
    SessionConflict,
    #[error("relay rejected the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Proof of a successful login. The connection token is generated fresh per
/// process and must accompany the logout so a stranger cannot release the
/// session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHandle {
    pub handle: String,
    pub connection_token: String,
}

pub struct AuthClient {
    http: reqwest::Client,
    base: String,
}

impl AuthClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn signup(&self, handle: &str, secret: &str) -> Result<(), AuthError> {
        let response = self
            .http
            .post(format!("{}/auth/signup", self.base))
            .json(&json!({ "handle": handle, "secret": secret }))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AuthError::Rejected(read_error(response).await))
        }
    }

    pub async fn login(&self, handle: &str, secret: &str) -> Result<SessionHandle, AuthError> {
        let connection_token = Uuid::new_v4().to_string();
        let response = self
            .http
            .post(format!("{}/auth/login", self.base))
            .json(&json!({
                "handle": handle,
                "secret": secret,
                "connectionToken": connection_token,
            }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(SessionHandle {
                handle: handle.to_string(),
                connection_token,
            }),
            reqwest::StatusCode::UNAUTHORIZED => Err(AuthError::InvalidCredentials),
            reqwest::StatusCode::CONFLICT => Err(AuthError::SessionConflict),
            _ => Err(AuthError::Rejected(read_error(response).await)),
        }
    }

    /// Best-effort release. The relay treats logout as idempotent, so errors
    /// here only matter for logging.
    pub async fn logout(&self, session: &SessionHandle) -> Result<(), AuthError> {
        self.http
            .post(format!("{}/auth/logout", self.base))
            .json(&json!({
                "handle": session.handle,
                "connectionToken": session.connection_token,
            }))
            .send()
            .await?;
        Ok(())
    }
}

async fn read_error(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => format!("status {status}"),
    }
}
