use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::registry::{AuthError, SharedRegistry};
use crate::storage::StorageError;

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub handle: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub handle: String,
    pub secret: String,
    pub connection_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub handle: String,
    pub connection_token: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub struct AuthFailure {
    status: StatusCode,
    message: String,
}

impl AuthFailure {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for AuthFailure {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<AuthError> for AuthFailure {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => {
                AuthFailure::new(StatusCode::UNAUTHORIZED, "Invalid credentials")
            }
            AuthError::SessionConflict => AuthFailure::new(
                StatusCode::CONFLICT,
                "This account is already logged in elsewhere. Please log out from other sessions first.",
            ),
        }
    }
}

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn signup(
    State(registry): State<SharedRegistry>,
    Json(request): Json<SignupRequest>,
) -> Result<impl IntoResponse, AuthFailure> {
    if request.handle.is_empty() || request.secret.is_empty() {
        return Err(AuthFailure::new(
            StatusCode::BAD_REQUEST,
            "Handle and secret are required",
        ));
    }

    let mut registry = registry.lock().await;
    match registry.signup(&request.handle, &request.secret) {
        Ok(()) => Ok(Json(json!({ "success": true }))),
        Err(StorageError::DuplicateHandle) => Err(AuthFailure::new(
            StatusCode::BAD_REQUEST,
            "Handle already exists",
        )),
        Err(err) => {
            warn!(error = %err, "signup failed to persist");
            Err(AuthFailure::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error creating account",
            ))
        }
    }
}

pub async fn login(
    State(registry): State<SharedRegistry>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse, AuthFailure> {
    if request.handle.is_empty() || request.secret.is_empty() || request.connection_token.is_empty()
    {
        return Err(AuthFailure::new(
            StatusCode::BAD_REQUEST,
            "Missing required information",
        ));
    }

    let mut registry = registry.lock().await;
    registry.authenticate(&request.handle, &request.secret, &request.connection_token)?;
    Ok(Json(json!({ "success": true })))
}

/// Logout is idempotent: releasing a session that is already gone, or with a
/// token that never owned it, still reports success.
pub async fn logout(
    State(registry): State<SharedRegistry>,
    Json(request): Json<LogoutRequest>,
) -> impl IntoResponse {
    let mut registry = registry.lock().await;
    registry.release(&request.handle, &request.connection_token);
    Json(json!({ "success": true }))
}
