use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

pub const ADMIN_ROLES: &[&str] = &["admin", "super_admin"];

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        ADMIN_ROLES.contains(&self.role.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

/// Establishes the caller identity. Tokens are minted upstream; this service
/// verifies the signature and trusts the claims as-is.
pub fn require_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AppError> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user) = dev_override_user(headers) {
            return Ok(user);
        }
    }

    let token = bearer_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token.".to_string()))?;

    let secret = state
        .config
        .auth_jwt_secret
        .as_deref()
        .ok_or_else(|| AppError::Dependency("AUTH_JWT_SECRET is not configured.".to_string()))?;

    let validation = Validation::new(Algorithm::HS256);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|error| AppError::Unauthorized(format!("Invalid bearer token: {error}")))?;

    Ok(AuthUser {
        id: data.claims.sub,
        email: data.claims.email,
        role: data.claims.role.unwrap_or_else(|| "customer".to_string()),
    })
}

pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, AppError> {
    let user = require_user(state, headers)?;
    if !user.is_admin() {
        return Err(AppError::Forbidden("Admin access required.".to_string()));
    }
    Ok(user)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn dev_override_user(headers: &HeaderMap) -> Option<AuthUser> {
    let id = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())?;
    let role = headers
        .get("x-user-role")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("customer");
    Some(AuthUser {
        id: id.to_string(),
        email: None,
        role: role.to_string(),
    })
}
