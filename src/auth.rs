use crate::error::{AppError, RelayError};
use crate::users::{User, UserRepository};
use axum::http::{HeaderMap, StatusCode};

pub const ACCESS_TOKEN_HEADER: &str = "access-token";

pub fn access_token(headers: &HeaderMap) -> &str {
    headers
        .get(ACCESS_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
}

/// Resolves the caller's user, rejecting unknown tokens and expired licenses.
pub async fn authenticate(
    users: &dyn UserRepository,
    token: &str,
    now: i64,
) -> Result<User, RelayError> {
    if token.is_empty() {
        return Err(RelayError::Auth);
    }
    let user = users.get(token).await.ok_or(RelayError::Auth)?;
    if user.is_expired_at(now) {
        return Err(RelayError::LicenseExpired);
    }
    Ok(user)
}

pub fn require_admin(user: &User) -> Result<(), AppError> {
    if user.admin {
        Ok(())
    } else {
        Err(AppError::new(StatusCode::FORBIDDEN, "no_permission", "no permission")
            .with_type("permission_error"))
    }
}
