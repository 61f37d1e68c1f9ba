//! Caller authentication for the HTTP surface.
//!
//! The upstream gateway terminates the session and forwards the
//! authenticated user id; this service re-derives the caller's organization
//! from their profile and never trusts an organization claim off the wire.

use crate::engine::Caller;
use crate::services::Database;
use axum::http::HeaderMap;
use platform_core::error::AppError;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

pub async fn authenticate(db: &Database, headers: &HeaderMap) -> Result<Caller, AppError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing caller identity")))?;

    let user_id = Uuid::parse_str(user_id)
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Invalid caller identity")))?;

    let organization_id = db
        .organization_for_user(user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Caller has no organization")))?;

    Ok(Caller {
        user_id,
        organization_id,
    })
}
