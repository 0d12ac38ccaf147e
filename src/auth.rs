//! Thin actor-extraction boundary.
//!
//! Authentication itself (credential checks, token issuance and
//! verification) happens upstream; by the time a request reaches this
//! service the edge proxy has already validated the caller and stamped
//! identity headers. This module only reads those headers into a typed
//! actor so ownership checks in the services have something to work with.

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::errors::ServiceError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub is_admin: bool,
}

impl AuthUser {
    /// Whether this actor may act on a resource owned by `owner`.
    pub fn can_act_on(&self, owner: Uuid) -> bool {
        self.is_admin || self.user_id == owner
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| ServiceError::Unauthorized("Authentication required".to_string()))?;

        let is_admin = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("admin"))
            .unwrap_or(false);

        Ok(AuthUser { user_id, is_admin })
    }
}
