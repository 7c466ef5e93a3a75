//! Caller identity from request headers.
//!
//! The subject header is set by the identity layer in front of this service
//! and is trusted, but must be a plain user id. `x-admin-channel: true` marks the internal
//! management channel; it is honored only when [`ApiConfig::trust_admin_header`]
//! is on, and ignored otherwise.
//!
//! [`ApiConfig::trust_admin_header`]: crate::state::ApiConfig::trust_admin_header

use crate::error::ApiError;
use crate::state::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use custos_core::types::user_id;
use custos_core::Caller;

pub const ADMIN_CHANNEL_HEADER: &str = "x-admin-channel";

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub struct Subject(pub Caller);

#[async_trait]
impl FromRequestParts<AppState> for Subject {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let subject = parts
            .headers
            .get(&state.subject_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing subject".into()))?;
        let subject = user_id("subject", subject)?;

        let asserts_admin = parts
            .headers
            .get(ADMIN_CHANNEL_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

        let caller = match (asserts_admin, state.trust_admin_header) {
            (true, true) => Caller::admin_channel(subject),
            (true, false) => {
                tracing::warn!(%subject, path = %parts.uri.path(), "ignoring untrusted x-admin-channel header");
                Caller::user(subject)
            }
            (false, _) => Caller::user(subject),
        };
        Ok(Subject(caller))
    }
}
