//! The abstract identity-provider boundary: a trait returning a user
//! principal for a bearer token. A real deployment supplies an
//! implementation that calls out to whatever identity provider issues
//! those tokens; this crate ships only the extractor plumbing and a
//! local stand-in for running the server without one wired up.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use cp_base::{OrgId, UserId};
use thiserror::Error;

use crate::state::AppState;

#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub user_id: UserId,
    pub org_id: OrgId,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed authorization header")]
    Malformed,
    #[error("invalid or expired token")]
    Invalid,
}

/// Verifies a bearer token and resolves it to a [`Principal`]. The only
/// production implementation lives outside this crate, behind
/// `token_verifier_url`; see [`LocalDevVerifier`] for the stand-in this
/// binary boots with when no such implementation is supplied.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Accepts any bearer token of the form `<user_id>:<org_id>` and trusts
/// it outright. Stands in for the real Token Verifier port so the
/// server can boot and be driven end to end without an identity
/// provider wired up; never appropriate against untrusted traffic.
pub struct LocalDevVerifier;

#[async_trait]
impl TokenVerifier for LocalDevVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let (user_raw, org_raw) = token.split_once(':').ok_or(AuthError::Malformed)?;
        let user_id = user_raw.parse::<UserId>().map_err(|_| AuthError::Invalid)?;
        let org_id = org_raw.parse::<OrgId>().map_err(|_| AuthError::Invalid)?;
        Ok(Principal { user_id, org_id })
    }
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or((StatusCode::UNAUTHORIZED, "missing authorization header"))?;
        let raw = header.to_str().map_err(|_| (StatusCode::UNAUTHORIZED, "malformed authorization header"))?;
        let token = raw.strip_prefix("Bearer ").ok_or((StatusCode::UNAUTHORIZED, "expected a bearer token"))?;
        state
            .token_verifier
            .verify(token)
            .await
            .map_err(|_| (StatusCode::UNAUTHORIZED, "invalid or expired token"))
    }
}
