//! Maps every port's error type onto a shared taxonomy (transient I/O,
//! concurrency, validation, budget, rate/backpressure, permanent
//! external) and from there onto an HTTP status and a
//! `{code, message, retry_after?}` body, matching the error-frame shape
//! the Collaboration Gateway uses on its WebSocket.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] cp_orchestrator::OrchestratorError),

    #[error(transparent)]
    Store(#[from] cp_store::StoreError),

    #[error(transparent)]
    Billing(#[from] cp_billing::BillingError),

    #[error(transparent)]
    Collab(#[from] cp_collab::CollabError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Validation(String),

    #[error("not found")]
    NotFound,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<u64>) {
        use cp_billing::BillingError;
        use cp_collab::CollabError;
        use cp_orchestrator::OrchestratorError;
        use cp_store::StoreError;

        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION", None),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            ApiError::Auth(AuthError::MissingToken | AuthError::Malformed) => {
                (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", None)
            }
            ApiError::Auth(AuthError::Invalid) => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED", None),

            ApiError::Store(StoreError::RunNotFound { .. } | StoreError::SubtaskNotFound { .. }) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", None)
            }
            ApiError::Store(StoreError::ConcurrencyConflict { .. }) => {
                (StatusCode::CONFLICT, "CONCURRENCY_CONFLICT", None)
            }
            ApiError::Store(StoreError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, "INVALID_TRANSITION", None)
            }
            ApiError::Store(StoreError::FencingTokenMismatch) => {
                (StatusCode::CONFLICT, "FENCING_TOKEN_STALE", None)
            }
            ApiError::Store(StoreError::IdempotencyKeyReused { .. }) => {
                (StatusCode::CONFLICT, "IDEMPOTENCY_KEY_REUSED", None)
            }
            ApiError::Store(StoreError::Unavailable { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", None)
            }

            ApiError::Billing(BillingError::InsufficientCredits { .. }) => {
                (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_CREDITS", None)
            }
            ApiError::Billing(BillingError::RateLimited { retry_after_secs }) => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", Some(*retry_after_secs))
            }
            ApiError::Billing(BillingError::Store(inner)) => {
                return ApiError::Store(clone_store_error(inner)).parts();
            }

            ApiError::Collab(CollabError::CircuitOpen) => {
                (StatusCode::SERVICE_UNAVAILABLE, "CIRCUIT_OPEN", None)
            }
            ApiError::Collab(CollabError::RateLimited { retry_after_secs }) => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", Some(*retry_after_secs))
            }
            ApiError::Collab(CollabError::ConnectionNotFound { .. } | CollabError::NotInDocument { .. }) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", None)
            }
            ApiError::Collab(CollabError::MalformedMessage { .. }) => {
                (StatusCode::BAD_REQUEST, "VALIDATION", None)
            }
            ApiError::Collab(CollabError::Ot(_)) => (StatusCode::CONFLICT, "OT_CONFLICT", None),
            ApiError::Collab(CollabError::Redis(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SYNC_UNAVAILABLE", None)
            }

            ApiError::Orchestrator(
                OrchestratorError::RunNotFound { .. }
                | OrchestratorError::SubtaskNotFound { .. }
                | OrchestratorError::NoSandboxReserved { .. },
            ) => (StatusCode::NOT_FOUND, "NOT_FOUND", None),
            ApiError::Orchestrator(OrchestratorError::EmptyPlan { .. }) => {
                (StatusCode::BAD_REQUEST, "VALIDATION", None)
            }
            ApiError::Orchestrator(OrchestratorError::NotLeaseHolder { .. }) => {
                (StatusCode::CONFLICT, "FENCING_TOKEN_STALE", None)
            }
            ApiError::Orchestrator(OrchestratorError::Store(inner)) => {
                return ApiError::Store(clone_store_error(inner)).parts();
            }
            ApiError::Orchestrator(OrchestratorError::Billing(inner)) => {
                return ApiError::Billing(clone_billing_error(inner)).parts();
            }
            ApiError::Orchestrator(
                OrchestratorError::State(_) | OrchestratorError::Queue(_) | OrchestratorError::Sandbox(_),
            ) => (StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT", None),
        }
    }
}

/// `thiserror` sources aren't `Clone`; the taxonomy mapping above only
/// needs the discriminant, not the original error, once it recurses
/// into a wrapped `StoreError`/`BillingError`.
fn clone_store_error(err: &cp_store::StoreError) -> cp_store::StoreError {
    use cp_store::StoreError::*;
    match err {
        RunNotFound { run_id } => RunNotFound { run_id: run_id.clone() },
        SubtaskNotFound { subtask_id } => SubtaskNotFound { subtask_id: subtask_id.clone() },
        InvalidTransition { from, to } => InvalidTransition { from: from.clone(), to: to.clone() },
        ConcurrencyConflict { expected, actual } => ConcurrencyConflict { expected: *expected, actual: *actual },
        FencingTokenMismatch => FencingTokenMismatch,
        IdempotencyKeyReused { key } => IdempotencyKeyReused { key: key.clone() },
        Unavailable { reason } => Unavailable { reason: reason.clone() },
    }
}

fn clone_billing_error(err: &cp_billing::BillingError) -> cp_billing::BillingError {
    use cp_billing::BillingError::*;
    match err {
        Store(inner) => Store(clone_store_error(inner)),
        InsufficientCredits { available, requested } => {
            InsufficientCredits { available: *available, requested: *requested }
        }
        RateLimited { retry_after_secs } => RateLimited { retry_after_secs: *retry_after_secs },
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, retry_after) = self.parts();
        if status.is_server_error() || status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!(error = %self, code, "request failed");
        }
        let body = ErrorBody { code, message: self.to_string(), retry_after };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after
            && let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
