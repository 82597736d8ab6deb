//! HTTP endpoints.
//!
//! - `POST /v1/verify` verifies a payment and issues a credential.
//! - `POST /v1/session/validate`, `/start`, `/commit`, `/rollback` drive a credential's quota.
//! - `GET /health` reports liveness and mode.
//!
//! Verify responses always carry the resolved request id, in the body and in the
//! `X-Request-ID` header. The id comes from the body's `request_id`, then the `X-Request-ID`
//! header, then a generated value.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

use crate::chain::PaymentVerifier;
use crate::proto::{
    ErrorResponse, HealthResponse, SessionAckResponse, SessionRequest, SessionStartResponse,
    SessionValidateResponse, VerifyRequest, VerifyResponse,
};
use crate::request_id::{RequestId, RequestIdGenerator, RequestIdLayer, X_REQUEST_ID};
use crate::timestamp::UnixTimestamp;
use crate::verification::{VerificationService, VerifyError};

/// Shared state of the HTTP layer.
#[derive(Debug)]
pub struct AppState<V> {
    pub service: VerificationService<V>,
    /// Deployment environment name, reported by `/health`.
    pub environment: String,
}

pub fn routes<V>() -> Router<Arc<AppState<V>>>
where
    V: PaymentVerifier + Send + Sync + 'static,
{
    Router::new()
        .route("/v1/verify", post(post_verify::<V>))
        .route("/v1/session/validate", post(post_session_validate::<V>))
        .route("/v1/session/start", post(post_session_start::<V>))
        .route("/v1/session/commit", post(post_session_commit::<V>))
        .route("/v1/session/rollback", post(post_session_rollback::<V>))
        .route("/health", get(get_health::<V>))
        .layer(RequestIdLayer::new(RequestIdGenerator::default()))
}

/// `GET /health`
#[instrument(skip_all)]
pub async fn get_health<V>(State(state): State<Arc<AppState<V>>>) -> Json<HealthResponse>
where
    V: PaymentVerifier,
{
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        environment: state.environment.clone(),
        mock_verify: state.service.settings().mock_verify,
        timestamp: UnixTimestamp::now(),
    })
}

/// `POST /v1/verify`
#[instrument(skip_all)]
pub async fn post_verify<V>(
    State(state): State<Arc<AppState<V>>>,
    Extension(header_id): Extension<RequestId>,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Response
where
    V: PaymentVerifier + Send + Sync,
{
    let started_at = Instant::now();
    let (request_id, result) = match body {
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected verify body");
            let request_id = header_id.0;
            let response = VerifyResponse::failure(
                "invalid_request_body",
                "Invalid request body".to_string(),
                false,
                request_id.clone(),
            );
            (request_id, Err((StatusCode::BAD_REQUEST, response)))
        }
        Ok(Json(request)) => {
            let request_id = match request.request_id.trim() {
                "" => header_id.0,
                body_id => body_id.to_string(),
            };
            let result = state
                .service
                .verify(&request, &request_id)
                .await
                .map(|outcome| {
                    VerifyResponse::success(
                        outcome.message(),
                        outcome.credential,
                        request_id.clone(),
                    )
                })
                .map_err(|error| verify_error_response(&error, request_id.clone()));
            (request_id, result)
        }
    };

    let (status, body) = match result {
        Ok(response) => (StatusCode::OK, response),
        Err((status, response)) => (status, response),
    };
    let outcome = if body.valid { "success" } else { "error" };
    let latency_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(
        request_id = %request_id,
        status = status.as_u16(),
        code = body.code.as_deref().unwrap_or("ok"),
        outcome,
        latency_ms,
        "Verify request completed"
    );

    let mut response = (status, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), value);
    }
    response
}

fn verify_error_response(error: &VerifyError, request_id: String) -> (StatusCode, VerifyResponse) {
    let status = match error {
        VerifyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        VerifyError::AlreadyUsed | VerifyError::Verification(_) => StatusCode::FORBIDDEN,
        VerifyError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let response = VerifyResponse::failure(
        error.code(),
        error.to_string(),
        error.retryable(),
        request_id,
    );
    (status, response)
}

/// Extracts a non-blank token from a session body.
fn session_token(body: Result<Json<SessionRequest>, JsonRejection>) -> Result<String, Response> {
    let message = match body {
        Ok(Json(request)) if !request.token.trim().is_empty() => {
            return Ok(request.token.trim().to_string());
        }
        Ok(_) => "token is required".to_string(),
        Err(rejection) => rejection.body_text(),
    };
    Err((
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            code: "invalid_request".to_string(),
            message,
        }),
    )
        .into_response())
}

/// `POST /v1/session/validate`
#[instrument(skip_all)]
pub async fn post_session_validate<V>(
    State(state): State<Arc<AppState<V>>>,
    body: Result<Json<SessionRequest>, JsonRejection>,
) -> Response
where
    V: PaymentVerifier + Send + Sync,
{
    let token = match session_token(body) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let valid = state.service.validate_session(&token).await;
    Json(SessionValidateResponse { valid }).into_response()
}

/// `POST /v1/session/start`: reserves one unit of quota.
#[instrument(skip_all)]
pub async fn post_session_start<V>(
    State(state): State<Arc<AppState<V>>>,
    body: Result<Json<SessionRequest>, JsonRejection>,
) -> Response
where
    V: PaymentVerifier + Send + Sync,
{
    let token = match session_token(body) {
        Ok(token) => token,
        Err(response) => return response,
    };
    let started = state.service.start_session_request(&token).await;
    Json(SessionStartResponse { started }).into_response()
}

/// `POST /v1/session/commit`
#[instrument(skip_all)]
pub async fn post_session_commit<V>(
    State(state): State<Arc<AppState<V>>>,
    body: Result<Json<SessionRequest>, JsonRejection>,
) -> Response
where
    V: PaymentVerifier + Send + Sync,
{
    let token = match session_token(body) {
        Ok(token) => token,
        Err(response) => return response,
    };
    state.service.commit_session_request(&token).await;
    Json(SessionAckResponse { ok: true }).into_response()
}

/// `POST /v1/session/rollback`: refunds the reserved unit.
#[instrument(skip_all)]
pub async fn post_session_rollback<V>(
    State(state): State<Arc<AppState<V>>>,
    body: Result<Json<SessionRequest>, JsonRejection>,
) -> Response
where
    V: PaymentVerifier + Send + Sync,
{
    let token = match session_token(body) {
        Ok(token) => token,
        Err(response) => return response,
    };
    state.service.rollback_session_request(&token).await;
    Json(SessionAckResponse { ok: true }).into_response()
}
