//! JSON bodies of the HTTP API.
//!
//! Field names are snake_case. Empty optional fields are omitted from responses.

use serde::{Deserialize, Serialize};

use crate::timestamp::UnixTimestamp;

/// Body of `POST /v1/verify`.
///
/// Every field defaults when absent. `amount` is also accepted under its older name
/// `amount_wei`. A `chain_id` or `min_confirmations` of zero counts as not given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub tx_hash: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub recipient: String,
    /// Decimal wei.
    #[serde(default, alias = "amount_wei")]
    pub amount: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confirmations: Option<u64>,
}

/// Response of `POST /v1/verify`, for both success and failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub message: String,
    /// The issued credential. Clients send it back as `token` on session calls.
    #[serde(rename = "token", default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub retryable: bool,
    pub request_id: String,
}

impl VerifyResponse {
    pub fn success(message: &str, credential: String, request_id: String) -> Self {
        Self {
            valid: true,
            message: message.to_string(),
            credential: Some(credential),
            code: None,
            retryable: false,
            request_id,
        }
    }

    pub fn failure(code: &str, message: String, retryable: bool, request_id: String) -> Self {
        Self {
            valid: false,
            message,
            credential: None,
            code: Some(code.to_string()),
            retryable,
            request_id,
        }
    }
}

/// Body of every `POST /v1/session/*` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionValidateResponse {
    pub valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartResponse {
    pub started: bool,
}

/// Response of commit and rollback. Both always answer `ok: true`; a call that finds no pending
/// reservation is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAckResponse {
    pub ok: bool,
}

/// Error body of the session endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub environment: String,
    pub mock_verify: bool,
    pub timestamp: UnixTimestamp,
}
