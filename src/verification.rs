//! The "verify payment, issue credential" use case and the quota session operations.
//!
//! [`VerificationService::verify`] runs, in order:
//!
//! 1. request-shape validation,
//! 2. idempotent replay: a live record for the same `(request_id, tx_hash)` returns its credential,
//! 3. the double-spend guard: a transaction owned by another request id is refused,
//! 4. on-chain verification, unless mock verification is enabled,
//! 5. credential minting,
//! 6. an atomic claim that records the pair and seeds the credential's quota session.
//!
//! Store calls block on file I/O and are moved off the async runtime with `spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::chain::{PaymentQuery, PaymentVerifier, VerificationError};
use crate::credential::{CredentialError, CredentialSigner, PaymentClaim};
use crate::ledger::{VerificationRecord, normalize_tx_hash};
use crate::proto::VerifyRequest;
use crate::store::{ClaimOutcome, VerificationStore};
use crate::timestamp::UnixTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationSettings {
    /// Skip on-chain checks. Local development only.
    pub mock_verify: bool,
    /// Used when a request does not ask for a minimum.
    pub default_min_confirmations: u64,
    /// Requests allotted to each issued credential.
    pub session_quota: u32,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            mock_verify: false,
            default_min_confirmations: 1,
            session_quota: 100,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("{0}")]
    InvalidRequest(&'static str),
    #[error("Transaction hash already used by another request")]
    AlreadyUsed,
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("Internal server error")]
    Signing(#[source] CredentialError),
}

impl VerifyError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            VerifyError::InvalidRequest(_) => "invalid_request",
            VerifyError::AlreadyUsed => "tx_hash_already_used",
            VerifyError::Verification(_) => "verification_failed",
            VerifyError::Signing(_) => "signing_error",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            VerifyError::InvalidRequest(_) | VerifyError::AlreadyUsed => false,
            VerifyError::Verification(error) => error.is_retryable(),
            VerifyError::Signing(_) => true,
        }
    }
}

/// A successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub credential: String,
    /// `true` when the credential was issued by an earlier call for the same pair.
    pub replayed: bool,
}

impl VerifyOutcome {
    pub fn message(&self) -> &'static str {
        if self.replayed {
            "Verification already processed"
        } else {
            "Verification successful"
        }
    }
}

#[derive(Debug)]
pub struct VerificationService<V> {
    store: Arc<VerificationStore>,
    verifier: V,
    signer: CredentialSigner,
    settings: VerificationSettings,
}

impl<V: PaymentVerifier> VerificationService<V> {
    pub fn new(
        store: Arc<VerificationStore>,
        verifier: V,
        signer: CredentialSigner,
        settings: VerificationSettings,
    ) -> Self {
        Self {
            store,
            verifier,
            signer,
            settings,
        }
    }

    pub fn settings(&self) -> &VerificationSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<VerificationStore> {
        &self.store
    }

    /// Verifies a payment claim and issues, or re-issues, its credential.
    ///
    /// `request_id` is the already resolved idempotency key; `request.request_id` is ignored.
    #[instrument(skip_all, fields(request_id = %request_id))]
    pub async fn verify(
        &self,
        request: &VerifyRequest,
        request_id: &str,
    ) -> Result<VerifyOutcome, VerifyError> {
        validate_request(request, self.settings.mock_verify)?;
        let tx_hash = normalize_tx_hash(&request.tx_hash);
        let request_id = request_id.trim().to_string();
        let chain_id = request.chain_id.filter(|id| *id != 0);
        tracing::info!(
            tx_hash = %tx_hash,
            network = %request.network,
            chain_id = ?chain_id,
            "Verification request received"
        );

        let now = UnixTimestamp::now();
        let existing = {
            let (request_id, tx_hash) = (request_id.clone(), tx_hash.clone());
            self.with_store(move |store| store.lookup(&request_id, &tx_hash, now))
                .await
        };
        if let Some(existing) = existing {
            tracing::info!(tx_hash = %tx_hash, "Idempotent verification hit");
            return Ok(VerifyOutcome {
                credential: existing.credential,
                replayed: true,
            });
        }

        let owner = {
            let tx_hash = tx_hash.clone();
            self.with_store(move |store| store.owner_of(&tx_hash, now))
                .await
        };
        if owner.is_some_and(|owner| owner != request_id) {
            return Err(VerifyError::AlreadyUsed);
        }

        if !self.settings.mock_verify {
            let query = PaymentQuery {
                tx_hash: &tx_hash,
                network: request.network.trim(),
                recipient: request.recipient.trim(),
                amount: request.amount.trim(),
                chain_id,
                min_confirmations: request
                    .min_confirmations
                    .filter(|min| *min != 0)
                    .unwrap_or(self.settings.default_min_confirmations),
            };
            self.verifier
                .verify_payment(&query)
                .await
                .inspect_err(|error| {
                    tracing::warn!(tx_hash = %tx_hash, error = %error, "Verification failed");
                })?;
        }

        let now = UnixTimestamp::now();
        let claim = PaymentClaim {
            request_id: request_id.clone(),
            tx_hash: tx_hash.clone(),
            network: Some(request.network.clone()),
            recipient: Some(request.recipient.clone()),
            amount_wei: Some(request.amount.clone()),
            chain_id,
            currency: Some(request.currency.clone()),
            max_requests: self.settings.session_quota,
        };
        let issued = self.signer.mint(&claim, now).map_err(|error| {
            tracing::error!(error = %error, "Credential signing failed");
            VerifyError::Signing(error)
        })?;

        let record = VerificationRecord {
            request_id,
            tx_hash: tx_hash.clone(),
            credential: issued.token,
            expires_at: issued.expires_at,
        };
        let quota = self.settings.session_quota;
        let credential = record.credential.clone();
        let outcome = self
            .with_store(move |store| store.claim(record, quota, now))
            .await;
        match outcome {
            ClaimOutcome::Issued => {
                tracing::info!(
                    tx_hash = %tx_hash,
                    expires_at = %issued.expires_at,
                    "Verification successful"
                );
                Ok(VerifyOutcome {
                    credential,
                    replayed: false,
                })
            }
            ClaimOutcome::Replayed(existing) => {
                tracing::info!(tx_hash = %tx_hash, "Idempotent verification hit");
                Ok(VerifyOutcome {
                    credential: existing.credential,
                    replayed: true,
                })
            }
            ClaimOutcome::Conflict { .. } => Err(VerifyError::AlreadyUsed),
        }
    }

    pub async fn validate_session(&self, token: &str) -> bool {
        let token = token.to_string();
        self.with_store(move |store| store.validate(&token, UnixTimestamp::now()))
            .await
    }

    pub async fn start_session_request(&self, token: &str) -> bool {
        let token = token.to_string();
        self.with_store(move |store| store.start(&token, UnixTimestamp::now()))
            .await
    }

    pub async fn commit_session_request(&self, token: &str) -> bool {
        let token = token.to_string();
        self.with_store(move |store| store.commit(&token, UnixTimestamp::now()))
            .await
    }

    pub async fn rollback_session_request(&self, token: &str) -> bool {
        let token = token.to_string();
        self.with_store(move |store| store.rollback(&token, UnixTimestamp::now()))
            .await
    }

    async fn with_store<T, F>(&self, operation: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&VerificationStore) -> T + Send + 'static,
    {
        run_blocking(self.store.clone(), operation).await
    }
}

async fn run_blocking<T, F>(store: Arc<VerificationStore>, operation: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&VerificationStore) -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(move || operation(&store)).await {
        Ok(output) => output,
        // Blocking tasks are only cancelled on runtime shutdown; a panic is re-raised here.
        Err(error) => std::panic::resume_unwind(error.into_panic()),
    }
}

fn validate_request(request: &VerifyRequest, mock_verify: bool) -> Result<(), VerifyError> {
    if request.tx_hash.trim().is_empty() {
        return Err(VerifyError::InvalidRequest("tx_hash is required"));
    }
    if mock_verify {
        return Ok(());
    }
    if request.network.trim().is_empty() {
        return Err(VerifyError::InvalidRequest("network is required"));
    }
    if request.recipient.trim().is_empty() {
        return Err(VerifyError::InvalidRequest("recipient is required"));
    }
    let amount = request.amount.trim();
    if amount.is_empty() {
        return Err(VerifyError::InvalidRequest("amount is required"));
    }
    if !amount.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VerifyError::InvalidRequest(
            "amount must be a decimal integer in wei",
        ));
    }
    Ok(())
}

/// Periodically deletes expired records and sessions until `shutdown` is cancelled.
///
/// The first sweep runs one `interval` after start. Sweeps that remove nothing are silent.
pub fn spawn_expiry_sweep(
    store: Arc<VerificationStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = run_blocking(store.clone(), |store| {
                        store.sweep(UnixTimestamp::now())
                    })
                    .await;
                    if report.total() > 0 {
                        tracing::info!(
                            records = report.records,
                            sessions = report.sessions,
                            "Expired verification entries removed"
                        );
                    }
                }
            }
        }
    })
}
