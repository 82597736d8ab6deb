//! Server entrypoint.
//!
//! Wires configuration, the verification store, the chain verifier and the credential signer
//! into an Axum server, and runs it until SIGTERM or SIGINT.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `APIX_*`, `HOST`, `PORT` configure the server, see [`crate::config::Config`]
//! - `RUST_LOG` filters logs; `OTEL_*` variables enable export with the `telemetry` feature

use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method, header};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{self, AllowOrigin, CorsLayer};

use crate::chain::RpcPaymentVerifier;
use crate::chain::rpc::JsonRpcClient;
use crate::config::{AllowedOrigins, Config, StoreLocation};
use crate::credential::CredentialSigner;
use crate::handlers::{self, AppState};
use crate::request_id::X_REQUEST_ID;
use crate::store::VerificationStore;
use crate::util::{SigDown, Telemetry};
use crate::verification::{VerificationService, spawn_expiry_sweep};

const PAYMENT_SIGNATURE: HeaderName = HeaderName::from_static("payment-signature");

fn cors_layer(origins: &AllowedOrigins) -> Result<CorsLayer, header::InvalidHeaderValue> {
    let allow_origin = match origins {
        AllowedOrigins::Any => AllowOrigin::from(cors::Any),
        AllowedOrigins::List(list) => AllowOrigin::list(
            list.iter()
                .map(|origin| HeaderValue::from_str(origin))
                .collect::<Result<Vec<_>, _>>()?,
        ),
    };
    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            PAYMENT_SIGNATURE,
            X_REQUEST_ID.clone(),
        ])
        .expose_headers([X_REQUEST_ID.clone()]))
}

/// Starts the server and blocks until it has shut down.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;
    let settings = config.verification_settings();

    let store = Arc::new(match config.store_location() {
        StoreLocation::Memory => VerificationStore::in_memory(),
        StoreLocation::File(path) => VerificationStore::open(path),
    });

    let verifier = match config.rpc_url() {
        Some(url) => {
            tracing::info!(rpc_host = url.host_str().unwrap_or_default(), "Using HTTP transport");
            Some(RpcPaymentVerifier::new(JsonRpcClient::new(
                url.clone(),
                config.rpc_settings(),
            )?))
        }
        None => None,
    };
    if settings.mock_verify {
        tracing::warn!("Mock verification is enabled; payments are not checked on chain");
    }

    let signer = CredentialSigner::new(
        config.jwt_secret(),
        config.jwt_issuer(),
        config.jwt_kid(),
        config.jwt_ttl(),
    );
    let service = VerificationService::new(store.clone(), verifier, signer, settings);
    let axum_state = Arc::new(AppState {
        service,
        environment: config.environment().to_string(),
    });

    let sig_down = SigDown::try_new()?;
    let sweeper = spawn_expiry_sweep(store, config.sweep_interval(), sig_down.cancellation_token());

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(axum_state))
        .layer(telemetry.http_tracing())
        .layer(cors_layer(&config.allowed_origins())?);

    let addr = SocketAddr::new(config.host(), config.port());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e))?;
    tracing::info!(
        environment = config.environment(),
        mock_verify = settings.mock_verify,
        "Starting server at http://{}",
        addr
    );

    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    let served = axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await;

    sig_down.cancel();
    if let Err(error) = sweeper.await {
        tracing::warn!(%error, "Expiry sweeper ended abnormally");
    }
    served?;
    tracing::info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_cors_layer_rejects_unencodable_origin() {
        let origins = AllowedOrigins::List(BTreeSet::from(["http://bad\norigin".to_string()]));
        assert!(cors_layer(&origins).is_err());
        let origins = AllowedOrigins::List(BTreeSet::from(["https://app.example.com".to_string()]));
        assert!(cors_layer(&origins).is_ok());
        assert!(cors_layer(&AllowedOrigins::Any).is_ok());
    }
}
