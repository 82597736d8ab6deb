//! apix-cloud HTTP entrypoint.
//!
//! Endpoints:
//! - `POST /v1/verify` – Verify an on-chain payment and issue a credential
//! - `POST /v1/session/validate` – Check that a credential has quota left
//! - `POST /v1/session/start` – Reserve one request against the quota
//! - `POST /v1/session/commit` – Consume the reservation
//! - `POST /v1/session/rollback` – Release the reservation
//! - `GET /health` – Liveness and mode

use std::process;

use apix_cloud::run::run;

#[tokio::main]
async fn main() {
    let result = run().await;
    if let Err(e) = result {
        eprintln!("{e}");
        process::exit(1)
    }
}
