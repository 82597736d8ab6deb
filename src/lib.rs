//! Core of a pay-per-use API gateway.
//!
//! A client pays for API access with a native-coin transfer on an EVM chain, then exchanges the
//! transaction hash for a short-lived signed credential. Each credential carries a request quota
//! that the gateway meters through a start, commit, rollback protocol.
//!
//! # Guarantees
//!
//! - A transaction hash buys at most one credential. Replaying the same `(request_id, tx_hash)`
//!   pair returns the credential already issued, never a new one.
//! - Verification state is shared by every instance pointed at the same store file, and
//!   survives restarts.
//! - A session holds at most one reserved request at a time.
//!
//! # Modules
//!
//! - [`chain`] - JSON-RPC client and on-chain payment checks.
//! - [`config`] - CLI and environment configuration.
//! - [`credential`] - HS256 credential minting and verification.
//! - [`handlers`] - HTTP endpoints.
//! - [`ledger`] - Idempotency records keyed by request id and transaction hash.
//! - [`network`] - CAIP-2 network identifiers.
//! - [`proto`] - JSON request and response bodies.
//! - [`request_id`] - Request correlation ids.
//! - [`run`] - Server wiring and lifecycle.
//! - [`session`] - Per-credential quota sessions.
//! - [`store`] - Locked, file-backed persistence of records and sessions.
//! - [`timestamp`] - Unix timestamps for expiry.
//! - [`util`] - Logging setup and signal handling.
//! - [`verification`] - The verify flow and session operations.

pub mod chain;
pub mod config;
pub mod credential;
pub mod handlers;
pub mod ledger;
pub mod network;
pub mod proto;
pub mod request_id;
pub mod run;
pub mod session;
pub mod store;
pub mod timestamp;
pub mod util;
pub mod verification;
