//! On-chain payment verification against an EVM JSON-RPC node.
//!
//! [`RpcPaymentVerifier`] runs an ordered list of checks for a claimed payment. Each check has
//! its own failure mode in [`VerificationError`]:
//!
//! 1. the transaction exists and is mined,
//! 2. its receipt exists and reports success,
//! 3. the recipient matches (case-insensitive),
//! 4. the transferred value covers the required amount (exact 256-bit comparison),
//! 5. the claimed network is a valid `eip155:<id>` identifier,
//! 6. the node, and the optional explicit chain id, agree with that network,
//! 7. the transaction has enough confirmations.
//!
//! Individual node calls are retried by [`rpc::JsonRpcClient`]. Verification failures are never
//! retried here; [`VerificationError::is_retryable`] tells the caller whether trying again later
//! could succeed.

pub mod rpc;
pub mod types;

use alloy_consensus::{Transaction as _, TxReceipt as _};
use alloy_primitives::{Address, U64, U256};
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

use crate::network::{Eip155Network, NetworkParseError};
use rpc::{JsonRpcClient, RpcError};
use types::{RequiredWei, Transaction, TransactionReceipt, parse_decimal_wei};

/// The payment a caller claims to have made.
#[derive(Debug, Clone, Copy)]
pub struct PaymentQuery<'a> {
    pub tx_hash: &'a str,
    /// CAIP-2 identifier, e.g. `eip155:43114`.
    pub network: &'a str,
    pub recipient: &'a str,
    /// Decimal wei.
    pub amount: &'a str,
    /// Optional explicit chain id that must agree with `network`.
    pub chain_id: Option<u64>,
    pub min_confirmations: u64,
}

/// Why a claimed payment was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// The node could not be reached or answered with an error, after retries.
    #[error("failed to get {stage}: {source}")]
    Rpc {
        stage: &'static str,
        #[source]
        source: RpcError,
    },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("transaction is not confirmed yet")]
    NotConfirmed,
    #[error("transaction execution failed")]
    ExecutionFailed,
    #[error("recipient mismatch expected={expected} actual={actual}")]
    RecipientMismatch { expected: String, actual: String },
    #[error("insufficient payment expected={expected} actual={actual}")]
    InsufficientPayment { expected: String, actual: String },
    #[error(transparent)]
    InvalidNetwork(#[from] NetworkParseError),
    #[error("network mismatch expected_chain={expected} {observed_by}_chain={actual}")]
    NetworkMismatch {
        expected: u64,
        actual: u64,
        observed_by: &'static str,
    },
    #[error("latest block is behind transaction block")]
    ChainBehind,
    #[error("insufficient confirmations required={required} actual={actual}")]
    InsufficientConfirmations { required: u64, actual: u64 },
    #[error("failed to parse amount {0:?}")]
    MalformedAmount(String),
    #[error("no chain node is configured")]
    NodeUnavailable,
}

impl VerificationError {
    /// Whether the same claim may succeed if submitted again later.
    ///
    /// Only node failures and lookups the node could not answer yet are retryable. Pending,
    /// lagging and under-confirmed transactions are rejected until the client submits again.
    pub fn is_retryable(&self) -> bool {
        match self {
            VerificationError::Rpc { .. } | VerificationError::NotFound(_) => true,
            VerificationError::NotConfirmed
            | VerificationError::ChainBehind
            | VerificationError::InsufficientConfirmations { .. }
            | VerificationError::ExecutionFailed
            | VerificationError::RecipientMismatch { .. }
            | VerificationError::InsufficientPayment { .. }
            | VerificationError::InvalidNetwork(_)
            | VerificationError::NetworkMismatch { .. }
            | VerificationError::MalformedAmount(_)
            | VerificationError::NodeUnavailable => false,
        }
    }
}

/// Verifies that a claimed on-chain payment satisfies its contract.
pub trait PaymentVerifier {
    fn verify_payment(
        &self,
        query: &PaymentQuery<'_>,
    ) -> impl Future<Output = Result<(), VerificationError>> + Send;
}

impl<T: PaymentVerifier> PaymentVerifier for Arc<T> {
    fn verify_payment(
        &self,
        query: &PaymentQuery<'_>,
    ) -> impl Future<Output = Result<(), VerificationError>> + Send {
        self.as_ref().verify_payment(query)
    }
}

/// A server in mock mode may run without a node; every on-chain check then fails.
impl<T: PaymentVerifier + Sync> PaymentVerifier for Option<T> {
    async fn verify_payment(&self, query: &PaymentQuery<'_>) -> Result<(), VerificationError> {
        match self {
            Some(verifier) => verifier.verify_payment(query).await,
            None => Err(VerificationError::NodeUnavailable),
        }
    }
}

/// [`PaymentVerifier`] backed by a JSON-RPC node.
#[derive(Clone, Debug)]
pub struct RpcPaymentVerifier {
    rpc: JsonRpcClient,
}

impl RpcPaymentVerifier {
    pub fn new(rpc: JsonRpcClient) -> Self {
        Self { rpc }
    }

    async fn fetch_transaction(&self, tx_hash: &str) -> Result<Transaction, VerificationError> {
        self.rpc
            .call::<_, Option<Transaction>>("eth_getTransactionByHash", (tx_hash.to_string(),))
            .await
            .map_err(|source| VerificationError::Rpc {
                stage: "transaction",
                source,
            })?
            .ok_or(VerificationError::NotFound("transaction"))
    }

    async fn fetch_receipt(&self, tx_hash: &str) -> Result<TransactionReceipt, VerificationError> {
        self.rpc
            .call::<_, Option<TransactionReceipt>>(
                "eth_getTransactionReceipt",
                (tx_hash.to_string(),),
            )
            .await
            .map_err(|source| VerificationError::Rpc {
                stage: "receipt",
                source,
            })?
            .ok_or(VerificationError::NotFound("transaction receipt"))
    }

    async fn fetch_quantity(
        &self,
        method: &'static str,
        stage: &'static str,
    ) -> Result<u64, VerificationError> {
        self.rpc
            .call_no_params::<U64>(method)
            .await
            .map(|quantity| quantity.to::<u64>())
            .map_err(|source| VerificationError::Rpc { stage, source })
    }

    /// The node must be on the claimed network, and an explicit chain id must agree with it.
    async fn assert_network(
        &self,
        network: Eip155Network,
        requested_chain_id: Option<u64>,
    ) -> Result<(), VerificationError> {
        let expected = network.chain_id();
        let rpc_chain_id = self.fetch_quantity("eth_chainId", "chain id from rpc").await?;
        if rpc_chain_id != expected {
            return Err(VerificationError::NetworkMismatch {
                expected,
                actual: rpc_chain_id,
                observed_by: "rpc",
            });
        }
        if let Some(requested) = requested_chain_id
            && requested != expected
        {
            return Err(VerificationError::NetworkMismatch {
                expected,
                actual: requested,
                observed_by: "request",
            });
        }
        Ok(())
    }

    async fn assert_confirmations(
        &self,
        tx_block: u64,
        min_confirmations: u64,
    ) -> Result<(), VerificationError> {
        let latest_block = self
            .fetch_quantity("eth_blockNumber", "latest block number")
            .await?;
        check_confirmations(tx_block, latest_block, min_confirmations)
    }
}

impl PaymentVerifier for RpcPaymentVerifier {
    #[instrument(skip_all, err, fields(tx_hash = %query.tx_hash, network = %query.network))]
    async fn verify_payment(&self, query: &PaymentQuery<'_>) -> Result<(), VerificationError> {
        let tx_hash = query.tx_hash.trim();

        let transaction = self.fetch_transaction(tx_hash).await?;
        let tx_block = transaction
            .block_number
            .ok_or(VerificationError::NotConfirmed)?;

        let receipt = self.fetch_receipt(tx_hash).await?;
        if !receipt.inner.status() {
            return Err(VerificationError::ExecutionFailed);
        }

        assert_recipient(query.recipient, transaction.to())?;
        assert_enough_value(transaction.value(), query.amount)?;

        let network = Eip155Network::from_str(query.network)?;
        self.assert_network(network, query.chain_id).await?;
        self.assert_confirmations(tx_block, query.min_confirmations)
            .await?;

        tracing::debug!(tx_hash, "payment verified on chain");
        Ok(())
    }
}

/// Contract creations have no recipient and never match.
fn assert_recipient(expected: &str, actual: Option<Address>) -> Result<(), VerificationError> {
    let actual = actual.map(|address| address.to_string()).unwrap_or_default();
    if expected.trim().eq_ignore_ascii_case(&actual) {
        Ok(())
    } else {
        Err(VerificationError::RecipientMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

fn assert_enough_value(value: U256, required: &str) -> Result<(), VerificationError> {
    let required_wei = parse_decimal_wei(required)
        .ok_or_else(|| VerificationError::MalformedAmount(required.to_string()))?;
    let sufficient = match required_wei {
        RequiredWei::Exact(required_wei) => value >= required_wei,
        RequiredWei::Unreachable => false,
    };
    if sufficient {
        Ok(())
    } else {
        Err(VerificationError::InsufficientPayment {
            expected: required.trim().to_string(),
            actual: value.to_string(),
        })
    }
}

/// Confirmations are `latest - tx_block + 1`: the inclusion block counts as the first.
fn check_confirmations(
    tx_block: u64,
    latest_block: u64,
    min_confirmations: u64,
) -> Result<(), VerificationError> {
    if latest_block < tx_block {
        return Err(VerificationError::ChainBehind);
    }
    let confirmations = latest_block - tx_block + 1;
    if confirmations < min_confirmations {
        return Err(VerificationError::InsufficientConfirmations {
            required: min_confirmations,
            actual: confirmations,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc::RpcSettings;
    use serde_json::{Value, json};
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TX_HASH: &str = "0x5c504ed432cb51138bcf09aa5e8a410dd4a1e204ef84bfed1be16dfba1b22060";
    const RECIPIENT: &str = "0x742d35Cc6634C0532925a3b844Bc454e4438f44e";
    const SENDER: &str = "0x1111111111111111111111111111111111111111";
    const BLOCK_HASH: &str = "0x8e38b4dbf6b11fcc3b9dee84fb7986e29ca0a02cecd8977c161ff7333329681e";
    const BLOCK_100: &str = "0x64";

    /// A signed legacy transfer as `eth_getTransactionByHash` returns it; pending when `block` is `None`.
    fn transaction_json(block: Option<&str>, to: &str, value: &str) -> Value {
        json!({
            "type": "0x0",
            "hash": TX_HASH,
            "nonce": "0x1",
            "blockHash": block.map(|_| BLOCK_HASH),
            "blockNumber": block,
            "transactionIndex": block.map(|_| "0x0"),
            "from": SENDER,
            "to": to,
            "value": value,
            "gasPrice": "0x5d21dba00",
            "gas": "0x5208",
            "input": "0x",
            "v": "0x1b",
            "r": "0x9242685bf161793cc25603c231bc2f568eb630ea16aa137d2664ac8038825608",
            "s": "0x4f8ae3bd7535248d0bd448298cc2e2071e56992d0774dc340c368ae950852ada",
        })
    }

    fn receipt_json(status: &str) -> Value {
        json!({
            "type": "0x0",
            "status": status,
            "cumulativeGasUsed": "0x5208",
            "logs": [],
            "logsBloom": format!("0x{}", "0".repeat(512)),
            "transactionHash": TX_HASH,
            "transactionIndex": "0x0",
            "blockHash": BLOCK_HASH,
            "blockNumber": BLOCK_100,
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x5d21dba00",
            "from": SENDER,
            "to": RECIPIENT.to_lowercase(),
            "contractAddress": null,
        })
    }

    async fn mount_result(server: &MockServer, rpc_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 0, "result": result})),
            )
            .mount(server)
            .await;
    }

    /// A node that knows one successful 1 ETH transfer to [`RECIPIENT`] mined in block 100 on
    /// Avalanche (43114), with the chain head at `latest_block`.
    async fn healthy_node(latest_block: &str) -> MockServer {
        let server = MockServer::start().await;
        mount_result(
            &server,
            "eth_getTransactionByHash",
            transaction_json(Some(BLOCK_100), &RECIPIENT.to_lowercase(), "0xde0b6b3a7640000"),
        )
        .await;
        mount_result(&server, "eth_getTransactionReceipt", receipt_json("0x1")).await;
        mount_result(&server, "eth_chainId", json!("0xa86a")).await;
        mount_result(&server, "eth_blockNumber", json!(latest_block)).await;
        server
    }

    fn verifier(server: &MockServer) -> RpcPaymentVerifier {
        let settings = RpcSettings {
            timeout: Duration::from_secs(2),
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
        };
        RpcPaymentVerifier::new(JsonRpcClient::new(server.uri().parse().unwrap(), settings).unwrap())
    }

    fn query(min_confirmations: u64) -> PaymentQuery<'static> {
        PaymentQuery {
            tx_hash: TX_HASH,
            network: "eip155:43114",
            recipient: RECIPIENT,
            amount: "1000000000000000000",
            chain_id: None,
            min_confirmations,
        }
    }

    #[tokio::test]
    async fn test_verify_payment_accepts_valid_transfer() {
        let server = healthy_node("0x65").await;
        verifier(&server)
            .verify_payment(&query(2))
            .await
            .expect("two confirmations satisfy a minimum of two");
    }

    #[tokio::test]
    async fn test_verify_payment_requires_confirmations() {
        let server = healthy_node("0x65").await;
        let err = verifier(&server)
            .verify_payment(&query(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VerificationError::InsufficientConfirmations {
                required: 3,
                actual: 2
            }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_verify_payment_chain_behind() {
        let server = healthy_node("0x63").await;
        let err = verifier(&server)
            .verify_payment(&query(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::ChainBehind));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_verify_payment_transaction_not_found() {
        let server = MockServer::start().await;
        mount_result(&server, "eth_getTransactionByHash", Value::Null).await;
        let err = verifier(&server)
            .verify_payment(&query(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::NotFound("transaction")));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_verify_payment_pending_transaction() {
        let server = MockServer::start().await;
        mount_result(
            &server,
            "eth_getTransactionByHash",
            transaction_json(None, RECIPIENT, "0x1"),
        )
        .await;
        let err = verifier(&server)
            .verify_payment(&query(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::NotConfirmed));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_verify_payment_reverted_transaction() {
        let server = MockServer::start().await;
        mount_result(
            &server,
            "eth_getTransactionByHash",
            transaction_json(Some(BLOCK_100), RECIPIENT, "0x1"),
        )
        .await;
        mount_result(&server, "eth_getTransactionReceipt", receipt_json("0x0")).await;
        let err = verifier(&server)
            .verify_payment(&query(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::ExecutionFailed));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_verify_payment_recipient_mismatch() {
        let server = healthy_node("0x65").await;
        let mut claim = query(1);
        claim.recipient = "0x0000000000000000000000000000000000000001";
        let err = verifier(&server)
            .verify_payment(&claim)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::RecipientMismatch { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_verify_payment_insufficient_value() {
        let server = healthy_node("0x65").await;
        let mut claim = query(1);
        claim.amount = "1000000000000000001";
        let err = verifier(&server)
            .verify_payment(&claim)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InsufficientPayment { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_verify_payment_invalid_network() {
        let server = healthy_node("0x65").await;
        let mut claim = query(1);
        claim.network = "avalanche:43114";
        let err = verifier(&server)
            .verify_payment(&claim)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidNetwork(_)));
    }

    #[tokio::test]
    async fn test_verify_payment_node_on_other_network() {
        let server = healthy_node("0x65").await;
        let mut claim = query(1);
        claim.network = "eip155:1";
        let err = verifier(&server)
            .verify_payment(&claim)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VerificationError::NetworkMismatch {
                expected: 1,
                actual: 43114,
                observed_by: "rpc"
            }
        ));
    }

    #[tokio::test]
    async fn test_verify_payment_explicit_chain_id_disagrees() {
        let server = healthy_node("0x65").await;
        let mut claim = query(1);
        claim.chain_id = Some(8453);
        let err = verifier(&server)
            .verify_payment(&claim)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VerificationError::NetworkMismatch {
                observed_by: "request",
                ..
            }
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_verify_payment_rpc_failure_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;
        let err = verifier(&server)
            .verify_payment(&query(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VerificationError::Rpc {
                stage: "transaction",
                ..
            }
        ));
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("failed to get transaction"));
    }

    #[test]
    fn test_check_confirmations_arithmetic() {
        assert!(check_confirmations(100, 101, 2).is_ok());
        assert!(check_confirmations(100, 100, 1).is_ok());
        assert!(matches!(
            check_confirmations(100, 101, 3),
            Err(VerificationError::InsufficientConfirmations {
                required: 3,
                actual: 2
            })
        ));
        assert!(matches!(
            check_confirmations(101, 100, 1),
            Err(VerificationError::ChainBehind)
        ));
    }

    #[test]
    fn test_assert_recipient_ignores_case() {
        let address = Address::from_str(RECIPIENT).unwrap();
        assert!(assert_recipient(RECIPIENT, Some(address)).is_ok());
        assert!(assert_recipient(&RECIPIENT.to_lowercase(), Some(address)).is_ok());
        assert!(matches!(
            assert_recipient("not-an-address", Some(address)),
            Err(VerificationError::RecipientMismatch { .. })
        ));
        assert!(matches!(
            assert_recipient(RECIPIENT, None),
            Err(VerificationError::RecipientMismatch { .. })
        ));
    }

    #[test]
    fn test_assert_enough_value_precision() {
        let one_ether = U256::from(1_000_000_000_000_000_000u64);
        assert!(assert_enough_value(one_ether, "1000000000000000000").is_ok());
        assert!(assert_enough_value(one_ether, "999999999999999999").is_ok());
        assert!(assert_enough_value(one_ether, "1000000000000000001").is_err());
        assert!(matches!(
            assert_enough_value(U256::from(1), &"9".repeat(90)),
            Err(VerificationError::InsufficientPayment { .. })
        ));
        assert!(matches!(
            assert_enough_value(U256::from(1), "one"),
            Err(VerificationError::MalformedAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_node_rejects_without_retry() {
        let verifier: Option<RpcPaymentVerifier> = None;
        let query = PaymentQuery {
            tx_hash: "0x64",
            network: "eip155:43114",
            recipient: RECIPIENT,
            amount: "1",
            chain_id: None,
            min_confirmations: 1,
        };
        let err = verifier.verify_payment(&query).await.unwrap_err();
        assert!(matches!(err, VerificationError::NodeUnavailable));
        assert!(!err.is_retryable());
    }
}
