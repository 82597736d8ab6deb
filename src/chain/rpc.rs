//! JSON-RPC access to a chain node.
//!
//! [`JsonRpcClient`] is an Alloy [`RpcClient`] over the HTTP transport, wrapped in a
//! [`LinearRetryLayer`]. A failed attempt, either a transport error or a JSON-RPC error payload,
//! is retried up to [`RpcSettings::max_retries`] times, sleeping `attempt * retry_delay` in
//! between. Timeouts apply per attempt.

use alloy_json_rpc::{RequestPacket, ResponsePacket, ResponsePayload, RpcRecv, RpcSend};
use alloy_rpc_client::RpcClient;
use alloy_transport::{TransportError, TransportErrorKind, TransportFut};
use alloy_transport_http::Http;
use std::fmt;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service, ServiceBuilder};
use url::Url;

/// Timeout and retry policy for outbound node calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(8000),
            max_retries: 2,
            retry_delay: Duration::from_millis(150),
        }
    }
}

impl RpcSettings {
    /// Sleep before the retry that follows failed attempt number `attempt`, saturating on overflow.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay
            .checked_mul(attempt)
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc client setup failed: {0}")]
    Setup(#[source] reqwest::Error),
    #[error("rpc transport error: {method}: {source}")]
    Transport {
        method: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("rpc http error status={status}: {method}")]
    HttpStatus { method: &'static str, status: u16 },
    #[error("rpc decode error: {method}: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("rpc error code={code} message={message}: {method}")]
    Node {
        method: &'static str,
        code: i64,
        message: String,
    },
}

impl RpcError {
    fn from_transport(method: &'static str, error: TransportError) -> Self {
        match error {
            TransportError::ErrorResp(payload) => RpcError::Node {
                method,
                code: payload.code,
                message: payload.message.to_string(),
            },
            TransportError::Transport(TransportErrorKind::HttpError(http)) => {
                RpcError::HttpStatus {
                    method,
                    status: http.status,
                }
            }
            source @ (TransportError::SerError(_) | TransportError::DeserError { .. }) => {
                RpcError::Decode { method, source }
            }
            source => RpcError::Transport { method, source },
        }
    }
}

/// Retries failed JSON-RPC exchanges with a linear backoff.
///
/// The request packet is cloned for every attempt, so each retry re-sends the full body.
#[derive(Debug, Clone, Copy)]
pub struct LinearRetryLayer {
    settings: RpcSettings,
}

impl LinearRetryLayer {
    pub fn new(settings: RpcSettings) -> Self {
        Self { settings }
    }
}

impl<S> Layer<S> for LinearRetryLayer {
    type Service = LinearRetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LinearRetryService {
            inner,
            settings: self.settings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinearRetryService<S> {
    inner: S,
    settings: RpcSettings,
}

fn is_failure(response: &ResponsePacket) -> bool {
    match response {
        ResponsePacket::Single(response) => {
            matches!(response.payload, ResponsePayload::Failure(_))
        }
        ResponsePacket::Batch(responses) => responses
            .iter()
            .any(|response| matches!(response.payload, ResponsePayload::Failure(_))),
    }
}

impl<S> Service<RequestPacket> for LinearRetryService<S>
where
    S: Service<
            RequestPacket,
            Response = ResponsePacket,
            Error = TransportError,
            Future = TransportFut<'static>,
        > + Clone
        + Send
        + Sync
        + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = TransportFut<'static>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: RequestPacket) -> Self::Future {
        let mut inner = self.inner.clone();
        let settings = self.settings;
        Box::pin(async move {
            let mut attempt: u32 = 1;
            loop {
                let outcome = inner.call(request.clone()).await;
                let failed = match &outcome {
                    Ok(response) => is_failure(response),
                    Err(_) => true,
                };
                if !failed || attempt > settings.max_retries {
                    return outcome;
                }
                tracing::debug!(attempt, "JSON-RPC attempt failed, retrying");
                tokio::time::sleep(settings.backoff(attempt)).await;
                attempt += 1;
            }
        })
    }
}

/// A JSON-RPC client bound to one node endpoint.
#[derive(Clone)]
pub struct JsonRpcClient {
    endpoint: Url,
    client: RpcClient,
}

impl fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    pub fn new(endpoint: Url, settings: RpcSettings) -> Result<Self, RpcError> {
        let http_client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(RpcError::Setup)?;
        let transport = ServiceBuilder::new()
            .layer(LinearRetryLayer::new(settings))
            .service(Http::with_client(http_client, endpoint.clone()));
        let client = RpcClient::new(transport, false);
        Ok(Self { endpoint, client })
    }

    /// Calls `method` with positional `params`.
    ///
    /// Use an `Option` result for lookups by hash: a `null` result means "not known yet".
    pub async fn call<P, R>(&self, method: &'static str, params: P) -> Result<R, RpcError>
    where
        P: RpcSend,
        R: RpcRecv,
    {
        self.client
            .request(method, params)
            .await
            .map_err(|error| RpcError::from_transport(method, error))
    }

    pub async fn call_no_params<R: RpcRecv>(&self, method: &'static str) -> Result<R, RpcError> {
        self.client
            .request_noparams(method)
            .await
            .map_err(|error| RpcError::from_transport(method, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U64;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Instant;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn fast_settings(max_retries: u32) -> RpcSettings {
        RpcSettings {
            timeout: Duration::from_secs(2),
            max_retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn client(server: &MockServer, settings: RpcSettings) -> JsonRpcClient {
        JsonRpcClient::new(server.uri().parse().unwrap(), settings).unwrap()
    }

    #[tokio::test]
    async fn test_retry_sends_a_fresh_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_chainId"})))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"jsonrpc": "2.0", "method": "eth_chainId"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 0, "result": "0xa86a"})),
            )
            .with_priority(2)
            .expect(1)
            .mount(&server)
            .await;

        let chain_id: U64 = client(&server, fast_settings(1))
            .call_no_params("eth_chainId")
            .await
            .unwrap();
        assert_eq!(chain_id, U64::from(43114));
    }

    #[tokio::test]
    async fn test_null_result_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": ["0xabc"]})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 0, "result": null})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let tx: Option<serde_json::Value> = client(&server, fast_settings(2))
            .call("eth_getTransactionByHash", ("0xabc".to_string(),))
            .await
            .unwrap();
        assert!(tx.is_none());
    }

    #[tokio::test]
    async fn test_node_error_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"jsonrpc": "2.0", "id": 0, "error": {"code": -32000, "message": "header not found"}}),
            ))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server, fast_settings(2))
            .call_no_params::<U64>("eth_blockNumber")
            .await
            .unwrap_err();
        match err {
            RpcError::Node { code, message, .. } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "header not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_http_status_error_without_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, fast_settings(0))
            .call_no_params::<U64>("eth_chainId")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::HttpStatus { status: 503, .. }));
        assert!(err.to_string().contains("rpc http error status=503"));
    }

    #[tokio::test]
    async fn test_timeout_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 0, "result": "0x1"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let settings = RpcSettings {
            timeout: Duration::from_millis(50),
            max_retries: 0,
            retry_delay: Duration::from_millis(1),
        };
        let err = client(&server, settings)
            .call_no_params::<U64>("eth_chainId")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
    }

    /// Records when each request reaches the node.
    #[derive(Clone, Default)]
    struct ArrivalLog(Arc<parking_lot::Mutex<Vec<Instant>>>);

    impl Respond for ArrivalLog {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.0.lock().push(Instant::now());
            ResponseTemplate::new(502)
        }
    }

    #[tokio::test]
    async fn test_backoff_grows_linearly_between_attempts() {
        let server = MockServer::start().await;
        let arrivals = ArrivalLog::default();
        Mock::given(method("POST"))
            .respond_with(arrivals.clone())
            .expect(3)
            .mount(&server)
            .await;

        let delay = Duration::from_millis(40);
        let settings = RpcSettings {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_delay: delay,
        };
        let started = Instant::now();
        let err = client(&server, settings)
            .call_no_params::<U64>("eth_chainId")
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::HttpStatus { status: 502, .. }));
        // 1 * delay after the first attempt, 2 * delay after the second.
        assert!(started.elapsed() >= delay * 3);

        let arrivals = arrivals.0.lock().clone();
        assert_eq!(arrivals.len(), 3);
        assert!(arrivals[1] - arrivals[0] >= delay);
        assert!(arrivals[2] - arrivals[1] >= delay * 2);
    }

    #[test]
    fn test_backoff_saturates_instead_of_overflowing() {
        let settings = RpcSettings {
            retry_delay: Duration::MAX,
            ..RpcSettings::default()
        };
        assert_eq!(settings.backoff(2), Duration::MAX);
        assert_eq!(
            RpcSettings::default().backoff(3),
            Duration::from_millis(450)
        );
    }
}
