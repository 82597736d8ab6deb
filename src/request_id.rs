//! Correlation ids for incoming requests.
//!
//! [`RequestIdLayer`] stores a [`RequestId`] in every request's extensions: the trimmed
//! `X-Request-ID` header when the caller sent one, otherwise a generated
//! `req_<unix_millis>_<counter>`.

use axum::http::{HeaderName, Request};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};
use tower::{Layer, Service};

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// Generates process-unique request ids.
#[derive(Debug, Clone, Default)]
pub struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl RequestIdGenerator {
    pub fn next_id(&self) -> String {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        format!("req_{millis}_{sequence}")
    }

    /// `candidate` trimmed, or a fresh id if it is blank.
    pub fn resolve(&self, candidate: &str) -> String {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            self.next_id()
        } else {
            candidate.to_string()
        }
    }
}

#[derive(Clone, Default)]
pub struct RequestIdLayer {
    generator: RequestIdGenerator,
}

impl RequestIdLayer {
    pub fn new(generator: RequestIdGenerator) -> Self {
        Self { generator }
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService {
            inner,
            generator: self.generator.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
    generator: RequestIdGenerator,
}

impl<S, B> Service<Request<B>> for RequestIdService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let header = req
            .headers()
            .get(&X_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let request_id = self.generator.resolve(header);
        req.extensions_mut().insert(RequestId(request_id));
        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let generator = RequestIdGenerator::default();
        let first = generator.next_id();
        let second = generator.next_id();
        assert!(first.starts_with("req_"));
        assert!(first.ends_with("_1"));
        assert!(second.ends_with("_2"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_resolve_prefers_non_blank_candidate() {
        let generator = RequestIdGenerator::default();
        assert_eq!(generator.resolve("  client-42 "), "client-42");
        assert!(generator.resolve("   ").starts_with("req_"));
    }
}
