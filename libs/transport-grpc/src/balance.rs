//! Round-robin channel over the live instances of one service.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::transport::Channel;
use tower::{Service, ServiceExt};

use crate::error::TransportError;
use crate::trace_context;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A gRPC channel that spreads calls over every resolved instance in turn.
///
/// Cloning is cheap; all clones share the endpoint set. Once the last clone
/// is dropped the resolver feeding it is closed.
#[derive(Clone)]
pub struct BalancedChannel {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    target: String,
    endpoints: RwLock<Vec<(String, Channel)>>,
    cursor: AtomicUsize,
    pub(crate) closed: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for BalancedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancedChannel")
            .field("target", &self.shared.target)
            .field("endpoints", &self.addresses())
            .finish_non_exhaustive()
    }
}

impl BalancedChannel {
    pub(crate) fn new(target: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                target: target.into(),
                endpoints: RwLock::new(Vec::new()),
                cursor: AtomicUsize::new(0),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Logical name this channel was dialed with.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.shared.target
    }

    /// Addresses currently in rotation, in rotation order.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.shared
            .endpoints
            .read()
            .iter()
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.endpoints.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.endpoints.read().is_empty()
    }

    #[must_use]
    pub fn contains(&self, addr: &str) -> bool {
        self.shared.endpoints.read().iter().any(|(a, _)| a == addr)
    }

    /// Add `addr` to the rotation, replacing an existing channel for it.
    pub(crate) fn insert(&self, addr: String, channel: Channel) {
        let mut endpoints = self.shared.endpoints.write();
        if let Some(slot) = endpoints.iter_mut().find(|(a, _)| *a == addr) {
            slot.1 = channel;
        } else {
            endpoints.push((addr, channel));
        }
    }

    pub(crate) fn remove(&self, addr: &str) -> bool {
        let mut endpoints = self.shared.endpoints.write();
        let before = endpoints.len();
        endpoints.retain(|(a, _)| a != addr);
        endpoints.len() != before
    }

    fn pick(&self) -> Option<(String, Channel)> {
        let endpoints = self.shared.endpoints.read();
        if endpoints.is_empty() {
            return None;
        }
        let idx = self.shared.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        endpoints.get(idx).cloned()
    }
}

impl Service<http::Request<Body>> for BalancedChannel {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is checked on the picked endpoint inside `call`.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut request: http::Request<Body>) -> Self::Future {
        trace_context::inject_current_span(request.headers_mut());
        let picked = self.pick();
        let target = self.shared.target.clone();
        Box::pin(async move {
            let Some((addr, mut channel)) = picked else {
                return Err(TransportError::NoEndpoints { target }.into());
            };
            tracing::trace!(service = %target, %addr, "dispatching call");
            let ready = ServiceExt::<http::Request<Body>>::ready(&mut channel).await?;
            ready.call(request).await.map_err(Into::into)
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use tonic::transport::Endpoint;

    fn lazy(addr: &str) -> Channel {
        Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect_lazy()
    }

    #[tokio::test]
    async fn test_pick_rotates_in_order() {
        let channel = BalancedChannel::new("svcA");
        for addr in ["127.0.0.1:7001", "127.0.0.1:7002", "127.0.0.1:7003"] {
            channel.insert(addr.to_owned(), lazy(addr));
        }

        let picked: Vec<_> = (0..6).map(|_| channel.pick().unwrap().0).collect();
        assert_eq!(
            picked,
            vec![
                "127.0.0.1:7001",
                "127.0.0.1:7002",
                "127.0.0.1:7003",
                "127.0.0.1:7001",
                "127.0.0.1:7002",
                "127.0.0.1:7003",
            ]
        );
    }

    #[tokio::test]
    async fn test_removed_endpoint_leaves_rotation() {
        let channel = BalancedChannel::new("svcA");
        channel.insert("127.0.0.1:7001".to_owned(), lazy("127.0.0.1:7001"));
        channel.insert("127.0.0.1:7002".to_owned(), lazy("127.0.0.1:7002"));
        channel.insert("127.0.0.1:7001".to_owned(), lazy("127.0.0.1:7001"));
        assert_eq!(channel.len(), 2);

        assert!(channel.remove("127.0.0.1:7001"));
        assert!(!channel.remove("127.0.0.1:7001"));
        for _ in 0..3 {
            assert_eq!(channel.pick().unwrap().0, "127.0.0.1:7002");
        }
    }

    #[tokio::test]
    async fn test_call_without_endpoints_fails() {
        let mut channel = BalancedChannel::new("svcA");
        let request = http::Request::new(Body::empty());
        let Err(err) = channel.call(request).await else {
            panic!("call without endpoints must fail");
        };
        let err = err.downcast::<TransportError>().unwrap();
        assert!(matches!(*err, TransportError::NoEndpoints { ref target } if target == "svcA"));
    }

    #[test]
    fn test_dropping_last_clone_signals_close() {
        let channel = BalancedChannel::new("svcA");
        let closed = channel.shared.closed.clone();
        let clone = channel.clone();
        drop(channel);
        assert!(!closed.is_cancelled());
        drop(clone);
        assert!(closed.is_cancelled());
    }
}
