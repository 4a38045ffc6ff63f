//! gRPC server assembly: listener, interceptor chain and self-registration.

use std::net::SocketAddr;

use discovery::{CoordinationStore, LeasePublisher, instance_key};
use parking_lot::RwLock;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::Server;

use crate::error::TransportError;
use crate::layers::{CallMetrics, interceptors};

/// Where a [`GrpcServer`] listens and what it publishes.
#[derive(Debug, Clone)]
pub struct GrpcServerConfig {
    /// Logical name registered in the coordination store.
    pub service_name: String,

    /// Address to bind. Port `0` picks an ephemeral port.
    pub listen_addr: SocketAddr,

    /// Host part of the registered address. Defaults to the machine's local IP.
    pub advertise_host: Option<String>,

    /// Registry receiving the call metrics. Each server gets its own when unset.
    pub registry: Option<Registry>,
}

impl GrpcServerConfig {
    #[must_use]
    pub fn new(service_name: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            service_name: service_name.into(),
            listen_addr,
            advertise_host: None,
            registry: None,
        }
    }

    #[must_use]
    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }
}

/// A tonic server that keeps itself registered while it is serving.
pub struct GrpcServer<S> {
    config: GrpcServerConfig,
    publisher: LeasePublisher<S>,
    metrics: CallMetrics,
    shutdown: CancellationToken,
    advertised: RwLock<Option<String>>,
    serving: watch::Sender<bool>,
}

impl<S> std::fmt::Debug for GrpcServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcServer")
            .field("config", &self.config)
            .field("advertised", &*self.advertised.read())
            .field("serving", &*self.serving.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: CoordinationStore> GrpcServer<S> {
    /// # Errors
    /// Returns [`TransportError::Metrics`] if the configured registry already
    /// holds the call metrics of a server with the same service name.
    pub fn new(config: GrpcServerConfig, publisher: LeasePublisher<S>) -> Result<Self, TransportError> {
        let registry = config.registry.clone().unwrap_or_default();
        let metrics = CallMetrics::register(&config.service_name, &registry)?;
        let (serving, _) = watch::channel(false);
        Ok(Self {
            config,
            publisher,
            metrics,
            shutdown: CancellationToken::new(),
            advertised: RwLock::new(None),
            serving,
        })
    }

    #[must_use]
    pub fn config(&self) -> &GrpcServerConfig {
        &self.config
    }

    /// `host:port` registered for this server, once it is listening.
    #[must_use]
    pub fn advertised_addr(&self) -> Option<String> {
        self.advertised.read().clone()
    }

    /// Prometheus collectors fed by the interceptor chain.
    #[must_use]
    pub fn metrics(&self) -> &CallMetrics {
        &self.metrics
    }

    /// Bind, register and serve `routes` until [`stop`](Self::stop) is called
    /// or the transport fails.
    ///
    /// Returns `Ok(())` right away if the server was already stopped.
    ///
    /// # Errors
    /// - [`TransportError::Bind`] if the listener cannot be bound
    /// - [`TransportError::AdvertiseHost`] if no host was configured and the
    ///   local IP cannot be determined
    /// - [`TransportError::Serve`] if the transport terminates with an error
    pub async fn serve(&self, routes: Routes) -> Result<(), TransportError> {
        self.serving.send_replace(true);
        let result = self.run(routes).await;
        self.serving.send_replace(false);
        result
    }

    async fn run(&self, routes: Routes) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            tracing::debug!(service = %self.config.service_name, "server already stopped");
            return Ok(());
        }

        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let bound_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let host = match &self.config.advertise_host {
            Some(host) => host.clone(),
            None => local_ip_address::local_ip()
                .map_err(TransportError::AdvertiseHost)?
                .to_string(),
        };
        let advertised = format!("{host}:{}", bound_addr.port());
        *self.advertised.write() = Some(advertised.clone());
        tracing::info!(
            service = %self.config.service_name,
            %bound_addr,
            %advertised,
            "gRPC server listening"
        );

        self.publisher
            .register(&self.config.service_name, &advertised)?;

        let cancel = self.shutdown.clone();
        let incoming = TcpListenerStream::new(listener);
        let result = Server::builder()
            .layer(interceptors(&self.config.service_name, self.metrics.clone()))
            .add_routes(routes)
            .serve_with_incoming_shutdown(incoming, async move {
                cancel.cancelled().await;
            })
            .await;

        // `stop` deregisters before draining; this covers transport failures
        // and a stop that raced with startup.
        let key = instance_key(
            self.publisher.service_prefix(),
            &self.config.service_name,
            &advertised,
        );
        if self.publisher.registered_keys().contains(&key) {
            self.deregister_best_effort(&advertised).await;
        }

        tracing::info!(service = %self.config.service_name, "gRPC server stopped");
        result.map_err(TransportError::Serve)
    }

    /// Deregister, then drain in-flight calls and wait for [`serve`](Self::serve)
    /// to return.
    ///
    /// A failed deregistration is logged and does not prevent shutdown; the
    /// lease expires on its own.
    pub async fn stop(&self) {
        let advertised = self.advertised.read().clone();
        if let Some(addr) = advertised {
            self.deregister_best_effort(&addr).await;
        }
        self.shutdown.cancel();

        let mut serving = self.serving.subscribe();
        if let Err(err) = serving.wait_for(|serving| !*serving).await {
            tracing::debug!(error = %err, "serving state channel closed");
        }
    }

    async fn deregister_best_effort(&self, addr: &str) {
        if let Err(err) = self.publisher.deregister(&self.config.service_name, addr).await {
            tracing::warn!(
                service = %self.config.service_name,
                key = err.key(),
                error = %err,
                "failed to deregister gRPC server"
            );
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use discovery::{MemoryStore, RegistrationConfig};

    fn server(store: &MemoryStore, listen: &str) -> GrpcServer<MemoryStore> {
        let publisher =
            LeasePublisher::new(store.clone(), "/services", RegistrationConfig::default()).unwrap();
        let config = GrpcServerConfig::new("svcA", listen.parse().unwrap())
            .with_advertise_host("127.0.0.1");
        GrpcServer::new(config, publisher).unwrap()
    }

    #[tokio::test]
    async fn test_serve_after_stop_returns_immediately() {
        let store = MemoryStore::new();
        let server = server(&store, "127.0.0.1:0");
        server.stop().await;

        server.serve(Routes::default()).await.unwrap();
        assert!(server.advertised_addr().is_none());
        assert_eq!(store.revision(), 0);
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let store = MemoryStore::new();
        let server = server(&store, &addr);

        let err = server.serve(Routes::default()).await.unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }), "{err:?}");
        assert!(server.advertised_addr().is_none());
    }

    #[test]
    fn test_servers_can_share_a_registry() {
        let store = MemoryStore::new();
        let registry = Registry::new();
        let make = |service: &str| {
            let publisher =
                LeasePublisher::new(store.clone(), "/services", RegistrationConfig::default())
                    .unwrap();
            let config = GrpcServerConfig::new(service, "127.0.0.1:0".parse().unwrap())
                .with_registry(registry.clone());
            GrpcServer::new(config, publisher)
        };

        assert!(make("svcA").is_ok());
        assert!(make("svcB").is_ok());
        let err = make("svcA").unwrap_err();
        assert!(matches!(err, TransportError::Metrics(_)), "{err:?}");
    }
}
