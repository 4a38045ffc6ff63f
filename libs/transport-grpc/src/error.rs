use std::net::SocketAddr;
use std::time::Duration;

use discovery::DiscoveryError;

/// Errors raised while assembling gRPC clients and servers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    #[error("no instances of `{target}` resolved within {}ms", timeout.as_millis())]
    ResolveTimeout { target: String, timeout: Duration },

    #[error("none of the resolved instances of `{target}` could be reached")]
    NoReachableEndpoint { target: String },

    #[error("no live instances of `{target}`")]
    NoEndpoints { target: String },

    #[error("failed to bind gRPC listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to determine the address to advertise")]
    AdvertiseHost(#[source] local_ip_address::Error),

    #[error("failed to register call metrics")]
    Metrics(#[from] prometheus::Error),

    #[error("gRPC server terminated with an error")]
    Serve(#[source] tonic::transport::Error),
}
