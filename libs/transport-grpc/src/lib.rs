//! gRPC client and server assembly on top of [`discovery`].
//!
//! - [`client::dial`] resolves a logical service name into a round-robin
//!   [`BalancedChannel`] that follows membership changes.
//! - [`GrpcServer`] binds a listener, wraps the routes in the interceptor
//!   chain from [`layers`] and keeps itself registered while serving.
//! - [`trace_context`] carries W3C trace context across calls (`otel` feature).
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod balance;
pub mod client;
pub mod error;
pub mod layers;
pub mod server;
pub mod trace_context;

pub use balance::{BalancedChannel, BoxError};
pub use client::{GrpcClientConfig, dial, dial_with_store};
pub use error::TransportError;
pub use layers::{CallClassifier, CallMetrics, CallObserver, interceptors};
pub use server::{GrpcServer, GrpcServerConfig};
