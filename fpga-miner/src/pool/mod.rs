//! Getwork pool protocol.
//!
//! Work is fetched and solutions are submitted with the `getwork` JSON-RPC
//! method over HTTP. Each device session owns a [`PoolClient`] holding
//! failure state for every configured endpoint; the transport is shared.

pub mod client;
pub mod endpoint;
pub mod http;
pub mod rpc;

pub use client::{ClientConfig, PoolClient, PoolTiming, SubmitAck};
pub use endpoint::{EndpointState, PoolEndpoint};
pub use http::HttpTransport;
pub use rpc::{decode_work_data, extract_field, RpcRequest, RpcResponse, RpcTransport};

use thiserror::Error;

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("fpga-miner/", env!("CARGO_PKG_VERSION"));

/// Errors from the pool protocol.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PoolError {
    /// Every endpoint is cooling down. Retried on the next cycle.
    #[error("no pool endpoint available")]
    NoEndpointAvailable,

    /// Transport failure (connect, timeout, HTTP status, body read).
    #[error("network error: {0}")]
    Network(String),

    /// The response could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed URL: {0}")]
    MalformedUrl(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;
