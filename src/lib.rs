//! A relay-aware DHCPv6 server with leasequery support.
//!
//! The `sedge-proto` crate handles the wire; this crate handles behavior:
//! the per-request [`bundle::TransactionBundle`], the filter/handler
//! [`pipeline`], the [`leasequery`] store, shared [`statistics`], the UDP and
//! TCP [`transport`], and the supervisor in [`server`] that ties them to
//! worker threads, signals and configuration reloads.

pub mod bundle;
pub mod config;
pub mod filters;
pub mod handlers;
pub mod leasequery;
pub mod pipeline;
pub mod server;
pub mod statistics;
pub mod transport;

use thiserror::Error;

/// Errors that abort request handling or server startup, as opposed to the
/// short-circuit conditions in [`handlers::HandlerError`] that shape a reply.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Proto(#[from] sedge_proto::Error),

    #[error("leasequery store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
