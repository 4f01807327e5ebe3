//! Relay error types

use thiserror::Error;

use super::connection::ConnectionId;
use crate::handshake::HandshakeError;

/// Errors from registry membership changes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    /// The relay has been shut down
    #[error("Relay is shutting down")]
    ShuttingDown,
}

/// Errors surfaced to the accept loop
#[derive(Error, Debug)]
pub enum RelayError {
    /// Upgrade negotiation failed; the transport was never registered
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Registration refused
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The dispatcher task is gone (relay shutting down)
    #[error("Dispatcher stopped")]
    DispatcherStopped,
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
