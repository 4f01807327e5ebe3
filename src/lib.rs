//! # wsrelay
//!
//! A single-endpoint WebSocket broadcast relay. Clients upgrade over plain
//! TCP, and every message one client sends is written to all the others.
//!
//! ## Modules
//!
//! - [`protocol`]: RFC 6455 frame codec
//! - [`handshake`]: HTTP upgrade negotiation
//! - [`relay`]: connection registry, broadcast dispatcher and sessions
//! - [`server`]: TCP accept loop
//! - [`config`]: TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wsrelay::config::Config;
//! use wsrelay::server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!
//!     let listener = server::bind(&config).await?;
//!     server::serve(listener, config.relay, server::shutdown_signal()).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod handshake;
pub mod protocol;
pub mod relay;
pub mod server;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError, LoggingConfig, RelayConfig, ServerConfig};

pub use handshake::{accept_key, negotiate, HandshakeError, UpgradeRequest};

pub use protocol::{decode, encode, CloseCode, Frame, FrameError, OpCode};

pub use relay::{
    CloseReason, Connection, ConnectionHandle, ConnectionId, ConnectionState, DispatchReport,
    Flow, Registry, RegistryError, Relay, RelayError,
};
