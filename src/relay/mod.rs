//! Broadcast Relay
//!
//! Everything above the codec: the set of live connections, the dispatcher
//! that fans messages out, and the per-connection session that drives the
//! handshake and read loop.
//!
//! ## Architecture
//!
//! ```text
//! reader task (one per peer)          dispatcher task (one)
//! ┌───────────────────────┐  submit   ┌────────────────────────┐
//! │ read -> decode ->     │ ────────► │ snapshot registry      │
//! │ reassemble -> submit  │ ◄──────── │ write to peers != from │
//! └───────────────────────┘  report   │ compact failed peers   │
//!                                     └────────────────────────┘
//! ```
//!
//! A reader waits for each report before reading further, so one peer's
//! messages are delivered in the order they were received.

mod connection;
mod dispatcher;
mod error;
mod registry;
mod session;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use dispatcher::{DispatchHandle, DispatchReport, Dispatcher};
pub use error::{RegistryError, RelayError, RelayResult};
pub use registry::Registry;
pub use session::{CloseReason, ConnectionHandle, Flow, Relay};
