//! Per-peer connection state
//!
//! A `Connection` owns the write half of a peer's transport behind an async
//! lock, so the dispatcher and the peer's own reader (answering pings,
//! sending Close) never interleave bytes on the wire. The lifecycle state is
//! published on a watch channel; the reader task waits on it to notice when
//! the relay has dropped the peer.

use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::protocol::{encode, Frame};

/// Unique identifier for a connection
pub type ConnectionId = Uuid;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade request not yet answered
    Handshaking,
    /// Registered and relaying
    Open,
    /// A Close frame has been sent or received
    Closing,
    /// Terminated; no longer in the registry
    Closed,
}

/// One peer's session
pub struct Connection {
    id: ConnectionId,
    writer: Mutex<BoxedWriter>,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Wrap the write half of a transport; starts in `Handshaking`
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state, _) = watch::channel(ConnectionState::Handshaking);
        Self {
            id: Uuid::new_v4(),
            writer: Mutex::new(Box::new(writer)),
            state,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Receiver that observes every state change
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Handshaking -> Open
    pub(crate) fn mark_open(&self) -> bool {
        self.transition(|state| state == ConnectionState::Handshaking, ConnectionState::Open)
    }

    /// Open -> Closing; false if a close is already under way
    pub fn begin_closing(&self) -> bool {
        self.transition(|state| state == ConnectionState::Open, ConnectionState::Closing)
    }

    /// Any state -> Closed; true only for the call that performed it
    pub fn mark_closed(&self) -> bool {
        self.transition(|state| state != ConnectionState::Closed, ConnectionState::Closed)
    }

    fn transition(&self, allowed: impl Fn(ConnectionState) -> bool, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if allowed(*state) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Write raw bytes under the per-connection write lock
    pub async fn send_bytes(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    pub async fn send_frame(&self, frame: &Frame) -> std::io::Result<()> {
        self.send_bytes(&encode(frame)).await
    }

    /// Shut the write half down; errors are irrelevant at this point
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
