//! Connection Sessions
//!
//! `Relay` is what the accept loop talks to. `on_connect` performs the
//! handshake and registers the peer, `on_bytes` feeds socket data through
//! the codec and routes complete messages to the dispatcher, and `on_close`
//! tears a connection down. `run` is the per-connection read loop that ties
//! the three together.

use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connection::{Connection, ConnectionId, ConnectionState};
use super::dispatcher::{DispatchHandle, Dispatcher};
use super::error::{RegistryError, RelayResult};
use super::registry::Registry;
use crate::config::RelayConfig;
use crate::handshake::{self, HandshakeError};
use crate::protocol::{decode_limited, parse_close_payload, CloseCode, Frame, FrameError, OpCode};

/// Why a connection is being torn down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a Close frame carrying this code
    PeerClosed { code: u16 },
    /// Frame-level protocol violation
    Protocol(FrameError),
    /// Continuation without a started message, or a new message mid-fragment
    Fragmentation,
    /// Reassembled message over the size limit
    MessageTooBig,
    /// Text message that is not UTF-8
    InvalidUtf8,
    /// Peer closed its side of the stream without a Close frame
    EndOfStream,
    /// Read or write on the transport failed
    Transport(String),
    /// The relay already closed this connection (pruned or shut down)
    Terminated,
}

impl CloseReason {
    /// Code for the outgoing Close frame; `None` when none should be sent
    pub fn close_code(&self) -> Option<u16> {
        match self {
            CloseReason::PeerClosed { code } => Some(*code),
            CloseReason::Protocol(e) => Some(e.close_code()),
            CloseReason::Fragmentation => Some(CloseCode::PROTOCOL_ERROR),
            CloseReason::MessageTooBig => Some(CloseCode::MESSAGE_TOO_BIG),
            CloseReason::InvalidUtf8 => Some(CloseCode::INVALID_PAYLOAD),
            CloseReason::EndOfStream => Some(CloseCode::NO_STATUS),
            CloseReason::Transport(_) | CloseReason::Terminated => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed { code } => write!(f, "peer closed ({})", code),
            CloseReason::Protocol(e) => write!(f, "protocol error: {}", e),
            CloseReason::Fragmentation => write!(f, "invalid fragmentation"),
            CloseReason::MessageTooBig => write!(f, "message too big"),
            CloseReason::InvalidUtf8 => write!(f, "invalid UTF-8 in text message"),
            CloseReason::EndOfStream => write!(f, "end of stream"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::Terminated => write!(f, "terminated by relay"),
        }
    }
}

/// What the read loop should do after feeding bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(CloseReason),
}

struct PartialMessage {
    opcode: OpCode,
    payload: Vec<u8>,
}

/// Read side of an open connection
pub struct ConnectionHandle {
    connection: Arc<Connection>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Bytes received but not yet decoded
    buffer: Vec<u8>,
    partial: Option<PartialMessage>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Fold a data frame into the message being assembled
    ///
    /// Returns the complete message once its final fragment arrives.
    fn assemble(&mut self, frame: Frame, max_len: usize) -> Result<Option<Frame>, CloseReason> {
        let mut message = match (frame.opcode, self.partial.take()) {
            (OpCode::Continuation, Some(partial)) => partial,
            (OpCode::Continuation, None) | (_, Some(_)) => {
                return Err(CloseReason::Fragmentation)
            }
            (opcode, None) => PartialMessage {
                opcode,
                payload: Vec::new(),
            },
        };

        if message.payload.len() + frame.payload.len() > max_len {
            return Err(CloseReason::MessageTooBig);
        }
        message.payload.extend_from_slice(&frame.payload);

        if !frame.fin {
            self.partial = Some(message);
            return Ok(None);
        }

        if message.opcode == OpCode::Text && std::str::from_utf8(&message.payload).is_err() {
            return Err(CloseReason::InvalidUtf8);
        }
        Ok(Some(Frame::new(message.opcode, message.payload)))
    }
}

/// The broadcast relay: registry, dispatcher and per-connection sessions
#[derive(Clone)]
pub struct Relay {
    registry: Arc<Registry>,
    dispatch: DispatchHandle,
    config: Arc<RelayConfig>,
}

impl Relay {
    /// Create a relay and spawn its dispatcher task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: RelayConfig) -> (Self, JoinHandle<()>) {
        let registry = Arc::new(Registry::new(config.max_connections));
        let dispatcher = Dispatcher::new(Arc::clone(&registry), config.write_timeout());
        let (dispatch, task) = dispatcher.spawn(config.dispatch_queue_capacity);

        let relay = Self {
            registry,
            dispatch,
            config: Arc::new(config),
        };
        (relay, task)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    /// Perform the opening handshake on a fresh transport and register it
    ///
    /// The slot is reserved before the 101 is written, so a client refused
    /// for capacity or shutdown never sees an upgrade. On error nothing stays
    /// registered and the transport is dropped.
    pub async fn on_connect<S>(&self, transport: S) -> RelayResult<ConnectionHandle>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(transport);

        let request = handshake::read_request(
            &mut reader,
            self.config.handshake_timeout(),
            self.config.max_handshake_bytes,
        )
        .await?;
        let response = handshake::negotiate(&request.head)?;

        let connection = Arc::new(Connection::new(writer));
        let id = self.registry.reserve(Arc::clone(&connection)).await?;

        let written =
            tokio::time::timeout(self.config.write_timeout(), connection.send_bytes(&response))
                .await
                .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut)));
        if let Err(e) = written {
            self.registry.release(id).await;
            return Err(HandshakeError::WriteFailed(e).into());
        }

        // Shutdown may have drained the slot while the 101 was in flight
        if !connection.mark_open() {
            self.registry.release(id).await;
            let frame = Frame::close(CloseCode::GOING_AWAY, "server shutting down");
            let _ =
                tokio::time::timeout(self.config.write_timeout(), connection.send_frame(&frame))
                    .await;
            return Err(RegistryError::ShuttingDown.into());
        }
        tracing::info!(connection_id = %id, "WebSocket connected");

        let state_rx = connection.subscribe_state();
        Ok(ConnectionHandle {
            connection,
            reader: Box::new(reader),
            buffer: request.leftover,
            partial: None,
            state_rx,
        })
    }

    /// Feed newly read bytes and act on every complete frame
    ///
    /// Incomplete trailing data stays buffered for the next call.
    pub async fn on_bytes(&self, handle: &mut ConnectionHandle, bytes: &[u8]) -> Flow {
        handle.buffer.extend_from_slice(bytes);

        let mut offset = 0;
        let flow = loop {
            match decode_limited(&handle.buffer[offset..], self.config.max_frame_bytes) {
                Ok((frame, used)) => {
                    offset += used;
                    if let Flow::Close(reason) = self.handle_frame(handle, frame).await {
                        break Flow::Close(reason);
                    }
                }
                Err(e) if e.is_truncated() => break Flow::Continue,
                Err(e) => break Flow::Close(CloseReason::Protocol(e)),
            }
        };

        handle.buffer.drain(..offset);
        flow
    }

    async fn handle_frame(&self, handle: &mut ConnectionHandle, frame: Frame) -> Flow {
        if let Err(e) = frame.validate_inbound(self.config.strict_reserved_bits) {
            return Flow::Close(CloseReason::Protocol(e));
        }

        match frame.opcode {
            OpCode::Ping => {
                let pong = Frame::pong(frame.payload);
                let write_timeout = self.config.write_timeout();
                match tokio::time::timeout(write_timeout, handle.connection.send_frame(&pong)).await
                {
                    Ok(Ok(())) => Flow::Continue,
                    Ok(Err(e)) => Flow::Close(CloseReason::Transport(e.to_string())),
                    Err(_) => Flow::Close(CloseReason::Transport(format!(
                        "pong not written within {:?}",
                        write_timeout
                    ))),
                }
            }
            OpCode::Pong => Flow::Continue,
            OpCode::Close => {
                let (code, reason) = parse_close_payload(&frame.payload);
                if frame.payload.len() >= 2 && !CloseCode::is_sendable(code) {
                    return Flow::Close(CloseReason::Protocol(FrameError::InvalidCloseCode(code)));
                }
                tracing::debug!(
                    connection_id = %handle.id(),
                    code,
                    reason = %reason,
                    "Client requested close"
                );
                Flow::Close(CloseReason::PeerClosed { code })
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                match handle.assemble(frame, self.config.max_message_bytes) {
                    Ok(Some(message)) => self.relay_message(handle.id(), message).await,
                    Ok(None) => Flow::Continue,
                    Err(reason) => Flow::Close(reason),
                }
            }
        }
    }

    async fn relay_message(&self, sender: ConnectionId, message: Frame) -> Flow {
        match self.dispatch.submit(sender, message).await {
            Ok(report) => {
                if !report.pruned.is_empty() {
                    tracing::debug!(
                        connection_id = %sender,
                        pruned = report.pruned.len(),
                        "Broadcast pruned peers"
                    );
                }
                Flow::Continue
            }
            Err(e) => {
                tracing::debug!(connection_id = %sender, error = %e, "Message not relayed");
                Flow::Close(CloseReason::Terminated)
            }
        }
    }

    /// Tear a connection down
    ///
    /// Sends a best-effort Close frame when the transport is still usable,
    /// then unregisters the connection and shuts its write half.
    pub async fn on_close(&self, handle: ConnectionHandle, reason: CloseReason) {
        let connection = handle.connection;
        let write_timeout = self.config.write_timeout();

        if let Some(code) = reason.close_code() {
            if connection.begin_closing() {
                let frame = Frame::close(code, "");
                let _ = tokio::time::timeout(write_timeout, connection.send_frame(&frame)).await;
            }
        }

        connection.mark_closed();
        self.registry.unregister(connection.id()).await;
        let _ = tokio::time::timeout(write_timeout, connection.shutdown()).await;

        tracing::debug!(connection_id = %connection.id(), reason = %reason, "Connection closed");
    }

    /// Read loop for one connection; returns once it has been closed
    pub async fn run(&self, mut handle: ConnectionHandle) {
        let mut buf = vec![0u8; self.config.read_buffer_bytes.max(1)];

        // Frames that arrived together with the upgrade request
        let mut flow = self.on_bytes(&mut handle, &[]).await;

        while flow == Flow::Continue {
            let read = tokio::select! {
                result = handle.reader.read(&mut buf) => Some(result),
                _ = terminated(&mut handle.state_rx) => None,
            };

            flow = match read {
                Some(Ok(0)) => Flow::Close(CloseReason::EndOfStream),
                Some(Ok(n)) => self.on_bytes(&mut handle, &buf[..n]).await,
                Some(Err(e)) => Flow::Close(CloseReason::Transport(e.to_string())),
                None => Flow::Close(CloseReason::Terminated),
            };
        }

        if let Flow::Close(reason) = flow {
            self.on_close(handle, reason).await;
        }
    }

    /// Close every connection with 1001 and empty the registry
    pub async fn shutdown(&self) {
        let connections = self.registry.drain().await;
        let count = connections.len();
        let frame = Frame::close(CloseCode::GOING_AWAY, "server shutting down");

        for connection in connections {
            if connection.begin_closing() {
                let _ = tokio::time::timeout(
                    self.config.write_timeout(),
                    connection.send_frame(&frame),
                )
                .await;
            }
            connection.mark_closed();
        }

        tracing::info!(connections = count, "Relay shut down");
    }
}

/// Resolves once the connection has been marked `Closed` elsewhere
async fn terminated(state_rx: &mut watch::Receiver<ConnectionState>) {
    loop {
        if *state_rx.borrow_and_update() == ConnectionState::Closed {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}
