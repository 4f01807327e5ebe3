//! Broadcast Dispatcher
//!
//! Fans each message out to every registered peer except its sender. A
//! single dispatcher task drains a bounded queue; every submission carries a
//! reply channel and the submitting reader waits for it, so one sender's
//! messages reach peers in the order they were read.
//!
//! Per message:
//! 1. Snapshot the registry (lock held only for the copy)
//! 2. Encode once
//! 3. Write to each open peer under its own write lock, bounded by a timeout
//! 4. After every peer has been tried, drop the failed ones in one compaction

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::connection::ConnectionId;
use super::error::RelayError;
use super::registry::Registry;
use crate::protocol::{encode, Frame};

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Peers the message was written to
    pub delivered: usize,
    /// Peers whose write failed and were removed
    pub pruned: Vec<ConnectionId>,
}

/// Writes messages to registry members
pub struct Dispatcher {
    registry: Arc<Registry>,
    write_timeout: Duration,
}

struct Envelope {
    sender: ConnectionId,
    frame: Frame,
    reply: oneshot::Sender<DispatchReport>,
}

/// Cloneable submission side of a running dispatcher
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Envelope>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    /// Deliver `frame` to every open peer except `sender`
    pub async fn dispatch(&self, sender: ConnectionId, frame: &Frame) -> DispatchReport {
        let peers = self.registry.snapshot().await;
        let bytes = encode(frame);
        let mut report = DispatchReport::default();

        for peer in peers
            .iter()
            .filter(|peer| peer.id() != sender && peer.is_open())
        {
            match tokio::time::timeout(self.write_timeout, peer.send_bytes(&bytes)).await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    tracing::debug!(
                        connection_id = %peer.id(),
                        error = %e,
                        "Broadcast write failed"
                    );
                    peer.mark_closed();
                    report.pruned.push(peer.id());
                }
                Err(_) => {
                    tracing::debug!(
                        connection_id = %peer.id(),
                        timeout = ?self.write_timeout,
                        "Broadcast write timed out"
                    );
                    peer.mark_closed();
                    report.pruned.push(peer.id());
                }
            }
        }

        if !report.pruned.is_empty() {
            self.registry.compact(&report.pruned).await;
        }

        tracing::trace!(
            sender = %sender,
            delivered = report.delivered,
            pruned = report.pruned.len(),
            "Broadcast message"
        );
        report
    }

    /// Run the dispatcher as a task consuming a queue of `capacity` messages
    ///
    /// The task ends once every `DispatchHandle` has been dropped.
    pub fn spawn(self, capacity: usize) -> (DispatchHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));

        let task = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let report = self.dispatch(envelope.sender, &envelope.frame).await;
                let _ = envelope.reply.send(report);
            }
            tracing::debug!("Dispatcher stopped");
        });

        (DispatchHandle { tx }, task)
    }
}

impl DispatchHandle {
    /// Queue a message and wait until its broadcast has completed
    pub async fn submit(
        &self,
        sender: ConnectionId,
        frame: Frame,
    ) -> Result<DispatchReport, RelayError> {
        let (reply, done) = oneshot::channel();

        self.tx
            .send(Envelope {
                sender,
                frame,
                reply,
            })
            .await
            .map_err(|_| RelayError::DispatcherStopped)?;

        done.await.map_err(|_| RelayError::DispatcherStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;
    use crate::relay::connection::{Connection, ConnectionState};
    use tokio::io::{AsyncReadExt, DuplexStream};

    async fn peer(registry: &Registry) -> (Arc<Connection>, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::new(server));
        registry.register(Arc::clone(&conn)).await.unwrap();
        (conn, client)
    }

    async fn read_frames(client: &mut DuplexStream, count: usize) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        while frames.len() < count {
            if let Ok((frame, used)) = decode(&buf) {
                buf.drain(..used);
                frames.push(frame);
                continue;
            }
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream closed before a frame arrived");
            buf.extend_from_slice(&chunk[..n]);
        }
        frames
    }

    async fn read_frame(client: &mut DuplexStream) -> Frame {
        read_frames(client, 1).await.remove(0)
    }

    async fn assert_nothing_received(client: &mut DuplexStream) {
        let mut chunk = [0u8; 16];
        let result =
            tokio::time::timeout(Duration::from_millis(50), client.read(&mut chunk)).await;
        assert!(result.is_err(), "sender received its own message");
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let registry = Arc::new(Registry::new(16));
        let (a, mut a_client) = peer(&registry).await;
        let (_b, mut b_client) = peer(&registry).await;
        let (_c, mut c_client) = peer(&registry).await;

        let dispatcher = Dispatcher::new(Arc::clone(&registry), Duration::from_secs(1));
        let report = dispatcher.dispatch(a.id(), &Frame::text("hello")).await;

        assert_eq!(report.delivered, 2);
        assert!(report.pruned.is_empty());
        assert_eq!(read_frame(&mut b_client).await, Frame::text("hello"));
        assert_eq!(read_frame(&mut c_client).await, Frame::text("hello"));
        assert_nothing_received(&mut a_client).await;
    }

    #[tokio::test]
    async fn test_dead_peer_pruned() {
        let registry = Arc::new(Registry::new(16));
        let (a, _a_client) = peer(&registry).await;
        let (b, b_client) = peer(&registry).await;
        let (c, mut c_client) = peer(&registry).await;
        drop(b_client);

        let dispatcher = Dispatcher::new(Arc::clone(&registry), Duration::from_secs(1));
        let report = dispatcher.dispatch(a.id(), &Frame::text("first")).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.pruned, vec![b.id()]);
        assert_eq!(b.state(), ConnectionState::Closed);
        assert!(!registry.contains(b.id()).await);
        assert!(registry.contains(c.id()).await);
        assert_eq!(read_frame(&mut c_client).await, Frame::text("first"));

        let report = dispatcher.dispatch(a.id(), &Frame::text("second")).await;
        assert_eq!(report.delivered, 1);
        assert!(report.pruned.is_empty());
        assert_eq!(read_frame(&mut c_client).await, Frame::text("second"));
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out() {
        let registry = Arc::new(Registry::new(16));
        let (a, _a_client) = peer(&registry).await;

        // Tiny buffer that nobody drains
        let (_stalled_client, server) = tokio::io::duplex(8);
        let stalled = Arc::new(Connection::new(server));
        registry.register(Arc::clone(&stalled)).await.unwrap();

        let dispatcher = Dispatcher::new(Arc::clone(&registry), Duration::from_millis(50));
        let report = dispatcher
            .dispatch(a.id(), &Frame::binary(vec![0u8; 1024]))
            .await;

        assert_eq!(report.pruned, vec![stalled.id()]);
        assert!(!registry.contains(stalled.id()).await);
    }

    #[tokio::test]
    async fn test_skips_closing_peers() {
        let registry = Arc::new(Registry::new(16));
        let (a, _a_client) = peer(&registry).await;
        let (b, _b_client) = peer(&registry).await;
        b.begin_closing();

        let dispatcher = Dispatcher::new(Arc::clone(&registry), Duration::from_secs(1));
        let report = dispatcher.dispatch(a.id(), &Frame::text("x")).await;

        assert_eq!(report.delivered, 0);
        assert!(report.pruned.is_empty());
    }

    #[tokio::test]
    async fn test_queued_dispatch_preserves_order() {
        let registry = Arc::new(Registry::new(16));
        let (a, _a_client) = peer(&registry).await;
        let (_b, mut b_client) = peer(&registry).await;

        let (handle, _task) =
            Dispatcher::new(Arc::clone(&registry), Duration::from_secs(1)).spawn(8);

        for i in 0..5 {
            let report = handle
                .submit(a.id(), Frame::text(format!("msg-{}", i)))
                .await
                .unwrap();
            assert_eq!(report.delivered, 1);
        }

        let frames = read_frames(&mut b_client, 5).await;
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.payload, format!("msg-{}", i).into_bytes());
        }
    }

    #[tokio::test]
    async fn test_submit_after_stop() {
        let registry = Arc::new(Registry::new(16));
        let (handle, task) =
            Dispatcher::new(Arc::clone(&registry), Duration::from_secs(1)).spawn(1);
        task.abort();
        let _ = task.await;

        let result = handle.submit(uuid::Uuid::new_v4(), Frame::text("x")).await;
        assert!(matches!(result, Err(RelayError::DispatcherStopped)));
    }
}
