//! Response reordering.
//!
//! Handlers complete in any order; responses must hit the wire in request
//! order. Each completed response is parked under its sequence id and the
//! drain step writes the contiguous run starting at `next_expected`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::metrics::IngressMetrics;
use crate::network::codec::OutboundFrame;
use crate::network::Connection;

use super::session::SessionResources;

/// Sequence-ordered queue: items go in under any id and come out strictly
/// in id order starting from zero.
#[derive(Debug)]
pub struct ReorderQueue<T> {
    next_expected: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for ReorderQueue<T> {
    fn default() -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> ReorderQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `item` under `sequence_id`. Returns `false` (and drops nothing)
    /// when the id was already delivered or is already pending.
    pub fn insert(&mut self, sequence_id: u64, item: T) -> bool {
        if sequence_id < self.next_expected || self.pending.contains_key(&sequence_id) {
            return false;
        }
        self.pending.insert(sequence_id, item);
        true
    }

    /// Remove the item for `next_expected`, if it arrived, and advance.
    pub fn pop_ready(&mut self) -> Option<(u64, T)> {
        let item = self.pending.remove(&self.next_expected)?;
        let sequence_id = self.next_expected;
        self.next_expected += 1;
        Some((sequence_id, item))
    }

    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A completed response waiting for its turn.
#[derive(Debug)]
pub struct ResponseSlot {
    /// `None` for no-op responses.
    pub frame: Option<OutboundFrame>,
    pub resources: SessionResources,
}

impl ResponseSlot {
    #[must_use]
    pub fn new(frame: Option<OutboundFrame>, resources: SessionResources) -> Self {
        Self { frame, resources }
    }
}

/// Reordering buffer of one connection.
pub struct ResponseReorderBuffer {
    queue: Mutex<ReorderQueue<ResponseSlot>>,
    /// Held for a whole drain so only one task writes at a time.
    writer: tokio::sync::Mutex<()>,
    metrics: Arc<IngressMetrics>,
}

impl ResponseReorderBuffer {
    #[must_use]
    pub fn new(metrics: Arc<IngressMetrics>) -> Self {
        Self {
            queue: Mutex::new(ReorderQueue::new()),
            writer: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, ReorderQueue<ResponseSlot>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Park a completed response.
    pub fn insert(&self, sequence_id: u64, slot: ResponseSlot) {
        if !self.queue().insert(sequence_id, slot) {
            debug!(sequence_id, "duplicate or stale response slot dropped");
        }
    }

    /// Write every response that is next in line.
    ///
    /// Resources of a slot are released after its write finished. Write
    /// failures are logged and the slot is consumed anyway.
    pub async fn drain(&self, conn: &Connection) {
        let _writer = self.writer.lock().await;
        loop {
            let next = self.queue().pop_ready();
            let Some((sequence_id, slot)) = next else {
                break;
            };
            let ResponseSlot { frame, resources } = slot;

            let Some(frame) = frame else {
                trace!(connection_id = conn.id(), sequence_id, "skipping no-op response");
                resources.release();
                continue;
            };

            match conn.write(frame).await {
                Ok(written) => {
                    self.metrics.record_bytes_sent(written);
                    trace!(connection_id = conn.id(), sequence_id, written, "response written");
                }
                Err(e) => {
                    debug!(connection_id = conn.id(), sequence_id, error = %e, "failed to write response");
                }
            }
            resources.release();
        }
    }

    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.queue().next_expected()
    }

    /// Completed responses waiting for an earlier one.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.queue().len()
    }
}

impl std::fmt::Debug for ResponseReorderBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue();
        f.debug_struct("ResponseReorderBuffer")
            .field("next_expected", &queue.next_expected())
            .field("pending", &queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::RequestBudgets;
    use crate::auth::AuthState;
    use crate::network::codec::{ResponseDecoder, ResponseFrame};
    use crate::network::ClientStream;
    use crate::pipeline::session::RequestTracker;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_queue_releases_in_order() {
        let mut queue = ReorderQueue::new();
        assert!(queue.insert(2, "c"));
        assert!(queue.insert(1, "b"));
        assert_eq!(queue.pop_ready(), None);

        assert!(queue.insert(0, "a"));
        assert_eq!(queue.pop_ready(), Some((0, "a")));
        assert_eq!(queue.pop_ready(), Some((1, "b")));
        assert_eq!(queue.pop_ready(), Some((2, "c")));
        assert_eq!(queue.pop_ready(), None);
        assert_eq!(queue.next_expected(), 3);
    }

    #[test]
    fn test_queue_rejects_stale_and_duplicate() {
        let mut queue = ReorderQueue::new();
        assert!(queue.insert(0, 1));
        assert!(!queue.insert(0, 2));
        queue.pop_ready();
        assert!(!queue.insert(0, 3));
        assert!(queue.is_empty());
    }

    async fn connected() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (conn, _input) = Connection::new(
            0,
            Arc::from("test"),
            peer,
            ClientStream::plain(server),
            AuthState::new(0, false, vec![]),
        );
        (conn, client)
    }

    async fn resources(budgets: &RequestBudgets, metrics: &Arc<IngressMetrics>) -> SessionResources {
        SessionResources::new(
            Duration::ZERO,
            budgets.acquire_memory(100).await.unwrap(),
            budgets.acquire_slot().await.unwrap(),
            RequestTracker::new(Arc::clone(metrics), "test"),
        )
    }

    fn response(correlation_id: i32, body: &'static [u8]) -> Option<OutboundFrame> {
        Some(OutboundFrame::Response {
            correlation_id,
            body: Bytes::from_static(body),
        })
    }

    #[tokio::test]
    async fn test_drain_writes_in_sequence_order() {
        let metrics = Arc::new(IngressMetrics::new());
        let budgets = RequestBudgets::new(10_000, 10);
        let (conn, client) = connected().await;
        let buffer = ResponseReorderBuffer::new(Arc::clone(&metrics));

        buffer.insert(1, ResponseSlot::new(response(20, b"second"), resources(&budgets, &metrics).await));
        buffer.drain(&conn).await;
        assert_eq!(buffer.pending_len(), 1);
        assert_eq!(budgets.available_slots(), 9);

        buffer.insert(0, ResponseSlot::new(response(10, b"first"), resources(&budgets, &metrics).await));
        buffer.drain(&conn).await;
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.next_expected(), 2);
        assert_eq!(budgets.available_slots(), 10);
        assert_eq!(budgets.available_memory(), 10_000);

        let mut frames = FramedRead::new(client, ResponseDecoder::default());
        let first: ResponseFrame = frames.next().await.unwrap().unwrap();
        let second: ResponseFrame = frames.next().await.unwrap().unwrap();
        assert_eq!(first.correlation_id, 10);
        assert_eq!(&first.body[..], b"first");
        assert_eq!(second.correlation_id, 20);
    }

    #[tokio::test]
    async fn test_noop_skipped_but_released() {
        let metrics = Arc::new(IngressMetrics::new());
        let budgets = RequestBudgets::new(10_000, 10);
        let (conn, client) = connected().await;
        let buffer = ResponseReorderBuffer::new(Arc::clone(&metrics));

        buffer.insert(0, ResponseSlot::new(None, resources(&budgets, &metrics).await));
        buffer.insert(1, ResponseSlot::new(response(7, b"x"), resources(&budgets, &metrics).await));
        buffer.drain(&conn).await;

        assert_eq!(buffer.next_expected(), 2);
        assert_eq!(budgets.available_slots(), 10);

        let mut frames = FramedRead::new(client, ResponseDecoder::default());
        let frame = frames.next().await.unwrap().unwrap();
        assert_eq!(frame.correlation_id, 7);
        assert_eq!(metrics.bytes_sent.get(), 9);
    }
}
