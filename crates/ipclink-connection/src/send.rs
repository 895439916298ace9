//! The send pipeline.
//!
//! Any thread may post; exactly one worker per connection takes envelopes off
//! the [`SendQueue`] in order and transfers them. Buffers that need an
//! acknowledgement are parked in the [`AcknowledgementWaitQueue`] at transfer
//! time, so a message can be queued well before it is in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use ipclink_frame::{is_reserved, FrameError};
use ipclink_transport::{MessageBuffer, Transport};
use tracing::{debug, trace, warn};

use crate::control::LargeMessageWrapper;
use crate::error::{ConnectionError, Result};
use crate::message::{Message, NeedsAcknowledgement};
use crate::timer::ResponsivenessTimer;

/// An outgoing buffer and whether the peer must acknowledge it.
#[derive(Debug)]
pub struct OutgoingEnvelope {
    pub buffer: MessageBuffer,
    pub needs_acknowledgement: NeedsAcknowledgement,
}

#[derive(Debug)]
struct SendQueueState {
    envelopes: VecDeque<OutgoingEnvelope>,
    running: bool,
}

/// FIFO between posting threads and the send worker.
#[derive(Debug)]
pub struct SendQueue {
    state: Mutex<SendQueueState>,
    condition: Condvar,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SendQueueState {
                envelopes: VecDeque::new(),
                running: true,
            }),
            condition: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SendQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an envelope and wake the worker.
    pub fn push(&self, envelope: OutgoingEnvelope) {
        let mut state = self.lock();
        state.envelopes.push_back(envelope);
        self.condition.notify_one();
    }

    /// Block until an envelope is available. Returns `None` once stopped,
    /// even if envelopes are still queued.
    pub fn pop_blocking(&self) -> Option<OutgoingEnvelope> {
        let mut state = self.lock();
        while state.envelopes.is_empty() && state.running {
            state = self
                .condition
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if !state.running {
            return None;
        }
        state.envelopes.pop_front()
    }

    /// Mark the pipeline stopped and wake the worker.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.running = false;
        self.condition.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn len(&self) -> usize {
        self.lock().envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().envelopes.is_empty()
    }
}

/// Transferred buffers the peer has not acknowledged yet, oldest first.
///
/// Entries keep their handles alive until acknowledged.
#[derive(Debug, Default)]
pub struct AcknowledgementWaitQueue {
    messages: Mutex<VecDeque<Arc<MessageBuffer>>>,
}

impl AcknowledgementWaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<MessageBuffer>>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, buffer: Arc<MessageBuffer>) {
        self.lock().push_back(buffer);
    }

    /// Drop the `count` oldest entries. Returns how many were actually removed.
    pub fn acknowledge(&self, count: usize) -> usize {
        let mut messages = self.lock();
        let removed = count.min(messages.len());
        messages.drain(..removed);
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Counters maintained by the send worker.
#[derive(Debug, Default)]
pub struct SendStats {
    transferred: AtomicU64,
    failed: AtomicU64,
}

/// A point-in-time copy of [`SendStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendStatsSnapshot {
    /// Envelopes written to the transport.
    pub transferred: u64,
    /// Envelopes dropped because the transfer failed.
    pub failed: u64,
}

impl SendStatsSnapshot {
    /// Every envelope the worker took off the queue.
    pub fn processed(&self) -> u64 {
        self.transferred + self.failed
    }
}

impl SendStats {
    pub fn snapshot(&self) -> SendStatsSnapshot {
        SendStatsSnapshot {
            transferred: self.transferred.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }
}

/// Start the send worker. It runs until the queue is stopped.
pub(crate) fn spawn_send_worker<T: Transport>(
    transport: Arc<T>,
    queue: Arc<SendQueue>,
    acknowledgements: Arc<AcknowledgementWaitQueue>,
    stats: Arc<SendStats>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("ipclink-send".to_string())
        .spawn(move || {
            while let Some(envelope) = queue.pop_blocking() {
                let buffer = Arc::new(envelope.buffer);
                if envelope.needs_acknowledgement == NeedsAcknowledgement::Yes {
                    acknowledgements.append(Arc::clone(&buffer));
                }

                match transport.transfer(&buffer) {
                    Ok(()) => {
                        stats.transferred.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(err) => {
                        warn!(error = %err, size = buffer.data().len(), "send worker: transfer failed");
                        stats.failed.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
            debug!("send worker stopped");
        })
}

/// A cloneable handle for posting on a connection from any thread.
pub struct MessageSender<T> {
    transport: Arc<T>,
    queue: Arc<SendQueue>,
    timer: ResponsivenessTimer,
}

impl<T> Clone for MessageSender<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            queue: Arc::clone(&self.queue),
            timer: self.timer.clone(),
        }
    }
}

impl<T: Transport> MessageSender<T> {
    pub(crate) fn new(transport: Arc<T>, queue: Arc<SendQueue>, timer: ResponsivenessTimer) -> Self {
        Self {
            transport,
            queue,
            timer,
        }
    }

    /// Whether the underlying transport is still open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Encode `message` and post it to its endpoint; the peer will acknowledge it.
    pub fn post_message<M: Message>(&self, message: &M) -> Result<()> {
        if !self.is_open() {
            return Err(ConnectionError::AlreadyClosed);
        }
        if is_reserved(message.kind_id()) {
            return Err(FrameError::ReservedKind(message.kind_id()).into());
        }
        let buffer = message.encode()?;
        self.post_buffer(message.endpoint_id(), buffer, NeedsAcknowledgement::Yes)
    }

    /// Post an already-encoded buffer.
    ///
    /// Buffers larger than the transport's single-transfer size are wrapped
    /// first. Fails with [`ConnectionError::AlreadyClosed`] once the
    /// transport is closed, without touching the queue.
    pub fn post_buffer(
        &self,
        endpoint_id: u32,
        buffer: MessageBuffer,
        needs_acknowledgement: NeedsAcknowledgement,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(ConnectionError::AlreadyClosed);
        }

        let buffer = if buffer.data().len() > self.transport.max_single_transfer_size() {
            debug!(
                size = buffer.data().len(),
                endpoint_id, "wrapping oversized message"
            );
            LargeMessageWrapper::wrap(endpoint_id, buffer)?
        } else {
            buffer
        };

        trace!(
            endpoint_id,
            size = buffer.data().len(),
            ?needs_acknowledgement,
            "queueing message"
        );
        self.queue.push(OutgoingEnvelope {
            buffer,
            needs_acknowledgement,
        });

        self.timer.start();
        Ok(())
    }
}

impl<T> std::fmt::Debug for MessageSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn envelope(data: &[u8], needs: NeedsAcknowledgement) -> OutgoingEnvelope {
        OutgoingEnvelope {
            buffer: MessageBuffer::from_parts(data, Vec::new()),
            needs_acknowledgement: needs,
        }
    }

    #[test]
    fn send_queue_is_fifo() {
        let queue = SendQueue::new();
        queue.push(envelope(b"one", NeedsAcknowledgement::Yes));
        queue.push(envelope(b"two", NeedsAcknowledgement::No));

        assert_eq!(queue.pop_blocking().unwrap().buffer.data(), b"one");
        let second = queue.pop_blocking().unwrap();
        assert_eq!(second.buffer.data(), b"two");
        assert_eq!(second.needs_acknowledgement, NeedsAcknowledgement::No);
        assert!(queue.is_empty());
    }

    #[test]
    fn stop_releases_a_blocked_worker() {
        let queue = Arc::new(SendQueue::new());
        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        queue.stop();
        assert!(worker.join().unwrap());
        assert!(!queue.is_running());
    }

    #[test]
    fn stopped_queue_yields_nothing_even_when_full() {
        let queue = SendQueue::new();
        queue.push(envelope(b"late", NeedsAcknowledgement::Yes));
        queue.stop();
        assert!(queue.pop_blocking().is_none());
    }

    #[test]
    fn acknowledge_removes_oldest_by_count() {
        let waits = AcknowledgementWaitQueue::new();
        for data in [&b"a"[..], b"b", b"c"] {
            waits.append(Arc::new(MessageBuffer::from_parts(data, Vec::new())));
        }

        assert_eq!(waits.acknowledge(2), 2);
        assert_eq!(waits.len(), 1);
        assert_eq!(waits.acknowledge(5), 1);
        assert!(waits.is_empty());
    }
}
