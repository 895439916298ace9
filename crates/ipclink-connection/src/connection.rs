use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::BytesMut;
use ipclink_frame::{is_reserved, Frames, MessageHeader, ScanStop};
use ipclink_transport::{HandleQueue, MessageBuffer, Transport};
use tracing::{debug, trace, warn};

use crate::config::{ConnectionConfig, Endpoints};
use crate::control::{decode_incoming, Acknowledgement, Incoming, LargeMessageWrapper};
use crate::error::{ConnectionError, Result};
use crate::message::{
    ConnectionObserver, Message, MessageCatalog, NeedsAcknowledgement, NoopObserver, NullStub,
    Stub,
};
use crate::send::{
    spawn_send_worker, AcknowledgementWaitQueue, MessageSender, SendQueue, SendStats,
    SendStatsSnapshot,
};
use crate::timer::ResponsivenessTimer;

/// Work queued on the I/O context, run by [`Connection::process_deferred`]
/// after the triggering notification has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    HandleMessages,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchEnd {
    /// Out of complete frames.
    Exhausted,
    DecodeFailure,
    ZeroLength,
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder<T, C: MessageCatalog> {
    transport: T,
    catalog: C,
    endpoints: Endpoints,
    stub: Box<dyn Stub<C::Message>>,
    observer: Arc<dyn ConnectionObserver>,
    config: ConnectionConfig,
}

impl<T: Transport, C: MessageCatalog> ConnectionBuilder<T, C> {
    /// Start building a connection over an open transport.
    pub fn new(transport: T, catalog: C, endpoints: Endpoints) -> Self {
        Self {
            transport,
            catalog,
            endpoints,
            stub: Box::new(NullStub),
            observer: Arc::new(NoopObserver),
            config: ConnectionConfig::default(),
        }
    }

    /// Set the dispatcher for messages addressed to the local endpoint.
    pub fn with_stub(mut self, stub: impl Stub<C::Message> + 'static) -> Self {
        self.stub = Box::new(stub);
        self
    }

    /// Set the owner hooks.
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Set connection configuration.
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the send worker and the responsiveness timer.
    pub fn build(self) -> Result<Connection<T, C>> {
        let transport = Arc::new(self.transport);

        let timeout_observer = Arc::clone(&self.observer);
        let (timer, timer_thread) =
            ResponsivenessTimer::spawn(self.config.responsiveness_timeout, move || {
                debug!("peer may have become unresponsive");
                timeout_observer.may_have_become_unresponsive();
            })
            .map_err(ConnectionError::Spawn)?;

        let send_queue = Arc::new(SendQueue::new());
        let acknowledgements = Arc::new(AcknowledgementWaitQueue::new());
        let stats = Arc::new(SendStats::default());

        let send_worker = match spawn_send_worker(
            Arc::clone(&transport),
            Arc::clone(&send_queue),
            Arc::clone(&acknowledgements),
            Arc::clone(&stats),
        ) {
            Ok(handle) => handle,
            Err(err) => {
                timer.shutdown();
                return Err(ConnectionError::Spawn(err));
            }
        };

        let sender = MessageSender::new(
            Arc::clone(&transport),
            Arc::clone(&send_queue),
            timer.clone(),
        );

        debug!(
            local = self.endpoints.local,
            peer = self.endpoints.peer,
            "connection started"
        );

        Ok(Connection {
            transport,
            catalog: self.catalog,
            stub: self.stub,
            observer: self.observer,
            endpoints: self.endpoints,
            sender,
            send_queue,
            acknowledgements,
            stats,
            timer,
            unprocessed_messages: VecDeque::new(),
            unprocessed_bytes: BytesMut::new(),
            handles: HandleQueue::new(),
            deferred: VecDeque::new(),
            died: false,
            _send_worker: send_worker,
            _timer_thread: timer_thread,
        })
    }
}

/// A message-oriented connection over a [`Transport`].
///
/// The connection itself lives on one I/O context: reading, decoding,
/// dispatch and the blocking wait all take `&mut self`. Posting from other
/// threads goes through a [`MessageSender`] from [`Connection::sender`].
pub struct Connection<T: Transport, C: MessageCatalog> {
    transport: Arc<T>,
    catalog: C,
    stub: Box<dyn Stub<C::Message>>,
    observer: Arc<dyn ConnectionObserver>,
    endpoints: Endpoints,

    sender: MessageSender<T>,
    send_queue: Arc<SendQueue>,
    acknowledgements: Arc<AcknowledgementWaitQueue>,
    stats: Arc<SendStats>,
    timer: ResponsivenessTimer,

    unprocessed_messages: VecDeque<C::Message>,
    unprocessed_bytes: BytesMut,
    handles: HandleQueue,
    deferred: VecDeque<Deferred>,
    died: bool,

    // Detached on drop.
    _send_worker: JoinHandle<()>,
    _timer_thread: JoinHandle<()>,
}

impl<T: Transport, C: MessageCatalog> Connection<T, C> {
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// A handle for posting from other threads.
    pub fn sender(&self) -> MessageSender<T> {
        self.sender.clone()
    }

    /// Encode and post a message; the peer will acknowledge it.
    pub fn post_message<M: Message>(&self, message: &M) -> Result<()> {
        self.sender.post_message(message)
    }

    /// Post an already-encoded buffer. See [`MessageSender::post_buffer`].
    pub fn post_buffer(
        &self,
        endpoint_id: u32,
        buffer: MessageBuffer,
        needs_acknowledgement: NeedsAcknowledgement,
    ) -> Result<()> {
        self.sender
            .post_buffer(endpoint_id, buffer, needs_acknowledgement)
    }

    /// Close the transport. The owner's `die` hook runs the first time only.
    pub fn shutdown(&mut self) {
        self.transport.close();
        self.timer.stop();
        if !self.died {
            self.died = true;
            debug!(local = self.endpoints.local, "connection shut down");
            self.observer.die();
        }
    }

    pub fn shutdown_with_error(&mut self, error: ConnectionError) {
        warn!(error = %error, "shutting down connection");
        self.shutdown();
    }

    /// Counters from the send worker.
    pub fn send_stats(&self) -> SendStatsSnapshot {
        self.stats.snapshot()
    }

    /// Transferred messages the peer has not acknowledged yet.
    pub fn pending_acknowledgements(&self) -> usize {
        self.acknowledgements.len()
    }

    /// Envelopes posted but not yet taken by the send worker.
    pub fn queued_sends(&self) -> usize {
        self.send_queue.len()
    }

    /// Decoded messages not yet dispatched or claimed by a waiter.
    pub fn unprocessed_message_count(&self) -> usize {
        self.unprocessed_messages.len()
    }

    /// Handles received but not yet claimed by a decoded message.
    pub fn unclaimed_handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn deferred_tasks(&self) -> impl Iterator<Item = &Deferred> + '_ {
        self.deferred.iter()
    }

    /// Readability hook: drain the transport, then dispatch.
    pub fn on_readable(&mut self) {
        match self.drain_messages_from_peer() {
            Ok(()) => {}
            Err(ConnectionError::EndOfStream) => debug!("peer closed the connection"),
            Err(err) => warn!(error = %err, "failed to drain messages from peer"),
        }
        self.handle_messages();
    }

    /// Read everything available, decode complete frames and settle
    /// acknowledgements. A trailing partial frame is kept for the next drain.
    ///
    /// An undecodable frame ends its batch; the frames after it are parsed
    /// as the next batch in the same drain. A zero-length frame is fatal.
    pub fn drain_messages_from_peer(&mut self) -> Result<()> {
        let bytes = self.read_from_transport()?;
        let mut offset = 0;
        let mut end = BatchEnd::Exhausted;

        while offset < bytes.len() {
            let (consumed, batch_end) = self.try_parse_messages(&bytes[offset..]);
            offset += consumed;
            end = batch_end;
            if end != BatchEnd::DecodeFailure {
                break;
            }
        }

        if !self.unprocessed_messages.is_empty() {
            self.defer(Deferred::HandleMessages);
        }

        if end == BatchEnd::ZeroLength {
            self.shutdown_with_error(ConnectionError::ZeroLengthFrame);
            return Err(ConnectionError::ZeroLengthFrame);
        }

        if offset < bytes.len() {
            self.stash_partial_frame(&bytes[offset..])?;
        }
        Ok(())
    }

    /// Run queued I/O-context tasks in order.
    pub fn process_deferred(&mut self) {
        while let Some(task) = self.deferred.pop_front() {
            match task {
                Deferred::HandleMessages => self.handle_messages(),
                Deferred::Shutdown => self.shutdown(),
            }
        }
    }

    /// Block until a message with this endpoint and kind arrives, or the
    /// connection closes.
    ///
    /// Drains the transport itself, so it can be called from the I/O context.
    pub fn wait_for_specific_endpoint_message(
        &mut self,
        endpoint_id: u32,
        kind_id: u32,
    ) -> Option<C::Message> {
        loop {
            let found = self
                .unprocessed_messages
                .iter()
                .position(|m| m.endpoint_id() == endpoint_id && m.kind_id() == kind_id);
            if let Some(index) = found {
                return self.unprocessed_messages.remove(index);
            }

            if !self.is_open() {
                return None;
            }
            self.transport.wait_until_readable();
            if !self.is_open() {
                return None;
            }

            if let Err(err) = self.drain_messages_from_peer() {
                debug!(error = %err, endpoint_id, kind_id, "stopped waiting for message");
                return None;
            }
        }
    }

    /// Serve the connection on the current thread until it closes.
    pub fn run(&mut self) {
        while self.is_open() {
            self.transport.wait_until_readable();
            if !self.is_open() {
                break;
            }
            self.on_readable();
            self.process_deferred();
        }
        self.process_deferred();
    }

    fn defer(&mut self, task: Deferred) {
        if !self.deferred.contains(&task) {
            self.deferred.push_back(task);
        }
    }

    fn read_from_transport(&mut self) -> Result<BytesMut> {
        let mut bytes = std::mem::take(&mut self.unprocessed_bytes);

        let outcome = self.transport.read_as_much_as_possible_without_blocking();
        let received = !outcome.is_empty();
        self.handles.extend(outcome.handles);

        if received {
            self.timer.stop();
            self.observer.did_become_responsive();
        }

        if outcome.peer_closed {
            self.defer(Deferred::Shutdown);
            if !received {
                return Err(ConnectionError::EndOfStream);
            }
        }

        bytes.extend_from_slice(&outcome.bytes);
        Ok(bytes)
    }

    /// Keep the tail of an incomplete frame. Only one may be pending.
    ///
    /// `read_from_transport` takes the pending tail before every parse, so
    /// this only fails for a drain that re-enters while a tail is still held.
    fn stash_partial_frame(&mut self, tail: &[u8]) -> Result<()> {
        if !self.unprocessed_bytes.is_empty() {
            self.shutdown();
            return Err(ConnectionError::DuplicatePartialFrame);
        }
        trace!(len = tail.len(), "keeping partial frame");
        self.unprocessed_bytes.extend_from_slice(tail);
        Ok(())
    }

    /// Decode the complete frames in `bytes` as one batch. Returns the offset
    /// of the first byte not consumed and why the batch ended.
    fn try_parse_messages(&mut self, bytes: &[u8]) -> (usize, BatchEnd) {
        let mut frames = Frames::new(bytes, 0);
        let mut received_ack_count = 0usize;
        let mut pending_ack_count = 0u32;
        let mut end = BatchEnd::Exhausted;

        while let Some(payload) = frames.next() {
            match decode_incoming(&self.catalog, payload, &mut self.handles) {
                Some(Incoming::Acknowledgement(ack)) => {
                    if ack.endpoint_id() == self.endpoints.local {
                        received_ack_count += ack.count() as usize;
                    } else {
                        warn!(
                            endpoint_id = ack.endpoint_id(),
                            local = self.endpoints.local,
                            "ignoring acknowledgement for another endpoint"
                        );
                    }
                }
                Some(Incoming::LargeMessageWrapper(wrapper)) => {
                    match self.unwrap_large_message(wrapper) {
                        Some(message) => {
                            self.unprocessed_messages.push_back(message);
                            pending_ack_count += 1;
                        }
                        None => {
                            log_decode_failure(payload);
                            end = BatchEnd::DecodeFailure;
                            break;
                        }
                    }
                }
                Some(Incoming::Message(message)) => {
                    trace!(
                        endpoint_id = message.endpoint_id(),
                        kind_id = message.kind_id(),
                        "decoded message"
                    );
                    self.unprocessed_messages.push_back(message);
                    pending_ack_count += 1;
                }
                None => {
                    log_decode_failure(payload);
                    end = BatchEnd::DecodeFailure;
                    break;
                }
            }
        }

        if frames.stop_reason() == Some(ScanStop::ZeroLength) {
            warn!(offset = frames.offset(), "zero-length frame in stream");
            end = BatchEnd::ZeroLength;
        }

        if received_ack_count > 0 {
            let removed = self.acknowledgements.acknowledge(received_ack_count);
            if removed < received_ack_count {
                warn!(
                    acknowledged = received_ack_count,
                    waiting = removed,
                    "peer acknowledged more messages than were waiting"
                );
            }
        }

        if self.is_open() && pending_ack_count > 0 {
            let ack = Acknowledgement::new(self.endpoints.peer, pending_ack_count);
            if let Err(err) =
                self.sender
                    .post_buffer(self.endpoints.peer, ack.encode(), NeedsAcknowledgement::No)
            {
                warn!(error = %err, "failed to post acknowledgement");
            }
        }

        (frames.offset(), end)
    }

    /// Decode a wrapped payload as the real message, with the wrapper's
    /// handles back at the front of the queue.
    fn unwrap_large_message(&mut self, wrapper: LargeMessageWrapper) -> Option<C::Message> {
        let (payload, handles) = wrapper.into_parts();
        trace!(len = payload.len(), handles = handles.len(), "unwrapping large message");
        self.handles.return_to_front(handles);

        let header = MessageHeader::peek(&payload)?;
        if is_reserved(header.kind_id) {
            return None;
        }
        self.catalog.decode(&payload, &mut self.handles)
    }

    fn handle_messages(&mut self) {
        let messages = std::mem::take(&mut self.unprocessed_messages);
        for message in messages {
            if message.endpoint_id() != self.endpoints.local {
                trace!(
                    endpoint_id = message.endpoint_id(),
                    kind_id = message.kind_id(),
                    "dropping message for another endpoint"
                );
                continue;
            }

            match self.stub.handle(message) {
                Ok(Some(reply)) => {
                    let posted = reply.encode().and_then(|buffer| {
                        self.sender.post_buffer(
                            self.endpoints.local,
                            buffer,
                            NeedsAcknowledgement::Yes,
                        )
                    });
                    if let Err(err) = posted {
                        warn!(error = %err, "failed to post reply");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "handler failed"),
            }
        }
    }
}

impl<T: Transport, C: MessageCatalog> Drop for Connection<T, C> {
    fn drop(&mut self) {
        self.send_queue.stop();
        self.timer.shutdown();
        self.transport.close();
    }
}

fn log_decode_failure(payload: &[u8]) {
    let err = ConnectionError::Decode { len: payload.len() };
    warn!(error = %err, bytes = %hex_preview(payload), "dropping undecodable frame");
}

fn hex_preview(bytes: &[u8]) -> String {
    const LIMIT: usize = 64;
    let mut out = String::with_capacity(LIMIT * 3);
    for (i, byte) in bytes.iter().take(LIMIT).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    if bytes.len() > LIMIT {
        let _ = write!(out, " ... ({} bytes)", bytes.len());
    }
    out
}
