//! In-memory transport and a minimal catalog for the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use ipclink_frame::{is_reserved, MessageHeader, PayloadReader, PayloadWriter};
use ipclink_transport::{
    HandleQueue, MessageBuffer, ReadOutcome, Transport, TransportError, MAX_SINGLE_TRANSFER_SIZE,
};

use crate::message::{ConnectionObserver, Message, MessageCatalog};

/// Kind id the test catalog refuses to decode.
pub(crate) const UNDECODABLE_KIND: u32 = 0xBAD;

/// Frame a buffer the way the wire carries it.
pub(crate) fn frame(buffer: &MessageBuffer) -> Vec<u8> {
    let mut out = BytesMut::new();
    buffer.encode_frame(&mut out).unwrap();
    out.to_vec()
}

/// Plays back queued reads and records transfers.
pub(crate) struct ScriptedTransport {
    open: AtomicBool,
    reads: Mutex<VecDeque<ReadOutcome>>,
    transferred: Mutex<Vec<Vec<u8>>>,
    waits: AtomicUsize,
    max_transfer: usize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::with_max_transfer(MAX_SINGLE_TRANSFER_SIZE)
    }

    pub(crate) fn with_max_transfer(max_transfer: usize) -> Self {
        Self {
            open: AtomicBool::new(true),
            reads: Mutex::new(VecDeque::new()),
            transferred: Mutex::new(Vec::new()),
            waits: AtomicUsize::new(0),
            max_transfer,
        }
    }

    pub(crate) fn push(&self, outcome: ReadOutcome) {
        self.reads.lock().unwrap().push_back(outcome);
    }

    pub(crate) fn push_bytes(&self, bytes: &[u8]) {
        self.push(ReadOutcome {
            bytes: BytesMut::from(bytes),
            ..ReadOutcome::default()
        });
    }

    /// Payloads transferred so far, without length prefixes.
    pub(crate) fn transferred(&self) -> Vec<Vec<u8>> {
        self.transferred.lock().unwrap().clone()
    }

    pub(crate) fn wait_count(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` transfers happened.
    pub(crate) fn wait_for_transfers(&self, count: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.transferred.lock().unwrap().len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl Transport for ScriptedTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn read_as_much_as_possible_without_blocking(&self) -> ReadOutcome {
        self.reads.lock().unwrap().pop_front().unwrap_or_default()
    }

    fn wait_until_readable(&self) {
        self.waits.fetch_add(1, Ordering::SeqCst);
    }

    fn transfer(&self, buffer: &MessageBuffer) -> ipclink_transport::Result<()> {
        if !self.is_open() {
            return Err(TransportError::Shutdown);
        }
        self.transferred.lock().unwrap().push(buffer.data().to_vec());
        Ok(())
    }

    fn max_single_transfer_size(&self) -> usize {
        self.max_transfer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TestMessage {
    pub endpoint_id: u32,
    pub kind_id: u32,
    pub body: Vec<u8>,
}

impl TestMessage {
    pub(crate) fn new(endpoint_id: u32, kind_id: u32, body: &[u8]) -> Self {
        Self {
            endpoint_id,
            kind_id,
            body: body.to_vec(),
        }
    }
}

impl Message for TestMessage {
    fn endpoint_id(&self) -> u32 {
        self.endpoint_id
    }

    fn kind_id(&self) -> u32 {
        self.kind_id
    }

    fn encode(&self) -> crate::Result<MessageBuffer> {
        let mut writer = PayloadWriter::new(MessageHeader::new(self.endpoint_id, self.kind_id));
        writer.put_bytes(&self.body)?;
        Ok(writer.finish())
    }
}

/// Decodes any non-reserved kind except [`UNDECODABLE_KIND`].
pub(crate) struct TestCatalog;

impl TestCatalog {
    pub(crate) fn decode_plain(payload: &[u8]) -> Option<TestMessage> {
        let mut reader = PayloadReader::new(payload).ok()?;
        let header = reader.header();
        if is_reserved(header.kind_id) || header.kind_id == UNDECODABLE_KIND {
            return None;
        }
        let body = reader.get_bytes().ok()?;
        Some(TestMessage::new(header.endpoint_id, header.kind_id, body))
    }
}

impl MessageCatalog for TestCatalog {
    type Message = TestMessage;

    fn decode(&self, payload: &[u8], _handles: &mut HandleQueue) -> Option<TestMessage> {
        Self::decode_plain(payload)
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingObserver {
    pub unresponsive: AtomicUsize,
    pub responsive: AtomicUsize,
    pub died: AtomicUsize,
}

impl ConnectionObserver for RecordingObserver {
    fn may_have_become_unresponsive(&self) {
        self.unresponsive.fetch_add(1, Ordering::SeqCst);
    }

    fn did_become_responsive(&self) {
        self.responsive.fetch_add(1, Ordering::SeqCst);
    }

    fn die(&self) {
        self.died.fetch_add(1, Ordering::SeqCst);
    }
}
