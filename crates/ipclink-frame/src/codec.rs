use ipclink_transport::LENGTH_PREFIX_SIZE;

/// Size of the header every payload starts with: endpoint id + kind id.
pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Why a [`Frames`] scan stopped before the end of its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    /// Fewer bytes remain than the next frame needs.
    Incomplete,
    /// The next length prefix is zero, which is never valid on the wire.
    ZeroLength,
}

/// Iterates the complete frames in a byte run.
///
/// Wire format, per frame:
/// ```text
/// ┌──────────────────┬──────────────────────────────┐
/// │ Length (4B, NE)  │ Payload (Length bytes, > 0)  │
/// └──────────────────┴──────────────────────────────┘
/// ```
///
/// Each item is one payload. After the iterator returns `None`,
/// [`Frames::offset`] is the position of the first unconsumed byte and
/// everything from there on is the unprocessed remainder.
#[derive(Debug, Clone)]
pub struct Frames<'a> {
    bytes: &'a [u8],
    offset: usize,
    stop: Option<ScanStop>,
}

impl<'a> Frames<'a> {
    /// Scan `bytes` starting at `offset`.
    pub fn new(bytes: &'a [u8], offset: usize) -> Self {
        Self {
            bytes,
            offset,
            stop: None,
        }
    }

    /// Position just past the last consumed frame.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes past the last consumed frame.
    pub fn remainder(&self) -> &'a [u8] {
        &self.bytes[self.offset.min(self.bytes.len())..]
    }

    /// Why scanning stopped, if it stopped short of the end.
    pub fn stop_reason(&self) -> Option<ScanStop> {
        self.stop
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop.is_some() {
            return None;
        }

        let available = self.bytes.len().saturating_sub(self.offset);
        if available == 0 {
            return None;
        }
        if available <= LENGTH_PREFIX_SIZE {
            self.stop = Some(ScanStop::Incomplete);
            return None;
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.bytes[self.offset..self.offset + LENGTH_PREFIX_SIZE]);
        let len = u32::from_ne_bytes(prefix) as usize;

        if len == 0 {
            self.stop = Some(ScanStop::ZeroLength);
            return None;
        }
        if available - LENGTH_PREFIX_SIZE < len {
            self.stop = Some(ScanStop::Incomplete);
            return None;
        }

        let start = self.offset + LENGTH_PREFIX_SIZE;
        self.offset = start + len;
        Some(&self.bytes[start..start + len])
    }
}

/// The endpoint/kind discriminator at the start of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHeader {
    pub endpoint_id: u32,
    pub kind_id: u32,
}

impl MessageHeader {
    pub fn new(endpoint_id: u32, kind_id: u32) -> Self {
        Self {
            endpoint_id,
            kind_id,
        }
    }

    /// Read the header of a payload, if it is long enough to have one.
    pub fn peek(payload: &[u8]) -> Option<Self> {
        if payload.len() < MESSAGE_HEADER_SIZE {
            return None;
        }
        let endpoint_id = u32::from_ne_bytes(payload[0..4].try_into().ok()?);
        let kind_id = u32::from_ne_bytes(payload[4..8].try_into().ok()?);
        Some(Self::new(endpoint_id, kind_id))
    }
}
