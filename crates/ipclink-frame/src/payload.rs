//! Field-level encoding helpers for message catalogs.
//!
//! Every payload starts with a [`MessageHeader`]; fields follow in native
//! byte order. Byte strings and strings carry a `u32` length prefix. Handles
//! are not written inline: they are attached to the buffer and the decoder
//! takes them from the [`HandleQueue`] in the same order.

use std::os::fd::OwnedFd;

use bytes::BufMut;
use ipclink_transport::{HandleQueue, MessageBuffer};

use crate::codec::{MessageHeader, MESSAGE_HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Builds one payload.
#[derive(Debug)]
pub struct PayloadWriter {
    buffer: MessageBuffer,
}

impl PayloadWriter {
    /// Start a payload with its header.
    pub fn new(header: MessageHeader) -> Self {
        let mut buffer = MessageBuffer::new();
        let data = buffer.data_mut();
        data.reserve(MESSAGE_HEADER_SIZE);
        data.put_u32_ne(header.endpoint_id);
        data.put_u32_ne(header.kind_id);
        Self { buffer }
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.data_mut().put_u32_ne(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buffer.data_mut().put_u64_ne(value);
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buffer.data_mut().put_u8(u8::from(value));
        self
    }

    /// Write a length-prefixed byte string.
    pub fn put_bytes(&mut self, value: &[u8]) -> Result<&mut Self> {
        let len =
            u32::try_from(value.len()).map_err(|_| FrameError::FieldTooLarge { size: value.len() })?;
        let data = self.buffer.data_mut();
        data.put_u32_ne(len);
        data.put_slice(value);
        Ok(self)
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) -> Result<&mut Self> {
        self.put_bytes(value.as_bytes())
    }

    /// Attach a handle to be sent out of band.
    pub fn put_handle(&mut self, handle: OwnedFd) -> &mut Self {
        self.buffer.push_handle(handle);
        self
    }

    pub fn finish(self) -> MessageBuffer {
        self.buffer
    }
}

/// Reads fields from one payload.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    header: MessageHeader,
    rest: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    /// Read the header and position the reader on the first field.
    pub fn new(payload: &'a [u8]) -> Result<Self> {
        let header = MessageHeader::peek(payload).ok_or(FrameError::Truncated {
            needed: MESSAGE_HEADER_SIZE,
            remaining: payload.len(),
        })?;
        Ok(Self {
            header,
            rest: &payload[MESSAGE_HEADER_SIZE..],
        })
    }

    pub fn header(&self) -> MessageHeader {
        self.header
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8]> {
        if self.rest.len() < needed {
            return Err(FrameError::Truncated {
                needed,
                remaining: self.rest.len(),
            });
        }
        let (head, tail) = self.rest.split_at(needed);
        self.rest = tail;
        Ok(head)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        Ok(u32::from_ne_bytes(raw))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_ne_bytes(raw))
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    /// Read a length-prefixed byte string.
    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn get_str(&mut self) -> Result<&'a str> {
        std::str::from_utf8(self.get_bytes()?).map_err(|_| FrameError::InvalidUtf8)
    }

    /// Take the next received handle.
    pub fn take_handle(&mut self, handles: &mut HandleQueue) -> Result<OwnedFd> {
        handles.dequeue().ok_or(FrameError::MissingHandle)
    }
}
