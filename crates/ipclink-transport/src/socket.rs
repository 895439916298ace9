use std::io::{self, ErrorKind};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use crate::buffer::MessageBuffer;
use crate::error::{Result, TransportError};
use crate::traits::{ReadOutcome, Transport, MAX_SINGLE_TRANSFER_SIZE};

/// Most handles a single transfer may carry (one `SCM_RIGHTS` control message).
pub const MAX_HANDLES_PER_TRANSFER: usize = 64;

const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const RECV_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const RECV_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Tuning for [`UnixTransport`].
#[derive(Debug, Clone)]
pub struct UnixTransportConfig {
    /// Bytes requested per `recvmsg` call while draining. Default: 64 KiB.
    pub read_chunk_size: usize,
    /// Payload size above which the connection wraps messages. Default: 128 KiB.
    pub max_single_transfer_size: usize,
}

impl Default for UnixTransportConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_single_transfer_size: MAX_SINGLE_TRANSFER_SIZE,
        }
    }
}

/// A connected Unix stream socket that carries handles with `SCM_RIGHTS`.
///
/// Reads never block (`MSG_DONTWAIT`); transfers block until the whole frame
/// is written and are serialized by an internal lock.
pub struct UnixTransport {
    stream: UnixStream,
    open: AtomicBool,
    write_lock: Mutex<()>,
    config: UnixTransportConfig,
}

impl UnixTransport {
    /// Wrap a connected stream.
    pub fn new(stream: UnixStream) -> Self {
        Self::with_config(stream, UnixTransportConfig::default())
    }

    /// Wrap a connected stream with explicit configuration.
    pub fn with_config(stream: UnixStream, config: UnixTransportConfig) -> Self {
        Self {
            stream,
            open: AtomicBool::new(true),
            write_lock: Mutex::new(()),
            config,
        }
    }

    /// Create a connected pair, mostly useful for tests and in-process peers.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        Ok((Self::new(left), Self::new(right)))
    }

    /// Current configuration.
    pub fn config(&self) -> &UnixTransportConfig {
        &self.config
    }

    fn recv_chunk(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let mut control = ControlBuffer::for_handles(MAX_HANDLES_PER_TRANSFER);

        // SAFETY: zeroed msghdr is valid before assigning pointers.
        let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;
        msghdr.msg_control = control.as_mut_ptr();
        msghdr.msg_controllen = control.len() as _;

        // SAFETY: msghdr points to live iov/control buffers for the duration of the call.
        let n = unsafe { libc::recvmsg(self.stream.as_raw_fd(), &mut msghdr, RECV_FLAGS) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let handles = take_received_handles(&msghdr);
        if (msghdr.msg_flags & libc::MSG_CTRUNC) != 0 {
            warn!(
                received = handles.len(),
                "control message truncated; some handles were dropped by the kernel"
            );
        }
        Ok((n as usize, handles))
    }

    fn send_chunk(&self, bytes: &[u8], handles: &[OwnedFd]) -> io::Result<usize> {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };

        // SAFETY: zeroed msghdr is valid before assigning pointers.
        let mut msghdr: libc::msghdr = unsafe { std::mem::zeroed() };
        msghdr.msg_iov = &mut iov;
        msghdr.msg_iovlen = 1;

        let mut control = ControlBuffer::for_handles(handles.len());
        if !handles.is_empty() {
            let data_len = std::mem::size_of_val(handles);
            msghdr.msg_control = control.as_mut_ptr();
            msghdr.msg_controllen = control.len() as _;

            // SAFETY: the control buffer was sized with CMSG_SPACE for `handles.len()` fds.
            let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msghdr) };
            if cmsg.is_null() {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    "failed to allocate SCM_RIGHTS control message",
                ));
            }
            let raw: Vec<RawFd> = handles.iter().map(AsRawFd::as_raw_fd).collect();
            // SAFETY: cmsg points into `control`, which has room for `raw.len()` fds.
            unsafe {
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(data_len as u32) as _;
                std::ptr::copy_nonoverlapping(
                    raw.as_ptr(),
                    libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                    raw.len(),
                );
            }
        }

        // SAFETY: msghdr points to live iov/control buffers for the duration of the call.
        let n = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msghdr, SEND_FLAGS) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Transport for UnixTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("closing unix transport");
            if let Err(err) = self.stream.shutdown(Shutdown::Both) {
                // The peer may already have torn the socket down.
                trace!(error = %err, "socket shutdown failed");
            }
        }
    }

    fn read_as_much_as_possible_without_blocking(&self) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        if !self.is_open() {
            return outcome;
        }

        let mut chunk = vec![0u8; self.config.read_chunk_size.max(1)];
        loop {
            match self.recv_chunk(&mut chunk) {
                Ok((0, handles)) => {
                    outcome.handles.extend(handles);
                    outcome.peer_closed = true;
                    break;
                }
                Ok((n, handles)) => {
                    outcome.bytes.extend_from_slice(&chunk[..n]);
                    outcome.handles.extend(handles);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "unix transport read failed");
                    outcome.peer_closed = true;
                    break;
                }
            }
        }

        trace!(
            bytes = outcome.bytes.len(),
            handles = outcome.handles.len(),
            peer_closed = outcome.peer_closed,
            "drained unix transport"
        );
        outcome
    }

    fn wait_until_readable(&self) {
        let mut pfd = libc::pollfd {
            fd: self.stream.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        while self.is_open() {
            // SAFETY: `pfd` is a valid pollfd for the duration of the call.
            let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
            if rc >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() != ErrorKind::Interrupted {
                warn!(error = %err, "poll failed while waiting for readability");
                return;
            }
        }
    }

    fn transfer(&self, buffer: &MessageBuffer) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::Shutdown);
        }
        if buffer.handles().len() > MAX_HANDLES_PER_TRANSFER {
            return Err(TransportError::TooManyHandles {
                count: buffer.handles().len(),
                max: MAX_HANDLES_PER_TRANSFER,
            });
        }

        let mut wire = BytesMut::new();
        buffer.encode_frame(&mut wire)?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Handles ride on the first chunk only.
        let mut handles = buffer.handles();
        let mut offset = 0usize;
        while offset < wire.len() {
            match self.send_chunk(&wire[offset..], handles) {
                Ok(0) => {
                    return Err(TransportError::Io(io::Error::new(
                        ErrorKind::WriteZero,
                        "sendmsg wrote zero bytes",
                    )))
                }
                Ok(n) => {
                    offset += n;
                    handles = &[];
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Io(err)),
            }
        }

        trace!(
            size = wire.len(),
            handles = buffer.handles().len(),
            "transferred frame"
        );
        Ok(())
    }

    fn max_single_transfer_size(&self) -> usize {
        self.config.max_single_transfer_size
    }
}

impl std::fmt::Debug for UnixTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixTransport")
            .field("fd", &self.stream.as_raw_fd())
            .field("open", &self.is_open())
            .finish()
    }
}

/// `cmsghdr`-aligned storage for one `SCM_RIGHTS` control message.
struct ControlBuffer {
    words: Vec<u64>,
    len: usize,
}

impl ControlBuffer {
    fn for_handles(count: usize) -> Self {
        if count == 0 {
            return Self {
                words: Vec::new(),
                len: 0,
            };
        }
        let data_len = count * std::mem::size_of::<RawFd>();
        // SAFETY: CMSG_SPACE is a pure size computation.
        let len = unsafe { libc::CMSG_SPACE(data_len as u32) } as usize;
        Self {
            words: vec![0u64; len.div_ceil(std::mem::size_of::<u64>())],
            len,
        }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.words.as_mut_ptr().cast()
    }

    fn len(&self) -> usize {
        self.len
    }
}

fn take_received_handles(msghdr: &libc::msghdr) -> Vec<OwnedFd> {
    let mut out = Vec::new();
    if msghdr.msg_control.is_null() {
        return out;
    }
    // SAFETY: msghdr points at the control buffer filled in by recvmsg.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msghdr);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let cmsg_len = (*cmsg).cmsg_len as usize;
                let base_len = libc::CMSG_LEN(0) as usize;
                let count = cmsg_len.saturating_sub(base_len) / std::mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    let fd = std::ptr::read_unaligned(data.add(i));
                    // The kernel installed a fresh descriptor that nobody else owns.
                    out.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msghdr, cmsg);
        }
    }
    out
}
