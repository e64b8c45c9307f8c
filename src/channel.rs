//! Buffered non-blocking byte channels.
//!
//! A [`BufferedChannel`] wraps one non-blocking file descriptor (a client's
//! data socket, a PTY master) with a pair of ring buffers. Reads prefer the
//! read buffer and retain any surplus pulled from the kernel; writes drain
//! the write buffer first and never interleave a later payload into a
//! partially sent earlier one. Either buffer exceeding the hard cap fails
//! the channel permanently.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Initial ring capacity and the chunk size for single kernel operations.
pub const BUFFER_SIZE: usize = 1 << 14; // 16 KiB

/// Hard cap on either ring. Crossing it is a fatal overflow.
pub const BUFFER_CAP: usize = 2 << 30; // 2 GiB

/// How long a ring must stay under the low-water mark before `try_trim`
/// releases its excess capacity.
const TRIM_AFTER: Duration = Duration::from_secs(10);

/// How many peak-usage samples each ring retains for diagnostics.
const PEAK_SAMPLES: usize = 8;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("{identifier}: {side} buffer overflow at {size} bytes")]
    Overflow {
        identifier: String,
        side: &'static str,
        size: usize,
    },

    #[error("channel has failed and cannot be used")]
    Failed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

// ── Ring buffer ────────────────────────────────────────────────────

/// A growable byte ring with a hard cap and peak-usage tracking.
///
/// Capacity grows geometrically up to [`BUFFER_CAP`] and can be given back
/// with [`RingBuffer::try_trim`] once usage has stayed low for a while.
#[derive(Debug)]
pub struct RingBuffer {
    storage: Vec<u8>,
    head: usize,
    len: usize,
    hard_cap: usize,
    /// High-water mark since the last trim.
    peak: usize,
    /// Recent high-water marks, newest last.
    peak_history: Vec<usize>,
    below_low_water_since: Option<Instant>,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::with_capacity(BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_limits(capacity, BUFFER_CAP)
    }

    /// A ring with a non-default hard cap. Production channels keep
    /// [`BUFFER_CAP`]; a smaller cap makes overflow reachable in tests.
    pub fn with_limits(capacity: usize, hard_cap: usize) -> Self {
        Self {
            storage: vec![0; capacity.max(1)],
            head: 0,
            len: 0,
            hard_cap: hard_cap.max(1),
            peak: 0,
            peak_history: Vec::new(),
            below_low_water_since: None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn peak_history(&self) -> &[usize] {
        &self.peak_history
    }

    /// Append `data`, growing if needed. Fails if the ring would exceed the
    /// hard cap; the ring is left unchanged in that case.
    pub fn push(&mut self, data: &[u8]) -> Result<(), usize> {
        let needed = self.len + data.len();
        if needed > self.hard_cap {
            return Err(needed);
        }
        if needed > self.storage.len() {
            self.grow(needed);
        }

        let cap = self.storage.len();
        let tail = (self.head + self.len) % cap;
        let first = data.len().min(cap - tail);
        self.storage[tail..tail + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            self.storage[..data.len() - first].copy_from_slice(&data[first..]);
        }
        self.len += data.len();
        if self.len > self.peak {
            self.peak = self.len;
        }
        Ok(())
    }

    /// Copy up to `buf.len()` bytes from the front without consuming them.
    pub fn peek_into(&self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.len);
        let cap = self.storage.len();
        let first = n.min(cap - self.head);
        buf[..first].copy_from_slice(&self.storage[self.head..self.head + first]);
        if first < n {
            buf[first..n].copy_from_slice(&self.storage[..n - first]);
        }
        n
    }

    /// Remove and return up to `n` bytes from the front.
    pub fn pop(&mut self, n: usize) -> Vec<u8> {
        let take = n.min(self.len);
        let mut out = vec![0; take];
        self.peek_into(&mut out);
        self.consume(take);
        out
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let take = n.min(self.len);
        self.head = (self.head + take) % self.storage.len();
        self.len -= take;
        if self.len == 0 {
            self.head = 0;
        }
    }

    /// The longest contiguous slice at the front; call again after
    /// `consume` to reach wrapped bytes.
    pub fn first_chunk(&self) -> &[u8] {
        let end = (self.head + self.len).min(self.storage.len());
        &self.storage[self.head..end]
    }

    /// Release excess capacity if the ring has stayed under the low-water
    /// mark (the initial capacity) long enough. Returns whether it shrank.
    pub fn try_trim(&mut self) -> bool {
        if self.storage.len() <= BUFFER_SIZE {
            return false;
        }
        if self.len >= BUFFER_SIZE {
            self.below_low_water_since = None;
            return false;
        }
        let since = *self.below_low_water_since.get_or_insert_with(Instant::now);
        if since.elapsed() < TRIM_AFTER {
            return false;
        }

        let data = self.pop(self.len);
        self.storage = vec![0; BUFFER_SIZE];
        self.head = 0;
        self.len = 0;
        self.push(&data).ok();

        if self.peak_history.len() == PEAK_SAMPLES {
            self.peak_history.remove(0);
        }
        self.peak_history.push(self.peak);
        self.peak = self.len;
        self.below_low_water_since = None;
        true
    }

    fn grow(&mut self, needed: usize) {
        let mut new_cap = self.storage.len().max(1);
        while new_cap < needed {
            new_cap *= 2;
        }
        let new_cap = new_cap.min(self.hard_cap);

        let data = self.pop(self.len);
        self.storage = vec![0; new_cap];
        self.head = 0;
        self.len = 0;
        // Cannot fail: needed <= hard_cap was checked by the caller.
        self.push(&data).ok();
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ── Buffered channel ───────────────────────────────────────────────

/// Health of a channel's underlying descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelStatus {
    Open,
    /// The peer closed; buffered bytes may still be served.
    Eof,
    /// Overflow or a non-retryable error; every operation now fails.
    Failed,
}

/// Ring-buffered reads and writes over one non-blocking descriptor.
///
/// The wrapped endpoint `T` (a socket, a PTY master) is owned by the channel
/// and reachable through [`inner`](Self::inner) for endpoint-specific
/// operations like resizing a PTY.
#[derive(Debug)]
pub struct BufferedChannel<T: AsRawFd> {
    inner: T,
    identifier: String,
    read: RingBuffer,
    write: RingBuffer,
    status: ChannelStatus,
}

impl<T: AsRawFd> BufferedChannel<T> {
    pub fn new(inner: T, identifier: impl Into<String>) -> Self {
        Self::with_hard_cap(inner, identifier, BUFFER_CAP)
    }

    /// A channel whose rings overflow past `hard_cap` instead of the
    /// default 2 GiB. Meant for tests exercising the overflow path.
    pub fn with_hard_cap(inner: T, identifier: impl Into<String>, hard_cap: usize) -> Self {
        Self {
            inner,
            identifier: identifier.into(),
            read: RingBuffer::with_limits(BUFFER_SIZE.min(hard_cap), hard_cap),
            write: RingBuffer::with_limits(BUFFER_SIZE.min(hard_cap), hard_cap),
            status: ChannelStatus::Open,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The endpoint reached EOF or the channel failed; the owner should be
    /// torn down once the read buffer is drained.
    pub fn has_failed(&self) -> bool {
        self.status != ChannelStatus::Open
    }

    /// Bytes read from the kernel but not yet consumed.
    pub fn read_in_buffer(&self) -> usize {
        self.read.len()
    }

    /// Bytes accepted by `write` but not yet flushed to the kernel.
    pub fn write_in_buffer(&self) -> usize {
        self.write.len()
    }

    pub fn has_buffered_read(&self) -> bool {
        !self.read.is_empty()
    }

    pub fn has_buffered_write(&self) -> bool {
        !self.write.is_empty()
    }

    /// Size of single kernel operations that keeps syscall count and copy
    /// overhead balanced.
    pub fn optimal_read_size(&self) -> usize {
        BUFFER_SIZE
    }

    /// Read up to `n` bytes, serving the read buffer first. A would-block
    /// with nothing buffered yields an empty vector.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>, ChannelError> {
        if self.status == ChannelStatus::Failed {
            return Err(ChannelError::Failed);
        }

        let mut out = self.read.pop(n);
        if out.len() == n || self.status == ChannelStatus::Eof {
            return Ok(out);
        }

        // Top up from the kernel; surplus beyond n is retained.
        let mut chunk = vec![0u8; (n - out.len()).max(BUFFER_SIZE)];
        match self.read_raw(&mut chunk)? {
            0 => {}
            got => {
                let want = n - out.len();
                let direct = got.min(want);
                out.extend_from_slice(&chunk[..direct]);
                if direct < got {
                    self.buffer_read(&chunk[direct..got])?;
                }
            }
        }
        Ok(out)
    }

    /// Pull up to `n` bytes from the kernel into the read buffer without
    /// consuming them. Returns how many bytes were loaded.
    pub fn load(&mut self, n: usize) -> Result<usize, ChannelError> {
        if self.status == ChannelStatus::Failed {
            return Err(ChannelError::Failed);
        }
        if self.status == ChannelStatus::Eof {
            return Ok(0);
        }
        let mut chunk = vec![0u8; n.min(BUFFER_SIZE).max(1)];
        let mut total = 0;
        while total < n {
            let got = self.read_raw(&mut chunk)?;
            if got == 0 {
                break;
            }
            self.buffer_read(&chunk[..got])?;
            total += got;
            if got < chunk.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Copy up to `buf.len()` already-loaded bytes without consuming them.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        self.read.peek_into(buf)
    }

    /// Drop `n` bytes from the read buffer.
    pub fn consume(&mut self, n: usize) {
        self.read.consume(n);
    }

    /// Write `data`, flushing earlier buffered bytes first. If the backlog
    /// cannot be fully flushed, `data` is buffered wholesale and 0 is
    /// returned; a payload is never interleaved into an earlier write.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        if self.status == ChannelStatus::Failed {
            return Err(ChannelError::Failed);
        }

        if !self.write.is_empty() {
            self.flush_writes()?;
            if !self.write.is_empty() {
                self.buffer_write(data)?;
                return Ok(0);
            }
        }

        let mut sent = 0;
        while sent < data.len() {
            let end = (sent + BUFFER_SIZE).min(data.len());
            match self.write_raw(&data[sent..end])? {
                0 => break,
                n => sent += n,
            }
        }
        if sent < data.len() {
            self.buffer_write(&data[sent..])?;
        }
        Ok(sent)
    }

    /// Drain the write buffer chunk-by-chunk until the kernel would block.
    /// Returns the number of bytes flushed.
    pub fn flush_writes(&mut self) -> Result<usize, ChannelError> {
        if self.status == ChannelStatus::Failed {
            return Err(ChannelError::Failed);
        }
        let mut flushed = 0;
        while !self.write.is_empty() {
            let chunk_len = self.write.first_chunk().len().min(BUFFER_SIZE);
            let mut chunk = vec![0u8; chunk_len];
            self.write.peek_into(&mut chunk);
            let n = self.write_raw(&chunk)?;
            if n == 0 {
                break;
            }
            self.write.consume(n);
            flushed += n;
            if n < chunk.len() {
                break;
            }
        }
        Ok(flushed)
    }

    /// Opportunistically release ring capacity that has gone unused.
    pub fn try_trim(&mut self) {
        self.read.try_trim();
        self.write.try_trim();
    }

    /// Human-readable buffer diagnostics, one line per aspect.
    pub fn statistics(&self) -> String {
        let fmt_peaks = |ring: &RingBuffer| {
            if ring.peak_history().is_empty() {
                String::from("-")
            } else {
                ring.peak_history()
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        };
        format!(
            "'{}'\nread : {} in buffer, {} capacity, peak {} (history: {})\n\
             write: {} in buffer, {} capacity, peak {} (history: {})\n",
            self.identifier,
            self.read.len(),
            self.read.capacity(),
            self.read.peak(),
            fmt_peaks(&self.read),
            self.write.len(),
            self.write.capacity(),
            self.write.peak(),
            fmt_peaks(&self.write),
        )
    }

    fn buffer_read(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.read.push(data).map_err(|size| {
            self.status = ChannelStatus::Failed;
            ChannelError::Overflow {
                identifier: self.identifier.clone(),
                side: "read",
                size,
            }
        })
    }

    fn buffer_write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        self.write.push(data).map_err(|size| {
            self.status = ChannelStatus::Failed;
            ChannelError::Overflow {
                identifier: self.identifier.clone(),
                side: "write",
                size,
            }
        })
    }

    /// One kernel read. EAGAIN/EINTR yield 0; EOF and hard errors mark the
    /// channel. EIO from a PTY master whose slave side is gone is EOF.
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let fd = self.fd();
        loop {
            match nix::unistd::read(fd, buf) {
                Ok(0) => {
                    self.status = ChannelStatus::Eof;
                    return Ok(0);
                }
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EAGAIN) => return Ok(0),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::EIO) => {
                    self.status = ChannelStatus::Eof;
                    return Ok(0);
                }
                Err(errno) => {
                    self.status = ChannelStatus::Failed;
                    return Err(ChannelError::Io(io::Error::from_raw_os_error(
                        errno as i32,
                    )));
                }
            }
        }
    }

    /// One kernel write; EAGAIN/EINTR yield 0, hard errors mark the channel.
    fn write_raw(&mut self, buf: &[u8]) -> Result<usize, ChannelError> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd()) };
        loop {
            match nix::unistd::write(fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EAGAIN) => return Ok(0),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::EPIPE) => {
                    self.status = ChannelStatus::Eof;
                    return Ok(0);
                }
                Err(errno) => {
                    self.status = ChannelStatus::Failed;
                    return Err(ChannelError::Io(io::Error::from_raw_os_error(
                        errno as i32,
                    )));
                }
            }
        }
    }
}
