//! Readiness polling for the single-threaded event loop.
//!
//! Thin wrapper over [`mio::Poll`] that keys every source by its raw file
//! descriptor, supports interest changes while registered, and lets the
//! loop re-queue a descriptor for the next iteration when userspace buffers
//! still hold work the kernel will not report again.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// One readiness report for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// fd-keyed poll with synthetic rescheduling.
pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    /// Interests currently registered per descriptor.
    interests: HashMap<RawFd, Interest>,
    /// Synthetic events to deliver on the next wait, independent of the
    /// kernel. Used when buffered data remains after a partial handling.
    rescheduled: Vec<PollEvent>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("interests", &self.interests.len())
            .field("rescheduled", &self.rescheduled.len())
            .finish_non_exhaustive()
    }
}

impl Poller {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity),
            waker,
            interests: HashMap::new(),
            rescheduled: Vec::new(),
        })
    }

    /// Handle for waking the poll from another thread or a signal handler.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Start watching `fd`. Replaces any previous interest set.
    pub fn listen(&mut self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        let interest = to_interest(read, write);
        match self.interests.get(&fd) {
            Some(current) if *current == interest => Ok(()),
            Some(_) => {
                self.poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                self.interests.insert(fd, interest);
                Ok(())
            }
            None => {
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                self.interests.insert(fd, interest);
                Ok(())
            }
        }
    }

    /// Add or remove write interest while keeping read interest intact.
    pub fn watch_writes(&mut self, fd: RawFd, enable: bool) -> io::Result<()> {
        let read = self
            .interests
            .get(&fd)
            .is_some_and(|i| i.is_readable());
        self.listen(fd, read, enable)
    }

    /// Stop watching `fd`. Unknown descriptors are a no-op.
    pub fn stop(&mut self, fd: RawFd) {
        if self.interests.remove(&fd).is_some() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        self.rescheduled.retain(|event| event.fd != fd);
    }

    /// Queue a synthetic event for `fd` on the next wait. The kernel only
    /// reports edge conditions it has seen; data still sitting in userspace
    /// ring buffers needs this to get another turn.
    pub fn reschedule(&mut self, fd: RawFd, readable: bool, writable: bool) {
        if let Some(existing) = self.rescheduled.iter_mut().find(|e| e.fd == fd) {
            existing.readable |= readable;
            existing.writable |= writable;
            return;
        }
        self.rescheduled.push(PollEvent {
            fd,
            readable,
            writable,
        });
    }

    /// Wait for readiness, collecting kernel and synthetic events. With
    /// pending synthetic events the kernel is only polled non-blockingly.
    /// EINTR yields an empty batch so the loop can run housekeeping.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<PollEvent>> {
        let mut batch: Vec<PollEvent> = std::mem::take(&mut self.rescheduled);
        let effective_timeout = if batch.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };

        match self.poll.poll(&mut self.events, Some(effective_timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(batch),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            // A closed peer surfaces as a read so the owner discovers EOF.
            let readable = event.is_readable() || event.is_read_closed() || event.is_write_closed();
            let writable = event.is_writable();
            if let Some(existing) = batch.iter_mut().find(|e| e.fd == fd) {
                existing.readable |= readable;
                existing.writable |= writable;
            } else {
                batch.push(PollEvent {
                    fd,
                    readable,
                    writable,
                });
            }
        }
        Ok(batch)
    }

    /// Number of descriptors currently registered.
    pub fn watched(&self) -> usize {
        self.interests.len()
    }
}

fn to_interest(read: bool, write: bool) -> Interest {
    match (read, write) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // Registration with an empty interest set is not representable;
        // read interest is the harmless default.
        _ => Interest::READABLE,
    }
}
