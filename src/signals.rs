//! Signal plumbing between the OS and the event loop.
//!
//! Signal handlers are the only code running concurrently with the loop
//! thread, so everything they touch is lock-free: an atomic terminate flag,
//! a bounded slot array of dead-child PIDs, and a poll waker. The server
//! core never installs handlers itself; the binary wires them up through
//! [`install`].

use mio::Waker;
use signal_hook_registry::SigId;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

/// Capacity of the dead-child mailbox. More than this many un-reaped
/// children between two loop iterations loses notifications; the bounded
/// poll timeout re-reaps stragglers shortly after.
pub const DEAD_CHILD_SLOTS: usize = 8;

/// Lock-free single-producer (signal context) / single-consumer (loop)
/// mailbox of PIDs whose children have exited.
#[derive(Debug)]
pub struct DeadChildSlots {
    slots: [AtomicI32; DEAD_CHILD_SLOTS],
}

impl DeadChildSlots {
    const EMPTY: i32 = 0;

    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicI32::new(Self::EMPTY)),
        }
    }

    /// Record a dead child. Async-signal-safe. Returns false when every
    /// slot is occupied.
    pub fn push(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        for slot in &self.slots {
            if slot
                .compare_exchange(Self::EMPTY, pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Take every recorded PID, invoking `f` for each.
    pub fn drain(&self, mut f: impl FnMut(u32)) {
        for slot in &self.slots {
            let pid = slot.swap(Self::EMPTY, Ordering::AcqRel);
            if pid > 0 {
                f(pid as u32);
            }
        }
    }
}

impl Default for DeadChildSlots {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle through which signal handlers (and anything else outside
/// the loop thread) talk to a running server.
#[derive(Clone, Debug)]
pub struct InterruptHandle {
    inner: Arc<InterruptState>,
}

#[derive(Debug)]
struct InterruptState {
    terminate: AtomicBool,
    dead_children: DeadChildSlots,
    waker: OnceLock<Arc<Waker>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InterruptState {
                terminate: AtomicBool::new(false),
                dead_children: DeadChildSlots::new(),
                waker: OnceLock::new(),
            }),
        }
    }

    /// Attach the poll waker. Set once when the loop starts; later calls
    /// are ignored so the handle stays safe to read from signal context.
    pub fn set_waker(&self, waker: Arc<Waker>) {
        let _ = self.inner.waker.set(waker);
    }

    /// Request loop termination. Async-signal-safe.
    pub fn interrupt(&self) {
        self.inner.terminate.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.terminate.load(Ordering::Acquire)
    }

    /// Record an exited child for the loop to reap. Async-signal-safe.
    /// A full mailbox drops the notification; the loop's non-blocking
    /// wait sweep catches the child shortly after.
    pub fn register_dead_child(&self, pid: i32) {
        let _ = self.inner.dead_children.push(pid);
        self.wake();
    }

    pub fn drain_dead_children(&self, f: impl FnMut(u32)) {
        self.inner.dead_children.drain(f);
    }

    fn wake(&self) {
        if let Some(waker) = self.inner.waker.get() {
            let _ = waker.wake();
        }
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Uninstalls the handlers registered by [`install`] when dropped.
pub struct SignalGuard {
    ids: Vec<SigId>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        for id in self.ids.drain(..) {
            signal_hook_registry::unregister(id);
        }
        INSTALLED.store(false, Ordering::Release);
    }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the server's signal handlers: SIGHUP/SIGINT/SIGTERM interrupt
/// the loop, SIGCHLD records the dead PID, SIGPIPE is absorbed so broken
/// client sockets surface as write errors.
///
/// Installation is idempotent: a second call while handlers are active
/// returns an empty guard rather than stacking duplicate handlers.
pub fn install(handle: InterruptHandle) -> io::Result<SignalGuard> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Ok(SignalGuard { ids: Vec::new() });
    }

    let mut ids = Vec::new();
    for signal in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        let handle = handle.clone();
        // Handler body is async-signal-safe: atomics plus an eventfd write.
        let id = unsafe { signal_hook_registry::register(signal, move || handle.interrupt()) }?;
        ids.push(id);
    }

    {
        let handle = handle.clone();
        let on_child = move |info: &libc::siginfo_t| {
            let pid = unsafe { info.si_pid() };
            handle.register_dead_child(pid);
        };
        let id = unsafe { signal_hook_registry::register_sigaction(libc::SIGCHLD, on_child) }?;
        ids.push(id);
    }

    let id = unsafe { signal_hook_registry::register(libc::SIGPIPE, || {}) }?;
    ids.push(id);

    Ok(SignalGuard { ids })
}

static FATAL_SOCKET: OnceLock<CString> = OnceLock::new();

/// Install last-resort handlers for fatal signals (SIGABRT, SIGSEGV,
/// SIGILL, SIGBUS): emit one diagnostic line, unlink the server socket so a
/// restart does not find a live-looking stale file, then die with the
/// default disposition.
pub fn install_fatal_cleanup(socket_path: &Path) -> io::Result<()> {
    let path = CString::new(socket_path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "socket path contains NUL"))?;
    let _ = FATAL_SOCKET.set(path);

    for signal in [libc::SIGABRT, libc::SIGSEGV, libc::SIGILL, libc::SIGBUS] {
        let on_fatal = move |_: &libc::siginfo_t| {
            const MSG: &[u8] = b"monomux: fatal signal, removing server socket\n";
            unsafe {
                libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
            }
            if let Some(path) = FATAL_SOCKET.get() {
                unsafe {
                    libc::unlink(path.as_ptr());
                }
            }
            let _ = signal_hook::low_level::emulate_default_handler(signal);
        };
        unsafe { signal_hook_registry::register_unchecked(signal, on_fatal) }?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_push_and_drain() {
        let slots = DeadChildSlots::new();
        assert!(slots.push(100));
        assert!(slots.push(200));

        let mut seen = Vec::new();
        slots.drain(|pid| seen.push(pid));
        seen.sort_unstable();
        assert_eq!(seen, vec![100, 200]);

        // Drained slots are reusable.
        assert!(slots.push(300));
        let mut seen = Vec::new();
        slots.drain(|pid| seen.push(pid));
        assert_eq!(seen, vec![300]);
    }

    #[test]
    fn slots_reject_when_full() {
        let slots = DeadChildSlots::new();
        for pid in 1..=DEAD_CHILD_SLOTS as i32 {
            assert!(slots.push(pid));
        }
        assert!(!slots.push(999));

        let mut count = 0;
        slots.drain(|_| count += 1);
        assert_eq!(count, DEAD_CHILD_SLOTS);
    }

    #[test]
    fn slots_ignore_invalid_pids() {
        let slots = DeadChildSlots::new();
        assert!(!slots.push(0));
        assert!(!slots.push(-5));
        let mut count = 0;
        slots.drain(|_| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn interrupt_flag_round_trip() {
        let handle = InterruptHandle::new();
        assert!(!handle.is_interrupted());
        handle.interrupt();
        assert!(handle.is_interrupted());
    }

    #[test]
    fn dead_children_flow_through_handle() {
        let handle = InterruptHandle::new();
        handle.register_dead_child(4242);
        let mut seen = Vec::new();
        handle.drain_dead_children(|pid| seen.push(pid));
        assert_eq!(seen, vec![4242]);
    }

    #[test]
    fn install_is_idempotent() {
        let handle = InterruptHandle::new();
        let first = install(handle.clone()).unwrap();
        let second = install(handle).unwrap();
        // The second guard carries no registrations of its own.
        assert!(second.ids.is_empty());
        assert!(!first.ids.is_empty());
        drop(second);
        drop(first);
    }
}
