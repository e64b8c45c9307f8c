//! PTY session hosting.
//!
//! Opens a PTY pair, spawns the session's child process as a session leader
//! on the slave side, and keeps the master side in non-blocking mode so the
//! server's event loop can multiplex it alongside the client sockets.

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pty master exposes no file descriptor")]
    NoMasterFd,

    #[error("failed to set up master fd: {0}")]
    MasterFd(#[source] nix::Error),

    #[error("invalid signal number: {0}")]
    BadSignal(i32),

    #[error("signal delivery failed: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[from] std::io::Error),
}

/// What to execute inside a new session.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Program path; empty means `$SHELL` (falling back to `/bin/sh`).
    pub program: String,
    pub argv: Vec<String>,
    pub env_set: Vec<(String, String)>,
    pub env_unset: Vec<String>,
    pub rows: u16,
    pub cols: u16,
}

/// A running PTY child: the master endpoint plus the child process handle.
///
/// The slave side is consumed by the spawn and the child holds it as its
/// controlling terminal; the parent only ever touches the master.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    master_fd: RawFd,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("pid", &self.pid)
            .field("master_fd", &self.master_fd)
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Open a PTY pair and spawn the child on the slave side.
    ///
    /// The child becomes a session leader with the slave as its controlling
    /// terminal and stdin/stdout/stderr. Environment mutations are applied
    /// before exec. The retained master is switched to non-blocking mode.
    pub fn spawn(opts: &SpawnOptions) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows: if opts.rows == 0 { 24 } else { opts.rows },
            cols: if opts.cols == 0 { 80 } else { opts.cols },
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system.openpty(size).map_err(PtyError::OpenPty)?;

        let cmd = Self::build_command(opts);
        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        drop(pair.slave);

        let pid = child.process_id();
        let master = pair.master;
        let master_fd = master.as_raw_fd().ok_or(PtyError::NoMasterFd)?;
        set_nonblocking(master_fd).map_err(PtyError::MasterFd)?;

        tracing::debug!(?pid, master_fd, "pty session spawned");
        Ok(Self {
            master,
            child,
            pid,
            master_fd,
        })
    }

    fn build_command(opts: &SpawnOptions) -> CommandBuilder {
        let program = if opts.program.is_empty() {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        } else {
            opts.program.clone()
        };
        let mut cmd = CommandBuilder::new(program);
        cmd.args(&opts.argv);
        let term = std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string());
        cmd.env("TERM", term);
        for (key, value) in &opts.env_set {
            cmd.env(key, value);
        }
        for key in &opts.env_unset {
            cmd.env_remove(key);
        }
        cmd
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Apply a window-size change to the master. Zero rows or columns are
    /// ignored rather than propagated as a degenerate size.
    pub fn window_size(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        if rows == 0 || cols == 0 {
            return Ok(());
        }
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    /// Deliver `signum` to the child's process group.
    pub fn signal(&self, signum: i32) -> Result<(), PtyError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let signal = Signal::try_from(signum).map_err(|_| PtyError::BadSignal(signum))?;
        killpg(Pid::from_raw(pid as i32), signal).map_err(PtyError::Signal)
    }

    /// Non-blocking wait. If `pid` names this session's child and it has
    /// exited, reaps it and returns the exit code.
    pub fn reap_if_dead(&mut self, pid: u32) -> Result<Option<i32>, PtyError> {
        if self.pid != Some(pid) {
            return Ok(None);
        }
        match self.child.try_wait()? {
            Some(status) => Ok(Some(status.exit_code() as i32)),
            None => Ok(None),
        }
    }

    /// Ask the child to hang up; used during server shutdown before the
    /// harder [`kill`](Self::kill).
    pub fn hangup(&self) {
        let _ = self.signal(libc::SIGHUP);
    }

    /// Force-kill the child's process group.
    pub fn kill(&self) {
        let _ = self.signal(libc::SIGKILL);
    }

    /// Blocking reap, for shutdown paths where the child is known dead or
    /// dying. Swallows errors; there is nothing left to do with them.
    pub fn wait(&mut self) {
        let _ = self.child.wait();
    }
}

impl AsRawFd for PtySession {
    fn as_raw_fd(&self) -> RawFd {
        self.master_fd
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn shell_opts() -> SpawnOptions {
        SpawnOptions {
            program: "/bin/sh".into(),
            rows: 24,
            cols: 80,
            ..Default::default()
        }
    }

    /// Read the master fd until `pattern` shows up or the deadline passes.
    fn read_until(session: &PtySession, pattern: &[u8], timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let fd = session.as_raw_fd();
        while Instant::now() < deadline {
            match nix::unistd::read(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if collected
                        .windows(pattern.len())
                        .any(|window| window == pattern)
                    {
                        break;
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break,
            }
        }
        collected
    }

    fn write_all(session: &PtySession, mut data: &[u8]) {
        let fd = unsafe { BorrowedFd::borrow_raw(session.as_raw_fd()) };
        while !data.is_empty() {
            match nix::unistd::write(fd, data) {
                Ok(n) => data = &data[n..],
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("write to pty failed: {e}"),
            }
        }
    }

    #[test]
    fn spawn_shell_and_echo() {
        let session = PtySession::spawn(&shell_opts()).expect("spawn shell");
        assert!(session.pid().is_some());

        write_all(&session, b"echo MONO_PTY_TEST_1\n");
        let output = read_until(&session, b"MONO_PTY_TEST_1", Duration::from_secs(5));
        let text = String::from_utf8_lossy(&output);
        assert!(
            text.contains("MONO_PTY_TEST_1"),
            "expected marker in output, got: {text}"
        );
    }

    #[test]
    fn spawn_applies_env_mutations() {
        let mut opts = shell_opts();
        opts.env_set.push(("MONO_PTY_VAR".into(), "present".into()));
        let session = PtySession::spawn(&opts).expect("spawn shell");

        write_all(&session, b"echo \"VAR=$MONO_PTY_VAR\"\n");
        let output = read_until(&session, b"VAR=present", Duration::from_secs(5));
        assert!(
            String::from_utf8_lossy(&output).contains("VAR=present"),
            "environment addition should reach the child"
        );
    }

    #[test]
    fn window_size_zero_is_ignored() {
        let session = PtySession::spawn(&shell_opts()).expect("spawn shell");
        session.window_size(0, 80).unwrap();
        session.window_size(24, 0).unwrap();
        session.window_size(40, 120).unwrap();
    }

    #[test]
    fn reap_if_dead_matches_only_own_child() {
        let mut opts = shell_opts();
        opts.argv = vec!["-c".into(), "exit 7".into()];
        let mut session = PtySession::spawn(&opts).expect("spawn");
        let pid = session.pid().unwrap();

        // A foreign PID is never reaped by this session.
        assert_eq!(session.reap_if_dead(pid + 100_000).unwrap(), None);

        let deadline = Instant::now() + Duration::from_secs(5);
        let code = loop {
            if let Some(code) = session.reap_if_dead(pid).unwrap() {
                break code;
            }
            assert!(Instant::now() < deadline, "child did not exit in time");
            std::thread::sleep(Duration::from_millis(20));
        };
        assert_eq!(code, 7);
    }

    #[test]
    fn bad_signal_number_is_rejected() {
        let session = PtySession::spawn(&shell_opts()).expect("spawn shell");
        assert!(matches!(
            session.signal(12345),
            Err(PtyError::BadSignal(12345))
        ));
    }
}
