//! Per-session server-side state.

use super::ClientId;
use crate::channel::BufferedChannel;
use crate::pty::PtySession;
use std::time::{Instant, SystemTime};

/// Lifecycle of a session from spawn to removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Child spawned; the master is not yet armed in the event loop.
    Spawning,
    /// Child running and master armed.
    Running,
    /// The child was reaped; the master may still hold undelivered output.
    ChildExited { exit_code: i32 },
    /// Master drained; exit notices are going out to attached clients.
    Draining { exit_code: i32 },
}

/// A session: a named PTY child plus the set of attached clients.
///
/// The buffered channel owns the [`PtySession`], which owns the master
/// descriptor and the child handle; there is exactly one owner for each
/// resource. Attached clients are referenced by id only.
#[derive(Debug)]
pub struct SessionData {
    name: String,
    created: SystemTime,
    last_active: Instant,
    channel: BufferedChannel<PtySession>,
    attached: Vec<ClientId>,
    state: SessionState,
}

impl SessionData {
    pub fn new(name: String, pty: PtySession) -> Self {
        let identifier = format!("<pty:{name}>");
        Self {
            name,
            created: SystemTime::now(),
            last_active: Instant::now(),
            channel: BufferedChannel::new(pty, identifier),
            attached: Vec::new(),
            state: SessionState::Spawning,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn when_created(&self) -> SystemTime {
        self.created
    }

    /// Creation time in seconds since the Unix epoch, for wire transfer.
    pub fn created_unix(&self) -> u64 {
        self.created
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn activity(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// The child is gone (possibly still draining output).
    pub fn is_dead(&self) -> bool {
        matches!(
            self.state,
            SessionState::ChildExited { .. } | SessionState::Draining { .. }
        )
    }

    pub fn channel(&mut self) -> &mut BufferedChannel<PtySession> {
        &mut self.channel
    }

    pub fn channel_ref(&self) -> &BufferedChannel<PtySession> {
        &self.channel
    }

    pub fn pty(&self) -> &PtySession {
        self.channel.inner()
    }

    pub fn pty_mut(&mut self) -> &mut PtySession {
        self.channel.inner_mut()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty().pid()
    }

    pub fn attached_clients(&self) -> &[ClientId] {
        &self.attached
    }

    pub fn attach_client(&mut self, id: ClientId) {
        if !self.attached.contains(&id) {
            self.attached.push(id);
        }
    }

    pub fn remove_client(&mut self, id: ClientId) {
        self.attached.retain(|&c| c != id);
    }
}
