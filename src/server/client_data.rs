//! Per-client server-side state.

use crate::channel::BufferedChannel;
use mio::net::UnixStream;
use std::time::{Instant, SystemTime};

/// Dense identifier the server assigns to each connected client.
pub type ClientId = u64;

/// Why a client is being disconnected. Reported in the statistics dump and
/// used to pick the farewell frame during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The client went away on its own (stream closed).
    Disconnected,
    /// Detached on request.
    Detached,
    /// Its session's child exited.
    SessionExit,
    /// The server is shutting down.
    ServerShutdown,
    /// The server kicked the client; the message says why.
    Kicked,
}

/// A pending disconnect decided by the server but not yet executed.
#[derive(Debug, Clone)]
pub struct ClientExit {
    pub reason: ExitReason,
    pub exit_code: i32,
    pub message: String,
}

/// State for one connected client: its identity, streams, pending nonce,
/// and session attachment. Cross-references to sessions are stored as
/// names, never as references; the server resolves them under the
/// loop-thread invariant.
#[derive(Debug)]
pub struct ClientData {
    id: ClientId,
    created: SystemTime,
    connected_at: Instant,
    last_active: Instant,
    control: BufferedChannel<UnixStream>,
    data: Option<BufferedChannel<UnixStream>>,
    nonce: Option<u64>,
    attached_session: Option<String>,
    pending_exit: Option<ClientExit>,
}

impl ClientData {
    pub fn new(id: ClientId, control: BufferedChannel<UnixStream>) -> Self {
        let now = Instant::now();
        Self {
            id,
            created: SystemTime::now(),
            connected_at: now,
            last_active: now,
            control,
            data: None,
            nonce: None,
            attached_session: None,
            pending_exit: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn when_created(&self) -> SystemTime {
        self.created
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn activity(&mut self) {
        self.last_active = Instant::now();
    }

    /// Time since the control connection was accepted; drives the
    /// handshake deadline.
    pub fn connected_for(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    pub fn control(&mut self) -> &mut BufferedChannel<UnixStream> {
        &mut self.control
    }

    pub fn control_ref(&self) -> &BufferedChannel<UnixStream> {
        &self.control
    }

    pub fn data(&mut self) -> Option<&mut BufferedChannel<UnixStream>> {
        self.data.as_mut()
    }

    pub fn data_ref(&self) -> Option<&BufferedChannel<UnixStream>> {
        self.data.as_ref()
    }

    /// The handshake finished and the client may attach and move data.
    pub fn is_established(&self) -> bool {
        self.data.is_some()
    }

    /// Store a fresh single-use nonce, replacing any unconsumed one.
    pub fn set_nonce(&mut self, nonce: u64) {
        self.nonce = Some(nonce);
    }

    /// Take the pending nonce. Each stored value can be checked exactly
    /// once; a second consume yields nothing.
    pub fn consume_nonce(&mut self) -> Option<u64> {
        self.nonce.take()
    }

    pub fn has_pending_nonce(&self) -> bool {
        self.nonce.is_some()
    }

    /// Promote the given stream into this client's data channel.
    pub fn adopt_data_channel(&mut self, channel: BufferedChannel<UnixStream>) {
        debug_assert!(self.data.is_none(), "data channel adopted twice");
        self.data = Some(channel);
    }

    /// Release the control channel, used when this record's stream becomes
    /// another client's data channel.
    pub fn into_control_channel(self) -> BufferedChannel<UnixStream> {
        self.control
    }

    pub fn attached_session(&self) -> Option<&str> {
        self.attached_session.as_deref()
    }

    pub fn attach_to(&mut self, session: &str) {
        self.attached_session = Some(session.to_string());
    }

    pub fn detach(&mut self) {
        self.attached_session = None;
    }

    /// Mark the client for teardown on the next loop iteration. The first
    /// recorded reason wins.
    pub fn mark_exit(&mut self, exit: ClientExit) {
        if self.pending_exit.is_none() {
            self.pending_exit = Some(exit);
        }
    }

    pub fn pending_exit(&self) -> Option<&ClientExit> {
        self.pending_exit.as_ref()
    }

    /// Either stream failing condemns the whole client.
    pub fn has_failed_stream(&self) -> bool {
        self.control.has_failed() || self.data.as_ref().is_some_and(|d| d.has_failed())
    }
}
