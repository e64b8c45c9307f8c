//! The monomux server: a single-threaded, poll-driven connection and
//! session multiplexer.
//!
//! Everything mutates on the loop thread. Signal handlers are the only
//! concurrent actors and reach the loop exclusively through the
//! [`InterruptHandle`](crate::signals::InterruptHandle): an atomic
//! terminate flag, the bounded dead-child slots, and a poll waker.

pub mod client_data;
pub mod dispatch;
pub mod registry;
pub mod session_data;

pub use client_data::{ClientData, ClientExit, ClientId, ExitReason};
pub use registry::{FdRegistry, FdTag};
pub use session_data::{SessionData, SessionState};

use crate::channel::{BufferedChannel, ChannelError};
use crate::protocol::{
    Frame, Payload, ProtocolError, RejectMsg, ServerExitMsg, SessionExitMsg,
};
use crate::poller::{PollEvent, Poller};
use crate::pty::PtyError;
use crate::signals::InterruptHandle;
use crate::socket;
use dispatch::DispatchTable;
use mio::net::{UnixListener, UnixStream};
use rand::Rng;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Upper bound on one poll wait so housekeeping (dead-child reap,
/// handshake deadlines, buffer trims) runs even without I/O.
const POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long a client may take between connecting and completing the
/// two-socket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Event buffer capacity for the poller.
const EVENT_CAPACITY: usize = 1024;

/// Descriptors held back from the budget: a full client costs two and one
/// must stay free so accept() keeps working.
const FD_KEEP_SPARE: u64 = 8;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Spawn(#[from] PtyError),

    #[error("unknown session: {0}")]
    NotFound(String),

    #[error("session name already exists: {0}")]
    Conflict(String),

    #[error("internal invariant violated: {0}")]
    Fatal(String),
}

/// Options for [`run_server`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket_path: PathBuf,
    /// Stop the loop once the last session terminates.
    pub exit_on_last_session_terminate: bool,
}

/// Bind the socket, run the server until interrupted, then shut down.
/// Installs the process signal handlers for the duration of the run.
pub fn run_server(opts: ServerOptions) -> Result<(), ServerError> {
    let mut server = Server::bind(&opts)?;
    let _signals = crate::signals::install(server.interrupt_handle())?;
    crate::signals::install_fatal_cleanup(&opts.socket_path)?;
    let result = server.run();
    server.shutdown();
    result
}

pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    started_at: SystemTime,
    poller: Poller,
    fds: FdRegistry,
    clients: BTreeMap<ClientId, ClientData>,
    sessions: BTreeMap<String, SessionData>,
    next_client_id: ClientId,
    nonce_salt: u64,
    interrupt: InterruptHandle,
    exit_on_empty: bool,
    dispatch: DispatchTable,
}

impl Server {
    /// Bind the listening socket at `opts.socket_path` and build a server
    /// around it.
    pub fn bind(opts: &ServerOptions) -> Result<Self, ServerError> {
        let listener = socket::bind(&opts.socket_path)?;
        Self::new(listener, opts.socket_path.clone(), opts.exit_on_last_session_terminate)
    }

    pub fn new(
        listener: UnixListener,
        socket_path: PathBuf,
        exit_on_empty: bool,
    ) -> Result<Self, ServerError> {
        let poller = Poller::new(EVENT_CAPACITY)?;
        let interrupt = InterruptHandle::new();
        interrupt.set_waker(poller.waker());
        Ok(Self {
            listener,
            socket_path,
            started_at: SystemTime::now(),
            poller,
            fds: FdRegistry::new(),
            clients: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_client_id: 1,
            nonce_salt: rand::thread_rng().gen(),
            interrupt,
            exit_on_empty,
            dispatch: dispatch::default_table(),
        })
    }

    /// Handle for interrupting the loop and feeding dead-child PIDs from
    /// signal context.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Request loop termination from the loop thread itself.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    /// Record an exited child for the next iteration to reap.
    pub fn register_dead_child(&self, pid: i32) {
        self.interrupt.register_dead_child(pid);
    }

    /// Replace the handler for a message kind. The default table covers
    /// every kind the server understands.
    pub fn register_handler(&mut self, kind: u16, handler: dispatch::Handler) {
        self.dispatch.insert(kind, handler);
    }

    pub fn when_started(&self) -> SystemTime {
        self.started_at
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    // ── Record operations (pure data structure, no fd side effects) ──

    pub fn get_client(&mut self, id: ClientId) -> Option<&mut ClientData> {
        self.clients.get_mut(&id)
    }

    pub fn get_session(&mut self, name: &str) -> Option<&mut SessionData> {
        self.sessions.get_mut(name)
    }

    /// Insert a new client record. Rejects a duplicate id.
    pub fn make_client(&mut self, client: ClientData) -> Result<ClientId, ServerError> {
        let id = client.id();
        if self.clients.contains_key(&id) {
            return Err(ServerError::Fatal(format!("client id {id} already exists")));
        }
        self.clients.insert(id, client);
        Ok(id)
    }

    /// Insert a new session record. Rejects a duplicate name.
    pub fn make_session(&mut self, session: SessionData) -> Result<(), ServerError> {
        let name = session.name().to_string();
        if self.sessions.contains_key(&name) {
            return Err(ServerError::Conflict(name));
        }
        self.sessions.insert(name, session);
        Ok(())
    }

    /// Remove a client record, detaching it from its session. Streams are
    /// not closed gracefully by this call; they close on drop.
    pub fn remove_client(&mut self, id: ClientId) -> Option<ClientData> {
        let client = self.clients.remove(&id)?;
        if let Some(name) = client.attached_session() {
            if let Some(session) = self.sessions.get_mut(name) {
                session.remove_client(id);
            }
        }
        Some(client)
    }

    /// Remove a session record, detaching every attached client.
    pub fn remove_session(&mut self, name: &str) -> Option<SessionData> {
        let session = self.sessions.remove(name)?;
        for &id in session.attached_clients() {
            if let Some(client) = self.clients.get_mut(&id) {
                client.detach();
            }
        }
        if self.sessions.is_empty() && self.exit_on_empty {
            tracing::info!("last session terminated, requesting exit");
            self.interrupt.interrupt();
        }
        Some(session)
    }

    /// Mutually attach `client` and `session`.
    pub fn client_attached(&mut self, id: ClientId, name: &str) -> Result<(), ServerError> {
        let session = self
            .sessions
            .get_mut(name)
            .ok_or_else(|| ServerError::NotFound(name.to_string()))?;
        let client = self
            .clients
            .get_mut(&id)
            .ok_or_else(|| ServerError::Fatal(format!("unknown client {id}")))?;
        client.attach_to(name);
        session.attach_client(id);
        tracing::info!(client = id, session = name, "client attached");
        Ok(())
    }

    /// Mutually detach `client` from its session, if that session is `name`.
    pub fn client_detached(&mut self, id: ClientId, name: &str) {
        if let Some(client) = self.clients.get_mut(&id) {
            if client.attached_session() == Some(name) {
                client.detach();
                tracing::info!(client = id, session = name, "client detached");
            }
        }
        if let Some(session) = self.sessions.get_mut(name) {
            session.remove_client(id);
        }
    }

    /// Fold the `data` client's control stream into `main` as its data
    /// channel. The `data` record disappears without firing exit handling;
    /// its descriptor stays armed and is re-tagged.
    pub fn turn_client_into_data_of(
        &mut self,
        main_id: ClientId,
        data_id: ClientId,
    ) -> Result<(), ServerError> {
        let data_client = self
            .clients
            .remove(&data_id)
            .ok_or_else(|| ServerError::Fatal(format!("unknown client {data_id}")))?;
        let channel = data_client.into_control_channel();
        let fd = channel.fd();

        let main = match self.clients.get_mut(&main_id) {
            Some(main) => main,
            None => {
                return Err(ServerError::Fatal(format!("unknown client {main_id}")));
            }
        };
        main.adopt_data_channel(channel);
        let leftover = main
            .data()
            .map(|d| d.has_buffered_read())
            .unwrap_or(false);

        self.fds.remove(fd);
        self.fds
            .insert(fd, FdTag::ClientData(main_id))
            .map_err(|e| ServerError::Fatal(e.to_string()))?;
        if leftover {
            // Bytes that raced the promotion are already buffered; give
            // the descriptor a turn even without new kernel readiness.
            self.poller.reschedule(fd, true, false);
        }
        tracing::debug!(main = main_id, promoted = data_id, fd, "data channel promoted");
        Ok(())
    }

    // ── Event loop ───────────────────────────────────────────────────

    /// Block handling connections until interrupted (or, with
    /// exit-on-empty, until the last session terminates).
    pub fn run(&mut self) -> Result<(), ServerError> {
        let listener_fd = self.listener.as_raw_fd();
        self.poller.listen(listener_fd, true, false)?;
        tracing::info!(path = %self.socket_path.display(), "server loop started");

        while !self.interrupt.is_interrupted() {
            self.reap_dead_children();
            self.expire_handshakes();

            let events = self.poller.wait(POLL_TIMEOUT)?;
            for event in events {
                if event.fd == listener_fd {
                    self.accept_clients();
                    continue;
                }
                self.dispatch_event(event);
            }

            self.prune_failed();
            self.trim_buffers();
        }
        tracing::info!("server loop stopped");
        Ok(())
    }

    fn dispatch_event(&mut self, event: PollEvent) {
        let Some(tag) = self.fds.lookup(event.fd).cloned() else {
            tracing::error!(
                fd = event.fd,
                "event for descriptor missing from registry (mid-handling disconnect?)"
            );
            return;
        };
        match tag {
            FdTag::Session(name) => {
                if event.readable {
                    self.session_output(&name);
                }
                if event.writable {
                    self.flush_session(&name);
                }
            }
            FdTag::ClientData(id) => {
                if event.readable {
                    self.client_data_input(id);
                }
                if event.writable {
                    self.flush_client_data(id);
                }
            }
            FdTag::ClientControl(id) => {
                if event.readable {
                    dispatch::handle_control(self, id);
                }
                if event.writable {
                    self.flush_client_control(id);
                }
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.client_create(stream),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(?e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Register a freshly accepted control connection and greet it with
    /// its identity and nonce.
    fn client_create(&mut self, stream: UnixStream) {
        let id = self.next_client_id;
        self.next_client_id += 1;

        let identifier = format!("<control:client:{id}>");
        let mut client = ClientData::new(id, BufferedChannel::new(stream, identifier));
        let fd = client.control_ref().fd();

        // A full client needs two descriptors plus one spare for accept.
        if let Some(max) = fd_budget() {
            if (self.fds.len() as u64) + FD_KEEP_SPARE >= max {
                tracing::warn!(
                    fds = self.fds.len(),
                    max,
                    "rejecting client, file descriptor budget exhausted"
                );
                // Best-effort farewell without arming the descriptor.
                let frame = Frame::from_msg(&RejectMsg {
                    reason: "not enough file descriptors left on server".into(),
                });
                let _ = client.control().write(&frame.encode());
                let _ = client.control().flush_writes();
                return;
            }
        }

        let nonce = self.fresh_nonce();
        client.set_nonce(nonce);

        if self.fds.insert(fd, FdTag::ClientControl(id)).is_err() {
            tracing::error!(fd, "stale registry entry for accepted socket");
            self.fds.remove(fd);
            let _ = self.fds.insert(fd, FdTag::ClientControl(id));
        }
        if let Err(e) = self.poller.listen(fd, true, false) {
            tracing::error!(?e, fd, "failed to arm client control socket");
            self.fds.remove(fd);
            return;
        }

        let greeting = crate::protocol::ClientIdMsg {
            client_id: id,
            nonce,
        };
        if let Err(e) = send_frame(&mut self.poller, client.control(), &greeting) {
            tracing::warn!(client = id, ?e, "failed to greet client");
            self.poller.stop(fd);
            self.fds.remove(fd);
            return;
        }

        tracing::info!(client = id, fd, "client connected");
        self.clients.insert(id, client);
    }

    /// Nonces never repeat within a server lifetime: fresh randomness
    /// folded with a monotonically advancing salt.
    fn fresh_nonce(&mut self) -> u64 {
        self.nonce_salt = self.nonce_salt.wrapping_add(0x9E37_79B9_7F4A_7C15);
        rand::thread_rng().gen::<u64>() ^ self.nonce_salt
    }

    /// Bytes arriving on a client's data channel go verbatim into the
    /// attached session's master.
    fn client_data_input(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let Some(data_channel) = client.data() else {
            return;
        };

        let chunk = data_channel.optimal_read_size();
        let data = match data_channel.read(chunk) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(client = id, ?e, "error reading client data");
                client.mark_exit(ClientExit {
                    reason: ExitReason::Kicked,
                    exit_code: 0,
                    message: format!("error reading data connection: {e}"),
                });
                return;
            }
        };
        if data_channel.has_buffered_read() {
            let fd = data_channel.fd();
            self.poller.reschedule(fd, true, false);
        }
        if data.is_empty() {
            return;
        }
        client.activity();

        let Some(session_name) = client.attached_session().map(str::to_string) else {
            // Data from an unattached client has nowhere to go.
            return;
        };
        let Some(session) = self.sessions.get_mut(&session_name) else {
            return;
        };

        match session.channel().write(&data) {
            Ok(_) => {}
            Err(e) => {
                tracing::error!(session = %session_name, ?e, "error relaying input to session");
            }
        }
        if session.channel().has_buffered_write() {
            let fd = session.channel().fd();
            let _ = self.poller.watch_writes(fd, true);
        }
    }

    /// Bytes arriving from a session's master are broadcast, best-effort,
    /// to every attached client's data channel.
    fn session_output(&mut self, name: &str) {
        let Some(session) = self.sessions.get_mut(name) else {
            return;
        };

        let chunk = session.channel().optimal_read_size();
        let data = match session.channel().read(chunk) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(session = name, ?e, "error reading session output");
                return;
            }
        };
        if session.channel().has_buffered_read() {
            let fd = session.channel().fd();
            self.poller.reschedule(fd, true, false);
        }
        if data.is_empty() {
            return;
        }
        session.activity();

        let targets: Vec<ClientId> = session.attached_clients().to_vec();
        self.broadcast_to_clients(&targets, &data);
    }

    fn broadcast_to_clients(&mut self, targets: &[ClientId], data: &[u8]) {
        for &id in targets {
            let Some(client) = self.clients.get_mut(&id) else {
                continue;
            };
            let Some(data_channel) = client.data() else {
                continue;
            };
            match data_channel.write(data) {
                Ok(_) => {
                    if data_channel.has_buffered_write() {
                        let fd = data_channel.fd();
                        let _ = self.poller.watch_writes(fd, true);
                    }
                }
                Err(ChannelError::Overflow { size, .. }) => {
                    tracing::error!(client = id, size, "client output overflow, kicking");
                    client.mark_exit(ClientExit {
                        reason: ExitReason::Kicked,
                        exit_code: 0,
                        message: format!("overflow when sending, {size} bytes already pending"),
                    });
                }
                Err(e) => {
                    tracing::error!(client = id, ?e, "error sending to client");
                    client.mark_exit(ClientExit {
                        reason: ExitReason::Disconnected,
                        exit_code: 0,
                        message: String::new(),
                    });
                }
            }
        }
    }

    fn flush_session(&mut self, name: &str) {
        let Some(session) = self.sessions.get_mut(name) else {
            return;
        };
        let _ = session.channel().flush_writes();
        let drained = !session.channel().has_buffered_write();
        let fd = session.channel().fd();
        if drained {
            let _ = self.poller.watch_writes(fd, false);
        }
    }

    fn flush_client_data(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let Some(data_channel) = client.data() else {
            return;
        };
        let _ = data_channel.flush_writes();
        let drained = !data_channel.has_buffered_write();
        let fd = data_channel.fd();
        if drained {
            let _ = self.poller.watch_writes(fd, false);
        }
    }

    fn flush_client_control(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let channel = client.control();
        let _ = channel.flush_writes();
        let drained = !channel.has_buffered_write();
        let fd = channel.fd();
        if drained {
            let _ = self.poller.watch_writes(fd, false);
        }
    }

    // ── Housekeeping ─────────────────────────────────────────────────

    /// Drain the dead-child slots and run post-mortem session cleanup.
    ///
    /// Also sweeps every running session with a non-blocking wait: the
    /// slot array is bounded and the signal path can race, so a child
    /// missed there is picked up within one poll timeout.
    fn reap_dead_children(&mut self) {
        let mut pids = Vec::new();
        self.interrupt.drain_dead_children(|pid| pids.push(pid));

        for session in self.sessions.values() {
            if session.is_dead() {
                continue;
            }
            if let Some(pid) = session.pid() {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }

        for pid in pids {
            let Some(name) = self
                .sessions
                .iter()
                .find(|(_, s)| s.pid() == Some(pid))
                .map(|(name, _)| name.clone())
            else {
                // Not one of ours (or already gone); nothing to reap.
                continue;
            };

            let Some(session) = self.sessions.get_mut(&name) else {
                continue;
            };
            match session.pty_mut().reap_if_dead(pid) {
                Ok(Some(exit_code)) => {
                    tracing::debug!(session = %name, pid, exit_code, "session child exited");
                    session.set_state(SessionState::ChildExited { exit_code });
                    self.finish_session(&name, exit_code);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(session = %name, pid, ?e, "failed to reap child");
                }
            }
        }
    }

    /// Drain any output still queued in a dead session's master, notify
    /// attached clients, and remove the session.
    fn finish_session(&mut self, name: &str, exit_code: i32) {
        // Drain: the master may hold output produced just before death.
        loop {
            let Some(session) = self.sessions.get_mut(name) else {
                return;
            };
            let chunk = session.channel().optimal_read_size();
            let data = match session.channel().read(chunk) {
                Ok(data) if data.is_empty() => break,
                Ok(data) => data,
                Err(_) => break,
            };
            let targets: Vec<ClientId> = session.attached_clients().to_vec();
            self.broadcast_to_clients(&targets, &data);
        }

        if let Some(session) = self.sessions.get_mut(name) {
            session.set_state(SessionState::Draining { exit_code });
        }

        let notice = SessionExitMsg {
            name: name.to_string(),
            exit_code,
        };
        let targets: Vec<ClientId> = self
            .sessions
            .get(name)
            .map(|s| s.attached_clients().to_vec())
            .unwrap_or_default();
        for id in targets {
            if let Some(client) = self.clients.get_mut(&id) {
                if let Err(e) = send_frame(&mut self.poller, client.control(), &notice) {
                    tracing::warn!(client = id, ?e, "failed to send session exit notice");
                }
                // Flush what we can so the notice beats the disconnect.
                let _ = client.control().flush_writes();
            }
            self.client_detached(id, name);
        }

        self.session_destroy(name);
    }

    /// Disarm and drop a session. Closing the master on drop hangs up the
    /// child's terminal if it is somehow still alive.
    fn session_destroy(&mut self, name: &str) {
        let Some(session) = self.sessions.get(name) else {
            return;
        };
        let fd = session.channel_ref().fd();
        self.poller.stop(fd);
        self.fds.remove(fd);
        self.remove_session(name);
        tracing::info!(session = name, "session removed");
    }

    /// Disconnect clients that exceeded the handshake deadline.
    fn expire_handshakes(&mut self) {
        let expired: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| !c.is_established() && c.connected_for() > HANDSHAKE_TIMEOUT)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(client) = self.clients.get_mut(&id) {
                tracing::info!(client = id, "handshake deadline exceeded");
                client.mark_exit(ClientExit {
                    reason: ExitReason::Kicked,
                    exit_code: 0,
                    message: "handshake deadline exceeded".into(),
                });
            }
        }
    }

    /// Tear down clients with failed streams or pending exits, and
    /// sessions whose master failed outside the child-exit path.
    fn prune_failed(&mut self) {
        let condemned: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.has_failed_stream() || c.pending_exit().is_some())
            .map(|(&id, _)| id)
            .collect();
        for id in condemned {
            self.client_exit(id);
        }

        let failed_sessions: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.channel_ref().has_failed() && !s.is_dead())
            .map(|(name, _)| name.clone())
            .collect();
        for name in failed_sessions {
            tracing::error!(session = %name, "session channel failed, cascading exit");
            // The master usually fails because the child died; prefer the
            // real exit code when a reap can still produce one.
            let exit_code = self
                .sessions
                .get_mut(&name)
                .and_then(|s| {
                    let pid = s.pid()?;
                    s.pty_mut().reap_if_dead(pid).ok().flatten()
                })
                .unwrap_or(-1);
            self.finish_session(&name, exit_code);
        }
    }

    /// Full client teardown: farewell frame, descriptor disarm, record
    /// removal. Stream closure happens on drop.
    pub fn client_exit(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(&id) else {
            return;
        };
        let exit = client.pending_exit().cloned();

        if let Some(exit) = &exit {
            let farewell: Option<Frame> = match exit.reason {
                ExitReason::Kicked => Some(Frame::from_msg(&RejectMsg {
                    reason: exit.message.clone(),
                })),
                ExitReason::ServerShutdown => Some(Frame::from_msg(&ServerExitMsg {
                    reason: "server shutting down".into(),
                })),
                _ => None,
            };
            if let Some(frame) = farewell {
                let channel = client.control();
                if !channel.has_failed() {
                    let _ = channel.write(&frame.encode());
                    let _ = channel.flush_writes();
                }
            }
        }

        let control_fd = client.control_ref().fd();
        let data_fd = client.data_ref().map(|d| d.fd());

        self.poller.stop(control_fd);
        self.fds.remove(control_fd);
        if let Some(fd) = data_fd {
            self.poller.stop(fd);
            self.fds.remove(fd);
        }
        self.remove_client(id);
        tracing::info!(client = id, "client exited");
    }

    fn trim_buffers(&mut self) {
        for client in self.clients.values_mut() {
            client.control().try_trim();
            if let Some(data) = client.data() {
                data.try_trim();
            }
        }
        for session in self.sessions.values_mut() {
            session.channel().try_trim();
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Graceful teardown after the loop exits: notify clients, terminate
    /// and reap children, remove the socket file.
    pub fn shutdown(&mut self) {
        tracing::info!("detaching all clients");
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            if let Some(client) = self.clients.get_mut(&id) {
                client.mark_exit(ClientExit {
                    reason: ExitReason::ServerShutdown,
                    exit_code: 0,
                    message: String::new(),
                });
            }
            self.client_exit(id);
        }

        tracing::info!("terminating all sessions");
        let names: Vec<String> = self.sessions.keys().cloned().collect();
        for name in names {
            if let Some(session) = self.sessions.get_mut(&name) {
                session.pty().hangup();
                session.pty().kill();
                session.pty_mut().wait();
            }
            self.session_destroy(&name);
        }

        socket::unlink(&self.socket_path);
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_names(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Human-readable state breakdown. Not meant to be machine-readable.
    pub fn statistics(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "monomux server statistics");
        let _ = writeln!(out, "  on '{}'", self.socket_path.display());
        let _ = writeln!(out, "  started at {}", format_time(self.started_at));
        let _ = writeln!(out);
        let _ = writeln!(out, "  * connected clients   : {}", self.clients.len());
        let _ = writeln!(out, "  * running sessions    : {}", self.sessions.len());
        let _ = writeln!(out, "  * registered handles  : {}", self.fds.len());

        let _ = writeln!(out, "\n# sessions");
        for session in self.sessions.values() {
            let _ = writeln!(out, "  '{}'", session.name());
            let _ = writeln!(out, "    created  : {}", format_time(session.when_created()));
            let _ = writeln!(out, "    state    : {:?}", session.state());
            if let Some(pid) = session.pid() {
                let _ = writeln!(out, "    child pid: {pid}");
            }
            let _ = writeln!(out, "    attached : {:?}", session.attached_clients());
            for line in session.channel_ref().statistics().lines() {
                let _ = writeln!(out, "    {line}");
            }
        }

        let _ = writeln!(out, "\n# clients");
        for client in self.clients.values() {
            let _ = writeln!(out, "  client {}", client.id());
            let _ = writeln!(out, "    connected: {}", format_time(client.when_created()));
            let _ = writeln!(
                out,
                "    attached : {}",
                client.attached_session().unwrap_or("-")
            );
            for line in client.control_ref().statistics().lines() {
                let _ = writeln!(out, "    control {line}");
            }
            if let Some(data) = client.data_ref() {
                for line in data.statistics().lines() {
                    let _ = writeln!(out, "    data    {line}");
                }
            }
        }
        out
    }
}

/// Encode and send a message on a channel, arming write interest when part
/// of it stays buffered.
pub(crate) fn send_frame<T, M>(
    poller: &mut Poller,
    channel: &mut BufferedChannel<T>,
    msg: &M,
) -> Result<(), ChannelError>
where
    T: AsRawFd,
    M: Payload,
{
    let frame = Frame::from_msg(msg);
    channel.write(&frame.encode())?;
    if channel.has_buffered_write() {
        let fd = channel.fd();
        let _ = poller.watch_writes(fd, true);
    }
    Ok(())
}

/// Soft limit on open descriptors for this process.
fn fd_budget() -> Option<u64> {
    nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
        .ok()
        .map(|(soft, _hard)| soft)
}

fn format_time(time: SystemTime) -> String {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => format!("{}.{:03} (unix)", d.as_secs(), d.subsec_millis()),
        Err(_) => "<before epoch>".into(),
    }
}
