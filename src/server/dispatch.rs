//! Control-frame dispatch: the kind-keyed handler table and the default
//! handlers behind every request the server understands.

use super::{send_frame, ClientExit, ClientId, ExitReason, Server, ServerError, SessionData};
use crate::channel::BufferedChannel;
use crate::protocol::{
    AttachRequestMsg, AttachResponseMsg, DataHandshakeAckMsg, DataHandshakeMsg, DetachMsg,
    DetachScope, Frame, MakeSessionRequestMsg, MakeSessionResponseMsg, MessageKind,
    ProtocolError, SessionEntry, SessionExitMsg, SessionListRequestMsg,
    SessionListResponseMsg, SignalMsg, StatisticsRequestMsg, StatisticsResponseMsg,
    WindowSizeMsg,
};
use crate::pty::SpawnOptions;
use crate::socket::{SESSION_ENV_VAR, SOCKET_ENV_VAR};
use mio::net::UnixStream;
use std::collections::HashMap;

/// A control-message handler: `(server, sending client, frame)`.
pub type Handler = fn(&mut Server, ClientId, &Frame) -> Result<(), ServerError>;

pub type DispatchTable = HashMap<u16, Handler>;

/// The built-in handler set. Users embedding the server may replace
/// individual entries through [`Server::register_handler`].
pub fn default_table() -> DispatchTable {
    let mut table: DispatchTable = HashMap::new();
    table.insert(MessageKind::DataHandshake as u16, handle_data_handshake);
    table.insert(MessageKind::SessionListRequest as u16, handle_session_list);
    table.insert(MessageKind::MakeSessionRequest as u16, handle_make_session);
    table.insert(MessageKind::AttachRequest as u16, handle_attach);
    table.insert(MessageKind::Detach as u16, handle_detach);
    table.insert(MessageKind::Signal as u16, handle_signal);
    table.insert(MessageKind::WindowSize as u16, handle_window_size);
    table.insert(MessageKind::StatisticsRequest as u16, handle_statistics);
    table
}

/// Requests a client may issue before completing the data handshake:
/// the handshake itself plus the informational ones.
fn allowed_before_established(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::DataHandshake
            | MessageKind::SessionListRequest
            | MessageKind::StatisticsRequest
    )
}

/// Pull one complete frame out of a buffered control channel.
///
/// Returns `Ok(None)` while the frame is still partial. Frames of unknown
/// kind are consumed and skipped. Protocol violations (zero-length frame,
/// version mismatch) surface as errors for the caller to punish.
pub(crate) fn read_control_frame(
    channel: &mut BufferedChannel<UnixStream>,
) -> Result<Option<Frame>, ServerError> {
    loop {
        channel.load(channel.optimal_read_size())?;

        let mut header = [0u8; 4];
        if channel.peek(&mut header) < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes(header);
        if length < 4 {
            // Poison: consume the bogus prefix so it cannot wedge the stream.
            channel.consume(4);
            return Err(ProtocolError::EmptyFrame.into());
        }
        // Checked before buffering so an absurd prefix cannot balloon the
        // read ring while the loop waits for a frame that never completes.
        if length - 4 > crate::protocol::MAX_PAYLOAD_SIZE {
            channel.consume(4);
            return Err(ProtocolError::Oversized(length - 4).into());
        }
        let total = 4 + length as usize;
        if channel.read_in_buffer() < total {
            return Ok(None);
        }

        let wire = channel.read(total)?;
        match Frame::decode(&wire)? {
            Some((frame, _)) => return Ok(Some(frame)),
            None => continue, // unknown kind, already logged
        }
    }
}

/// Drain and dispatch every complete control frame a client has sent, in
/// arrival order. Protocol errors reject and condemn the client.
pub(crate) fn handle_control(server: &mut Server, id: ClientId) {
    loop {
        let (frame, established) = {
            let Some(client) = server.get_client(id) else {
                return;
            };
            match read_control_frame(client.control()) {
                Ok(Some(frame)) => {
                    client.activity();
                    let established = client.is_established();
                    (frame, established)
                }
                Ok(None) => return,
                Err(ServerError::Protocol(e)) => {
                    tracing::warn!(client = id, %e, "protocol violation on control stream");
                    reject_and_disconnect(server, id, &format!("protocol error: {e}"));
                    return;
                }
                Err(e) => {
                    tracing::error!(client = id, %e, "error reading control stream");
                    return;
                }
            }
        };

        if !established && !allowed_before_established(frame.kind) {
            tracing::warn!(client = id, kind = ?frame.kind, "request requires a data connection");
            reject_and_disconnect(server, id, "request requires a completed data handshake");
            return;
        }

        let Some(handler) = server.dispatch.get(&(frame.kind as u16)).copied() else {
            tracing::warn!(client = id, kind = ?frame.kind, "no handler for message kind");
            continue;
        };
        if let Err(e) = handler(server, id, &frame) {
            tracing::error!(client = id, kind = ?frame.kind, %e, "handler failed");
        }
    }
}

fn reject_and_disconnect(server: &mut Server, id: ClientId, reason: &str) {
    if let Some(client) = server.get_client(id) {
        client.mark_exit(ClientExit {
            reason: ExitReason::Kicked,
            exit_code: 0,
            message: reason.to_string(),
        });
    }
    // The farewell Reject frame goes out during the prune pass.
}

// ── Handlers ───────────────────────────────────────────────────────

/// A second connection presents `{client_id, nonce}` to become the data
/// channel of its control client. The nonce is consumed by the check
/// whether or not it matches.
fn handle_data_handshake(
    server: &mut Server,
    presenting_id: ClientId,
    frame: &Frame,
) -> Result<(), ServerError> {
    let msg: DataHandshakeMsg = frame.parse()?;
    let main_id = msg.client_id;

    let verdict: Result<(), &str> = (|| {
        if main_id == presenting_id {
            return Err("cannot become one's own data connection");
        }
        let Some(main) = server.clients.get_mut(&main_id) else {
            return Err("unknown client id");
        };
        if main.is_established() {
            return Err("client already has a data connection");
        }
        if main.consume_nonce() != Some(msg.nonce) {
            return Err("bad nonce");
        }
        Ok(())
    })();

    match verdict {
        Ok(()) => {
            server.turn_client_into_data_of(main_id, presenting_id)?;
            if let Some(data) = server.clients.get_mut(&main_id).and_then(|c| c.data()) {
                send_frame(&mut server.poller, data, &DataHandshakeAckMsg)?;
            }
            tracing::info!(client = main_id, "handshake established");
            Ok(())
        }
        Err(reason) => {
            tracing::warn!(client = presenting_id, main = main_id, reason, "data handshake rejected");
            reject_and_disconnect(server, presenting_id, reason);
            Ok(())
        }
    }
}

fn handle_session_list(
    server: &mut Server,
    id: ClientId,
    frame: &Frame,
) -> Result<(), ServerError> {
    let _msg: SessionListRequestMsg = frame.parse()?;
    let sessions: Vec<SessionEntry> = server
        .sessions
        .values()
        .map(|s| SessionEntry {
            name: s.name().to_string(),
            created_at: s.created_unix(),
            dead: s.is_dead(),
        })
        .collect();

    let resp = SessionListResponseMsg { sessions };
    if let Some(client) = server.clients.get_mut(&id) {
        send_frame(&mut server.poller, client.control(), &resp)?;
    }
    Ok(())
}

fn handle_make_session(
    server: &mut Server,
    id: ClientId,
    frame: &Frame,
) -> Result<(), ServerError> {
    let msg: MakeSessionRequestMsg = frame.parse()?;

    let respond = |server: &mut Server, resp: MakeSessionResponseMsg| -> Result<(), ServerError> {
        if let Some(client) = server.clients.get_mut(&id) {
            send_frame(&mut server.poller, client.control(), &resp)?;
        }
        Ok(())
    };

    if !msg.name.is_empty() && server.sessions.contains_key(&msg.name) {
        tracing::debug!(session = %msg.name, "session already exists");
        return respond(
            server,
            MakeSessionResponseMsg {
                success: false,
                name: msg.name.clone(),
                error: "session name already exists".into(),
            },
        );
    }

    let name = if msg.name.is_empty() {
        // Pick the lowest free numeric name.
        let mut counter = 1usize;
        while server.sessions.contains_key(&counter.to_string()) {
            counter += 1;
        }
        counter.to_string()
    } else {
        msg.name.clone()
    };

    tracing::info!(session = %name, program = %msg.program, "creating session");

    let mut opts = SpawnOptions {
        program: msg.program,
        argv: msg.argv,
        env_set: msg.env_set,
        env_unset: msg.env_unset,
        rows: 24,
        cols: 80,
    };
    // Hand the session enough environment to find its way back here.
    let socket_path = server.socket_path.to_string_lossy().into_owned();
    opts.env_set.push((SOCKET_ENV_VAR.into(), socket_path));
    opts.env_set.push((SESSION_ENV_VAR.into(), name.clone()));

    let pty = match crate::pty::PtySession::spawn(&opts) {
        Ok(pty) => pty,
        Err(e) => {
            tracing::error!(session = %name, %e, "failed to spawn session");
            return respond(
                server,
                MakeSessionResponseMsg {
                    success: false,
                    name,
                    error: format!("failed to spawn: {e}"),
                },
            );
        }
    };

    let session = SessionData::new(name.clone(), pty);
    let fd = session.channel_ref().fd();
    server.make_session(session)?;
    let armed = server
        .fds
        .insert(fd, super::FdTag::Session(name.clone()))
        .map_err(|e| ServerError::Fatal(e.to_string()))
        .and_then(|()| server.poller.listen(fd, true, false).map_err(Into::into));
    if let Err(e) = armed {
        tracing::error!(session = %name, %e, "failed to arm session master");
        self_destroy_session(server, &name, fd);
        return respond(
            server,
            MakeSessionResponseMsg {
                success: false,
                name,
                error: "failed to register session with the event loop".into(),
            },
        );
    }
    if let Some(session) = server.sessions.get_mut(&name) {
        session.set_state(super::SessionState::Running);
    }
    tracing::info!(session = %name, fd, "session created");

    respond(
        server,
        MakeSessionResponseMsg {
            success: true,
            name,
            error: String::new(),
        },
    )
}

fn handle_attach(server: &mut Server, id: ClientId, frame: &Frame) -> Result<(), ServerError> {
    let msg: AttachRequestMsg = frame.parse()?;

    let (resp, attach) = match server.sessions.get(&msg.name) {
        Some(session) if !session.is_dead() => (
            AttachResponseMsg {
                success: true,
                name: session.name().to_string(),
                created_at: session.created_unix(),
                error: String::new(),
            },
            true,
        ),
        Some(_) => (
            AttachResponseMsg {
                success: false,
                name: msg.name.clone(),
                error: "session is terminating".into(),
                ..Default::default()
            },
            false,
        ),
        None => (
            AttachResponseMsg {
                success: false,
                name: msg.name.clone(),
                error: "no such session".into(),
                ..Default::default()
            },
            false,
        ),
    };

    if attach {
        // Leaving a previous session first keeps the at-most-one invariant.
        if let Some(previous) = server
            .clients
            .get(&id)
            .and_then(|c| c.attached_session())
            .map(str::to_string)
        {
            server.client_detached(id, &previous);
        }
        server.client_attached(id, &msg.name)?;
    }

    if let Some(client) = server.clients.get_mut(&id) {
        send_frame(&mut server.poller, client.control(), &resp)?;
    }
    Ok(())
}

/// Detach the requester (or everyone in its session). Each detached
/// client receives a session-exit notice with code 0 so its pump returns
/// to the local shell; the session itself keeps running.
fn handle_detach(server: &mut Server, id: ClientId, frame: &Frame) -> Result<(), ServerError> {
    let msg: DetachMsg = frame.parse()?;

    let Some(session_name) = server
        .clients
        .get(&id)
        .and_then(|c| c.attached_session())
        .map(str::to_string)
    else {
        return Ok(());
    };

    let targets: Vec<ClientId> = match msg.scope {
        DetachScope::Own => vec![id],
        DetachScope::AllOfSession => server
            .sessions
            .get(&session_name)
            .map(|s| s.attached_clients().to_vec())
            .unwrap_or_default(),
    };

    let notice = SessionExitMsg {
        name: session_name.clone(),
        exit_code: 0,
    };
    for target in targets {
        if let Some(client) = server.clients.get_mut(&target) {
            if let Err(e) = send_frame(&mut server.poller, client.control(), &notice) {
                tracing::warn!(client = target, %e, "failed to send detach notice");
            }
        }
        server.client_detached(target, &session_name);
    }
    Ok(())
}

fn handle_signal(server: &mut Server, id: ClientId, frame: &Frame) -> Result<(), ServerError> {
    let msg: SignalMsg = frame.parse()?;
    let Some(session_name) = server
        .clients
        .get(&id)
        .and_then(|c| c.attached_session())
        .map(str::to_string)
    else {
        return Ok(());
    };
    if let Some(session) = server.sessions.get(&session_name) {
        if let Err(e) = session.pty().signal(msg.signal) {
            tracing::warn!(session = %session_name, signal = msg.signal, %e, "signal delivery failed");
        }
    }
    Ok(())
}

fn handle_window_size(
    server: &mut Server,
    id: ClientId,
    frame: &Frame,
) -> Result<(), ServerError> {
    let msg: WindowSizeMsg = frame.parse()?;
    let Some(session_name) = server
        .clients
        .get(&id)
        .and_then(|c| c.attached_session())
        .map(str::to_string)
    else {
        return Ok(());
    };
    if let Some(session) = server.sessions.get(&session_name) {
        if let Err(e) = session.pty().window_size(msg.rows, msg.cols) {
            tracing::warn!(session = %session_name, %e, "window size change failed");
        }
    }
    Ok(())
}

fn handle_statistics(
    server: &mut Server,
    id: ClientId,
    frame: &Frame,
) -> Result<(), ServerError> {
    let _msg: StatisticsRequestMsg = frame.parse()?;
    let resp = StatisticsResponseMsg {
        text: server.statistics(),
    };
    if let Some(client) = server.clients.get_mut(&id) {
        send_frame(&mut server.poller, client.control(), &resp)?;
    }
    Ok(())
}

fn self_destroy_session(server: &mut Server, name: &str, fd: std::os::fd::RawFd) {
    server.poller.stop(fd);
    server.fds.remove(fd);
    if let Some(session) = server.sessions.get_mut(name) {
        session.pty().kill();
        session.pty_mut().wait();
    }
    server.remove_session(name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_covers_every_client_request() {
        let table = default_table();
        for kind in [
            MessageKind::DataHandshake,
            MessageKind::SessionListRequest,
            MessageKind::MakeSessionRequest,
            MessageKind::AttachRequest,
            MessageKind::Detach,
            MessageKind::Signal,
            MessageKind::WindowSize,
            MessageKind::StatisticsRequest,
        ] {
            assert!(table.contains_key(&(kind as u16)), "missing {kind:?}");
        }
        // Server-to-client kinds have no handlers.
        assert!(!table.contains_key(&(MessageKind::ClientId as u16)));
        assert!(!table.contains_key(&(MessageKind::Reject as u16)));
    }

    #[test]
    fn informational_requests_allowed_before_handshake() {
        assert!(allowed_before_established(MessageKind::SessionListRequest));
        assert!(allowed_before_established(MessageKind::StatisticsRequest));
        assert!(allowed_before_established(MessageKind::DataHandshake));
        assert!(!allowed_before_established(MessageKind::AttachRequest));
        assert!(!allowed_before_established(MessageKind::MakeSessionRequest));
        assert!(!allowed_before_established(MessageKind::Signal));
    }
}
