//! End-to-end session lifecycle tests: create, attach, echo through a real
//! PTY, detach, and the child-exit cascade.

mod common;

use common::{connect_control, recv_frame, send, TestServer};
use monomux::client::Client;
use monomux::protocol::*;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

fn make_session(control: &mut UnixStream, name: &str) -> MakeSessionResponseMsg {
    send(
        control,
        &MakeSessionRequestMsg {
            name: name.into(),
            program: "/bin/sh".into(),
            ..Default::default()
        },
    );
    let reply = recv_frame(control);
    assert_eq!(reply.kind, MessageKind::MakeSessionResponse);
    reply.parse().unwrap()
}

/// Complete the two-socket handshake on raw streams, returning
/// (control, data).
fn establish(server: &TestServer) -> (UnixStream, UnixStream) {
    let (control, greeting) = connect_control(server);
    let (mut data, _their_greeting) = connect_control(server);
    send(
        &mut data,
        &DataHandshakeMsg {
            client_id: greeting.client_id,
            nonce: greeting.nonce,
        },
    );
    assert_eq!(recv_frame(&mut data).kind, MessageKind::DataHandshakeAck);
    (control, data)
}

/// Read the data stream until `marker` shows up or the deadline passes.
fn read_until(data: &mut UnixStream, marker: &[u8], timeout: Duration) -> Vec<u8> {
    data.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    while Instant::now() < deadline {
        match data.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                collected.extend_from_slice(&buf[..n]);
                if collected.windows(marker.len()).any(|w| w == marker) {
                    break;
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }
    }
    collected
}

#[test]
fn create_and_attach() {
    let server = TestServer::start();
    let (mut control, _data) = establish(&server);

    let resp = make_session(&mut control, "s1");
    assert!(resp.success, "create failed: {}", resp.error);
    assert_eq!(resp.name, "s1");

    send(&mut control, &AttachRequestMsg { name: "s1".into() });
    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::AttachResponse);
    let attach: AttachResponseMsg = reply.parse().unwrap();
    assert!(attach.success);
    assert_eq!(attach.name, "s1");
    assert!(attach.created_at > 0);

    server.stop();
}

#[test]
fn attach_unknown_session_fails_cleanly() {
    let server = TestServer::start();
    let (mut control, _data) = establish(&server);

    send(
        &mut control,
        &AttachRequestMsg {
            name: "ghost".into(),
        },
    );
    let attach: AttachResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert!(!attach.success);
    assert!(attach.error.contains("no such session"));

    server.stop();
}

#[test]
fn duplicate_session_name_conflicts() {
    let server = TestServer::start();
    let (mut control, _data) = establish(&server);

    assert!(make_session(&mut control, "dup").success);
    let second = make_session(&mut control, "dup");
    assert!(!second.success);
    assert!(second.error.contains("already exists"));

    server.stop();
}

#[test]
fn empty_name_gets_numeric_assignment() {
    let server = TestServer::start();
    let (mut control, _data) = establish(&server);

    let first = make_session(&mut control, "");
    assert!(first.success);
    assert_eq!(first.name, "1");
    let second = make_session(&mut control, "");
    assert!(second.success);
    assert_eq!(second.name, "2");

    server.stop();
}

#[test]
fn session_list_reports_created_sessions() {
    let server = TestServer::start();
    let (mut control, _data) = establish(&server);

    make_session(&mut control, "listed");
    send(&mut control, &SessionListRequestMsg);
    let list: SessionListResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert_eq!(list.sessions.len(), 1);
    assert_eq!(list.sessions[0].name, "listed");
    assert!(!list.sessions[0].dead);
    assert!(list.sessions[0].created_at > 0);

    server.stop();
}

#[test]
fn data_echo_through_real_pty() {
    let server = TestServer::start();
    let (mut control, mut data) = establish(&server);

    assert!(make_session(&mut control, "echo").success);
    send(&mut control, &AttachRequestMsg { name: "echo".into() });
    let attach: AttachResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert!(attach.success);

    data.write_all(b"echo MONO_E2E_MARKER\n").unwrap();
    data.flush().unwrap();

    let output = read_until(&mut data, b"MONO_E2E_MARKER", Duration::from_secs(10));
    let text = String::from_utf8_lossy(&output);
    assert!(
        text.contains("MONO_E2E_MARKER"),
        "expected marker in session output, got: {text}"
    );

    server.stop();
}

#[test]
fn session_environment_carries_handover_variables() {
    let server = TestServer::start();
    let (mut control, mut data) = establish(&server);

    assert!(make_session(&mut control, "envy").success);
    send(&mut control, &AttachRequestMsg { name: "envy".into() });
    let attach: AttachResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert!(attach.success);

    data.write_all(b"echo \"S=$MONOMUX_SESSION\"\n").unwrap();
    let output = read_until(&mut data, b"S=envy", Duration::from_secs(10));
    assert!(
        String::from_utf8_lossy(&output).contains("S=envy"),
        "session name should be in the child's environment"
    );

    server.stop();
}

#[test]
fn child_exit_cascades_session_exit_notice() {
    let server = TestServer::start();
    let (mut control, mut data) = establish(&server);

    assert!(make_session(&mut control, "mortal").success);
    send(
        &mut control,
        &AttachRequestMsg {
            name: "mortal".into(),
        },
    );
    let attach: AttachResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert!(attach.success);

    // Ask the shell to die with a distinctive code.
    data.write_all(b"exit 7\n").unwrap();
    data.flush().unwrap();

    control
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::SessionExit);
    let exit: SessionExitMsg = reply.parse().unwrap();
    assert_eq!(exit.name, "mortal");
    assert_eq!(exit.exit_code, 7);

    // The session is gone from the list afterwards.
    send(&mut control, &SessionListRequestMsg);
    let list: SessionListResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert!(list.sessions.is_empty());

    server.stop();
}

#[test]
fn detach_sends_session_exit_notice_and_keeps_session() {
    let server = TestServer::start();
    let (mut control, _data) = establish(&server);

    assert!(make_session(&mut control, "keeper").success);
    send(
        &mut control,
        &AttachRequestMsg {
            name: "keeper".into(),
        },
    );
    let attach: AttachResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert!(attach.success);

    send(
        &mut control,
        &DetachMsg {
            scope: DetachScope::Own,
        },
    );
    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::SessionExit);
    let exit: SessionExitMsg = reply.parse().unwrap();
    assert_eq!(exit.name, "keeper");
    assert_eq!(exit.exit_code, 0);

    // The session survives the detach.
    send(&mut control, &SessionListRequestMsg);
    let list: SessionListResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert_eq!(list.sessions.len(), 1);
    assert!(!list.sessions[0].dead);

    server.stop();
}

#[test]
fn window_size_and_signal_are_accepted() {
    let server = TestServer::start();
    let (mut control, _data) = establish(&server);

    assert!(make_session(&mut control, "sized").success);
    send(
        &mut control,
        &AttachRequestMsg {
            name: "sized".into(),
        },
    );
    let attach: AttachResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert!(attach.success);

    // Fire-and-forget messages; degenerate sizes are ignored server-side.
    send(&mut control, &WindowSizeMsg { rows: 50, cols: 160 });
    send(&mut control, &WindowSizeMsg { rows: 0, cols: 160 });
    send(&mut control, &SignalMsg { signal: libc::SIGWINCH });

    // The connection is still healthy afterwards.
    send(&mut control, &SessionListRequestMsg);
    let list: SessionListResponseMsg = recv_frame(&mut control).parse().unwrap();
    assert_eq!(list.sessions.len(), 1);

    server.stop();
}

#[test]
fn second_client_shares_session_output() {
    let server = TestServer::start();

    // First client creates and attaches.
    let (mut control1, mut data1) = establish(&server);
    assert!(make_session(&mut control1, "shared").success);
    send(
        &mut control1,
        &AttachRequestMsg {
            name: "shared".into(),
        },
    );
    let attach: AttachResponseMsg = recv_frame(&mut control1).parse().unwrap();
    assert!(attach.success);

    // Second client attaches to the same session.
    let (mut control2, mut data2) = establish(&server);
    send(
        &mut control2,
        &AttachRequestMsg {
            name: "shared".into(),
        },
    );
    let attach: AttachResponseMsg = recv_frame(&mut control2).parse().unwrap();
    assert!(attach.success);

    // Input from the first client is seen by both.
    data1.write_all(b"echo MONO_SHARED_OUT\n").unwrap();
    let seen1 = read_until(&mut data1, b"MONO_SHARED_OUT", Duration::from_secs(10));
    let seen2 = read_until(&mut data2, b"MONO_SHARED_OUT", Duration::from_secs(10));
    assert!(String::from_utf8_lossy(&seen1).contains("MONO_SHARED_OUT"));
    assert!(String::from_utf8_lossy(&seen2).contains("MONO_SHARED_OUT"));

    server.stop();
}

#[test]
fn high_level_client_session_flow() {
    let server = TestServer::start();

    let mut client = Client::connect(&server.socket_path).unwrap();
    let resp = client
        .make_session(&MakeSessionRequestMsg {
            name: "hl".into(),
            program: "/bin/sh".into(),
            ..Default::default()
        })
        .unwrap();
    assert!(resp.success);

    let attach = client.attach("hl").unwrap();
    assert!(attach.success);
    client.window_size(24, 80).unwrap();

    let sessions = client.list_sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].name, "hl");

    server.stop();
}
