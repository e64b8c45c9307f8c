//! End-to-end tests for the two-socket handshake against a real server.

mod common;

use common::{connect_control, recv_frame, send, TestServer};
use monomux::protocol::*;
use std::io::Write;
use std::time::Duration;

#[test]
fn handshake_assigns_identity_and_promotes_data_channel() {
    let server = TestServer::start();

    let (_control, greeting) = connect_control(&server);
    assert!(greeting.client_id >= 1);
    assert_ne!(greeting.nonce, 0, "nonce should be random, zero is suspicious");

    // Second connection presents the nonce and becomes the data channel.
    let (mut data, _their_greeting) = connect_control(&server);
    send(
        &mut data,
        &DataHandshakeMsg {
            client_id: greeting.client_id,
            nonce: greeting.nonce,
        },
    );
    let reply = recv_frame(&mut data);
    assert_eq!(reply.kind, MessageKind::DataHandshakeAck);

    server.stop();
}

#[test]
fn distinct_clients_get_distinct_ids_and_nonces() {
    let server = TestServer::start();

    let (_c1, g1) = connect_control(&server);
    let (_c2, g2) = connect_control(&server);
    assert_ne!(g1.client_id, g2.client_id);
    assert_ne!(g1.nonce, g2.nonce);

    server.stop();
}

#[test]
fn wrong_nonce_rejected_stranger_only() {
    let server = TestServer::start();

    let (mut control, greeting) = connect_control(&server);

    // A stranger guesses the id but not the nonce.
    let (mut stranger, _g) = connect_control(&server);
    send(
        &mut stranger,
        &DataHandshakeMsg {
            client_id: greeting.client_id,
            nonce: 0xDEAD_BEEF,
        },
    );
    let reply = recv_frame(&mut stranger);
    assert_eq!(reply.kind, MessageKind::Reject);
    let reject: RejectMsg = reply.parse().unwrap();
    assert!(reject.reason.contains("nonce"), "reason was: {}", reject.reason);

    // The legitimate control client still answers informational requests.
    send(&mut control, &SessionListRequestMsg);
    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::SessionListResponse);

    server.stop();
}

#[test]
fn nonce_is_single_use_even_for_its_owner() {
    let server = TestServer::start();

    let (_control, greeting) = connect_control(&server);

    // The nonce is consumed by the first (failed) check...
    let (mut first, _g) = connect_control(&server);
    send(
        &mut first,
        &DataHandshakeMsg {
            client_id: greeting.client_id,
            nonce: greeting.nonce.wrapping_add(1),
        },
    );
    assert_eq!(recv_frame(&mut first).kind, MessageKind::Reject);

    // ...so even the real value no longer works.
    let (mut second, _g) = connect_control(&server);
    send(
        &mut second,
        &DataHandshakeMsg {
            client_id: greeting.client_id,
            nonce: greeting.nonce,
        },
    );
    assert_eq!(recv_frame(&mut second).kind, MessageKind::Reject);

    server.stop();
}

#[test]
fn unknown_client_id_is_rejected() {
    let server = TestServer::start();

    let (mut stream, greeting) = connect_control(&server);
    send(
        &mut stream,
        &DataHandshakeMsg {
            client_id: greeting.client_id + 1000,
            nonce: greeting.nonce,
        },
    );
    assert_eq!(recv_frame(&mut stream).kind, MessageKind::Reject);

    server.stop();
}

#[test]
fn informational_requests_work_before_handshake() {
    let server = TestServer::start();

    let (mut control, _greeting) = connect_control(&server);

    send(&mut control, &SessionListRequestMsg);
    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::SessionListResponse);
    let list: SessionListResponseMsg = reply.parse().unwrap();
    assert!(list.sessions.is_empty());

    send(&mut control, &StatisticsRequestMsg);
    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::StatisticsResponse);
    let stats: StatisticsResponseMsg = reply.parse().unwrap();
    assert!(stats.text.contains("monomux server statistics"));

    server.stop();
}

#[test]
fn attach_before_handshake_is_rejected() {
    let server = TestServer::start();

    let (mut control, _greeting) = connect_control(&server);
    send(
        &mut control,
        &AttachRequestMsg {
            name: "whatever".into(),
        },
    );
    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::Reject);

    server.stop();
}

#[test]
fn zero_length_frame_is_a_protocol_error() {
    let server = TestServer::start();

    let (mut control, _greeting) = connect_control(&server);
    control.write_all(&[0, 0, 0, 0]).unwrap();
    control.flush().unwrap();

    // The server answers with a Reject and then disconnects.
    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::Reject);

    server.stop();
}

#[test]
fn version_mismatch_is_rejected() {
    let server = TestServer::start();

    let (mut control, _greeting) = connect_control(&server);
    let mut wire = Frame::from_msg(&SessionListRequestMsg).encode().to_vec();
    wire[6] = 99; // version byte
    control.write_all(&wire).unwrap();
    control.flush().unwrap();

    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::Reject);

    server.stop();
}

#[test]
fn server_exit_notice_on_shutdown() {
    let server = TestServer::start();

    let (mut control, _greeting) = connect_control(&server);
    control
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    server.interrupt.interrupt();

    let reply = recv_frame(&mut control);
    assert_eq!(reply.kind, MessageKind::ServerExit);
    let exit: ServerExitMsg = reply.parse().unwrap();
    assert!(!exit.reason.is_empty());
}

#[test]
fn socket_file_removed_on_shutdown() {
    let server = TestServer::start();
    let path = server.socket_path.clone();
    assert!(path.exists());
    server.stop();
    assert!(!path.exists(), "socket file should be unlinked on shutdown");
}

#[test]
fn high_level_client_full_connect() {
    let server = TestServer::start();

    let mut client = monomux::client::Client::connect(&server.socket_path).unwrap();
    let sessions = client.list_sessions().unwrap();
    assert!(sessions.is_empty());
    let stats = client.statistics().unwrap();
    assert!(stats.contains("connected clients"));

    server.stop();
}
