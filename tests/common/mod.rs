//! Shared helpers for the end-to-end tests: a real server on a temporary
//! socket, driven by raw `UnixStream` clients.

use monomux::protocol::{ClientIdMsg, Frame, Payload};
use monomux::signals::InterruptHandle;
use monomux::{Server, ServerOptions};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestServer {
    pub socket_path: PathBuf,
    pub interrupt: InterruptHandle,
    join: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Start a server on a socket under a fresh temporary directory. The
    /// TempDir is leaked so the socket outlives the helper scope.
    pub fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("test.sock");
        std::mem::forget(dir);

        let opts = ServerOptions {
            socket_path: socket_path.clone(),
            exit_on_last_session_terminate: false,
        };
        let mut server = Server::bind(&opts).unwrap();
        let interrupt = server.interrupt_handle();

        let join = std::thread::spawn(move || {
            if let Err(e) = server.run() {
                eprintln!("test server loop failed: {e}");
            }
            server.shutdown();
        });

        assert!(
            monomux::socket::wait_until_ready(&socket_path, Duration::from_secs(5)),
            "server socket should become ready"
        );
        Self {
            socket_path,
            interrupt,
            join: Some(join),
        }
    }

    pub fn stop(mut self) {
        self.interrupt.interrupt();
        if let Some(join) = self.join.take() {
            join.join().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.interrupt.interrupt();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Open a raw control connection and read the server's greeting.
pub fn connect_control(server: &TestServer) -> (UnixStream, ClientIdMsg) {
    let mut stream = UnixStream::connect(&server.socket_path).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let greeting: ClientIdMsg = Frame::read_from(&mut stream).unwrap().parse().unwrap();
    (stream, greeting)
}

/// Send one typed message on a raw stream.
pub fn send<T: Payload>(stream: &mut UnixStream, msg: &T) {
    Frame::from_msg(msg).write_to(stream).unwrap();
}

/// Read the next frame, panicking on timeout or close.
pub fn recv_frame(stream: &mut UnixStream) -> Frame {
    Frame::read_from(stream).unwrap()
}
