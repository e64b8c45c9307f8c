//! monomux - terminal session multiplexer.
//!
//! A user-space daemon that hosts long-lived PTY sessions and lets
//! lightweight clients attach to, detach from, and exchange bytes with
//! those sessions over a local Unix socket. No terminal emulation happens
//! anywhere: bytes between a session's PTY and its attached clients are
//! forwarded verbatim.
//!
//! The server is a single-threaded, poll-driven event loop
//! ([`server::Server`]); the client ([`client::Client`]) is a thin
//! collaborator speaking the framed wire protocol ([`protocol`]).

pub mod channel;
pub mod client;
pub mod poller;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod signals;
pub mod socket;
pub mod terminal;

pub use server::{run_server, Server, ServerOptions};
