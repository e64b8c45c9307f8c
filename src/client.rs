//! Client-side collaborator: connects to a server, completes the
//! two-socket handshake, issues control requests, and pumps raw bytes
//! between the local terminal and the attached session.
//!
//! The client never interprets terminal bytes; everything between the
//! session's PTY and the local terminal is forwarded verbatim.

use crate::poller::Poller;
use crate::protocol::{
    AttachRequestMsg, AttachResponseMsg, ClientIdMsg, DataHandshakeAckMsg, DataHandshakeMsg,
    DetachMsg, DetachScope, Frame, MakeSessionRequestMsg, MakeSessionResponseMsg, MessageKind,
    Payload, ProtocolError, RejectMsg, ServerExitMsg, SessionEntry, SessionExitMsg,
    SessionListRequestMsg, SessionListResponseMsg, SignalMsg, StatisticsRequestMsg,
    StatisticsResponseMsg, WindowSizeMsg,
};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("server rejected the request: {0}")]
    Rejected(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("server went away: {0}")]
    ServerExit(String),
}

/// Why [`Client::pump`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The attached session ended (or this client was detached).
    SessionExit { name: String, exit_code: i32 },
    /// The server is shutting down.
    ServerExit { reason: String },
    /// The server kicked us.
    Rejected { reason: String },
    /// The data stream closed without a notice.
    Disconnected,
}

/// A connected monomux client.
///
/// The control stream carries frames; after the handshake the data stream
/// carries nothing but session bytes.
pub struct Client {
    control: UnixStream,
    data: Option<UnixStream>,
    id: u64,
    /// Notifications that arrived while waiting for a response.
    pending: VecDeque<Frame>,
}

impl Client {
    /// Connect the control stream only. The server greets the connection
    /// with its identity; informational requests work in this state.
    pub fn connect_control(path: &Path) -> Result<Self, ClientError> {
        let mut control = UnixStream::connect(path)?;
        let greeting: ClientIdMsg = Frame::read_from(&mut control)?.parse()?;
        tracing::debug!(id = greeting.client_id, "control connection established");
        Ok(Self {
            control,
            data: None,
            id: greeting.client_id,
            pending: VecDeque::new(),
        })
    }

    /// Full connect: control stream, then a second stream promoted to the
    /// data channel by presenting the greeting's single-use nonce.
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let mut control = UnixStream::connect(path)?;
        let greeting: ClientIdMsg = Frame::read_from(&mut control)?.parse()?;

        let mut data = UnixStream::connect(path)?;
        // The second connection is greeted as well; skip that identity.
        let _their_greeting: ClientIdMsg = Frame::read_from(&mut data)?.parse()?;

        Frame::from_msg(&DataHandshakeMsg {
            client_id: greeting.client_id,
            nonce: greeting.nonce,
        })
        .write_to(&mut data)?;

        let reply = Frame::read_from(&mut data)?;
        match reply.kind {
            MessageKind::DataHandshakeAck => {
                let _: DataHandshakeAckMsg = reply.parse()?;
            }
            MessageKind::Reject => {
                let reject: RejectMsg = reply.parse()?;
                return Err(ClientError::Handshake(reject.reason));
            }
            other => {
                return Err(ClientError::Handshake(format!(
                    "unexpected reply of kind {other:?}"
                )));
            }
        }

        tracing::debug!(id = greeting.client_id, "data channel established");
        Ok(Self {
            control,
            data: Some(data),
            id: greeting.client_id,
            pending: VecDeque::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send a request and wait for its typed response. Notifications that
    /// arrive in between are queued; a `Reject` fails the request.
    fn request<Req: Payload, Resp: Payload>(&mut self, req: &Req) -> Result<Resp, ClientError> {
        Frame::from_msg(req).write_to(&mut self.control)?;
        loop {
            let frame = Frame::read_from(&mut self.control)?;
            if frame.kind == Resp::KIND {
                return Ok(frame.parse()?);
            }
            match frame.kind {
                MessageKind::Reject => {
                    let reject: RejectMsg = frame.parse()?;
                    return Err(ClientError::Rejected(reject.reason));
                }
                MessageKind::ServerExit => {
                    let exit: ServerExitMsg = frame.parse()?;
                    return Err(ClientError::ServerExit(exit.reason));
                }
                MessageKind::SessionExit => self.pending.push_back(frame),
                other => {
                    tracing::debug!(kind = ?other, "ignoring unexpected frame");
                }
            }
        }
    }

    pub fn list_sessions(&mut self) -> Result<Vec<SessionEntry>, ClientError> {
        let resp: SessionListResponseMsg = self.request(&SessionListRequestMsg)?;
        Ok(resp.sessions)
    }

    pub fn make_session(
        &mut self,
        req: &MakeSessionRequestMsg,
    ) -> Result<MakeSessionResponseMsg, ClientError> {
        self.request(req)
    }

    pub fn attach(&mut self, name: &str) -> Result<AttachResponseMsg, ClientError> {
        self.request(&AttachRequestMsg {
            name: name.to_string(),
        })
    }

    pub fn detach(&mut self, scope: DetachScope) -> Result<(), ClientError> {
        Frame::from_msg(&DetachMsg { scope }).write_to(&mut self.control)?;
        Ok(())
    }

    pub fn signal(&mut self, signal: i32) -> Result<(), ClientError> {
        Frame::from_msg(&SignalMsg { signal }).write_to(&mut self.control)?;
        Ok(())
    }

    pub fn window_size(&mut self, rows: u16, cols: u16) -> Result<(), ClientError> {
        Frame::from_msg(&WindowSizeMsg { rows, cols }).write_to(&mut self.control)?;
        Ok(())
    }

    pub fn statistics(&mut self) -> Result<String, ClientError> {
        let resp: StatisticsResponseMsg = self.request(&StatisticsRequestMsg)?;
        Ok(resp.text)
    }

    /// Relay bytes between the local terminal and the attached session
    /// until the session ends, the server exits, or the streams close.
    ///
    /// stdin goes verbatim to the data stream; data-stream bytes go
    /// verbatim to stdout. Control frames interleave only lifecycle
    /// notices. Terminal resizes (SIGWINCH) are forwarded as
    /// `WindowSize` messages.
    pub fn pump(&mut self) -> Result<PumpOutcome, ClientError> {
        // A queued notice may already have ended the session.
        while let Some(frame) = self.pending.pop_front() {
            if let Some(outcome) = notice_to_outcome(&frame)? {
                return Ok(outcome);
            }
        }

        let Some(data) = self.data.as_mut() else {
            return Err(ClientError::Handshake(
                "pump requires an established data channel".into(),
            ));
        };

        static WINCH: AtomicBool = AtomicBool::new(false);
        let winch_id =
            unsafe { signal_hook_registry::register(libc::SIGWINCH, || WINCH.store(true, Ordering::Release)) }?;

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        let stdin_fd = stdin.as_raw_fd();
        let data_fd = data.as_raw_fd();
        let control_fd = self.control.as_raw_fd();

        let mut poller = Poller::new(16)?;
        poller.listen(stdin_fd, true, false)?;
        poller.listen(data_fd, true, false)?;
        poller.listen(control_fd, true, false)?;

        let mut stdin_handle = stdin.lock();
        let mut buf = [0u8; 16 * 1024];
        let outcome = loop {
            if WINCH.swap(false, Ordering::AcqRel) {
                if let Ok((rows, cols)) = crate::terminal::terminal_size() {
                    Frame::from_msg(&WindowSizeMsg { rows, cols }).write_to(&mut self.control)?;
                }
            }

            let events = poller.wait(Duration::from_millis(500))?;
            let mut finished = None;
            for event in &events {
                if event.fd == stdin_fd && event.readable {
                    match stdin_handle.read(&mut buf) {
                        Ok(0) => {
                            // Local input gone; ask to be detached and let
                            // the server's notice end the pump.
                            Frame::from_msg(&DetachMsg {
                                scope: DetachScope::Own,
                            })
                            .write_to(&mut self.control)?;
                            poller.stop(stdin_fd);
                        }
                        Ok(n) => data.write_all(&buf[..n])?,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                } else if event.fd == data_fd && event.readable {
                    match data.read(&mut buf) {
                        Ok(0) => {
                            finished = Some(PumpOutcome::Disconnected);
                        }
                        Ok(n) => {
                            stdout.write_all(&buf[..n])?;
                            stdout.flush()?;
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e.into()),
                    }
                } else if event.fd == control_fd && event.readable {
                    let frame = Frame::read_from(&mut self.control)?;
                    if let Some(o) = notice_to_outcome(&frame)? {
                        finished = Some(o);
                    }
                }
            }
            if let Some(outcome) = finished {
                break outcome;
            }
        };

        signal_hook_registry::unregister(winch_id);
        tracing::debug!(?outcome, "pump finished");
        Ok(outcome)
    }
}

fn notice_to_outcome(frame: &Frame) -> Result<Option<PumpOutcome>, ClientError> {
    match frame.kind {
        MessageKind::SessionExit => {
            let exit: SessionExitMsg = frame.parse()?;
            Ok(Some(PumpOutcome::SessionExit {
                name: exit.name,
                exit_code: exit.exit_code,
            }))
        }
        MessageKind::ServerExit => {
            let exit: ServerExitMsg = frame.parse()?;
            Ok(Some(PumpOutcome::ServerExit {
                reason: exit.reason,
            }))
        }
        MessageKind::Reject => {
            let reject: RejectMsg = frame.parse()?;
            Ok(Some(PumpOutcome::Rejected {
                reason: reject.reason,
            }))
        }
        _ => Ok(None),
    }
}
