//! Wire protocol for monomux client/server communication.
//!
//! Wire format: `[length: u32 big-endian][kind: u16][version: u8][reserved: u8][payload]`
//!
//! The length counts everything after itself, so a frame occupies
//! `4 + length` bytes on the wire. Payloads are a self-describing key/value
//! map: a `u32` entry count followed by `(key, value)` pairs, where keys are
//! length-prefixed strings and values carry a one-byte type tag. Unknown
//! fields inside a known message are skipped; unknown message kinds are
//! consumed and dropped by the receiver.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum frame payload size (16 MiB). Prevents OOM on malformed data.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame too short")]
    Truncated,

    #[error("zero-length frame")]
    EmptyFrame,

    #[error("frame payload too large: {0} bytes")]
    Oversized(u32),

    #[error("protocol version mismatch: got {0}, expected {PROTOCOL_VERSION}")]
    VersionMismatch(u8),

    #[error("unknown message kind: {0}")]
    UnknownKind(u16),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("field {0} has the wrong type")]
    WrongFieldType(&'static str),

    #[error("malformed payload")]
    Malformed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Message kind tag values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageKind {
    // Handshake (server-initiated identification, then data-channel promotion)
    ClientId = 0x01,
    DataHandshake = 0x02,
    DataHandshakeAck = 0x03,

    // Session management
    SessionListRequest = 0x04,
    SessionListResponse = 0x05,
    MakeSessionRequest = 0x06,
    MakeSessionResponse = 0x07,
    AttachRequest = 0x08,
    AttachResponse = 0x09,
    Detach = 0x0A,

    // Server-pushed lifecycle notices
    SessionExit = 0x0B,
    ServerExit = 0x0C,

    // In-session control
    Signal = 0x0D,
    WindowSize = 0x0E,

    // Diagnostics
    StatisticsRequest = 0x0F,
    StatisticsResponse = 0x10,

    // Errors
    Reject = 0x11,
}

impl MessageKind {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x01 => Some(Self::ClientId),
            0x02 => Some(Self::DataHandshake),
            0x03 => Some(Self::DataHandshakeAck),
            0x04 => Some(Self::SessionListRequest),
            0x05 => Some(Self::SessionListResponse),
            0x06 => Some(Self::MakeSessionRequest),
            0x07 => Some(Self::MakeSessionResponse),
            0x08 => Some(Self::AttachRequest),
            0x09 => Some(Self::AttachResponse),
            0x0A => Some(Self::Detach),
            0x0B => Some(Self::SessionExit),
            0x0C => Some(Self::ServerExit),
            0x0D => Some(Self::Signal),
            0x0E => Some(Self::WindowSize),
            0x0F => Some(Self::StatisticsRequest),
            0x10 => Some(Self::StatisticsResponse),
            0x11 => Some(Self::Reject),
            _ => None,
        }
    }
}

// ── Self-describing values ─────────────────────────────────────────

const TAG_U64: u8 = 0x01;
const TAG_STR: u8 = 0x02;
const TAG_LIST: u8 = 0x03;
const TAG_MAP: u8 = 0x04;

/// A tagged payload value. Integers are transmitted big-endian; strings,
/// lists, and maps are length-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U64(u64),
    Str(String),
    List(Vec<Value>),
    Map(FieldMap),
}

impl Value {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::U64(n) => {
                buf.put_u8(TAG_U64);
                buf.put_u64(*n);
            }
            Value::Str(s) => {
                buf.put_u8(TAG_STR);
                buf.put_u32(s.len() as u32);
                buf.put(s.as_bytes());
            }
            Value::List(items) => {
                buf.put_u8(TAG_LIST);
                buf.put_u32(items.len() as u32);
                for item in items {
                    item.encode(buf);
                }
            }
            Value::Map(fields) => {
                buf.put_u8(TAG_MAP);
                fields.encode(buf);
            }
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        if buf.remaining() < 1 {
            return Err(ProtocolError::Malformed);
        }
        match buf.get_u8() {
            TAG_U64 => {
                if buf.remaining() < 8 {
                    return Err(ProtocolError::Malformed);
                }
                Ok(Value::U64(buf.get_u64()))
            }
            TAG_STR => Ok(Value::Str(decode_string(buf)?)),
            TAG_LIST => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::Malformed);
                }
                let count = buf.get_u32() as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(Value::decode(buf)?);
                }
                Ok(Value::List(items))
            }
            TAG_MAP => Ok(Value::Map(FieldMap::decode(buf)?)),
            _ => Err(ProtocolError::Malformed),
        }
    }
}

fn decode_string(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Malformed);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Malformed);
    }
    let s = String::from_utf8(buf[..len].to_vec()).map_err(|_| ProtocolError::Malformed)?;
    buf.advance(len);
    Ok(s)
}

/// An ordered key/value map forming a message payload (or a nested value).
///
/// Lookup is linear; payloads are small. Duplicate keys keep the first
/// occurrence, unknown keys are simply never looked up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap(Vec<(String, Value)>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &str, value: Value) -> &mut Self {
        self.0.push((key.to_string(), value));
        self
    }

    pub fn put_u64(&mut self, key: &str, value: u64) -> &mut Self {
        self.put(key, Value::U64(value))
    }

    pub fn put_str(&mut self, key: &str, value: &str) -> &mut Self {
        self.put(key, Value::Str(value.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn u64(&self, key: &'static str) -> Result<u64, ProtocolError> {
        match self.get(key) {
            Some(Value::U64(n)) => Ok(*n),
            Some(_) => Err(ProtocolError::WrongFieldType(key)),
            None => Err(ProtocolError::MissingField(key)),
        }
    }

    pub fn str(&self, key: &'static str) -> Result<&str, ProtocolError> {
        match self.get(key) {
            Some(Value::Str(s)) => Ok(s),
            Some(_) => Err(ProtocolError::WrongFieldType(key)),
            None => Err(ProtocolError::MissingField(key)),
        }
    }

    pub fn list(&self, key: &'static str) -> Result<&[Value], ProtocolError> {
        match self.get(key) {
            Some(Value::List(items)) => Ok(items),
            Some(_) => Err(ProtocolError::WrongFieldType(key)),
            None => Err(ProtocolError::MissingField(key)),
        }
    }

    fn entries(&self) -> &[(String, Value)] {
        &self.0
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.0.len() as u32);
        for (key, value) in &self.0 {
            buf.put_u32(key.len() as u32);
            buf.put(key.as_bytes());
            value.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, ProtocolError> {
        if buf.remaining() < 4 {
            return Err(ProtocolError::Malformed);
        }
        let count = buf.get_u32() as usize;
        let mut fields = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let key = decode_string(buf)?;
            let value = Value::decode(buf)?;
            fields.push((key, value));
        }
        Ok(Self(fields))
    }
}

// ── Frames ─────────────────────────────────────────────────────────

/// A message type that can travel inside a frame payload.
pub trait Payload: Sized {
    const KIND: MessageKind;
    fn encode_fields(&self) -> FieldMap;
    fn decode_fields(fields: &FieldMap) -> Result<Self, ProtocolError>;
}

/// A protocol frame: a kind tag plus its undecoded payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from a typed message.
    pub fn from_msg<T: Payload>(msg: &T) -> Self {
        let mut buf = BytesMut::new();
        msg.encode_fields().encode(&mut buf);
        Self {
            kind: T::KIND,
            payload: buf.freeze(),
        }
    }

    /// Decode the payload as a typed message.
    pub fn parse<T: Payload>(&self) -> Result<T, ProtocolError> {
        if self.kind != T::KIND {
            return Err(ProtocolError::UnknownKind(self.kind as u16));
        }
        let mut slice = self.payload.as_ref();
        let fields = FieldMap::decode(&mut slice)?;
        T::decode_fields(&fields)
    }

    /// Encode this frame, header included, into wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.payload.len());
        buf.put_u32(4 + self.payload.len() as u32);
        buf.put_u16(self.kind as u16);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(0);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    /// Decode a frame from a complete wire buffer, returning the frame and
    /// the number of bytes consumed.
    ///
    /// `Ok(None)` means the wire was well-formed but the kind is unknown to
    /// this build; the caller should skip the reported length and continue.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(ProtocolError::Truncated);
        }
        let length = buf.get_u32();
        if length < 4 {
            return Err(ProtocolError::EmptyFrame);
        }
        if length - 4 > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Oversized(length - 4));
        }
        if buf.remaining() < length as usize {
            return Err(ProtocolError::Truncated);
        }
        let consumed = 4 + length as usize;

        let raw_kind = buf.get_u16();
        let version = buf.get_u8();
        let _reserved = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(version));
        }

        let payload_len = length as usize - 4;
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);

        match MessageKind::from_u16(raw_kind) {
            Some(kind) => Ok(Some((Self { kind, payload }, consumed))),
            None => {
                tracing::warn!(kind = raw_kind, "dropping frame of unknown kind");
                Ok(None)
            }
        }
    }

    /// Total wire size of the frame starting at `data`, if the length prefix
    /// is complete. Used by buffered readers to wait for whole frames.
    pub fn wire_len(data: &[u8]) -> Option<usize> {
        if data.len() < 4 {
            return None;
        }
        let mut buf = data;
        Some(4 + buf.get_u32() as usize)
    }

    /// Write this frame to a blocking writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())?;
        writer.flush()
    }

    /// Read one frame from a blocking reader. Frames of unknown kind are
    /// skipped and the next frame is returned.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        loop {
            let mut header = [0u8; 4];
            reader.read_exact(&mut header)?;
            let length = u32::from_be_bytes(header);
            if length < 4 {
                return Err(ProtocolError::EmptyFrame);
            }
            if length - 4 > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::Oversized(length - 4));
            }
            let mut rest = vec![0u8; length as usize];
            reader.read_exact(&mut rest)?;

            let mut full = Vec::with_capacity(4 + rest.len());
            full.extend_from_slice(&header);
            full.extend_from_slice(&rest);
            match Self::decode(&full)? {
                Some((frame, _)) => return Ok(frame),
                None => continue,
            }
        }
    }
}

// ── Message types ──────────────────────────────────────────────────

/// Server → Client: identity assignment, sent unprompted on accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdMsg {
    pub client_id: u64,
    /// Single-use token for promoting a second connection to the data channel.
    pub nonce: u64,
}

impl Payload for ClientIdMsg {
    const KIND: MessageKind = MessageKind::ClientId;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_u64("client_id", self.client_id).put_u64("nonce", self.nonce);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            client_id: f.u64("client_id")?,
            nonce: f.u64("nonce")?,
        })
    }
}

/// Client → Server: presented on a second connection to claim it as the
/// data channel of the identified control client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHandshakeMsg {
    pub client_id: u64,
    pub nonce: u64,
}

impl Payload for DataHandshakeMsg {
    const KIND: MessageKind = MessageKind::DataHandshake;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_u64("client_id", self.client_id).put_u64("nonce", self.nonce);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            client_id: f.u64("client_id")?,
            nonce: f.u64("nonce")?,
        })
    }
}

/// Server → Client: the data-channel promotion succeeded. Sent on the newly
/// promoted data channel as its last control frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataHandshakeAckMsg;

impl Payload for DataHandshakeAckMsg {
    const KIND: MessageKind = MessageKind::DataHandshakeAck;

    fn encode_fields(&self) -> FieldMap {
        FieldMap::new()
    }

    fn decode_fields(_f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionListRequestMsg;

impl Payload for SessionListRequestMsg {
    const KIND: MessageKind = MessageKind::SessionListRequest;

    fn encode_fields(&self) -> FieldMap {
        FieldMap::new()
    }

    fn decode_fields(_f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

/// One session as reported in a list response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub name: String,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
    /// The child has exited but the session is still draining.
    pub dead: bool,
}

impl SessionEntry {
    fn to_value(&self) -> Value {
        let mut f = FieldMap::new();
        f.put_str("name", &self.name)
            .put_u64("created_at", self.created_at)
            .put_u64("dead", self.dead as u64);
        Value::Map(f)
    }

    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let Value::Map(f) = value else {
            return Err(ProtocolError::Malformed);
        };
        Ok(Self {
            name: f.str("name")?.to_string(),
            created_at: f.u64("created_at")?,
            dead: f.u64("dead").unwrap_or(0) != 0,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionListResponseMsg {
    pub sessions: Vec<SessionEntry>,
}

impl Payload for SessionListResponseMsg {
    const KIND: MessageKind = MessageKind::SessionListResponse;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put(
            "sessions",
            Value::List(self.sessions.iter().map(SessionEntry::to_value).collect()),
        );
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        let sessions = f
            .list("sessions")?
            .iter()
            .map(SessionEntry::from_value)
            .collect::<Result<_, _>>()?;
        Ok(Self { sessions })
    }
}

/// Client → Server: spawn a new session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MakeSessionRequestMsg {
    /// Requested name; empty lets the server pick a numeric one. The
    /// response carries the final name.
    pub name: String,
    /// Program to execute; empty means the server-side default shell.
    pub program: String,
    pub argv: Vec<String>,
    pub env_set: Vec<(String, String)>,
    pub env_unset: Vec<String>,
}

impl Payload for MakeSessionRequestMsg {
    const KIND: MessageKind = MessageKind::MakeSessionRequest;

    fn encode_fields(&self) -> FieldMap {
        let mut env = FieldMap::new();
        for (key, value) in &self.env_set {
            env.put_str(key, value);
        }
        let mut f = FieldMap::new();
        f.put_str("name", &self.name)
            .put_str("program", &self.program)
            .put(
                "argv",
                Value::List(self.argv.iter().map(|a| Value::Str(a.clone())).collect()),
            )
            .put("env_set", Value::Map(env))
            .put(
                "env_unset",
                Value::List(self.env_unset.iter().map(|k| Value::Str(k.clone())).collect()),
            );
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        let argv = f
            .list("argv")?
            .iter()
            .map(|v| match v {
                Value::Str(s) => Ok(s.clone()),
                _ => Err(ProtocolError::Malformed),
            })
            .collect::<Result<_, _>>()?;
        let env_set = match f.get("env_set") {
            Some(Value::Map(env)) => env
                .entries()
                .iter()
                .map(|(k, v)| match v {
                    Value::Str(s) => Ok((k.clone(), s.clone())),
                    _ => Err(ProtocolError::Malformed),
                })
                .collect::<Result<_, _>>()?,
            _ => Vec::new(),
        };
        let env_unset = match f.get("env_unset") {
            Some(Value::List(items)) => items
                .iter()
                .map(|v| match v {
                    Value::Str(s) => Ok(s.clone()),
                    _ => Err(ProtocolError::Malformed),
                })
                .collect::<Result<_, _>>()?,
            _ => Vec::new(),
        };
        Ok(Self {
            name: f.str("name")?.to_string(),
            program: f.str("program")?.to_string(),
            argv,
            env_set,
            env_unset,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MakeSessionResponseMsg {
    pub success: bool,
    /// The final session name; may differ from the requested one.
    pub name: String,
    pub error: String,
}

impl Payload for MakeSessionResponseMsg {
    const KIND: MessageKind = MessageKind::MakeSessionResponse;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_u64("success", self.success as u64)
            .put_str("name", &self.name)
            .put_str("error", &self.error);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            success: f.u64("success")? != 0,
            name: f.str("name")?.to_string(),
            error: f.str("error").unwrap_or_default().to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachRequestMsg {
    pub name: String,
}

impl Payload for AttachRequestMsg {
    const KIND: MessageKind = MessageKind::AttachRequest;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_str("name", &self.name);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: f.str("name")?.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachResponseMsg {
    pub success: bool,
    pub name: String,
    pub created_at: u64,
    pub error: String,
}

impl Payload for AttachResponseMsg {
    const KIND: MessageKind = MessageKind::AttachResponse;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_u64("success", self.success as u64)
            .put_str("name", &self.name)
            .put_u64("created_at", self.created_at)
            .put_str("error", &self.error);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            success: f.u64("success")? != 0,
            name: f.str("name")?.to_string(),
            created_at: f.u64("created_at").unwrap_or(0),
            error: f.str("error").unwrap_or_default().to_string(),
        })
    }
}

/// Which clients a detach request applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DetachScope {
    /// Only the requesting client.
    #[default]
    Own,
    /// Every client attached to the requester's session.
    AllOfSession,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetachMsg {
    pub scope: DetachScope,
}

impl Payload for DetachMsg {
    const KIND: MessageKind = MessageKind::Detach;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_u64(
            "scope",
            match self.scope {
                DetachScope::Own => 0,
                DetachScope::AllOfSession => 1,
            },
        );
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            scope: match f.u64("scope")? {
                0 => DetachScope::Own,
                _ => DetachScope::AllOfSession,
            },
        })
    }
}

/// Server → Client: the attached session's child exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionExitMsg {
    pub name: String,
    pub exit_code: i32,
}

impl Payload for SessionExitMsg {
    const KIND: MessageKind = MessageKind::SessionExit;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_str("name", &self.name)
            .put_u64("exit_code", self.exit_code as u32 as u64);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: f.str("name")?.to_string(),
            exit_code: f.u64("exit_code")? as u32 as i32,
        })
    }
}

/// Server → Client: the server is going away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerExitMsg {
    pub reason: String,
}

impl Payload for ServerExitMsg {
    const KIND: MessageKind = MessageKind::ServerExit;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_str("reason", &self.reason);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            reason: f.str("reason").unwrap_or_default().to_string(),
        })
    }
}

/// Client → Server: deliver a signal to the attached session's child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalMsg {
    pub signal: i32,
}

impl Payload for SignalMsg {
    const KIND: MessageKind = MessageKind::Signal;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_u64("signal", self.signal as u32 as u64);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            signal: f.u64("signal")? as u32 as i32,
        })
    }
}

/// Client → Server: the client terminal was resized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowSizeMsg {
    pub rows: u16,
    pub cols: u16,
}

impl Payload for WindowSizeMsg {
    const KIND: MessageKind = MessageKind::WindowSize;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_u64("rows", self.rows as u64).put_u64("cols", self.cols as u64);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            rows: f.u64("rows")? as u16,
            cols: f.u64("cols")? as u16,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticsRequestMsg;

impl Payload for StatisticsRequestMsg {
    const KIND: MessageKind = MessageKind::StatisticsRequest;

    fn encode_fields(&self) -> FieldMap {
        FieldMap::new()
    }

    fn decode_fields(_f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

/// Server → Client: human-readable state dump. Not machine-parseable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticsResponseMsg {
    pub text: String,
}

impl Payload for StatisticsResponseMsg {
    const KIND: MessageKind = MessageKind::StatisticsResponse;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_str("text", &self.text);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            text: f.str("text")?.to_string(),
        })
    }
}

/// Server → Client: the request or connection was refused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RejectMsg {
    pub reason: String,
}

impl Payload for RejectMsg {
    const KIND: MessageKind = MessageKind::Reject;

    fn encode_fields(&self) -> FieldMap {
        let mut f = FieldMap::new();
        f.put_str("reason", &self.reason);
        f
    }

    fn decode_fields(f: &FieldMap) -> Result<Self, ProtocolError> {
        Ok(Self {
            reason: f.str("reason").unwrap_or_default().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Payload + PartialEq + std::fmt::Debug>(msg: T) {
        let frame = Frame::from_msg(&msg);
        let encoded = frame.encode();
        let (decoded, consumed) = Frame::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.kind, T::KIND);
        assert_eq!(decoded.parse::<T>().unwrap(), msg);
    }

    #[test]
    fn kind_round_trip() {
        for raw in 0x01..=0x11u16 {
            let kind = MessageKind::from_u16(raw).unwrap();
            assert_eq!(kind as u16, raw);
        }
        assert!(MessageKind::from_u16(0).is_none());
        assert!(MessageKind::from_u16(0x12).is_none());
        assert!(MessageKind::from_u16(0xFFFF).is_none());
    }

    #[test]
    fn client_id_round_trip() {
        round_trip(ClientIdMsg {
            client_id: 1,
            nonce: 0xA1B2_C3D4_E5F6_0718,
        });
    }

    #[test]
    fn data_handshake_round_trip() {
        round_trip(DataHandshakeMsg {
            client_id: 42,
            nonce: u64::MAX,
        });
        round_trip(DataHandshakeAckMsg);
    }

    #[test]
    fn session_list_round_trip() {
        round_trip(SessionListRequestMsg);
        round_trip(SessionListResponseMsg {
            sessions: vec![
                SessionEntry {
                    name: "main".into(),
                    created_at: 1_700_000_000,
                    dead: false,
                },
                SessionEntry {
                    name: "build".into(),
                    created_at: 1_700_000_100,
                    dead: true,
                },
            ],
        });
        round_trip(SessionListResponseMsg::default());
    }

    #[test]
    fn make_session_round_trip() {
        round_trip(MakeSessionRequestMsg {
            name: "s1".into(),
            program: "/bin/sh".into(),
            argv: vec!["-l".into()],
            env_set: vec![("FOO".into(), "bar".into())],
            env_unset: vec!["TMUX".into()],
        });
        round_trip(MakeSessionResponseMsg {
            success: true,
            name: "s1".into(),
            error: String::new(),
        });
        round_trip(MakeSessionResponseMsg {
            success: false,
            name: "s1".into(),
            error: "session name already exists".into(),
        });
    }

    #[test]
    fn attach_detach_round_trip() {
        round_trip(AttachRequestMsg { name: "s1".into() });
        round_trip(AttachResponseMsg {
            success: true,
            name: "s1".into(),
            created_at: 123,
            error: String::new(),
        });
        round_trip(DetachMsg {
            scope: DetachScope::Own,
        });
        round_trip(DetachMsg {
            scope: DetachScope::AllOfSession,
        });
    }

    #[test]
    fn notification_round_trip() {
        round_trip(SessionExitMsg {
            name: "s1".into(),
            exit_code: 7,
        });
        round_trip(SessionExitMsg {
            name: "s1".into(),
            exit_code: -1,
        });
        round_trip(ServerExitMsg {
            reason: "server shutting down".into(),
        });
        round_trip(RejectMsg {
            reason: "bad nonce".into(),
        });
    }

    #[test]
    fn control_round_trip() {
        round_trip(SignalMsg { signal: 15 });
        round_trip(WindowSizeMsg { rows: 50, cols: 200 });
        round_trip(StatisticsRequestMsg);
        round_trip(StatisticsResponseMsg {
            text: "clients: 0\nsessions: 0\n".into(),
        });
    }

    #[test]
    fn zero_length_frame_rejected() {
        // Length prefix says zero bytes follow, which cannot hold a header.
        let wire = [0u8, 0, 0, 0];
        assert!(matches!(
            Frame::decode(&wire),
            Err(ProtocolError::EmptyFrame)
        ));
    }

    #[test]
    fn truncated_frame_rejected() {
        let frame = Frame::from_msg(&ClientIdMsg {
            client_id: 1,
            nonce: 2,
        });
        let encoded = frame.encode();
        for cut in 0..encoded.len() {
            assert!(
                matches!(
                    Frame::decode(&encoded[..cut]),
                    Err(ProtocolError::Truncated)
                ),
                "cut at {cut} should not decode"
            );
        }
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut wire = Frame::from_msg(&DataHandshakeAckMsg).encode().to_vec();
        wire[6] = 2;
        assert!(matches!(
            Frame::decode(&wire),
            Err(ProtocolError::VersionMismatch(2))
        ));
    }

    #[test]
    fn unknown_kind_dropped() {
        // Valid header with an unassigned kind: decode yields None, not Err.
        let mut buf = BytesMut::new();
        buf.put_u32(8);
        buf.put_u16(0x7777);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(0);
        buf.put_u32(0); // empty field map
        let decoded = Frame::decode(&buf).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn unknown_fields_ignored() {
        // A ClientId payload with an extra field still parses.
        let mut f = FieldMap::new();
        f.put_u64("client_id", 9)
            .put_u64("nonce", 10)
            .put_str("future_extension", "ignored")
            .put("nested", Value::List(vec![Value::U64(1), Value::Str("x".into())]));
        let mut buf = BytesMut::new();
        f.encode(&mut buf);
        let frame = Frame {
            kind: MessageKind::ClientId,
            payload: buf.freeze(),
        };
        let msg: ClientIdMsg = frame.parse().unwrap();
        assert_eq!(msg.client_id, 9);
        assert_eq!(msg.nonce, 10);
    }

    #[test]
    fn missing_field_rejected() {
        let mut f = FieldMap::new();
        f.put_u64("client_id", 9);
        let mut buf = BytesMut::new();
        f.encode(&mut buf);
        let frame = Frame {
            kind: MessageKind::ClientId,
            payload: buf.freeze(),
        };
        assert!(matches!(
            frame.parse::<ClientIdMsg>(),
            Err(ProtocolError::MissingField("nonce"))
        ));
    }

    #[test]
    fn blocking_read_write_round_trip() {
        let frames = vec![
            Frame::from_msg(&SessionListRequestMsg),
            Frame::from_msg(&SignalMsg { signal: 2 }),
            Frame::from_msg(&RejectMsg {
                reason: "nope".into(),
            }),
        ];
        let mut wire = Vec::new();
        for frame in &frames {
            frame.write_to(&mut wire).unwrap();
        }

        let mut cursor = io::Cursor::new(wire);
        for expected in &frames {
            let got = Frame::read_from(&mut cursor).unwrap();
            assert_eq!(got.kind, expected.kind);
            assert_eq!(got.payload, expected.payload);
        }
    }

    #[test]
    fn blocking_read_skips_unknown_kind() {
        let mut wire = Vec::new();
        let mut unknown = BytesMut::new();
        unknown.put_u32(8);
        unknown.put_u16(0x4242);
        unknown.put_u8(PROTOCOL_VERSION);
        unknown.put_u8(0);
        unknown.put_u32(0);
        wire.extend_from_slice(&unknown);
        Frame::from_msg(&DataHandshakeAckMsg)
            .write_to(&mut wire)
            .unwrap();

        let mut cursor = io::Cursor::new(wire);
        let frame = Frame::read_from(&mut cursor).unwrap();
        assert_eq!(frame.kind, MessageKind::DataHandshakeAck);
    }

    #[test]
    fn wire_len_reports_full_frame_size() {
        let encoded = Frame::from_msg(&StatisticsRequestMsg).encode();
        assert_eq!(Frame::wire_len(&encoded), Some(encoded.len()));
        assert_eq!(Frame::wire_len(&encoded[..3]), None);
    }
}
