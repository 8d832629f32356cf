//! Fixed message header for the wire protocol.
//!
//! Every message starts with the same 24-byte header. Session control and data
//! messages use every field; other protocols may leave `session_id`, `sequence`
//! and `window_size` zeroed.

use bytes::{Buf, BufMut};

/// Identifies one endpoint attached to the message transport
pub type ClientId = u16;
/// Identifies one logical session between two clients
pub type SessionId = u32;
/// Per-session message sequence number
pub type Sequence = u64;
/// Advertised receive window, in messages
pub type WindowSize = u16;
/// Raw message code within a protocol
pub type MessageCode = u8;
/// Protocol version negotiated by protocol clients and servers
pub type Version = u16;
/// Version of the session protocol itself
pub type SessionVersion = u16;

/// Reserved broadcast client id, never assigned to a real endpoint
pub const BROADCAST_CLIENT_ID: ClientId = 0;

/// Reserved invalid session id, never allocated
pub const INVALID_SESSION_ID: SessionId = 0;

/// Header size in bytes
pub const MESSAGE_HEADER_SIZE: usize = 24;

/// Maximum size of a whole message (header plus payload)
pub const MAX_MESSAGE_SIZE: usize = 1408;

/// Maximum payload size carried by a single message
pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - MESSAGE_HEADER_SIZE;

/// Protocol ids. Values up to 223 are available to user protocols, the upper
/// range is reserved for system use.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Driver control protocol
    DriverControl = 0,
    /// Logging protocol
    Logging = 1,
    /// Settings protocol
    Settings = 2,
    /// Radeon GPU Profiler protocol
    Rgp = 3,
    /// Event tracing protocol
    Etw = 4,
    /// GPU crash dump protocol
    GpuCrashDump = 5,
    /// Bulk transfer protocol
    Transfer = 251,
    /// URI request protocol
    Uri = 252,
    /// Session control messages
    Session = 253,
    /// Client management messages
    ClientManagement = 254,
    /// System messages
    System = 255,
}

impl TryFrom<u8> for Protocol {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Protocol::DriverControl),
            1 => Ok(Protocol::Logging),
            2 => Ok(Protocol::Settings),
            3 => Ok(Protocol::Rgp),
            4 => Ok(Protocol::Etw),
            5 => Ok(Protocol::GpuCrashDump),
            251 => Ok(Protocol::Transfer),
            252 => Ok(Protocol::Uri),
            253 => Ok(Protocol::Session),
            254 => Ok(Protocol::ClientManagement),
            255 => Ok(Protocol::System),
            _ => Err(crate::WireError::Protocol(value)),
        }
    }
}

/// Session protocol message ids
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMessage {
    /// Session request from the connecting side
    Syn = 1,
    /// Session accepted by the listening side
    SynAck = 2,
    /// Graceful end of stream
    Fin = 3,
    /// Application payload
    Data = 4,
    /// Cumulative acknowledgement
    Ack = 5,
    /// Session reset, `sequence` carries the reason
    Rst = 6,
}

impl TryFrom<u8> for SessionMessage {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SessionMessage::Syn),
            2 => Ok(SessionMessage::SynAck),
            3 => Ok(SessionMessage::Fin),
            4 => Ok(SessionMessage::Data),
            5 => Ok(SessionMessage::Ack),
            6 => Ok(SessionMessage::Rst),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// Result codes shared by the API and the wire (carried by `Rst`)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Success
    Success = 0,
    /// Generic or transport failure
    Error = 1,
    /// Timeout or backpressure, retryable
    NotReady = 2,
    /// Protocol version negotiation failed
    VersionMismatch = 3,
    /// Transport-level disconnect or unknown session
    Unavailable = 4,
    /// Server declined the session
    Rejected = 5,
    /// Peer closed gracefully
    EndOfStream = 6,
    /// Operation abandoned
    Aborted = 7,
    /// Buffer too small or allocation failure
    InsufficientMemory = 8,
}

impl TryFrom<u32> for ResultCode {
    type Error = crate::WireError;

    fn try_from(value: u32) -> Result<Self, crate::WireError> {
        match value {
            0 => Ok(ResultCode::Success),
            1 => Ok(ResultCode::Error),
            2 => Ok(ResultCode::NotReady),
            3 => Ok(ResultCode::VersionMismatch),
            4 => Ok(ResultCode::Unavailable),
            5 => Ok(ResultCode::Rejected),
            6 => Ok(ResultCode::EndOfStream),
            7 => Ok(ResultCode::Aborted),
            8 => Ok(ResultCode::InsufficientMemory),
            _ => Err(crate::WireError::Code(value)),
        }
    }
}

impl ResultCode {
    /// Decode a reason carried in a `sequence` field. Unknown values map to `Error`.
    pub fn from_sequence(sequence: Sequence) -> Self {
        u32::try_from(sequence)
            .ok()
            .and_then(|code| ResultCode::try_from(code).ok())
            .unwrap_or(ResultCode::Error)
    }
}

/// Message header (24 bytes, little-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Sending client
    pub src_client_id: ClientId,
    /// Receiving client
    pub dst_client_id: ClientId,
    /// Raw protocol id
    pub protocol_id: u8,
    /// Raw message id within the protocol
    pub message_id: MessageCode,
    /// Receiver-advertised available window, in messages
    pub window_size: WindowSize,
    /// Number of payload bytes following the header
    pub payload_size: u32,
    /// Session the message belongs to
    pub session_id: SessionId,
    /// Sequence number, or an ack watermark / reason on control messages
    pub sequence: Sequence,
}

impl MessageHeader {
    /// Create a session protocol header with no payload
    pub fn session(
        message: SessionMessage,
        src_client_id: ClientId,
        dst_client_id: ClientId,
        session_id: SessionId,
        sequence: Sequence,
    ) -> Self {
        Self {
            src_client_id,
            dst_client_id,
            protocol_id: Protocol::Session as u8,
            message_id: message as u8,
            window_size: 0,
            payload_size: 0,
            session_id,
            sequence,
        }
    }

    /// Protocol this message belongs to
    pub fn protocol(&self) -> Result<Protocol, crate::WireError> {
        Protocol::try_from(self.protocol_id)
    }

    /// Session message id, if this is a session protocol message
    pub fn session_message(&self) -> Result<SessionMessage, crate::WireError> {
        SessionMessage::try_from(self.message_id)
    }

    /// Encode the header
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16_le(self.src_client_id);
        buf.put_u16_le(self.dst_client_id);
        buf.put_u8(self.protocol_id);
        buf.put_u8(self.message_id);
        buf.put_u16_le(self.window_size);
        buf.put_u32_le(self.payload_size);
        buf.put_u32_le(self.session_id);
        buf.put_u64_le(self.sequence);
    }

    /// Decode the header
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, crate::WireError> {
        if buf.remaining() < MESSAGE_HEADER_SIZE {
            return Err(crate::WireError::Incomplete);
        }

        let header = Self {
            src_client_id: buf.get_u16_le(),
            dst_client_id: buf.get_u16_le(),
            protocol_id: buf.get_u8(),
            message_id: buf.get_u8(),
            window_size: buf.get_u16_le(),
            payload_size: buf.get_u32_le(),
            session_id: buf.get_u32_le(),
            sequence: buf.get_u64_le(),
        };

        if header.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(crate::WireError::Size(header.payload_size as usize));
        }

        Ok(header)
    }
}
