//! Message header, session control payloads and stream framing for devdriver.
//!
//! This crate provides the low-level wire representation shared by every
//! devdriver endpoint: the fixed message header, the session protocol message
//! ids and result codes, the handshake payloads, and a decoder that splits a
//! byte stream back into messages.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+------------------------------------------+
//! | u16 src_client_id    | sender                                   |
//! | u16 dst_client_id    | receiver                                 |
//! | u8  protocol_id      | Session (253) for session traffic        |
//! | u8  message_id       | Syn=1 SynAck=2 Fin=3 Data=4 Ack=5 Rst=6  |
//! | u16 window_size      | receiver-advertised window, in messages  |
//! | u32 payload_size     | <= 1384                                  |
//! | u32 session_id       | low 16: requester, high 16: acceptor     |
//! | u64 sequence         | sequence / ack watermark / Rst reason    |
//! +----------------------+------------------------------------------+
//! | payload              | payload_size bytes                       |
//! +----------------------+------------------------------------------+
//! ```
//!
//! All integers are little-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;
pub mod message;
pub mod payload;

// Re-export main types
pub use error::WireError;
pub use header::{
    ClientId, MessageCode, MessageHeader, Protocol, ResultCode, Sequence, SessionId,
    SessionMessage, SessionVersion, Version, WindowSize, BROADCAST_CLIENT_ID, INVALID_SESSION_ID,
    MAX_MESSAGE_SIZE, MAX_PAYLOAD_SIZE, MESSAGE_HEADER_SIZE,
};
pub use message::{MessageBuffer, MessageDecoder};
pub use payload::{
    SynAckPayload, SynPayload, SESSION_PROTOCOL_RANGE_VERSION, SESSION_PROTOCOL_SYNACK_VERSION,
    SESSION_PROTOCOL_VERSION, SYN_ACK_PAYLOAD_SIZE, SYN_PAYLOAD_SIZE,
};
