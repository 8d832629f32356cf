//! Session handshake payloads.
//!
//! `Syn` carries the requested protocol and version range, `SynAck` echoes the
//! requester's provisional session id and Syn sequence together with the
//! negotiated versions.

use crate::header::{Protocol, Sequence, SessionId, SessionVersion, Version};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Current version of the session protocol
pub const SESSION_PROTOCOL_VERSION: SessionVersion = 2;

/// First session protocol version that negotiates a `[min, max]` range
pub const SESSION_PROTOCOL_RANGE_VERSION: SessionVersion = 2;

/// First session protocol version whose FinWait2 waits for unsent data to drain
pub const SESSION_PROTOCOL_SYNACK_VERSION: SessionVersion = 2;

/// Encoded size of [`SynPayload`]
pub const SYN_PAYLOAD_SIZE: usize = 8;

/// Encoded size of [`SynAckPayload`]
pub const SYN_ACK_PAYLOAD_SIZE: usize = 16;

/// Session request payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynPayload {
    /// Protocol the client wants to talk
    pub protocol: Protocol,
    /// Session protocol version of the requester
    pub session_version: SessionVersion,
    /// Lowest protocol version the client supports
    pub min_version: Version,
    /// Highest protocol version the client supports
    pub max_version: Version,
}

impl SynPayload {
    /// Encode the payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SYN_PAYLOAD_SIZE);
        buf.put_u8(self.protocol as u8);
        buf.put_u8(0);
        buf.put_u16_le(self.session_version);
        buf.put_u16_le(self.min_version);
        buf.put_u16_le(self.max_version);
        buf.freeze()
    }

    /// Decode the payload
    pub fn decode(mut buf: &[u8]) -> Result<Self, crate::WireError> {
        if buf.len() < SYN_PAYLOAD_SIZE {
            return Err(crate::WireError::Incomplete);
        }
        let protocol = Protocol::try_from(buf.get_u8())?;
        let _reserved = buf.get_u8();
        Ok(Self {
            protocol,
            session_version: buf.get_u16_le(),
            min_version: buf.get_u16_le(),
            max_version: buf.get_u16_le(),
        })
    }

    /// Version range the requester accepts, as seen by a server speaking the current
    /// session protocol. Requesters older than the range version only offer `min_version`.
    pub fn version_range(&self) -> (Version, Version) {
        if self.session_version >= SESSION_PROTOCOL_RANGE_VERSION {
            (self.min_version, self.max_version.max(self.min_version))
        } else {
            (self.min_version, self.min_version)
        }
    }
}

/// Session accept payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynAckPayload {
    /// Provisional session id the requester used in its Syn
    pub initial_session_id: SessionId,
    /// Sequence of the Syn being acknowledged
    pub sequence: Sequence,
    /// Negotiated protocol version, 0 if the server did not negotiate
    pub version: Version,
    /// Negotiated session protocol version
    pub session_version: SessionVersion,
}

impl SynAckPayload {
    /// Encode the payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SYN_ACK_PAYLOAD_SIZE);
        buf.put_u32_le(self.initial_session_id);
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.session_version);
        buf.put_u64_le(self.sequence);
        buf.freeze()
    }

    /// Decode the payload
    pub fn decode(mut buf: &[u8]) -> Result<Self, crate::WireError> {
        if buf.len() < SYN_ACK_PAYLOAD_SIZE {
            return Err(crate::WireError::Incomplete);
        }
        let initial_session_id = buf.get_u32_le();
        let version = buf.get_u16_le();
        let session_version = buf.get_u16_le();
        let sequence = buf.get_u64_le();
        Ok(Self {
            initial_session_id,
            sequence,
            version,
            session_version,
        })
    }
}
