//! Whole messages and stream framing.
//!
//! A message is its header followed by exactly `payload_size` bytes. Message
//! transports that preserve boundaries carry one message per datagram; byte
//! stream transports concatenate them and use [`MessageDecoder`] to split.

use crate::header::{MessageHeader, SessionMessage, MAX_PAYLOAD_SIZE, MESSAGE_HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// Complete wire message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageBuffer {
    /// Fixed header
    pub header: MessageHeader,
    /// Payload, `header.payload_size` bytes long
    pub payload: Bytes,
}

impl MessageBuffer {
    /// Create a message, setting `payload_size` from the payload
    pub fn new(mut header: MessageHeader, payload: Bytes) -> Result<Self, crate::WireError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(crate::WireError::Size(payload.len()));
        }
        header.payload_size = payload.len() as u32;
        Ok(Self { header, payload })
    }

    /// Create a message without payload
    pub fn control(header: MessageHeader) -> Self {
        let mut header = header;
        header.payload_size = 0;
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Session message id, if this is a session protocol message
    pub fn session_message(&self) -> Result<SessionMessage, crate::WireError> {
        self.header.session_message()
    }

    /// Size of the encoded message
    pub fn encoded_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.payload.len()
    }

    /// Encode the message into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        self.header.encode(buf);
        buf.put_slice(&self.payload);
    }

    /// Encode the message to a contiguous buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a single message occupying all of `buf`
    pub fn decode(mut buf: Bytes) -> Result<Self, crate::WireError> {
        let header = MessageHeader::decode(&mut buf)?;
        let payload_size = header.payload_size as usize;
        if buf.len() < payload_size {
            return Err(crate::WireError::Incomplete);
        }
        if buf.len() > payload_size {
            return Err(crate::WireError::Malformed);
        }
        Ok(Self {
            header,
            payload: buf,
        })
    }
}

/// Decoder splitting a byte stream into messages
#[derive(Debug, Default)]
pub struct MessageDecoder {
    pending: Option<MessageHeader>,
}

impl MessageDecoder {
    /// Create a new message decoder
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Decode one message from the front of `buf`, or `None` if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<MessageBuffer>, crate::WireError> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if buf.len() < MESSAGE_HEADER_SIZE {
                    return Ok(None);
                }
                let header = MessageHeader::decode(&mut buf.split_to(MESSAGE_HEADER_SIZE))?;
                self.pending = Some(header);
                header
            }
        };

        let payload_size = header.payload_size as usize;
        if buf.len() < payload_size {
            buf.reserve(payload_size - buf.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = buf.split_to(payload_size).freeze();
        Ok(Some(MessageBuffer { header, payload }))
    }
}
