//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete message (need more data)
    #[error("incomplete message")]
    Incomplete,

    /// Payload size limit exceeded
    #[error("payload size limit exceeded: {0}")]
    Size(usize),

    /// Unknown session message id
    #[error("unknown message id {0}")]
    Type(u8),

    /// Unknown protocol id
    #[error("unknown protocol {0}")]
    Protocol(u8),

    /// Unknown result code
    #[error("unknown result code {0}")]
    Code(u32),

    /// Malformed message structure
    #[error("malformed message")]
    Malformed,
}
