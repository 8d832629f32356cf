//! Session error types.

use dd_wire::{ResultCode, WireError};
use thiserror::Error;

/// Errors returned by session and manager operations.
///
/// Each variant corresponds to one non-success [`ResultCode`], so reasons can
/// travel over the wire in `Rst` messages and come back as errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// Generic or transport failure
    #[error("session error")]
    Error,

    /// Timeout or backpressure; retrying may succeed
    #[error("not ready")]
    NotReady,

    /// Protocol version negotiation failed
    #[error("protocol version mismatch")]
    VersionMismatch,

    /// Transport disconnected or remote session unknown
    #[error("unavailable")]
    Unavailable,

    /// Remote server declined the session
    #[error("session rejected")]
    Rejected,

    /// Peer closed the session gracefully
    #[error("end of stream")]
    EndOfStream,

    /// Operation abandoned
    #[error("aborted")]
    Aborted,

    /// Caller buffer too small, or message too large
    #[error("insufficient memory")]
    InsufficientMemory,
}

impl SessionError {
    /// Convert a result code into `Ok` or the matching error
    pub fn check(code: ResultCode) -> Result<(), SessionError> {
        match code {
            ResultCode::Success => Ok(()),
            ResultCode::Error => Err(SessionError::Error),
            ResultCode::NotReady => Err(SessionError::NotReady),
            ResultCode::VersionMismatch => Err(SessionError::VersionMismatch),
            ResultCode::Unavailable => Err(SessionError::Unavailable),
            ResultCode::Rejected => Err(SessionError::Rejected),
            ResultCode::EndOfStream => Err(SessionError::EndOfStream),
            ResultCode::Aborted => Err(SessionError::Aborted),
            ResultCode::InsufficientMemory => Err(SessionError::InsufficientMemory),
        }
    }
}

impl From<SessionError> for ResultCode {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Error => ResultCode::Error,
            SessionError::NotReady => ResultCode::NotReady,
            SessionError::VersionMismatch => ResultCode::VersionMismatch,
            SessionError::Unavailable => ResultCode::Unavailable,
            SessionError::Rejected => ResultCode::Rejected,
            SessionError::EndOfStream => ResultCode::EndOfStream,
            SessionError::Aborted => ResultCode::Aborted,
            SessionError::InsufficientMemory => ResultCode::InsufficientMemory,
        }
    }
}

impl From<WireError> for SessionError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Size(_) => SessionError::InsufficientMemory,
            _ => SessionError::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(SessionError::check(ResultCode::Success), Ok(()));
        for err in [
            SessionError::Error,
            SessionError::NotReady,
            SessionError::VersionMismatch,
            SessionError::Unavailable,
            SessionError::Rejected,
            SessionError::EndOfStream,
            SessionError::Aborted,
            SessionError::InsufficientMemory,
        ] {
            assert_eq!(SessionError::check(ResultCode::from(err)), Err(err));
        }
    }

    #[test]
    fn test_wire_error_mapping() {
        assert_eq!(SessionError::from(WireError::Size(5000)), SessionError::InsufficientMemory);
        assert_eq!(SessionError::from(WireError::Malformed), SessionError::Error);
    }
}
