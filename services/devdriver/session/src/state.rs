//! Session protocol state machine.
//!
//! States are ordered: several checks compare against a state rather than
//! matching it (for example sending is allowed in every state before
//! `FinWait2`). Transition decisions are pure functions here; the session
//! applies them and performs the side effects.

use std::fmt;

/// Session protocol states
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Not connected, or torn down (terminal)
    Closed = 0,
    /// Bound to a protocol server, waiting for the Syn
    Listening = 1,
    /// Syn queued by the connecting side
    SynSent = 2,
    /// SynAck queued by the accepting side
    SynReceived = 3,
    /// Handshake complete
    Established = 4,
    /// Local close requested, Fin not yet queued
    FinWait1 = 5,
    /// Peer sent Fin, draining received data
    Closing = 6,
    /// Fin queued, waiting for the send window to drain
    FinWait2 = 7,
}

/// What to do with a received Fin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinAction {
    /// Buffer the Fin behind pending data and move to `Closing`.
    ///
    /// Repeated in `Closing` so a retransmitted Fin is re-acknowledged.
    Drain,
    /// Simultaneous close: acknowledge immediately and move to `Closed`
    AckAndClose,
    /// Session already closed
    Ignore,
}

impl SessionState {
    /// Decode a state stored as its discriminant
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Listening,
            2 => SessionState::SynSent,
            3 => SessionState::SynReceived,
            4 => SessionState::Established,
            5 => SessionState::FinWait1,
            6 => SessionState::Closing,
            7 => SessionState::FinWait2,
            _ => SessionState::Closed,
        }
    }

    /// State name for logging
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Closed => "Closed",
            SessionState::Listening => "Listening",
            SessionState::SynSent => "SynSent",
            SessionState::SynReceived => "SynReceived",
            SessionState::Established => "Established",
            SessionState::FinWait1 => "FinWait1",
            SessionState::Closing => "Closing",
            SessionState::FinWait2 => "FinWait2",
        }
    }

    /// State after a shutdown request. A graceful (`Success`) shutdown of an
    /// established session goes through the Fin exchange, and sessions already
    /// closing keep closing; everything else closes immediately.
    pub fn on_shutdown(self, graceful: bool) -> SessionState {
        match self {
            SessionState::Closed
            | SessionState::FinWait1
            | SessionState::FinWait2
            | SessionState::Closing => {
                if graceful {
                    self
                } else {
                    SessionState::Closed
                }
            }
            SessionState::Established => {
                if graceful {
                    SessionState::FinWait1
                } else {
                    SessionState::Closed
                }
            }
            _ => SessionState::Closed,
        }
    }

    /// How a received Fin is handled in this state
    pub fn on_fin(self) -> FinAction {
        match self {
            SessionState::Closed => FinAction::Ignore,
            SessionState::FinWait2 => FinAction::AckAndClose,
            _ => FinAction::Drain,
        }
    }

    /// State after an Ack, if it completes the handshake
    pub fn on_ack(self) -> Option<SessionState> {
        match self {
            SessionState::SynReceived => Some(SessionState::Established),
            _ => None,
        }
    }

    /// Whether an Ack watermark is processed in this state
    pub fn processes_acks(self) -> bool {
        matches!(
            self,
            SessionState::SynReceived
                | SessionState::Established
                | SessionState::FinWait1
                | SessionState::FinWait2
                | SessionState::Closing
        )
    }

    /// Whether Data messages are accepted into the receive window.
    ///
    /// `Closing` still accepts data: the peer's Fin may have overtaken
    /// messages sent before it.
    pub fn accepts_data(self) -> bool {
        matches!(
            self,
            SessionState::Established
                | SessionState::FinWait1
                | SessionState::Closing
                | SessionState::FinWait2
        )
    }

    /// Whether new messages may be written into the send window
    pub fn can_send(self) -> bool {
        self != SessionState::Closed && self < SessionState::FinWait2
    }

    /// Whether the receive window may be drained by the consumer
    pub fn can_receive(self) -> bool {
        self >= SessionState::Established
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
