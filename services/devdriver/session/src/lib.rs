//! Reliable, ordered, flow-controlled sessions multiplexed over one message
//! transport.
//!
//! This crate implements the devdriver session protocol on top of the wire
//! types in `dd-wire`: a Syn/SynAck/Ack handshake with protocol version
//! negotiation, sliding send and receive windows with cumulative
//! acknowledgements, timeout and fast retransmission, and a Fin exchange for
//! graceful close.
//!
//! ## Components
//!
//! - [`Session`]: one end of a session, with async `send`/`receive`
//! - [`SessionManager`]: owns all sessions of a client, routes messages,
//!   accepts sessions for registered [`ProtocolServer`]s
//! - [`MsgChannel`]: non-blocking outbound transport, with in-process and TCP
//!   implementations
//!
//! ## Example
//!
//! ```rust,no_run
//! use dd_session::{dispatch_inbound, LocalChannel, SessionConfig, SessionManager};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let (local, _remote) = LocalChannel::pair(1, 2, 256);
//! let manager = Arc::new(SessionManager::new(local.channel, SessionConfig::default()));
//!
//! tokio::spawn(dispatch_inbound(local.inbound, manager.clone()));
//! tokio::spawn(manager.clone().run_updates(Duration::from_millis(1)));
//!
//! // Register protocol servers or establish client sessions here
//!
//! let _ = manager.destroy(Duration::from_secs(1)).await;
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod window;

// Re-export main types
pub use config::{SessionConfig, DEFAULT_WINDOW_SIZE};
pub use error::SessionError;
pub use manager::SessionManager;
pub use protocol::{ProtocolClient, ProtocolServer, ProtocolSession, SessionOwner};
pub use session::{Session, SessionStats};
pub use state::{FinAction, SessionState};
pub use transport::{dispatch_inbound, LocalChannel, LocalEndpoint, MsgChannel, TcpChannel};
pub use window::{AckOutcome, ReceiveOutcome, ReceiveWindow, SendWindow};
