//! Callback interfaces implemented by protocols layered on top of sessions.
//!
//! Callbacks are invoked from the transport dispatch task or the update
//! sweep, never with a window lock held. `update_session` and
//! `session_terminated` run inside the manager's sweep and must not call back
//! into the manager's session map (establishing sessions or unregistering
//! servers); sending and receiving on the session itself is fine.

use crate::session::Session;
use dd_wire::{Protocol, ResultCode, Version};
use std::sync::Arc;

/// Lifecycle callbacks shared by protocol clients and servers
pub trait ProtocolSession: Send + Sync + std::fmt::Debug {
    /// Protocol spoken over the sessions this object owns
    fn protocol(&self) -> Protocol;

    /// The session finished its handshake
    fn session_established(&self, session: &Arc<Session>);

    /// Periodic tick for an established session
    fn update_session(&self, session: &Arc<Session>);

    /// The session closed; called exactly once per owned session
    fn session_terminated(&self, session: &Arc<Session>, reason: ResultCode);
}

/// Connecting side of a protocol
pub trait ProtocolClient: ProtocolSession {
    /// Lowest protocol version this client speaks
    fn min_version(&self) -> Version;

    /// Highest protocol version this client speaks
    fn max_version(&self) -> Version;
}

/// Accepting side of a protocol
pub trait ProtocolServer: ProtocolSession {
    /// Lowest protocol version this server speaks
    fn min_version(&self) -> Version;

    /// Highest protocol version this server speaks; reported back to clients
    /// whose range does not overlap
    fn max_version(&self) -> Version;

    /// Pick a version within the client's `[min_version, max_version]`, or
    /// `None` if it does not overlap the server's range. Defaults to the
    /// highest common version.
    ///
    /// On `None` the client is reset with `VersionMismatch` carrying
    /// [`max_version`](Self::max_version), which the client reads back from
    /// `Session::rejected_version` to decide whether a retry with another
    /// range can succeed.
    fn get_supported_version(&self, min_version: Version, max_version: Version) -> Option<Version> {
        if min_version <= self.max_version() && max_version >= self.min_version() {
            Some(max_version.min(self.max_version()))
        } else {
            None
        }
    }

    /// Take ownership of a freshly bound session. Returning `false` rejects it.
    fn accept_session(&self, session: &Arc<Session>) -> bool;
}

/// Object receiving a session's callbacks
#[derive(Debug, Clone)]
pub enum SessionOwner {
    /// Session opened by [`crate::SessionManager::establish_session_for_client`]
    Client(Arc<dyn ProtocolClient>),
    /// Session accepted on behalf of a registered server
    Server(Arc<dyn ProtocolServer>),
}

impl SessionOwner {
    /// Protocol of the owner
    pub fn protocol(&self) -> Protocol {
        match self {
            SessionOwner::Client(client) => client.protocol(),
            SessionOwner::Server(server) => server.protocol(),
        }
    }

    /// Lowest protocol version the owner speaks
    pub fn min_version(&self) -> Version {
        match self {
            SessionOwner::Client(client) => client.min_version(),
            SessionOwner::Server(server) => server.min_version(),
        }
    }

    /// Address of the owning object, for identity comparisons
    pub fn addr(&self) -> *const () {
        match self {
            SessionOwner::Client(client) => Arc::as_ptr(client) as *const (),
            SessionOwner::Server(server) => Arc::as_ptr(server) as *const (),
        }
    }

    pub(crate) fn session_established(&self, session: &Arc<Session>) {
        match self {
            SessionOwner::Client(client) => client.session_established(session),
            SessionOwner::Server(server) => server.session_established(session),
        }
    }

    pub(crate) fn update_session(&self, session: &Arc<Session>) {
        match self {
            SessionOwner::Client(client) => client.update_session(session),
            SessionOwner::Server(server) => server.update_session(session),
        }
    }

    pub(crate) fn session_terminated(&self, session: &Arc<Session>, reason: ResultCode) {
        match self {
            SessionOwner::Client(client) => client.session_terminated(session, reason),
            SessionOwner::Server(server) => server.session_terminated(session, reason),
        }
    }
}
