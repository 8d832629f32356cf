//! Session manager multiplexing sessions over one message channel.
//!
//! The manager owns every live [`Session`] keyed by session id, routes
//! incoming session messages to them, accepts inbound session requests on
//! behalf of registered [`ProtocolServer`]s and answers messages for unknown
//! sessions with a reset.
//!
//! The server registry and the session map have separate mutexes. When both
//! are needed the server registry is locked first. Session window locks are
//! always taken inside either.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::protocol::{ProtocolClient, ProtocolServer};
use crate::session::Session;
use crate::state::SessionState;
use crate::transport::MsgChannel;
use dd_wire::{
    ClientId, MessageBuffer, MessageHeader, Protocol, ResultCode, SessionId, SessionMessage,
    SynAckPayload, SynPayload, Version, INVALID_SESSION_ID,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Bits of a session id chosen by the allocating side
const CLIENT_SESSION_ID_BITS: u32 = 16;
const CLIENT_SESSION_ID_MASK: u32 = (1 << CLIENT_SESSION_ID_BITS) - 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Why an inbound message could not be routed, reported in the reset
struct Rejection {
    reason: ResultCode,
    version: Version,
}

impl Rejection {
    fn new(reason: ResultCode) -> Self {
        Self { reason, version: 0 }
    }
}

/// Registry and demultiplexer for all sessions of one client
#[derive(Debug)]
pub struct SessionManager {
    channel: Arc<dyn MsgChannel>,
    config: Arc<SessionConfig>,
    client_id: ClientId,
    last_session_id: AtomicU32,
    active: AtomicBool,
    destroyed: AtomicBool,
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    servers: Mutex<HashMap<Protocol, Arc<dyn ProtocolServer>>>,
}

impl SessionManager {
    /// Create an active manager sending on `channel`
    pub fn new(channel: Arc<dyn MsgChannel>, config: SessionConfig) -> Self {
        let client_id = channel.client_id();
        info!("Session manager started for client {}", client_id);
        Self {
            channel,
            config: Arc::new(config),
            client_id,
            // Random start keeps ids from colliding across restarts
            last_session_id: AtomicU32::new(rand::random()),
            active: AtomicBool::new(true),
            destroyed: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Local client id
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Session configuration shared by all sessions
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether new sessions are accepted
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of sessions in the map, including ones waiting to be swept
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Allocate an id that is valid and not in use. The low half is local,
    /// the high half carries the requester's id for accepted sessions.
    fn new_session_id(
        &self,
        sessions: &HashMap<SessionId, Arc<Session>>,
        remote_session_id: SessionId,
    ) -> SessionId {
        let remote = (remote_session_id & CLIENT_SESSION_ID_MASK) << CLIENT_SESSION_ID_BITS;
        loop {
            let next = self
                .last_session_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            let session_id = (next & CLIENT_SESSION_ID_MASK) | remote;
            if session_id != INVALID_SESSION_ID && !sessions.contains_key(&session_id) {
                return session_id;
            }
        }
    }

    /// Open a session to `dst_client_id` for `client`.
    ///
    /// The Syn is queued immediately; `session_established` fires once the
    /// peer accepts.
    pub fn establish_session_for_client(
        &self,
        client: Arc<dyn ProtocolClient>,
        dst_client_id: ClientId,
    ) -> Result<Arc<Session>, SessionError> {
        if !self.is_active() {
            return Err(SessionError::Unavailable);
        }

        let session = Arc::new(Session::new(self.channel.clone(), self.config.clone()));

        let mut sessions = lock(&self.sessions);
        let session_id = self.new_session_id(&sessions, INVALID_SESSION_ID);
        session.connect(client, dst_client_id, session_id)?;
        sessions.insert(session_id, session.clone());

        debug!(
            "Session {:#010x} connecting to client {}",
            session_id, dst_client_id
        );
        Ok(session)
    }

    /// Accept inbound sessions for `server`'s protocol
    pub fn register_protocol_server(&self, server: Arc<dyn ProtocolServer>) -> Result<(), SessionError> {
        let protocol = server.protocol();
        let mut servers = lock(&self.servers);
        if servers.contains_key(&protocol) {
            warn!("Protocol server for {:?} is already registered", protocol);
            return Err(SessionError::Error);
        }
        servers.insert(protocol, server);
        info!("Registered protocol server for {:?}", protocol);
        Ok(())
    }

    /// Stop accepting sessions for `server` and close every session it owns
    /// without further callbacks
    pub fn unregister_protocol_server(&self, server: &Arc<dyn ProtocolServer>) -> Result<(), SessionError> {
        let protocol = server.protocol();
        let mut servers = lock(&self.servers);

        let registered = servers
            .get(&protocol)
            .map(|found| Arc::ptr_eq(found, server))
            .unwrap_or(false);
        if !registered {
            warn!("Attempted to unregister an unknown protocol server for {:?}", protocol);
            return Err(SessionError::Error);
        }

        let sessions = lock(&self.sessions);
        let closed = sessions
            .values()
            .filter(|session| session.close_if_owned_by(server))
            .count();
        servers.remove(&protocol);

        info!(
            "Unregistered protocol server for {:?}, closed {} sessions",
            protocol, closed
        );
        Ok(())
    }

    /// Whether a server is registered for `protocol`
    pub fn has_protocol_server(&self, protocol: Protocol) -> bool {
        lock(&self.servers).contains_key(&protocol)
    }

    /// Route one message received from the transport
    pub fn handle_received_session_message(&self, message: &MessageBuffer) {
        let header = &message.header;
        if header.dst_client_id != self.client_id || header.protocol() != Ok(Protocol::Session) {
            warn!(
                "Dropping message for client {} protocol {} on client {}",
                header.dst_client_id, header.protocol_id, self.client_id
            );
            return;
        }

        let kind = match message.session_message() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Dropping session message from client {}: {}", header.src_client_id, e);
                return;
            }
        };

        let routed = match kind {
            SessionMessage::Syn => self.accept_session_request(message),
            SessionMessage::SynAck => self.find_connecting_session(message),
            SessionMessage::Fin | SessionMessage::Data | SessionMessage::Ack | SessionMessage::Rst => self
                .find_open_session(header.src_client_id, header.session_id)
                .ok_or_else(|| Rejection::new(ResultCode::Unavailable)),
        };

        match routed {
            Ok(session) => session.handle_message(message),
            // A reset is never answered with another reset
            Err(_) if kind == SessionMessage::Rst => {
                debug!("Ignoring reset for unknown session {:#010x}", header.session_id);
            }
            Err(rejection) => {
                debug!(
                    "Resetting {:?} for session {:#010x} from client {}: {:?}",
                    kind, header.session_id, header.src_client_id, rejection.reason
                );
                self.send_reset(
                    header.src_client_id,
                    header.session_id,
                    rejection.reason,
                    rejection.version,
                );
            }
        }
    }

    /// Negotiate and create a session for an inbound Syn
    fn accept_session_request(&self, message: &MessageBuffer) -> Result<Arc<Session>, Rejection> {
        let header = &message.header;
        let request = SynPayload::decode(&message.payload).map_err(|e| {
            debug!("Malformed session request from client {}: {}", header.src_client_id, e);
            Rejection::new(ResultCode::Unavailable)
        })?;

        if !self.is_active() {
            return Err(Rejection::new(ResultCode::Unavailable));
        }

        let servers = lock(&self.servers);
        let server = servers
            .get(&request.protocol)
            .cloned()
            .ok_or_else(|| Rejection::new(ResultCode::Unavailable))?;

        let (min_version, max_version) = request.version_range();
        let version = server
            .get_supported_version(min_version, max_version)
            .ok_or_else(|| {
                info!(
                    "Rejecting {:?} session from client {}: versions [{}, {}] not supported",
                    request.protocol, header.src_client_id, min_version, max_version
                );
                Rejection {
                    reason: ResultCode::VersionMismatch,
                    version: server.max_version(),
                }
            })?;

        let rejected = Rejection {
            reason: ResultCode::Rejected,
            version,
        };

        let session = Arc::new(Session::new(self.channel.clone(), self.config.clone()));
        let session_id = {
            let mut sessions = lock(&self.sessions);
            let session_id = self.new_session_id(&sessions, header.session_id);
            if session
                .bind_to_server(
                    server.clone(),
                    header.src_client_id,
                    request.session_version,
                    version,
                    session_id,
                )
                .is_err()
            {
                return Err(rejected);
            }
            sessions.insert(session_id, session.clone());
            session_id
        };
        drop(servers);

        if !server.accept_session(&session) {
            info!(
                "{:?} server declined session from client {}",
                request.protocol, header.src_client_id
            );
            session.close(ResultCode::Rejected);
            lock(&self.sessions).remove(&session_id);
            return Err(rejected);
        }

        info!(
            "Accepted {:?} session {:#010x} from client {} at version {}",
            request.protocol, session_id, header.src_client_id, version
        );
        Ok(session)
    }

    /// Find the session a SynAck answers, re-keying it under the final id
    fn find_connecting_session(&self, message: &MessageBuffer) -> Result<Arc<Session>, Rejection> {
        if !self.is_active() {
            return Err(Rejection::new(ResultCode::Unavailable));
        }

        let final_id = message.header.session_id;
        let mut sessions = lock(&self.sessions);

        // The Ack for an earlier SynAck was lost and the peer resent it
        if let Some(session) = sessions
            .get(&final_id)
            .filter(|session| session.remote_client_id() == message.header.src_client_id)
        {
            return Ok(session.clone());
        }

        let payload = SynAckPayload::decode(&message.payload)
            .map_err(|_| Rejection::new(ResultCode::Unavailable))?;
        let session = sessions
            .get(&payload.initial_session_id)
            .filter(|session| session.remote_client_id() == message.header.src_client_id)
            .cloned()
            .ok_or_else(|| Rejection::new(ResultCode::Unavailable))?;

        // Insert under the final id before dropping the provisional one so the
        // session stays reachable
        sessions.insert(final_id, session.clone());
        sessions.remove(&payload.initial_session_id);
        debug!(
            "Session {:#010x} re-keyed to {:#010x}",
            payload.initial_session_id, final_id
        );
        Ok(session)
    }

    /// Look up a session with `remote_client_id` that has not closed yet
    pub fn find_open_session(&self, remote_client_id: ClientId, session_id: SessionId) -> Option<Arc<Session>> {
        lock(&self.sessions)
            .get(&session_id)
            .filter(|session| session.remote_client_id() == remote_client_id)
            .filter(|session| session.state() != SessionState::Closed)
            .cloned()
    }

    /// Tell `dst_client_id` that `session_id` is not valid here
    pub fn send_reset(
        &self,
        dst_client_id: ClientId,
        session_id: SessionId,
        reason: ResultCode,
        version: Version,
    ) {
        let mut header = MessageHeader::session(
            SessionMessage::Rst,
            self.client_id,
            dst_client_id,
            session_id,
            reason as u32 as u64,
        );
        header.window_size = version;
        if let Err(e) = self.channel.forward(&MessageBuffer::control(header)) {
            debug!("Failed to send reset to client {}: {}", dst_client_id, e);
        }
    }

    /// Run one update pass over every session and drop the closed ones.
    ///
    /// Owner callbacks run with the session map locked.
    pub fn update_sessions(&self) {
        let mut sessions = lock(&self.sessions);
        for session in sessions.values() {
            session.update();
        }
        sessions.retain(|session_id, session| {
            let open = session.state() != SessionState::Closed;
            if !open {
                debug!(
                    "Removing closed session {:#010x} ({:?})",
                    session_id,
                    session.termination_reason()
                );
            }
            open
        });
    }

    /// Shut down every session with `client_id` after its transport went away
    pub fn handle_client_disconnection(&self, client_id: ClientId) {
        let sessions = lock(&self.sessions);
        for session in sessions.values() {
            if session.remote_client_id() == client_id {
                session.shutdown(ResultCode::Unavailable);
            }
        }
    }

    /// Call [`update_sessions`](Self::update_sessions) every `tick` until the
    /// manager is destroyed
    pub async fn run_updates(self: Arc<Self>, tick: Duration) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !self.destroyed.load(Ordering::Acquire) {
            interval.tick().await;
            self.update_sessions();
        }
        debug!("Session update loop for client {} stopped", self.client_id);
    }

    /// Stop accepting sessions, close every session gracefully and wait up
    /// to `deadline` for them to finish.
    ///
    /// Sessions still open at the deadline are aborted; their owners get
    /// `session_terminated` with `Aborted` and `NotReady` is returned.
    pub async fn destroy(&self, deadline: Duration) -> Result<(), SessionError> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        for session in lock(&self.sessions).values() {
            session.shutdown(ResultCode::Success);
        }

        let expires = Instant::now() + deadline;
        let mut interval = tokio::time::interval(self.config.update_interval);
        loop {
            self.update_sessions();
            if self.session_count() == 0 {
                self.destroyed.store(true, Ordering::Release);
                info!("Session manager for client {} destroyed", self.client_id);
                return Ok(());
            }
            if Instant::now() >= expires {
                break;
            }
            interval.tick().await;
        }

        let abandoned = {
            let sessions = lock(&self.sessions);
            for session in sessions.values() {
                session.shutdown(ResultCode::Aborted);
            }
            sessions.len()
        };
        self.update_sessions();
        self.destroyed.store(true, Ordering::Release);

        warn!(
            "Session manager for client {} aborted {} sessions after {:?}",
            self.client_id, abandoned, deadline
        );
        Err(SessionError::NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolSession;
    use crate::transport::LocalChannel;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    #[derive(Debug, Default)]
    struct TestServer {
        reject: bool,
        accepted: AtomicUsize,
        terminated: AtomicUsize,
    }

    impl ProtocolSession for TestServer {
        fn protocol(&self) -> Protocol {
            Protocol::Settings
        }
        fn session_established(&self, _session: &Arc<Session>) {}
        fn update_session(&self, _session: &Arc<Session>) {}
        fn session_terminated(&self, _session: &Arc<Session>, _reason: ResultCode) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ProtocolServer for TestServer {
        fn min_version(&self) -> Version {
            2
        }
        fn max_version(&self) -> Version {
            4
        }
        fn accept_session(&self, _session: &Arc<Session>) -> bool {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            !self.reject
        }
    }

    fn manager() -> (SessionManager, mpsc::Receiver<MessageBuffer>) {
        let (local, remote) = LocalChannel::pair(1, 2, 64);
        (SessionManager::new(local.channel, SessionConfig::default()), remote.inbound)
    }

    fn syn(min_version: Version, max_version: Version) -> MessageBuffer {
        let mut header = MessageHeader::session(SessionMessage::Syn, 2, 1, 0x0042, 1);
        header.window_size = 64;
        let payload = SynPayload {
            protocol: Protocol::Settings,
            session_version: dd_wire::SESSION_PROTOCOL_VERSION,
            min_version,
            max_version,
        };
        MessageBuffer::new(header, payload.encode()).unwrap()
    }

    #[test]
    fn test_session_ids_are_unique_and_valid() {
        let (manager, _rx) = manager();
        manager.last_session_id.store(u32::MAX - 1, Ordering::SeqCst);

        let mut sessions = HashMap::new();
        for _ in 0..4 {
            let id = manager.new_session_id(&sessions, INVALID_SESSION_ID);
            assert_ne!(id, INVALID_SESSION_ID);
            assert_eq!(id >> CLIENT_SESSION_ID_BITS, 0);
            let session = Arc::new(Session::new(manager.channel.clone(), manager.config.clone()));
            assert!(sessions.insert(id, session).is_none());
        }

        // The remote id lands in the high half
        let id = manager.new_session_id(&sessions, 0x1234);
        assert_eq!(id >> CLIENT_SESSION_ID_BITS, 0x1234);
    }

    #[test]
    fn test_duplicate_server_registration() {
        let (manager, _rx) = manager();
        let server: Arc<dyn ProtocolServer> = Arc::new(TestServer::default());
        manager.register_protocol_server(server.clone()).unwrap();
        assert!(manager.has_protocol_server(Protocol::Settings));
        assert_eq!(
            manager.register_protocol_server(server.clone()),
            Err(SessionError::Error)
        );

        manager.unregister_protocol_server(&server).unwrap();
        assert_eq!(manager.unregister_protocol_server(&server), Err(SessionError::Error));
    }

    #[tokio::test]
    async fn test_syn_creates_session_and_syn_ack() {
        let (manager, mut rx) = manager();
        let server = Arc::new(TestServer::default());
        manager.register_protocol_server(server.clone()).unwrap();

        manager.handle_received_session_message(&syn(1, 3));
        assert_eq!(manager.session_count(), 1);
        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);

        manager.update_sessions();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.session_message(), Ok(SessionMessage::SynAck));
        assert_eq!(reply.header.session_id >> CLIENT_SESSION_ID_BITS, 0x0042);

        let payload = SynAckPayload::decode(&reply.payload).unwrap();
        assert_eq!(payload.initial_session_id, 0x0042);
        assert_eq!(payload.sequence, 1);
        assert_eq!(payload.version, 3);
    }

    #[tokio::test]
    async fn test_version_mismatch_resets() {
        let (manager, mut rx) = manager();
        manager
            .register_protocol_server(Arc::new(TestServer::default()))
            .unwrap();

        manager.handle_received_session_message(&syn(5, 7));
        assert_eq!(manager.session_count(), 0);

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.session_message(), Ok(SessionMessage::Rst));
        assert_eq!(reply.header.session_id, 0x0042);
        assert_eq!(ResultCode::from_sequence(reply.header.sequence), ResultCode::VersionMismatch);
        assert_eq!(reply.header.window_size, 4);
    }

    #[tokio::test]
    async fn test_declined_session_is_removed() {
        let (manager, mut rx) = manager();
        let server = Arc::new(TestServer {
            reject: true,
            ..Default::default()
        });
        manager.register_protocol_server(server.clone()).unwrap();

        manager.handle_received_session_message(&syn(2, 2));
        assert_eq!(manager.session_count(), 0);
        assert_eq!(server.terminated.load(Ordering::SeqCst), 0);

        let reply = rx.recv().await.unwrap();
        assert_eq!(ResultCode::from_sequence(reply.header.sequence), ResultCode::Rejected);
    }

    #[tokio::test]
    async fn test_unknown_sessions() {
        let (manager, mut rx) = manager();

        // No server for the protocol
        manager.handle_received_session_message(&syn(1, 1));
        let reply = rx.recv().await.unwrap();
        assert_eq!(ResultCode::from_sequence(reply.header.sequence), ResultCode::Unavailable);

        // Data for an unknown session is reset
        let header = MessageHeader::session(SessionMessage::Data, 2, 1, 0x77, 5);
        let data = MessageBuffer::new(header, Bytes::from_static(b"x")).unwrap();
        manager.handle_received_session_message(&data);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.session_message(), Ok(SessionMessage::Rst));
        assert_eq!(reply.header.session_id, 0x77);

        // A reset for an unknown session is not answered
        let rst = MessageBuffer::control(MessageHeader::session(SessionMessage::Rst, 2, 1, 0x77, 4));
        manager.handle_received_session_message(&rst);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sessions_only_accept_their_remote_client() {
        let (manager, mut rx) = manager();
        manager
            .register_protocol_server(Arc::new(TestServer::default()))
            .unwrap();
        manager.handle_received_session_message(&syn(2, 2));
        manager.update_sessions();
        let session_id = rx.recv().await.unwrap().header.session_id;
        assert!(manager.find_open_session(2, session_id).is_some());
        assert!(manager.find_open_session(3, session_id).is_none());

        // Another client cannot reset the session
        let reason = ResultCode::Aborted as u32 as u64;
        let rst = MessageBuffer::control(MessageHeader::session(SessionMessage::Rst, 3, 1, session_id, reason));
        manager.handle_received_session_message(&rst);
        assert!(rx.try_recv().is_err());
        assert!(manager.find_open_session(2, session_id).is_some());

        // Its data is refused with a reset addressed back to it
        let header = MessageHeader::session(SessionMessage::Data, 3, 1, session_id, 2);
        let data = MessageBuffer::new(header, Bytes::from_static(b"x")).unwrap();
        manager.handle_received_session_message(&data);
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.session_message(), Ok(SessionMessage::Rst));
        assert_eq!(reply.header.dst_client_id, 3);
        assert_eq!(reply.header.session_id, session_id);
        assert!(manager.find_open_session(2, session_id).is_some());
    }

    #[tokio::test]
    async fn test_misaddressed_messages_are_dropped() {
        let (manager, mut rx) = manager();
        let mut message = syn(1, 3);
        message.header.dst_client_id = 9;
        manager.handle_received_session_message(&message);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_without_sessions() {
        let (manager, _rx) = manager();
        assert_eq!(manager.destroy(Duration::from_millis(10)).await, Ok(()));
        assert!(!manager.is_active());
        // Idempotent
        assert_eq!(manager.destroy(Duration::from_millis(10)).await, Ok(()));
    }
}
