//! Echo protocol spoken by the devdriver binary.
//!
//! The server sends every received message straight back; the client sends
//! numbered pings and checks that each echo matches.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use dd_session::{
    ProtocolClient, ProtocolServer, ProtocolSession, Session, SessionManager, SessionStats,
};
use dd_wire::{ClientId, Protocol, ResultCode, Version, MAX_PAYLOAD_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Protocol id the echo service runs on
pub const ECHO_PROTOCOL: Protocol = Protocol::Logging;

/// Echoes every message back on the session it arrived on
#[derive(Debug)]
pub struct EchoServer {
    min_version: Version,
    max_version: Version,
}

impl EchoServer {
    pub fn new(min_version: Version, max_version: Version) -> Self {
        Self {
            min_version,
            max_version,
        }
    }
}

async fn echo_loop(session: Arc<Session>) {
    loop {
        let payload = match session.receive(MAX_PAYLOAD_SIZE, None).await {
            Ok(payload) => payload,
            Err(e) => {
                crate::component_debug!("echo", "Session {:#010x} stopped reading: {}", session.session_id(), e);
                return;
            }
        };
        if let Err(e) = session.send(payload, None).await {
            crate::component_debug!("echo", "Session {:#010x} stopped echoing: {}", session.session_id(), e);
            return;
        }
    }
}

impl ProtocolSession for EchoServer {
    fn protocol(&self) -> Protocol {
        ECHO_PROTOCOL
    }

    fn session_established(&self, session: &Arc<Session>) {
        crate::component_info!(
            "echo",
            "Serving session {:#010x} for client {} at version {}",
            session.session_id(),
            session.remote_client_id(),
            session.protocol_version()
        );
        tokio::spawn(echo_loop(session.clone()));
    }

    fn update_session(&self, _session: &Arc<Session>) {}

    fn session_terminated(&self, session: &Arc<Session>, reason: ResultCode) {
        let stats = session.stats();
        crate::component_info!(
            "echo",
            "Session {:#010x} ended ({:?}): {} delivered, {} retransmitted",
            session.session_id(),
            reason,
            stats.delivered,
            stats.retransmitted
        );
    }
}

impl ProtocolServer for EchoServer {
    fn min_version(&self) -> Version {
        self.min_version
    }

    fn max_version(&self) -> Version {
        self.max_version
    }

    fn accept_session(&self, session: &Arc<Session>) -> bool {
        crate::component_debug!(
            "echo",
            "Accepting session {:#010x} from client {}",
            session.session_id(),
            session.remote_client_id()
        );
        true
    }
}

/// Lifecycle notifications delivered to the pinging task
#[derive(Debug)]
enum ClientEvent {
    Established(Arc<Session>),
    Terminated(ResultCode),
}

/// Client half of the echo protocol
#[derive(Debug)]
pub struct EchoClient {
    min_version: Version,
    max_version: Version,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl ProtocolSession for EchoClient {
    fn protocol(&self) -> Protocol {
        ECHO_PROTOCOL
    }

    fn session_established(&self, session: &Arc<Session>) {
        let _ = self.events.send(ClientEvent::Established(session.clone()));
    }

    fn update_session(&self, _session: &Arc<Session>) {}

    fn session_terminated(&self, _session: &Arc<Session>, reason: ResultCode) {
        let _ = self.events.send(ClientEvent::Terminated(reason));
    }
}

impl ProtocolClient for EchoClient {
    fn min_version(&self) -> Version {
        self.min_version
    }

    fn max_version(&self) -> Version {
        self.max_version
    }
}

/// Outcome of a ping run
#[derive(Debug, Clone)]
pub struct PingReport {
    /// Negotiated echo protocol version
    pub version: Version,
    /// Pings echoed back intact
    pub echoed: u32,
    /// Slowest round trip observed
    pub max_round_trip: Duration,
    /// Session counters at close
    pub stats: SessionStats,
    /// Why the session closed
    pub reason: ResultCode,
}

/// Ping parameters
#[derive(Debug, Clone)]
pub struct PingOptions {
    /// Client id of the echo server
    pub remote_client_id: ClientId,
    /// Lowest version offered
    pub min_version: Version,
    /// Highest version offered
    pub max_version: Version,
    /// Pings to send
    pub count: u32,
    /// Bytes per ping, at least large enough for the sequence tag
    pub payload_size: usize,
    /// Time allowed for each step
    pub timeout: Duration,
}

fn ping_payload(index: u32, size: usize) -> Bytes {
    let mut payload = format!("ping-{}", index).into_bytes();
    if payload.len() < size {
        payload.resize(size.min(MAX_PAYLOAD_SIZE), b'.');
    }
    Bytes::from(payload)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>, timeout: Duration) -> Result<ClientEvent> {
    tokio::time::timeout(timeout, events.recv())
        .await
        .context("timed out waiting for the session")?
        .ok_or_else(|| anyhow!("session owner dropped"))
}

/// Open an echo session, exchange `count` pings and close it gracefully
pub async fn run_pings(manager: &SessionManager, options: &PingOptions) -> Result<PingReport> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let client = Arc::new(EchoClient {
        min_version: options.min_version,
        max_version: options.max_version,
        events: tx,
    });

    manager
        .establish_session_for_client(client, options.remote_client_id)
        .map_err(|e| anyhow!("failed to open session: {}", e))?;

    let session = match next_event(&mut events, options.timeout).await? {
        ClientEvent::Established(session) => session,
        ClientEvent::Terminated(reason) => bail!("session was refused: {:?}", reason),
    };
    crate::component_info!(
        "ping",
        "Session {:#010x} established at version {}",
        session.session_id(),
        session.protocol_version()
    );

    let mut max_round_trip = Duration::ZERO;
    for index in 0..options.count {
        let payload = ping_payload(index, options.payload_size);
        let started = Instant::now();

        session
            .send(payload.clone(), Some(options.timeout))
            .await
            .map_err(|e| anyhow!("ping {} not sent: {}", index, e))?;
        let echo = session
            .receive(MAX_PAYLOAD_SIZE, Some(options.timeout))
            .await
            .map_err(|e| anyhow!("ping {} not echoed: {}", index, e))?;
        if echo != payload {
            bail!("ping {} came back corrupted", index);
        }

        max_round_trip = max_round_trip.max(started.elapsed());
    }

    session.shutdown(ResultCode::Success);
    let reason = match next_event(&mut events, options.timeout).await? {
        ClientEvent::Terminated(reason) => reason,
        ClientEvent::Established(_) => bail!("session established twice"),
    };

    Ok(PingReport {
        version: session.protocol_version(),
        echoed: options.count,
        max_round_trip,
        stats: session.stats(),
        reason,
    })
}
