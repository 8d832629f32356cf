//! Reliable ordered message session.
//!
//! A [`Session`] is one end of a logical stream multiplexed over a
//! [`MsgChannel`]. Incoming messages are applied with
//! [`Session::handle_message`]; transmission, retransmission, acknowledgement
//! and timeout-driven transitions happen in [`Session::update`], which the
//! manager calls once per tick. Callers use the async [`Session::send`] and
//! [`Session::receive`], which block on per-window semaphores.
//!
//! Locking: the two window mutexes are leaf locks and are never held while
//! calling into a protocol owner. State and identity live in atomics.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::protocol::{ProtocolClient, ProtocolServer, SessionOwner};
use crate::state::{FinAction, SessionState};
use crate::transport::MsgChannel;
use crate::window::{AckOutcome, ReceiveOutcome, ReceiveWindow, SendWindow};
use bytes::Bytes;
use dd_wire::{
    ClientId, MessageBuffer, MessageHeader, ResultCode, Sequence, SessionId, SessionMessage,
    SessionVersion, SynAckPayload, SynPayload, Version, WindowSize, BROADCAST_CLIENT_ID,
    INVALID_SESSION_ID, MAX_PAYLOAD_SIZE, SESSION_PROTOCOL_SYNACK_VERSION,
    SESSION_PROTOCOL_VERSION,
};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Snapshot of per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    /// Messages transmitted for the first time
    pub transmitted: u64,
    /// Messages resent after a timeout
    pub retransmitted: u64,
    /// Messages resent after duplicate acknowledgements
    pub fast_retransmitted: u64,
    /// Incoming messages that were already received
    pub duplicates_received: u64,
    /// Messages handed to the consumer
    pub delivered: u64,
    /// Smoothed round-trip time in milliseconds
    pub round_trip_time_ms: f32,
}

#[derive(Debug, Default)]
struct Counters {
    transmitted: AtomicU64,
    retransmitted: AtomicU64,
    fast_retransmitted: AtomicU64,
    duplicates_received: AtomicU64,
    delivered: AtomicU64,
}

enum Acquire {
    Acquired,
    TimedOut,
    Closed,
}

async fn acquire(semaphore: &Semaphore, timeout: Option<Duration>) -> Acquire {
    let permit = match timeout {
        Some(timeout) if timeout.is_zero() => match semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Acquire::TimedOut,
            Err(TryAcquireError::Closed) => return Acquire::Closed,
        },
        Some(timeout) => match tokio::time::timeout(timeout, semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Acquire::Closed,
            Err(_) => return Acquire::TimedOut,
        },
        None => match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Acquire::Closed,
        },
    };
    // Permits are returned explicitly when a slot frees up
    permit.forget();
    Acquire::Acquired
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One end of a reliable session
#[derive(Debug)]
pub struct Session {
    config: Arc<SessionConfig>,
    channel: Arc<dyn MsgChannel>,
    client_id: ClientId,
    remote_client_id: AtomicU16,
    session_id: AtomicU32,
    state: AtomicU8,
    termination_reason: AtomicU32,
    protocol_version: AtomicU16,
    session_version: AtomicU16,
    rejected_version: AtomicU16,
    /// Mirrors `ReceiveWindow::current_available_size` for outgoing headers
    advertised_window: AtomicU16,
    owner: Mutex<Option<SessionOwner>>,
    send_window: Mutex<SendWindow>,
    receive_window: Mutex<ReceiveWindow>,
    send_permits: Semaphore,
    receive_permits: Semaphore,
    counters: Counters,
}

impl Session {
    /// Create a closed session on `channel`
    pub fn new(channel: Arc<dyn MsgChannel>, config: Arc<SessionConfig>) -> Self {
        let receive_window = ReceiveWindow::new(config.window_size);
        let advertised = receive_window.current_available_size;
        let send_window = SendWindow::new(config.window_size);
        let slots = send_window.size();

        Self {
            client_id: channel.client_id(),
            channel,
            remote_client_id: AtomicU16::new(BROADCAST_CLIENT_ID),
            session_id: AtomicU32::new(INVALID_SESSION_ID),
            state: AtomicU8::new(SessionState::Closed as u8),
            termination_reason: AtomicU32::new(ResultCode::Success as u32),
            protocol_version: AtomicU16::new(0),
            session_version: AtomicU16::new(SESSION_PROTOCOL_VERSION),
            rejected_version: AtomicU16::new(0),
            advertised_window: AtomicU16::new(advertised),
            owner: Mutex::new(None),
            send_window: Mutex::new(send_window),
            receive_window: Mutex::new(receive_window),
            send_permits: Semaphore::new(slots),
            receive_permits: Semaphore::new(0),
            counters: Counters::default(),
            config,
        }
    }

    /// Current protocol state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Session id; changes once when the SynAck assigns the final id
    pub fn session_id(&self) -> SessionId {
        self.session_id.load(Ordering::Acquire)
    }

    /// Local client id
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Client id of the peer
    pub fn remote_client_id(&self) -> ClientId {
        self.remote_client_id.load(Ordering::Acquire)
    }

    /// Negotiated protocol version
    pub fn protocol_version(&self) -> Version {
        self.protocol_version.load(Ordering::Acquire)
    }

    /// Negotiated session protocol version
    pub fn session_version(&self) -> SessionVersion {
        self.session_version.load(Ordering::Acquire)
    }

    /// Why the session closed, or is closing
    pub fn termination_reason(&self) -> ResultCode {
        ResultCode::from_sequence(u64::from(self.termination_reason.load(Ordering::Acquire)))
    }

    /// Version the peer reported when it rejected the session with `VersionMismatch`
    pub fn rejected_version(&self) -> Option<Version> {
        match self.rejected_version.load(Ordering::Acquire) {
            0 => None,
            version => Some(version),
        }
    }

    /// Whether a protocol owner is still attached
    pub fn has_owner(&self) -> bool {
        lock(&self.owner).is_some()
    }

    /// Counter snapshot
    pub fn stats(&self) -> SessionStats {
        let round_trip_time_ms = lock(&self.send_window).round_trip_time_ms;
        SessionStats {
            transmitted: self.counters.transmitted.load(Ordering::Relaxed),
            retransmitted: self.counters.retransmitted.load(Ordering::Relaxed),
            fast_retransmitted: self.counters.fast_retransmitted.load(Ordering::Relaxed),
            duplicates_received: self.counters.duplicates_received.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            round_trip_time_ms,
        }
    }

    fn owner(&self) -> Option<SessionOwner> {
        lock(&self.owner).clone()
    }

    fn set_state(&self, next: SessionState) {
        let previous = SessionState::from_u8(self.state.swap(next as u8, Ordering::AcqRel));
        self.on_transition(previous, next);
    }

    fn on_transition(&self, previous: SessionState, next: SessionState) {
        if previous == next {
            return;
        }
        debug!(
            "Session {:#010x} transitioned states: {} -> {}",
            self.session_id(),
            previous,
            next
        );
        if next == SessionState::Closed {
            // Wake blocked senders and receivers
            self.send_permits.close();
            self.receive_permits.close();
        }
    }

    fn set_termination_reason(&self, reason: ResultCode) {
        self.termination_reason.store(reason as u32, Ordering::Release);
    }

    /// Error reported to callers once the session is closed
    fn closed_error(&self) -> SessionError {
        match SessionError::check(self.termination_reason()) {
            Ok(()) => SessionError::EndOfStream,
            Err(err) => err,
        }
    }

    /// Open a session to `remote_client_id` on behalf of `owner`, queueing a Syn
    pub fn connect(
        &self,
        owner: Arc<dyn ProtocolClient>,
        remote_client_id: ClientId,
        session_id: SessionId,
    ) -> Result<(), SessionError> {
        if remote_client_id == BROADCAST_CLIENT_ID
            || session_id == INVALID_SESSION_ID
            || self.state() != SessionState::Closed
        {
            return Err(SessionError::Error);
        }

        self.remote_client_id.store(remote_client_id, Ordering::Release);
        self.session_id.store(session_id, Ordering::Release);

        let payload = SynPayload {
            protocol: owner.protocol(),
            session_version: self.session_version(),
            min_version: owner.min_version(),
            max_version: owner.max_version(),
        };
        *lock(&self.owner) = Some(SessionOwner::Client(owner));

        self.enqueue_control(SessionMessage::Syn, payload.encode())?;
        self.set_state(SessionState::SynSent);
        debug!(
            "Session {:#010x} requesting {:?} [{}, {}] from client {}",
            session_id, payload.protocol, payload.min_version, payload.max_version, remote_client_id
        );
        Ok(())
    }

    /// Bind an accepted session to `owner` after version negotiation
    pub fn bind_to_server(
        &self,
        owner: Arc<dyn ProtocolServer>,
        remote_client_id: ClientId,
        session_version: SessionVersion,
        protocol_version: Version,
        session_id: SessionId,
    ) -> Result<(), SessionError> {
        if remote_client_id == BROADCAST_CLIENT_ID
            || session_id == INVALID_SESSION_ID
            || self.state() != SessionState::Closed
        {
            return Err(SessionError::Error);
        }

        *lock(&self.owner) = Some(SessionOwner::Server(owner));
        self.remote_client_id.store(remote_client_id, Ordering::Release);
        self.session_version
            .store(session_version.min(SESSION_PROTOCOL_VERSION), Ordering::Release);
        self.protocol_version.store(protocol_version, Ordering::Release);
        self.session_id.store(session_id, Ordering::Release);
        self.set_state(SessionState::Listening);
        Ok(())
    }

    /// Apply an incoming session protocol message
    pub fn handle_message(self: &Arc<Self>, message: &MessageBuffer) {
        let initial = self.state();

        match message.session_message() {
            Ok(SessionMessage::Syn) => self.handle_syn(message),
            Ok(SessionMessage::SynAck) => self.handle_syn_ack(message),
            Ok(SessionMessage::Fin) => self.handle_fin(message),
            Ok(SessionMessage::Data) => self.handle_data(message),
            Ok(SessionMessage::Ack) => self.handle_ack(message),
            Ok(SessionMessage::Rst) => {
                self.handle_rst(message);
                return;
            }
            Err(e) => {
                debug!("Session {:#010x} ignoring message: {}", self.session_id(), e);
                return;
            }
        }

        lock(&self.send_window).last_available_size = message.header.window_size;

        let state = self.state();
        if state != initial && state == SessionState::Established {
            match self.owner() {
                Some(owner) => {
                    info!(
                        "Session {:#010x} established with client {} (version {})",
                        self.session_id(),
                        self.remote_client_id(),
                        self.protocol_version()
                    );
                    owner.session_established(self);
                }
                None => self.shutdown(ResultCode::Error),
            }
        }
    }

    fn handle_syn(&self, message: &MessageBuffer) {
        if self.state() != SessionState::Listening {
            // A retransmitted Syn is answered by the SynAck retransmission
            return;
        }

        let payload = SynAckPayload {
            initial_session_id: message.header.session_id,
            sequence: message.header.sequence,
            version: self.protocol_version(),
            session_version: self.session_version(),
        };

        match self.enqueue_control(SessionMessage::SynAck, payload.encode()) {
            Ok(()) => {
                self.set_state(SessionState::SynReceived);
                let mut window = lock(&self.receive_window);
                window.reset(message.header.sequence + 1);
                self.advertised_window
                    .store(window.current_available_size, Ordering::Release);
            }
            Err(_) => self.shutdown(ResultCode::Error),
        }
    }

    fn handle_syn_ack(&self, message: &MessageBuffer) {
        let payload = match SynAckPayload::decode(&message.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Session {:#010x} received bad SynAck: {}", self.session_id(), e);
                return;
            }
        };

        match self.state() {
            SessionState::SynSent => {
                self.mark_acknowledged(payload.sequence);

                self.session_version.store(
                    payload.session_version.min(SESSION_PROTOCOL_VERSION),
                    Ordering::Release,
                );
                self.session_id.store(message.header.session_id, Ordering::Release);
                let version = if payload.version != 0 {
                    payload.version
                } else {
                    self.owner().map(|owner| owner.min_version()).unwrap_or(0)
                };
                self.protocol_version.store(version, Ordering::Release);

                let mut window = lock(&self.receive_window);
                window.reset(message.header.sequence + 1);
                self.set_state(SessionState::Established);
                self.send_ack(&mut window);
            }
            SessionState::Established
            | SessionState::FinWait1
            | SessionState::FinWait2
            | SessionState::Closing => {
                // Our Ack for the SynAck was lost; repeat it so the peer can
                // leave SynReceived
                let outstanding = lock(&self.send_window).next_unacknowledged;
                if payload.sequence >= outstanding {
                    self.mark_acknowledged(payload.sequence);
                }
                debug!("Session {:#010x} re-acknowledging SynAck", self.session_id());
                self.send_ack(&mut lock(&self.receive_window));
            }
            _ => {}
        }
    }

    fn handle_fin(&self, message: &MessageBuffer) {
        match self.state().on_fin() {
            FinAction::Drain => {
                self.write_into_receive_window(message);
                if self.state() != SessionState::Closing {
                    self.set_termination_reason(ResultCode::Success);
                    self.set_state(SessionState::Closing);
                }
            }
            FinAction::AckAndClose => {
                self.write_into_receive_window(message);
                self.send_ack(&mut lock(&self.receive_window));
                self.set_termination_reason(ResultCode::Success);
                self.set_state(SessionState::Closed);
            }
            FinAction::Ignore => {}
        }
    }

    fn handle_data(&self, message: &MessageBuffer) {
        if self.state().accepts_data() {
            self.write_into_receive_window(message);
        }
    }

    fn handle_ack(&self, message: &MessageBuffer) {
        let state = self.state();
        if !state.processes_acks() {
            return;
        }
        if let Some(next) = state.on_ack() {
            self.set_state(next);
        }
        self.mark_acknowledged(message.header.sequence);
    }

    fn handle_rst(&self, message: &MessageBuffer) {
        let reason = ResultCode::from_sequence(message.header.sequence);
        if reason == ResultCode::VersionMismatch {
            self.rejected_version
                .store(message.header.window_size, Ordering::Release);
        }
        warn!(
            "Session {:#010x} reset by client {}: {:?}",
            self.session_id(),
            message.header.src_client_id,
            reason
        );
        self.shutdown(reason);
    }

    /// Forward a message, closing the session on a hard transport error.
    ///
    /// Backpressure is retried a bounded number of times; if the transport
    /// stays full the message is left for the retransmit path.
    fn send_or_close(&self, message: &MessageBuffer) -> bool {
        let mut attempts = 0;
        loop {
            match self.channel.forward(message) {
                Ok(()) => return true,
                Err(SessionError::NotReady) if attempts < self.config.forward_retry_limit => {
                    attempts += 1;
                    std::thread::yield_now();
                }
                Err(SessionError::NotReady) => {
                    debug!(
                        "Session {:#010x} transport saturated, deferring seq {}",
                        self.session_id(),
                        message.header.sequence
                    );
                    return false;
                }
                Err(e) => {
                    warn!("Session {:#010x} transport failed: {}", self.session_id(), e);
                    self.shutdown(ResultCode::Error);
                    return false;
                }
            }
        }
    }

    fn control_message(&self, message: SessionMessage, sequence: Sequence) -> MessageBuffer {
        let mut header = MessageHeader::session(
            message,
            self.client_id,
            self.remote_client_id(),
            self.session_id(),
            sequence,
        );
        header.window_size = self.advertised_window.load(Ordering::Acquire);
        MessageBuffer::control(header)
    }

    /// Acknowledge everything received so far. Takes the receive window guard
    /// to keep the watermark and the transmitted Ack consistent.
    fn send_ack(&self, window: &mut ReceiveWindow) -> bool {
        let watermark = window.prepare_ack();
        self.advertised_window
            .store(window.current_available_size, Ordering::Release);
        let ack = self.control_message(SessionMessage::Ack, watermark);
        self.send_or_close(&ack)
    }

    fn mark_acknowledged(&self, watermark: Sequence) {
        let mut window = lock(&self.send_window);
        let outcome = window.acknowledge(
            watermark,
            Instant::now(),
            self.config.rtt_alpha(),
            self.config.fast_retransmit_threshold,
        );

        match outcome {
            AckOutcome::Advanced { freed } => {
                self.send_permits.add_permits(freed as usize);
                debug!(
                    "Session {:#010x} acknowledged through {}, rtt {:.2}ms",
                    self.session_id(),
                    watermark,
                    window.round_trip_time_ms
                );
            }
            AckOutcome::Duplicate => {}
            AckOutcome::FastRetransmit(sequence) => {
                let advertised = self.advertised_window.load(Ordering::Acquire);
                if let Some(message) = window.message(sequence, advertised) {
                    debug!("Session {:#010x} fast retransmit seq {}", self.session_id(), sequence);
                    if self.send_or_close(&message) {
                        // Keep the timeout path from resending the same message
                        window.retransmit_count = 0;
                        self.counters.fast_retransmitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    fn write_into_receive_window(&self, message: &MessageBuffer) {
        let mut window = lock(&self.receive_window);
        match window.write(message, self.config.max_unacknowledged) {
            ReceiveOutcome::Stored { released, ack_now } => {
                if released > 0 {
                    self.receive_permits.add_permits(released as usize);
                }
                if ack_now {
                    self.send_ack(&mut window);
                }
            }
            ReceiveOutcome::Duplicate => {
                self.counters.duplicates_received.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Session {:#010x} re-ack seq {}",
                    self.session_id(),
                    window.next_expected.saturating_sub(1)
                );
                self.send_ack(&mut window);
            }
            ReceiveOutcome::OutOfWindow => {
                debug!(
                    "Session {:#010x} dropped seq {} outside the receive window",
                    self.session_id(),
                    message.header.sequence
                );
            }
        }
    }

    fn push_message(&self, message: SessionMessage, payload: Bytes) -> Result<Sequence, SessionError> {
        let mut header = MessageHeader::session(
            message,
            self.client_id,
            self.remote_client_id(),
            self.session_id(),
            0,
        );
        header.window_size = self.advertised_window.load(Ordering::Acquire);
        let buffer = MessageBuffer::new(header, payload)?;
        Ok(lock(&self.send_window).push(buffer))
    }

    /// Queue a handshake or Fin message without blocking
    fn enqueue_control(&self, message: SessionMessage, payload: Bytes) -> Result<(), SessionError> {
        match self.send_permits.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => return Err(SessionError::NotReady),
            Err(TryAcquireError::Closed) => return Err(self.closed_error()),
        }
        if let Err(e) = self.push_message(message, payload) {
            self.send_permits.add_permits(1);
            return Err(e);
        }
        Ok(())
    }

    /// Queue `payload` for reliable delivery.
    ///
    /// Waits up to `timeout` for a free send window slot (`None` waits
    /// forever, zero polls). Returns `NotReady` if no slot freed up in time.
    pub async fn send(&self, payload: Bytes, timeout: Option<Duration>) -> Result<(), SessionError> {
        let state = self.state();
        if !state.can_send() {
            return Err(SessionError::Error);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(SessionError::InsufficientMemory);
        }

        match acquire(&self.send_permits, timeout).await {
            Acquire::Acquired => {}
            Acquire::TimedOut => return Err(SessionError::NotReady),
            Acquire::Closed => return Err(self.closed_error()),
        }

        if let Err(e) = self.push_message(SessionMessage::Data, payload) {
            self.send_permits.add_permits(1);
            return Err(e);
        }
        Ok(())
    }

    /// Take the next message in sequence order.
    ///
    /// Fails with `InsufficientMemory` (leaving the message in place) if it
    /// is larger than `max_size`, and with `EndOfStream` once the peer's Fin
    /// is reached.
    pub async fn receive(&self, max_size: usize, timeout: Option<Duration>) -> Result<Bytes, SessionError> {
        let state = self.state();
        if state == SessionState::Closed {
            return self.read_after_close(max_size);
        }
        if !state.can_receive() {
            return Err(SessionError::Error);
        }

        match acquire(&self.receive_permits, timeout).await {
            Acquire::Acquired => self.read_front(max_size),
            Acquire::TimedOut => Err(SessionError::NotReady),
            Acquire::Closed => self.read_after_close(max_size),
        }
    }

    fn read_front(&self, max_size: usize) -> Result<Bytes, SessionError> {
        let mut window = lock(&self.receive_window);
        let size = match window.front() {
            Some(front) => front.payload.len(),
            None => return Err(SessionError::Error),
        };
        if size > max_size {
            self.receive_permits.add_permits(1);
            return Err(SessionError::InsufficientMemory);
        }

        let message = window.consume_front().ok_or(SessionError::Error)?;
        let is_fin = message.session_message() == Ok(SessionMessage::Fin);
        if is_fin && window.pending_ack() {
            // The peer's Fin must be acknowledged before the session goes away
            self.send_ack(&mut window);
        }
        self.advertised_window
            .store(window.current_available_size, Ordering::Release);
        drop(window);

        if is_fin {
            self.set_state(SessionState::Closed);
            return Err(SessionError::EndOfStream);
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(message.payload)
    }

    /// Drain whatever the session buffered before it closed
    fn read_after_close(&self, max_size: usize) -> Result<Bytes, SessionError> {
        let mut window = lock(&self.receive_window);
        let (size, is_fin) = match window.front() {
            Some(front) => (
                front.payload.len(),
                front.session_message() == Ok(SessionMessage::Fin),
            ),
            None => return Err(self.closed_error()),
        };
        if is_fin {
            return Err(SessionError::EndOfStream);
        }
        if size > max_size {
            return Err(SessionError::InsufficientMemory);
        }
        let message = window.consume_front().ok_or(SessionError::Error)?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(message.payload)
    }

    /// Drive the session: acknowledge received data, (re)transmit, and apply
    /// timeout transitions. Then notify the owner: `session_terminated` once
    /// the session is closed, `update_session` while it is open.
    pub fn update(self: &Arc<Self>) {
        if self.state() != SessionState::Closed {
            self.update_receive_window();
            self.update_send_window();
            self.update_timeout();
        }

        if self.state() == SessionState::Closed {
            let owner = lock(&self.owner).take();
            if let Some(owner) = owner {
                let reason = self.termination_reason();
                info!("Session {:#010x} terminated: {:?}", self.session_id(), reason);
                owner.session_terminated(self, reason);
            }
        } else if self.state() >= SessionState::Established {
            if let Some(owner) = self.owner() {
                owner.update_session(self);
            }
        }
    }

    fn update_receive_window(&self) {
        let mut window = lock(&self.receive_window);
        if window.pending_ack() {
            self.send_ack(&mut window);
        }
    }

    fn update_send_window(&self) {
        let mut window = lock(&self.send_window);

        if window.has_unacknowledged() {
            if window.retransmit_count <= self.config.max_retransmits {
                let timeout = self
                    .config
                    .retransmit_timeout(window.round_trip_time_ms, window.retransmit_count);
                let advertised = self.advertised_window.load(Ordering::Acquire);

                let mut count = 0u64;
                for sequence in window.timed_out(Instant::now(), timeout) {
                    let Some(message) = window.message(sequence, advertised) else {
                        break;
                    };
                    if !self.send_or_close(&message) {
                        break;
                    }
                    count += 1;
                }

                if count > 0 {
                    warn!(
                        "Session {:#010x} retransmitted {} messages (rtt {:.2}ms, timeout {:?}, attempt {})",
                        self.session_id(),
                        count,
                        window.round_trip_time_ms,
                        timeout,
                        window.retransmit_count + 1
                    );
                    window.retransmit_count += 1;
                    self.counters.retransmitted.fetch_add(count, Ordering::Relaxed);
                }
            } else {
                warn!(
                    "Session {:#010x} exceeded {} retransmits",
                    self.session_id(),
                    self.config.max_retransmits
                );
                self.shutdown(ResultCode::NotReady);
            }
        }

        if self.state() == SessionState::Closed {
            return;
        }

        while let Some(sequence) = window.next_unsent() {
            let advertised = self.advertised_window.load(Ordering::Acquire);
            let Some(message) = window.message(sequence, advertised) else {
                break;
            };
            match self.channel.forward(&message) {
                Ok(()) => {
                    window.mark_transmitted(sequence, Instant::now());
                    self.counters.transmitted.fetch_add(1, Ordering::Relaxed);
                }
                Err(SessionError::NotReady) => break,
                Err(e) => {
                    warn!("Session {:#010x} transport failed: {}", self.session_id(), e);
                    self.shutdown(ResultCode::Error);
                    break;
                }
            }
        }
    }

    fn update_timeout(&self) {
        if self.state() == SessionState::FinWait1 {
            match self.enqueue_control(SessionMessage::Fin, Bytes::new()) {
                Ok(()) => {
                    // A concurrent Fin from the peer may have moved us to Closing
                    let swapped = self.state.compare_exchange(
                        SessionState::FinWait1 as u8,
                        SessionState::FinWait2 as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    if swapped.is_ok() {
                        self.on_transition(SessionState::FinWait1, SessionState::FinWait2);
                    }
                    debug!("Session {:#010x} queued Fin", self.session_id());
                }
                Err(SessionError::NotReady) => {
                    // Window full, retried on the next tick
                }
                Err(e) => {
                    debug!("Session {:#010x} could not queue Fin: {}", self.session_id(), e);
                }
            }
        }

        if self.state() == SessionState::FinWait2 {
            let require_drained = self.session_version() >= SESSION_PROTOCOL_SYNACK_VERSION;
            if lock(&self.send_window).is_empty(require_drained) {
                self.set_state(SessionState::Closed);
            }
        }

        if self.state() == SessionState::Closing && lock(&self.receive_window).front_is_fin() {
            self.set_state(SessionState::Closed);
        }
    }

    /// Request termination. `Success` closes gracefully through the Fin
    /// exchange where possible; any other reason closes immediately.
    /// Idempotent and safe from any state.
    pub fn shutdown(&self, reason: ResultCode) {
        let graceful = reason == ResultCode::Success;
        let mut previous = self.state();
        loop {
            if previous != SessionState::Closed {
                self.set_termination_reason(reason);
            }
            let next = previous.on_shutdown(graceful);
            match self.state.compare_exchange(
                previous as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.on_transition(previous, next);
                    return;
                }
                Err(actual) => previous = SessionState::from_u8(actual),
            }
        }
    }

    /// Detach the owner so it receives no further callbacks
    pub fn orphan(&self) {
        lock(&self.owner).take();
    }

    /// Orphan the session, then shut it down with `reason`
    pub fn close(&self, reason: ResultCode) {
        self.orphan();
        self.shutdown(reason);
    }

    /// Close the session if `server` owns it. Returns whether it did.
    pub fn close_if_owned_by(&self, server: &Arc<dyn ProtocolServer>) -> bool {
        let addr = Arc::as_ptr(server) as *const ();
        let owned = {
            let mut owner = lock(&self.owner);
            if owner.as_ref().map(SessionOwner::addr) == Some(addr) {
                owner.take();
                true
            } else {
                false
            }
        };
        if owned {
            self.shutdown(ResultCode::Success);
        }
        owned
    }

    /// Window bookkeeping, for diagnostics and tests
    pub fn send_window_occupancy(&self) -> u64 {
        lock(&self.send_window).occupied()
    }

    /// Receive window size currently advertised to the peer
    pub fn advertised_window(&self) -> WindowSize {
        self.advertised_window.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolSession;
    use dd_wire::Protocol;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    const LOCAL: ClientId = 1;
    const PEER: ClientId = 2;
    const PROVISIONAL_ID: SessionId = 0x0000_0007;
    const FINAL_ID: SessionId = 0x0007_0031;

    #[derive(Debug, Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<MessageBuffer>>,
        disconnected: AtomicBool,
    }

    impl RecordingChannel {
        fn take(&self) -> Vec<MessageBuffer> {
            std::mem::take(&mut *lock(&self.sent))
        }
    }

    impl MsgChannel for RecordingChannel {
        fn client_id(&self) -> ClientId {
            LOCAL
        }

        fn forward(&self, message: &MessageBuffer) -> Result<(), SessionError> {
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(SessionError::Unavailable);
            }
            lock(&self.sent).push(message.clone());
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct Recorder {
        established: AtomicUsize,
        updates: AtomicUsize,
        terminated: Mutex<Vec<ResultCode>>,
    }

    impl ProtocolSession for Recorder {
        fn protocol(&self) -> Protocol {
            Protocol::Logging
        }
        fn session_established(&self, _session: &Arc<Session>) {
            self.established.fetch_add(1, Ordering::SeqCst);
        }
        fn update_session(&self, _session: &Arc<Session>) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        fn session_terminated(&self, _session: &Arc<Session>, reason: ResultCode) {
            lock(&self.terminated).push(reason);
        }
    }

    impl ProtocolClient for Recorder {
        fn min_version(&self) -> Version {
            1
        }
        fn max_version(&self) -> Version {
            3
        }
    }

    impl ProtocolServer for Recorder {
        fn min_version(&self) -> Version {
            2
        }
        fn max_version(&self) -> Version {
            3
        }
        fn accept_session(&self, _session: &Arc<Session>) -> bool {
            true
        }
    }

    fn from_peer(kind: SessionMessage, session_id: SessionId, sequence: Sequence, payload: Bytes) -> MessageBuffer {
        let mut header = MessageHeader::session(kind, PEER, LOCAL, session_id, sequence);
        header.window_size = 64;
        MessageBuffer::new(header, payload).unwrap()
    }

    fn new_session() -> (Arc<Session>, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::default());
        let session = Arc::new(Session::new(channel.clone(), Arc::new(SessionConfig::default())));
        (session, channel)
    }

    fn syn_ack(sequence: Sequence) -> MessageBuffer {
        let payload = SynAckPayload {
            initial_session_id: PROVISIONAL_ID,
            sequence,
            version: 2,
            session_version: SESSION_PROTOCOL_VERSION,
        };
        from_peer(SessionMessage::SynAck, FINAL_ID, 1, payload.encode())
    }

    /// Client session that completed its handshake; the peer's next sequence is 2
    fn established_client() -> (Arc<Session>, Arc<RecordingChannel>, Arc<Recorder>) {
        let (session, channel) = new_session();
        let owner = Arc::new(Recorder::default());
        session.connect(owner.clone(), PEER, PROVISIONAL_ID).unwrap();
        session.update();
        session.handle_message(&syn_ack(1));
        channel.take();
        (session, channel, owner)
    }

    #[test]
    fn test_connect_transmits_syn() {
        let (session, channel) = new_session();
        let owner = Arc::new(Recorder::default());

        session.connect(owner.clone(), PEER, PROVISIONAL_ID).unwrap();
        assert_eq!(session.state(), SessionState::SynSent);
        assert_eq!(
            session.connect(owner, PEER, PROVISIONAL_ID),
            Err(SessionError::Error)
        );

        session.update();
        let sent = channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_message(), Ok(SessionMessage::Syn));
        assert_eq!(sent[0].header.sequence, 1);
        assert_eq!(sent[0].header.dst_client_id, PEER);

        let payload = SynPayload::decode(&sent[0].payload).unwrap();
        assert_eq!(payload.protocol, Protocol::Logging);
        assert_eq!(payload.version_range(), (1, 3));
    }

    #[test]
    fn test_connect_validates_arguments() {
        let (session, _channel) = new_session();
        let owner = Arc::new(Recorder::default());
        assert_eq!(
            session.connect(owner.clone(), BROADCAST_CLIENT_ID, PROVISIONAL_ID),
            Err(SessionError::Error)
        );
        assert_eq!(
            session.connect(owner, PEER, INVALID_SESSION_ID),
            Err(SessionError::Error)
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_syn_ack_establishes_client() {
        let (session, channel) = new_session();
        let owner = Arc::new(Recorder::default());
        session.connect(owner.clone(), PEER, PROVISIONAL_ID).unwrap();
        session.update();
        channel.take();

        session.handle_message(&syn_ack(1));
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(session.session_id(), FINAL_ID);
        assert_eq!(session.protocol_version(), 2);
        assert_eq!(owner.established.load(Ordering::SeqCst), 1);
        assert_eq!(session.send_window_occupancy(), 0);

        let sent = channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_message(), Ok(SessionMessage::Ack));
        assert_eq!(sent[0].header.sequence, 1);
        assert_eq!(sent[0].header.session_id, FINAL_ID);

        // A repeated SynAck is answered with another Ack and nothing else changes
        session.handle_message(&syn_ack(1));
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(owner.established.load(Ordering::SeqCst), 1);
        let sent = channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_message(), Ok(SessionMessage::Ack));
    }

    #[test]
    fn test_server_handshake() {
        let (session, channel) = new_session();
        let owner = Arc::new(Recorder::default());
        session
            .bind_to_server(owner.clone(), PEER, SESSION_PROTOCOL_VERSION, 3, FINAL_ID)
            .unwrap();
        assert_eq!(session.state(), SessionState::Listening);

        let request = SynPayload {
            protocol: Protocol::Logging,
            session_version: SESSION_PROTOCOL_VERSION,
            min_version: 1,
            max_version: 3,
        };
        session.handle_message(&from_peer(SessionMessage::Syn, PROVISIONAL_ID, 1, request.encode()));
        assert_eq!(session.state(), SessionState::SynReceived);

        session.update();
        let sent = channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_message(), Ok(SessionMessage::SynAck));
        assert_eq!(sent[0].header.session_id, FINAL_ID);
        let payload = SynAckPayload::decode(&sent[0].payload).unwrap();
        assert_eq!(payload.initial_session_id, PROVISIONAL_ID);
        assert_eq!(payload.sequence, 1);
        assert_eq!(payload.version, 3);

        session.handle_message(&from_peer(SessionMessage::Ack, FINAL_ID, 1, Bytes::new()));
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(owner.established.load(Ordering::SeqCst), 1);
        assert_eq!(session.send_window_occupancy(), 0);

        session.update();
        assert_eq!(owner.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_receive_in_order_and_small_buffer() {
        let (session, channel, _owner) = established_client();

        session.handle_message(&from_peer(SessionMessage::Data, FINAL_ID, 2, Bytes::from_static(b"hello")));
        assert_eq!(
            session.receive(2, Some(Duration::ZERO)).await,
            Err(SessionError::InsufficientMemory)
        );
        assert_eq!(
            session.receive(64, Some(Duration::ZERO)).await,
            Ok(Bytes::from_static(b"hello"))
        );
        assert_eq!(
            session.receive(64, Some(Duration::ZERO)).await,
            Err(SessionError::NotReady)
        );

        // Acknowledged on the next update
        session.update();
        let sent = channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_message(), Ok(SessionMessage::Ack));
        assert_eq!(sent[0].header.sequence, 2);
    }

    #[tokio::test]
    async fn test_duplicate_data_is_reacknowledged() {
        let (session, channel, _owner) = established_client();
        let data = from_peer(SessionMessage::Data, FINAL_ID, 2, Bytes::from_static(b"once"));

        session.handle_message(&data);
        session.handle_message(&data);

        let sent = channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].header.sequence, 2);
        assert_eq!(session.stats().duplicates_received, 1);

        assert_eq!(session.receive(64, None).await, Ok(Bytes::from_static(b"once")));
        assert_eq!(
            session.receive(64, Some(Duration::ZERO)).await,
            Err(SessionError::NotReady)
        );
    }

    #[tokio::test]
    async fn test_send_checks() {
        let (session, _channel) = new_session();
        assert_eq!(
            session.send(Bytes::from_static(b"x"), None).await,
            Err(SessionError::Error)
        );

        let (session, _channel, _owner) = established_client();
        let oversized = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert_eq!(
            session.send(oversized, None).await,
            Err(SessionError::InsufficientMemory)
        );
        assert_eq!(session.send(Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE]), None).await, Ok(()));
        assert_eq!(session.send_window_occupancy(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_acks_fast_retransmit() {
        let (session, channel, _owner) = established_client();
        for _ in 0..4 {
            session.send(Bytes::from_static(b"data"), None).await.unwrap();
        }
        session.update();
        assert_eq!(channel.take().len(), 4);

        // The peer only has sequence 1 and keeps repeating it
        let ack = from_peer(SessionMessage::Ack, FINAL_ID, 1, Bytes::new());
        session.handle_message(&ack);
        session.handle_message(&ack);
        assert!(channel.take().is_empty());

        session.handle_message(&ack);
        let sent = channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_message(), Ok(SessionMessage::Data));
        assert_eq!(sent[0].header.sequence, 2);
        assert_eq!(session.stats().fast_retransmitted, 1);
    }

    #[tokio::test]
    async fn test_graceful_close() {
        let (session, channel, owner) = established_client();

        session.shutdown(ResultCode::Success);
        assert_eq!(session.state(), SessionState::FinWait1);
        assert_eq!(
            session.send(Bytes::from_static(b"late"), Some(Duration::ZERO)).await,
            Ok(())
        );

        session.update();
        assert_eq!(session.state(), SessionState::FinWait2);
        session.update();
        let sent = channel.take();
        let kinds: Vec<_> = sent.iter().map(|m| m.session_message().unwrap()).collect();
        assert_eq!(kinds, vec![SessionMessage::Data, SessionMessage::Fin]);
        assert_eq!(sent[1].header.sequence, 3);

        session.handle_message(&from_peer(SessionMessage::Ack, FINAL_ID, 3, Bytes::new()));
        session.update();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.termination_reason(), ResultCode::Success);
        assert_eq!(*lock(&owner.terminated), vec![ResultCode::Success]);
        assert!(!session.has_owner());

        // Terminated is reported once
        session.update();
        assert_eq!(lock(&owner.terminated).len(), 1);
    }

    #[tokio::test]
    async fn test_peer_fin_drains_then_closes() {
        let (session, _channel, owner) = established_client();
        session.handle_message(&from_peer(SessionMessage::Data, FINAL_ID, 2, Bytes::from_static(b"last")));
        session.handle_message(&from_peer(SessionMessage::Fin, FINAL_ID, 3, Bytes::new()));
        assert_eq!(session.state(), SessionState::Closing);

        // Data ahead of the Fin keeps the session open until it is read
        session.update();
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.receive(64, None).await, Ok(Bytes::from_static(b"last")));

        session.update();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*lock(&owner.terminated), vec![ResultCode::Success]);
        assert_eq!(session.receive(64, None).await, Err(SessionError::EndOfStream));
    }

    #[tokio::test]
    async fn test_fin_ahead_of_missing_data() {
        let (session, channel, owner) = established_client();
        session.handle_message(&from_peer(SessionMessage::Fin, FINAL_ID, 3, Bytes::new()));
        assert_eq!(session.state(), SessionState::Closing);
        session.update();
        assert_eq!(session.state(), SessionState::Closing);
        channel.take();

        // The message sent before the Fin is still accepted and acknowledged
        session.handle_message(&from_peer(SessionMessage::Data, FINAL_ID, 2, Bytes::from_static(b"late")));
        session.update();
        let acks: Vec<Sequence> = channel
            .take()
            .iter()
            .filter(|message| message.session_message() == Ok(SessionMessage::Ack))
            .map(|message| message.header.sequence)
            .collect();
        assert_eq!(acks.last(), Some(&3));

        assert_eq!(
            session.receive(64, Some(Duration::from_millis(10))).await,
            Ok(Bytes::from_static(b"late"))
        );
        session.update();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*lock(&owner.terminated), vec![ResultCode::Success]);
    }

    #[tokio::test]
    async fn test_retransmitted_fin_is_reacknowledged() {
        let (session, channel, _owner) = established_client();
        session.handle_message(&from_peer(SessionMessage::Data, FINAL_ID, 2, Bytes::from_static(b"data")));
        session.handle_message(&from_peer(SessionMessage::Fin, FINAL_ID, 3, Bytes::new()));
        session.update();
        channel.take();

        // Our Ack was lost and the peer resends its Fin
        session.handle_message(&from_peer(SessionMessage::Fin, FINAL_ID, 3, Bytes::new()));
        assert_eq!(session.state(), SessionState::Closing);
        let sent = channel.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_message(), Ok(SessionMessage::Ack));
        assert_eq!(sent[0].header.sequence, 3);
        assert_eq!(session.stats().duplicates_received, 1);

        assert_eq!(session.receive(64, None).await, Ok(Bytes::from_static(b"data")));
    }

    #[tokio::test]
    async fn test_reset_closes_and_wakes_receivers() {
        let (session, _channel, owner) = established_client();

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.receive(64, None).await })
        };
        tokio::task::yield_now().await;

        let reason = ResultCode::Aborted as u32 as u64;
        session.handle_message(&from_peer(SessionMessage::Rst, FINAL_ID, reason, Bytes::new()));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(waiter.await.unwrap(), Err(SessionError::Aborted));

        session.update();
        assert_eq!(*lock(&owner.terminated), vec![ResultCode::Aborted]);
        assert_eq!(
            session.send(Bytes::from_static(b"x"), None).await,
            Err(SessionError::Error)
        );
    }

    #[test]
    fn test_version_mismatch_reset_records_version() {
        let (session, _channel) = new_session();
        session
            .connect(Arc::new(Recorder::default()), PEER, PROVISIONAL_ID)
            .unwrap();

        let mut rst = from_peer(
            SessionMessage::Rst,
            PROVISIONAL_ID,
            ResultCode::VersionMismatch as u32 as u64,
            Bytes::new(),
        );
        rst.header.window_size = 5;
        session.handle_message(&rst);

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.termination_reason(), ResultCode::VersionMismatch);
        assert_eq!(session.rejected_version(), Some(5));
    }

    #[test]
    fn test_transport_failure_closes_with_error() {
        let (session, channel, owner) = established_client();
        channel.disconnected.store(true, Ordering::SeqCst);

        session.handle_message(&from_peer(SessionMessage::Data, FINAL_ID, 2, Bytes::from_static(b"x")));
        session.update();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(*lock(&owner.terminated), vec![ResultCode::Error]);
    }

    #[test]
    fn test_close_if_owned_by() {
        let (session, _channel) = new_session();
        let owner = Arc::new(Recorder::default());
        let server: Arc<dyn ProtocolServer> = owner.clone();
        let other: Arc<dyn ProtocolServer> = Arc::new(Recorder::default());
        session
            .bind_to_server(server.clone(), PEER, SESSION_PROTOCOL_VERSION, 2, FINAL_ID)
            .unwrap();

        assert!(!session.close_if_owned_by(&other));
        assert!(session.has_owner());
        assert!(session.close_if_owned_by(&server));
        assert!(!session.has_owner());
        assert_eq!(session.state(), SessionState::Closed);

        session.update();
        assert!(lock(&owner.terminated).is_empty());
    }
}
