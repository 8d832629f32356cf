//! Send and receive sliding windows.
//!
//! Both windows are fixed-capacity rings indexed by `sequence % size`. They
//! only keep bookkeeping; transmitting, acknowledging and waking blocked
//! callers is driven by the session that owns them.

use dd_wire::{MessageBuffer, Sequence, SessionMessage, WindowSize, MAX_PAYLOAD_SIZE};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
struct SendSlot {
    message: MessageBuffer,
    sequence: Sequence,
    valid: bool,
    initial_transmit: Option<Instant>,
}

/// Result of processing an acknowledgement watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The watermark moved forward, freeing `freed` slots
    Advanced {
        /// Number of slots released
        freed: u32,
    },
    /// Redundant acknowledgement below the fast-retransmit threshold
    Duplicate,
    /// Enough redundant acknowledgements arrived to resend `sequence` now
    FastRetransmit(Sequence),
}

/// Outgoing message ring
#[derive(Debug)]
pub struct SendWindow {
    slots: Vec<SendSlot>,
    /// Sequence assigned to the next queued message
    pub next_sequence: Sequence,
    /// Oldest sequence not yet acknowledged by the peer
    pub next_unacknowledged: Sequence,
    /// Highest sequence transmitted at least once
    pub last_sent: Sequence,
    /// Retransmission passes since the watermark last moved
    pub retransmit_count: u32,
    /// Smoothed round-trip time in milliseconds
    pub round_trip_time_ms: f32,
    /// Receive window last advertised by the peer
    pub last_available_size: WindowSize,
    /// Consecutive acknowledgements that did not move the watermark
    pub last_ack_count: u32,
}

impl SendWindow {
    /// Create an empty send window with `size` slots
    pub fn new(size: WindowSize) -> Self {
        Self {
            slots: vec![SendSlot::default(); usize::from(size.max(1))],
            next_sequence: 1,
            next_unacknowledged: 1,
            last_sent: 0,
            retransmit_count: 0,
            round_trip_time_ms: 0.0,
            last_available_size: 1,
            last_ack_count: 0,
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, sequence: Sequence) -> usize {
        (sequence % self.slots.len() as u64) as usize
    }

    /// Number of queued messages that are not yet acknowledged
    pub fn occupied(&self) -> u64 {
        self.next_sequence - self.next_unacknowledged
    }

    /// Queue a message, assigning it the next sequence number.
    ///
    /// The caller must hold a free slot (a send permit).
    pub fn push(&mut self, mut message: MessageBuffer) -> Sequence {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        message.header.sequence = sequence;

        let index = self.index(sequence);
        debug_assert!(!self.slots[index].valid);
        self.slots[index] = SendSlot {
            message,
            sequence,
            valid: true,
            initial_transmit: None,
        };
        sequence
    }

    /// Whether any transmitted message is still waiting for an acknowledgement
    pub fn has_unacknowledged(&self) -> bool {
        self.next_unacknowledged <= self.last_sent
    }

    /// Whether every transmitted message has been acknowledged. With
    /// `require_drained` queued-but-unsent messages also count as pending.
    pub fn is_empty(&self, require_drained: bool) -> bool {
        let acknowledged = self.next_unacknowledged > self.last_sent;
        if require_drained {
            acknowledged && self.last_sent + 1 == self.next_sequence
        } else {
            acknowledged
        }
    }

    /// Process a cumulative acknowledgement of everything up to `watermark`.
    ///
    /// Round-trip samples are only taken outside of retransmission so that
    /// resent messages do not skew the estimate.
    pub fn acknowledge(
        &mut self,
        watermark: Sequence,
        now: Instant,
        rtt_alpha: f32,
        fast_retransmit_threshold: u32,
    ) -> AckOutcome {
        let limit = watermark.min(self.last_sent);
        let mut average = self.round_trip_time_ms;
        let mut sequence = self.next_unacknowledged;
        let mut freed = 0;

        while sequence <= limit {
            let index = self.index(sequence);
            let slot = &mut self.slots[index];
            if !slot.valid || slot.sequence != sequence {
                break;
            }
            slot.valid = false;

            if self.retransmit_count == 0 {
                if let Some(sent_at) = slot.initial_transmit {
                    let sample = now.saturating_duration_since(sent_at).as_secs_f32() * 1000.0;
                    average = rtt_alpha * sample + (1.0 - rtt_alpha) * average;
                }
            }

            freed += 1;
            sequence += 1;
        }

        if sequence > self.next_unacknowledged {
            self.round_trip_time_ms = average;
            self.retransmit_count = 0;
            self.next_unacknowledged = sequence;
            self.last_ack_count = 0;
            return AckOutcome::Advanced { freed };
        }

        self.last_ack_count += 1;
        if self.last_ack_count < fast_retransmit_threshold {
            return AckOutcome::Duplicate;
        }

        // One additional message is resent for every duplicate past the threshold
        let target =
            self.next_unacknowledged + u64::from(self.last_ack_count - fast_retransmit_threshold);
        let index = self.index(target);
        let slot = &self.slots[index];
        if target <= self.last_sent && slot.valid && slot.sequence == target {
            AckOutcome::FastRetransmit(target)
        } else {
            AckOutcome::Duplicate
        }
    }

    /// Copy of a queued message for (re)transmission, stamped with the current
    /// receive window size
    pub fn message(&mut self, sequence: Sequence, window_size: WindowSize) -> Option<MessageBuffer> {
        let index = self.index(sequence);
        let slot = &mut self.slots[index];
        if !slot.valid || slot.sequence != sequence {
            return None;
        }
        slot.message.header.window_size = window_size;
        Some(slot.message.clone())
    }

    /// Transmitted messages whose first transmission is older than `timeout`,
    /// oldest first. Stops at the first message that has not timed out yet.
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<Sequence> {
        let mut expired = Vec::new();
        for sequence in self.next_unacknowledged..=self.last_sent {
            let slot = &self.slots[self.index(sequence)];
            if !slot.valid || slot.sequence != sequence {
                break;
            }
            let elapsed = slot
                .initial_transmit
                .map(|sent_at| now.saturating_duration_since(sent_at))
                .unwrap_or_default();
            if elapsed <= timeout {
                break;
            }
            expired.push(sequence);
        }
        expired
    }

    /// Next queued message that has never been transmitted, if the peer has
    /// advertised room for it
    pub fn next_unsent(&self) -> Option<Sequence> {
        let sequence = self.last_sent + 1;
        if sequence >= self.next_sequence || self.last_available_size == 0 {
            return None;
        }
        let slot = &self.slots[self.index(sequence)];
        (slot.valid && slot.sequence == sequence).then_some(sequence)
    }

    /// Record the first successful transmission of `sequence`
    pub fn mark_transmitted(&mut self, sequence: Sequence, now: Instant) {
        let index = self.index(sequence);
        self.slots[index].initial_transmit = Some(now);
        self.last_sent = sequence;
        self.last_available_size = self.last_available_size.saturating_sub(1);
    }
}

#[derive(Debug, Clone, Default)]
struct ReceiveSlot {
    message: MessageBuffer,
    sequence: Sequence,
    valid: bool,
}

/// Result of writing an incoming message into the receive window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The message was buffered
    Stored {
        /// Messages that became readable in order
        released: u32,
        /// An acknowledgement should be sent immediately
        ack_now: bool,
    },
    /// Already received; the current watermark should be re-sent
    Duplicate,
    /// Too far ahead of the consumer to buffer
    OutOfWindow,
}

/// Incoming message ring
#[derive(Debug)]
pub struct ReceiveWindow {
    slots: Vec<ReceiveSlot>,
    /// Oldest sequence not yet drained by the consumer
    pub next_unread: Sequence,
    /// Next contiguous sequence expected from the peer
    pub next_expected: Sequence,
    /// Watermark last acknowledged to the peer
    pub last_unacknowledged: Sequence,
    /// Window size advertised in outgoing headers
    pub current_available_size: WindowSize,
}

impl ReceiveWindow {
    /// Create an empty receive window with `size` slots
    pub fn new(size: WindowSize) -> Self {
        let size = size.max(1);
        Self {
            slots: vec![ReceiveSlot::default(); usize::from(size)],
            next_unread: 0,
            next_expected: 0,
            last_unacknowledged: 0,
            current_available_size: (size / 2).max(1),
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, sequence: Sequence) -> usize {
        (sequence % self.slots.len() as u64) as usize
    }

    /// Largest window ever advertised; half the capacity leaves room for reordering
    pub fn max_advertised(&self) -> WindowSize {
        ((self.slots.len() / 2) as WindowSize).max(1)
    }

    /// Start receiving at `first`, the sequence following the peer's handshake message
    pub fn reset(&mut self, first: Sequence) {
        self.next_unread = first;
        self.next_expected = first;
        self.last_unacknowledged = first;
        self.current_available_size = self.max_advertised();
    }

    /// Whether messages were received since the last acknowledgement
    pub fn pending_ack(&self) -> bool {
        self.next_expected > self.last_unacknowledged
    }

    /// Space advertised to the peer, never less than one message
    pub fn calculate_window_size(&self) -> WindowSize {
        let buffered = self.next_expected.saturating_sub(self.next_unread);
        let available = i64::from(self.max_advertised()) - buffered.min(i64::MAX as u64) as i64;
        available.max(1) as WindowSize
    }

    /// Buffer an incoming message
    pub fn write(&mut self, message: &MessageBuffer, early_ack_threshold: u64) -> ReceiveOutcome {
        let pending = self.pending_ack();
        let sequence = message.header.sequence;

        if sequence < self.next_expected || message.payload.len() > MAX_PAYLOAD_SIZE {
            return ReceiveOutcome::Duplicate;
        }
        if sequence - self.next_unread >= self.slots.len() as u64 {
            return ReceiveOutcome::OutOfWindow;
        }

        let index = self.index(sequence);
        self.slots[index] = ReceiveSlot {
            message: message.clone(),
            sequence,
            valid: true,
        };

        let mut next = self.next_expected;
        let mut released = 0;
        while next - self.next_unread < self.slots.len() as u64 {
            let slot = &self.slots[self.index(next)];
            if !slot.valid || slot.sequence != next {
                break;
            }
            next += 1;
            released += 1;
        }
        self.next_expected = next;

        // A gap means something was lost; repeat the watermark so the sender
        // can fast retransmit
        let ack_now = if released == 0 {
            true
        } else {
            pending && next - self.last_unacknowledged >= early_ack_threshold
        };

        ReceiveOutcome::Stored { released, ack_now }
    }

    /// Record that an acknowledgement is being sent and return its watermark
    pub fn prepare_ack(&mut self) -> Sequence {
        self.last_unacknowledged = self.next_expected;
        self.current_available_size = self.calculate_window_size();
        self.next_expected.saturating_sub(1)
    }

    /// Oldest readable message
    pub fn front(&self) -> Option<&MessageBuffer> {
        if self.next_unread >= self.next_expected {
            return None;
        }
        let slot = &self.slots[self.index(self.next_unread)];
        (slot.valid && slot.sequence == self.next_unread).then_some(&slot.message)
    }

    /// Whether the oldest readable message is the peer's Fin
    pub fn front_is_fin(&self) -> bool {
        self.front()
            .map(|message| message.session_message() == Ok(SessionMessage::Fin))
            .unwrap_or(false)
    }

    /// Remove and return the oldest readable message
    pub fn consume_front(&mut self) -> Option<MessageBuffer> {
        self.front()?;
        let index = self.index(self.next_unread);
        let slot = &mut self.slots[index];
        slot.valid = false;
        let message = std::mem::take(&mut slot.message);
        self.next_unread += 1;
        self.current_available_size = self.calculate_window_size();
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dd_wire::MessageHeader;

    const ALPHA: f32 = 2.0 / 3.0;

    fn data(sequence: Sequence) -> MessageBuffer {
        let header = MessageHeader::session(SessionMessage::Data, 1, 2, 0x10001, sequence);
        MessageBuffer::new(header, Bytes::from(format!("msg-{}", sequence))).unwrap()
    }

    fn send_window_with(count: u64) -> (SendWindow, Instant) {
        let mut window = SendWindow::new(8);
        window.last_available_size = 8;
        let now = Instant::now();
        for _ in 0..count {
            let sequence = window.push(data(0));
            window.mark_transmitted(sequence, now);
        }
        (window, now)
    }

    #[test]
    fn test_push_assigns_sequences() {
        let mut window = SendWindow::new(4);
        assert_eq!(window.push(data(0)), 1);
        assert_eq!(window.push(data(0)), 2);
        assert_eq!(window.occupied(), 2);
        assert_eq!(window.message(2, 9).unwrap().header.sequence, 2);
        assert_eq!(window.message(2, 9).unwrap().header.window_size, 9);
        assert!(!window.has_unacknowledged());
        assert!(window.is_empty(false));
        assert!(!window.is_empty(true));
    }

    #[test]
    fn test_transmit_respects_advertised_window() {
        let mut window = SendWindow::new(8);
        window.push(data(0));
        window.push(data(0));

        // Initial advertised window is one message
        assert_eq!(window.next_unsent(), Some(1));
        window.mark_transmitted(1, Instant::now());
        assert_eq!(window.next_unsent(), None);

        window.last_available_size = 4;
        assert_eq!(window.next_unsent(), Some(2));
        window.mark_transmitted(2, Instant::now());
        assert_eq!(window.next_unsent(), None);
        assert_eq!(window.last_available_size, 3);
    }

    #[test]
    fn test_acknowledge_frees_slots() {
        let (mut window, now) = send_window_with(4);
        let later = now + Duration::from_millis(30);

        assert_eq!(window.acknowledge(2, later, ALPHA, 3), AckOutcome::Advanced { freed: 2 });
        assert_eq!(window.next_unacknowledged, 3);
        assert!((window.round_trip_time_ms - 30.0 * ALPHA * (1.0 + (1.0 - ALPHA))).abs() < 0.5);

        // Watermark beyond what was sent is clamped
        assert_eq!(window.acknowledge(100, later, ALPHA, 3), AckOutcome::Advanced { freed: 2 });
        assert!(window.is_empty(true));
    }

    #[test]
    fn test_retransmitted_samples_do_not_update_rtt() {
        let (mut window, now) = send_window_with(1);
        window.retransmit_count = 1;
        window.acknowledge(1, now + Duration::from_secs(1), ALPHA, 3);
        assert_eq!(window.round_trip_time_ms, 0.0);
        assert_eq!(window.retransmit_count, 0);
    }

    #[test]
    fn test_duplicate_acks_trigger_fast_retransmit() {
        let (mut window, now) = send_window_with(4);
        window.acknowledge(1, now, ALPHA, 3);

        assert_eq!(window.acknowledge(1, now, ALPHA, 3), AckOutcome::Duplicate);
        assert_eq!(window.acknowledge(1, now, ALPHA, 3), AckOutcome::Duplicate);
        assert_eq!(window.acknowledge(1, now, ALPHA, 3), AckOutcome::FastRetransmit(2));
        assert_eq!(window.acknowledge(1, now, ALPHA, 3), AckOutcome::FastRetransmit(3));
        assert_eq!(window.acknowledge(1, now, ALPHA, 3), AckOutcome::FastRetransmit(4));

        // Nothing was transmitted past sequence 4
        assert_eq!(window.acknowledge(1, now, ALPHA, 3), AckOutcome::Duplicate);

        // Progress resets the duplicate count
        assert_eq!(window.acknowledge(2, now, ALPHA, 3), AckOutcome::Advanced { freed: 1 });
        assert_eq!(window.last_ack_count, 0);
    }

    #[test]
    fn test_timed_out_stops_at_fresh_message() {
        let (mut window, now) = send_window_with(2);
        let sequence = window.push(data(0));
        window.mark_transmitted(sequence, now + Duration::from_millis(150));

        let timeout = Duration::from_millis(200);
        assert!(window.timed_out(now + Duration::from_millis(200), timeout).is_empty());
        assert_eq!(window.timed_out(now + Duration::from_millis(250), timeout), vec![1, 2]);
        assert_eq!(window.timed_out(now + Duration::from_millis(400), timeout), vec![1, 2, 3]);
    }

    #[test]
    fn test_receive_in_order() {
        let mut window = ReceiveWindow::new(8);
        window.reset(2);
        assert_eq!(window.max_advertised(), 4);

        assert_eq!(
            window.write(&data(2), 5),
            ReceiveOutcome::Stored { released: 1, ack_now: false }
        );
        assert_eq!(window.calculate_window_size(), 3);
        assert!(window.pending_ack());
        assert_eq!(window.prepare_ack(), 2);
        assert!(!window.pending_ack());

        let message = window.consume_front().unwrap();
        assert_eq!(message.payload, Bytes::from_static(b"msg-2"));
        assert!(window.front().is_none());
        assert_eq!(window.current_available_size, 4);
    }

    #[test]
    fn test_receive_reordered_and_duplicate() {
        let mut window = ReceiveWindow::new(8);
        window.reset(1);

        // Gap at 1: stored but not readable, ack repeated
        assert_eq!(
            window.write(&data(2), 5),
            ReceiveOutcome::Stored { released: 0, ack_now: true }
        );
        assert!(window.front().is_none());

        assert_eq!(
            window.write(&data(1), 5),
            ReceiveOutcome::Stored { released: 2, ack_now: false }
        );
        assert_eq!(window.next_expected, 3);

        assert_eq!(window.write(&data(1), 5), ReceiveOutcome::Duplicate);
        assert_eq!(window.consume_front().unwrap().header.sequence, 1);
        assert_eq!(window.consume_front().unwrap().header.sequence, 2);
        assert!(window.consume_front().is_none());
    }

    #[test]
    fn test_receive_early_ack() {
        let mut window = ReceiveWindow::new(16);
        window.reset(1);

        let mut outcomes = Vec::new();
        for sequence in 1..=6 {
            outcomes.push(window.write(&data(sequence), 5));
        }
        // The first message is not pending yet; the fifth past the watermark triggers an ack
        assert_eq!(outcomes[3], ReceiveOutcome::Stored { released: 1, ack_now: false });
        assert_eq!(outcomes[4], ReceiveOutcome::Stored { released: 1, ack_now: true });
    }

    #[test]
    fn test_receive_out_of_window() {
        let mut window = ReceiveWindow::new(4);
        window.reset(1);
        assert_eq!(window.write(&data(5), 5), ReceiveOutcome::OutOfWindow);
        assert_eq!(
            window.write(&data(4), 5),
            ReceiveOutcome::Stored { released: 0, ack_now: true }
        );
    }

    #[test]
    fn test_window_size_never_zero() {
        let mut window = ReceiveWindow::new(4);
        window.reset(1);
        for sequence in 1..=4 {
            window.write(&data(sequence), 100);
        }
        assert_eq!(window.calculate_window_size(), 1);
    }

    #[test]
    fn test_fin_at_front() {
        let mut window = ReceiveWindow::new(4);
        window.reset(1);
        let fin = MessageBuffer::control(MessageHeader::session(SessionMessage::Fin, 1, 2, 3, 1));
        window.write(&fin, 5);
        assert!(window.front_is_fin());
    }
}
