//! Session tuning parameters.

use std::time::Duration;

/// Default number of slots in each send and receive window
pub const DEFAULT_WINDOW_SIZE: u16 = 128;

/// Configuration shared by a session manager and its sessions
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Slots in each of the send and receive windows
    pub window_size: u16,
    /// Retransmission passes allowed before the session is shut down
    pub max_retransmits: u32,
    /// Lower bound on the retransmission timeout
    pub min_retransmit_delay: Duration,
    /// Upper bound on the retransmission timeout
    pub max_retransmit_delay: Duration,
    /// Samples in the round-trip-time moving average
    pub rtt_average_window: f32,
    /// Duplicate acknowledgements that trigger a fast retransmit
    pub fast_retransmit_threshold: u32,
    /// Unacknowledged received messages that trigger an early ack
    pub max_unacknowledged: u64,
    /// Attempts to forward a message while the transport reports backpressure
    pub forward_retry_limit: u32,
    /// Interval between manager update sweeps
    pub update_interval: Duration,
    /// Time allowed for sessions to close when the manager is destroyed
    pub destroy_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_retransmits: 5,
            min_retransmit_delay: Duration::from_millis(100),
            max_retransmit_delay: Duration::from_millis(2000),
            rtt_average_window: 2.0,
            fast_retransmit_threshold: 3,
            max_unacknowledged: 5,
            forward_retry_limit: 64,
            update_interval: Duration::from_millis(1),
            destroy_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Weight of a new sample in the round-trip-time moving average
    pub fn rtt_alpha(&self) -> f32 {
        2.0 / (self.rtt_average_window + 1.0)
    }

    /// Retransmission timeout for the given smoothed RTT and retransmit count
    pub fn retransmit_timeout(&self, round_trip_time_ms: f32, retransmit_count: u32) -> Duration {
        let multiplier = 2u32 << retransmit_count.min(14);
        let base_ms = round_trip_time_ms.max(self.min_retransmit_delay.as_millis() as f32);
        let timeout_ms = (base_ms * multiplier as f32).min(self.max_retransmit_delay.as_millis() as f32);
        Duration::from_millis(timeout_ms as u64)
    }
}
