use std::time::Duration;

/// Tunables for the relay's per-session outbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Frames queued for one client before deliveries to it start waiting.
    pub outbound_capacity: usize,
    /// Upper bound on how long one delivery or socket write may block.
    pub send_timeout: Duration,
}

impl RelayConfig {
    pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: Self::DEFAULT_OUTBOUND_CAPACITY,
            send_timeout: Self::DEFAULT_SEND_TIMEOUT,
        }
    }
}
