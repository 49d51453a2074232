//! Retry delay schedules

use std::time::Duration;

/// Upper bound of the reconnect loop delay
pub const RECONNECT_CAP: Duration = Duration::from_secs(300);

/// Upper bound of the connect retry delay
pub const CONNECT_RETRY_CAP: Duration = Duration::from_secs(60);

/// Delay before connect retry `attempt` (1-based): `min(2^attempt, 60)` seconds
pub fn connect_retry_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt.min(63)).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(CONNECT_RETRY_CAP)
}

/// Doubling delay for the reconnect loop
///
/// Yields floor, 2×floor, 4×floor, … capped at [`RECONNECT_CAP`] (or the
/// floor itself when the floor is larger).
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl ReconnectBackoff {
    /// Create a schedule starting at `floor`
    pub fn new(floor: Duration) -> Self {
        Self::with_cap(floor, RECONNECT_CAP)
    }

    /// Create a schedule with a custom cap
    pub fn with_cap(floor: Duration, cap: Duration) -> Self {
        let cap = cap.max(floor);
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    /// Delay to wait now; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.cap);
        delay
    }

    /// Back to the floor after a success
    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// First delay of the schedule
    pub fn floor(&self) -> Duration {
        self.floor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_from_floor_to_cap() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(10));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 300, 300, 300]);
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(10));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_floor_above_cap() {
        let mut backoff = ReconnectBackoff::new(Duration::from_secs(600));
        assert_eq!(backoff.next_delay(), Duration::from_secs(600));
        assert_eq!(backoff.next_delay(), Duration::from_secs(600));
    }

    #[test]
    fn test_connect_retry_delay() {
        assert_eq!(connect_retry_delay(1), Duration::from_secs(2));
        assert_eq!(connect_retry_delay(5), Duration::from_secs(32));
        assert_eq!(connect_retry_delay(6), Duration::from_secs(60));
        assert_eq!(connect_retry_delay(200), Duration::from_secs(60));
    }
}
