//! DTLS flight retransmission (RFC 6347 §4.2.4).
//!
//! A flight is the group of handshake messages sent between two peer
//! responses; on timeout the whole flight is retransmitted with
//! exponential backoff. The timer resets to its initial value only
//! when the expected answering flight completes.

use std::time::{Duration, Instant};

const INITIAL_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRANSMISSIONS: u32 = 12;

/// The current outgoing flight plus its retransmission timer.
pub struct FlightTracker {
    messages: Vec<Vec<u8>>,
    current_timeout: Duration,
    deadline: Option<Instant>,
    retransmit_count: u32,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            current_timeout: INITIAL_TIMEOUT,
            deadline: None,
            retransmit_count: 0,
        }
    }

    /// Record a freshly sent flight and start the timer.
    pub fn flight_sent(&mut self, messages: Vec<Vec<u8>>, now: Instant) {
        self.messages = messages;
        self.current_timeout = INITIAL_TIMEOUT;
        self.retransmit_count = 0;
        self.deadline = Some(now + self.current_timeout);
    }

    /// Whether a retransmission is due at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(d) if now >= d)
    }

    /// Retransmit the stored flight: returns the messages to resend
    /// and advances the backoff. `None` once the retry budget is
    /// exhausted.
    pub fn retransmit(&mut self, now: Instant) -> Option<&[Vec<u8>]> {
        if self.retransmit_count >= MAX_RETRANSMISSIONS {
            return None;
        }
        self.retransmit_count += 1;
        self.current_timeout = (self.current_timeout * 2).min(MAX_TIMEOUT);
        self.deadline = Some(now + self.current_timeout);
        Some(&self.messages)
    }

    /// The expected answering flight completed: stop the timer and
    /// reset backoff.
    pub fn flight_completed(&mut self) {
        self.messages.clear();
        self.current_timeout = INITIAL_TIMEOUT;
        self.retransmit_count = 0;
        self.deadline = None;
    }

    pub fn retransmit_count(&self) -> u32 {
        self.retransmit_count
    }
}

impl Default for FlightTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_lifecycle() {
        let mut t = FlightTracker::new();
        let start = Instant::now();
        assert!(!t.is_expired(start));

        t.flight_sent(vec![vec![1, 2, 3]], start);
        assert!(!t.is_expired(start));
        assert!(t.is_expired(start + Duration::from_secs(1)));

        let msgs = t.retransmit(start + Duration::from_secs(1)).unwrap();
        assert_eq!(msgs, &[vec![1, 2, 3]]);
        assert_eq!(t.retransmit_count(), 1);
        // Backoff doubled: not expired until +2s from the retransmit.
        assert!(!t.is_expired(start + Duration::from_secs(2)));
        assert!(t.is_expired(start + Duration::from_secs(3)));
    }

    #[test]
    fn test_completion_resets_backoff() {
        let mut t = FlightTracker::new();
        let start = Instant::now();
        t.flight_sent(vec![vec![9]], start);
        t.retransmit(start + Duration::from_secs(1));
        t.retransmit(start + Duration::from_secs(3));
        assert_eq!(t.retransmit_count(), 2);

        t.flight_completed();
        assert_eq!(t.retransmit_count(), 0);
        assert!(!t.is_expired(start + Duration::from_secs(100)));

        // The next flight starts from the initial timeout again.
        t.flight_sent(vec![vec![8]], start);
        assert!(t.is_expired(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_retry_budget_exhausts() {
        let mut t = FlightTracker::new();
        let mut now = Instant::now();
        t.flight_sent(vec![vec![7]], now);
        for _ in 0..MAX_RETRANSMISSIONS {
            now += Duration::from_secs(61);
            assert!(t.retransmit(now).is_some());
        }
        assert!(t.retransmit(now).is_none());
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let mut t = FlightTracker::new();
        let mut now = Instant::now();
        t.flight_sent(vec![vec![0]], now);
        for _ in 0..8 {
            now += Duration::from_secs(120);
            t.retransmit(now);
        }
        // 1 → 2 → 4 → ... capped at 60
        assert!(!t.is_expired(now + Duration::from_secs(59)));
        assert!(t.is_expired(now + Duration::from_secs(60)));
    }
}
