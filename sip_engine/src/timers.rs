//! RFC 3261 timer values and the deadline slots transactions arm.
//!
//! Nothing here sleeps. A slot stores the instant it expires at; the owner
//! checks it from `poll(now)` and re-validates its own state before acting.

use std::time::{Duration, Instant};

pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);

/// INVITE client transaction timeout.
pub const TIMER_B: Duration = Duration::from_millis(64 * 500);
/// Non-INVITE client transaction timeout.
pub const TIMER_F: Duration = Duration::from_millis(64 * 500);
/// Wait for ACK after a non-2xx final response.
pub const TIMER_H: Duration = Duration::from_millis(64 * 500);
/// Linger in ACCEPTED after a 2xx was sent.
pub const TIMER_L: Duration = Duration::from_millis(64 * 500);
/// Linger in ACCEPTED after a 2xx was received.
pub const TIMER_M: Duration = Duration::from_millis(64 * 500);

/// Resend period for a reliable-less provisional response.
pub const PROVISIONAL_RESPONSE_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before a re-INVITE rejected with 491 is attempted again.
pub const REQUEST_PENDING_BACKOFF: Duration = Duration::from_secs(1);

const TIMER_D_UNRELIABLE: Duration = Duration::from_secs(32);

/// The timers whose value depends on the transport being reliable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timers {
    pub d: Duration,
    pub i: Duration,
    pub j: Duration,
    pub k: Duration,
    /// Whether requests and final responses are retransmitted (A, E, G).
    pub retransmit: bool,
}

impl Timers {
    pub fn for_transport(reliable: bool) -> Self {
        if reliable {
            Self {
                d: Duration::ZERO,
                i: Duration::ZERO,
                j: Duration::ZERO,
                k: Duration::ZERO,
                retransmit: false,
            }
        } else {
            Self {
                d: TIMER_D_UNRELIABLE,
                i: T4,
                j: Duration::from_millis(64 * 500),
                k: T4,
                retransmit: true,
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimerSlot(Option<Instant>);

impl TimerSlot {
    pub fn arm(&mut self, now: Instant, after: Duration) {
        self.0 = Some(now + after);
    }

    pub fn cancel(&mut self) {
        self.0 = None;
    }

    pub fn is_armed(&self) -> bool {
        self.0.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.0
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.0, Some(deadline) if deadline <= now)
    }

    /// Disarms the slot and returns true if it had expired.
    pub fn fire(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.0 = None;
            true
        } else {
            false
        }
    }
}

/// Earliest of a set of optional deadlines.
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliable_transport_zeroes_wait_timers() {
        let t = Timers::for_transport(true);
        assert_eq!(t.d, Duration::ZERO);
        assert_eq!(t.k, Duration::ZERO);
        assert!(!t.retransmit);

        let t = Timers::for_transport(false);
        assert_eq!(t.d, Duration::from_secs(32));
        assert_eq!(t.i, T4);
        assert_eq!(t.j, Duration::from_secs(32));
        assert!(t.retransmit);
        assert_eq!(TIMER_B, Duration::from_secs(32));
    }

    #[test]
    fn slot_fires_once() {
        let now = Instant::now();
        let mut slot = TimerSlot::default();
        assert!(!slot.fire(now));

        slot.arm(now, Duration::from_secs(1));
        assert!(!slot.is_due(now));
        assert!(slot.fire(now + Duration::from_secs(1)));
        assert!(!slot.is_armed());
        assert!(!slot.fire(now + Duration::from_secs(5)));
    }

    #[test]
    fn earliest_skips_unarmed() {
        let now = Instant::now();
        let later = now + Duration::from_secs(3);
        assert_eq!(earliest([None, Some(later), Some(now)]), Some(now));
        assert_eq!(earliest([None, None]), None);
    }
}
