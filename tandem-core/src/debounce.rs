//! Cancel-and-reschedule timer for coalescing bursts of input.
//!
//! A `Debouncer` holds at most one deadline. Every `touch` pushes the deadline
//! to `now + batch + quiet`, so the timer fires only after the input has been
//! quiet for the whole window. The two windows are kept separate because the
//! editor groups keystrokes in a short batch stage before waiting for a pause;
//! restarting both stages on each keystroke collapses to a single deadline.
//!
//! The debouncer never reads a clock itself. Callers pass `now`, which lets
//! tests drive it with a virtual clock and lets async drivers sleep until
//! [`Debouncer::deadline`].

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Debouncer {
    batch: Duration,
    quiet: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(batch: Duration, quiet: Duration) -> Self {
        Self {
            batch,
            quiet,
            deadline: None,
        }
    }

    /// Single-stage debouncer with only a quiet window.
    pub fn quiet(quiet: Duration) -> Self {
        Self::new(Duration::ZERO, quiet)
    }

    /// Register input at `now`, superseding any pending deadline.
    pub fn touch(&mut self, now: Instant) {
        self.deadline = Some(now + self.batch + self.quiet);
    }

    /// Drop the pending deadline without firing.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Total delay between the last input and firing.
    pub fn window(&self) -> Duration {
        self.batch + self.quiet
    }

    /// Fire if the deadline has passed. Returns `true` exactly once per burst.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest of several optional deadlines.
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_fires_after_both_windows() {
        let start = Instant::now();
        let mut d = Debouncer::new(ms(50), ms(300));
        d.touch(start);

        assert!(!d.fire_if_due(start + ms(349)));
        assert!(d.fire_if_due(start + ms(350)));
        assert!(!d.is_pending());
    }

    #[test]
    fn test_touch_reschedules() {
        let start = Instant::now();
        let mut d = Debouncer::new(ms(50), ms(300));
        d.touch(start);
        d.touch(start + ms(200));

        assert!(!d.fire_if_due(start + ms(350)));
        assert!(d.fire_if_due(start + ms(550)));
    }

    #[test]
    fn test_fires_once_per_burst() {
        let start = Instant::now();
        let mut d = Debouncer::quiet(ms(150));
        d.touch(start);

        assert!(d.fire_if_due(start + ms(200)));
        assert!(!d.fire_if_due(start + ms(400)));
    }

    #[test]
    fn test_cancel_drops_deadline() {
        let start = Instant::now();
        let mut d = Debouncer::quiet(ms(10));
        d.touch(start);
        d.cancel();

        assert_eq!(d.deadline(), None);
        assert!(!d.fire_if_due(start + ms(100)));
    }

    #[test]
    fn test_earliest() {
        let start = Instant::now();
        let a = Some(start + ms(30));
        let b = Some(start + ms(10));

        assert_eq!(earliest([a, None, b]), b);
        assert_eq!(earliest([None, None]), None);
    }
}
