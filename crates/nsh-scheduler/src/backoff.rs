//! Exponential backoff shared by every scheduler backend's polling loops:
//! start small, double each attempt, never exceed a fixed ceiling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Sleeps for `duration`, checking `cancel` every [`CANCEL_CHECK_INTERVAL`]
/// so a cooperative cancellation request is noticed promptly instead of
/// only between polling attempts.
pub fn sleep_cancelable(duration: Duration, cancel: &AtomicBool) -> Result<(), crate::Error> {
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        if cancel.load(Ordering::Relaxed) {
            return Err(crate::Error::Cancelled);
        }
        let this_step = remaining.min(CANCEL_CHECK_INTERVAL);
        sleep(this_step);
        remaining -= this_step;
    }
    if cancel.load(Ordering::Relaxed) {
        return Err(crate::Error::Cancelled);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(start: Duration, cap: Duration) -> Self {
        Self { next: start, cap }
    }

    /// Host-assignment polling: 50ms start, 1s cap.
    pub fn host_assignment() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(1))
    }

    /// General state polling: 50ms start, 2s cap.
    pub fn state_polling() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(2))
    }

    /// Completion polling: 50ms start, 4s cap.
    pub fn completion_polling() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(4))
    }

    /// Returns the duration to sleep for this attempt and advances state.
    pub fn step(&mut self) -> Duration {
        let this = self.next;
        self.next = (self.next * 2).min(self.cap);
        this
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let mut b = Backoff::new(Duration::from_millis(50), Duration::from_millis(500));
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let d = b.step();
            assert!(d >= last);
            assert!(d <= Duration::from_millis(500));
            last = d;
        }
        assert_eq!(last, Duration::from_millis(500));
    }

    #[test]
    fn first_step_equals_start() {
        let mut b = Backoff::new(Duration::from_millis(50), Duration::from_secs(1));
        assert_eq!(b.step(), Duration::from_millis(50));
    }
}
