use std::thread;
use std::time::Duration;

use crossbeam_utils::Backoff as Spin;

/// First sleep once spinning and yielding are exhausted.
const FIRST_SLEEP_NANOS: u64 = 1 << 13;

/// Longest sleep between two retries.
const MAX_SLEEP_NANOS: u64 = 1 << 20;

/// Exponential backoff for optimistic retry loops.
///
/// Retries start by busy-spinning for exponentially growing bursts, then
/// yield to the scheduler, and finally sleep for doubling intervals capped
/// at [`MAX_SLEEP_NANOS`].
pub(crate) struct Backoff {
    spin: Spin,
    sleep_nanos: u64,
}

impl Backoff {
    pub(crate) fn new() -> Backoff {
        Backoff {
            spin: Spin::new(),
            sleep_nanos: FIRST_SLEEP_NANOS,
        }
    }

    /// Waits before the next retry and escalates the delay.
    pub(crate) fn pause(&mut self) {
        if self.spin.is_completed() {
            thread::sleep(Duration::from_nanos(self.sleep_nanos));
            self.sleep_nanos = (self.sleep_nanos * 2).min(MAX_SLEEP_NANOS);
        } else {
            self.spin.snooze();
        }
    }
}
