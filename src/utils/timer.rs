//! Small reusable timer wrapper around `tokio::time`, used everywhere a
//! subsystem needs a resettable deadline: Heartbeat's per-neighbour ack
//! timeout, Election's per-round timeout, Replication's per-op retransmit
//! timeout, FO-multicast's per-message retransmit timer, and the vote
//! deadline scheduler.

use std::time::Duration;

use tokio::time::{self, Instant, Sleep};

/// A resettable one-shot deadline. `Timer::fired()` is cancel-safe and can
/// be awaited inside a `tokio::select!` arm alongside other branches.
pub struct Timer {
    deadline: Instant,
    sleep: std::pin::Pin<Box<Sleep>>,
}

impl Timer {
    /// Creates a timer that fires after `dur` from now.
    pub fn new(dur: Duration) -> Self {
        let deadline = Instant::now() + dur;
        Timer {
            deadline,
            sleep: Box::pin(time::sleep_until(deadline)),
        }
    }

    /// Resets the timer to fire `dur` from now.
    pub fn reset(&mut self, dur: Duration) {
        self.deadline = Instant::now() + dur;
        self.sleep.as_mut().reset(self.deadline);
    }

    /// Awaits the timer firing. Cancel-safe: re-polling after a `select!`
    /// chose a different branch simply continues waiting for the same
    /// deadline.
    pub async fn fired(&mut self) {
        self.sleep.as_mut().await;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_duration() {
        let mut timer = Timer::new(Duration::from_millis(50));
        let before = Instant::now();
        timer.fired().await;
        assert!(Instant::now() - before >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_extends_deadline() {
        let mut timer = Timer::new(Duration::from_millis(10));
        timer.reset(Duration::from_millis(100));
        let before = Instant::now();
        timer.fired().await;
        assert!(Instant::now() - before >= Duration::from_millis(100));
    }
}
