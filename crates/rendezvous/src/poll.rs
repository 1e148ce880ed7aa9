//! Deadline-bounded fixed-interval polling

use std::time::Duration;
use tokio::time::Instant;

/// Paces a polling loop: a round every `interval` until `deadline`
///
/// The sleep before the last round is clamped to the deadline, so a final
/// round always happens at the deadline and a wait never ends early.
#[derive(Debug, Clone)]
pub struct TimedPoll {
    interval: Duration,
    deadline: Instant,
    rounds: u64,
}

impl TimedPoll {
    /// Poll every `interval` for at most `budget`, starting now
    pub fn new(interval: Duration, budget: Duration) -> Self {
        Self::until(interval, Instant::now() + budget)
    }

    /// Poll every `interval` until `deadline`
    pub fn until(interval: Duration, deadline: Instant) -> Self {
        Self {
            interval,
            deadline,
            rounds: 0,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Rounds started so far
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Wait for the next round
    ///
    /// Returns immediately for the first round. Returns false once the
    /// deadline has passed and no further round may start.
    pub async fn wait_next(&mut self) -> bool {
        if self.rounds == 0 {
            self.rounds = 1;
            return true;
        }

        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }

        let wake = (now + self.interval).min(self.deadline);
        tokio::time::sleep_until(wake).await;
        self.rounds += 1;
        true
    }
}
