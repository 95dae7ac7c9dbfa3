//! Cancellable one-shot deadlines for the engine's select loop

use std::time::Duration;
use tokio::time::Instant;

/// A deadline that is either armed at an instant or idle
#[derive(Debug, Default, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// An unarmed deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) to fire `after` from now
    pub fn arm(&mut self, after: Duration) {
        self.at = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.at
    }
}

/// Sleep until `at`, or forever when no deadline is armed
pub async fn wait(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_after_duration() {
        let mut deadline = Deadline::new();
        deadline.arm(Duration::from_secs(30));
        let start = Instant::now();
        wait(deadline.deadline()).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_deadline_never_fires() {
        let mut deadline = Deadline::new();
        deadline.arm(Duration::from_secs(1));
        deadline.cancel();
        assert!(!deadline.is_armed());

        let fired = tokio::time::timeout(Duration::from_secs(60), wait(deadline.deadline())).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_pushes_deadline_out() {
        let mut deadline = Deadline::new();
        deadline.arm(Duration::from_secs(10));
        let first = deadline.deadline().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        deadline.arm(Duration::from_secs(10));
        assert!(deadline.deadline().unwrap() > first);
    }
}
