//! Resume signal delivery.
//!
//! A paused job blocks until someone (the review surface, a CLI, a test)
//! announces that a resolution is ready. The in-process bus covers the
//! single-binary deployment; callers always combine it with the polling
//! fallback on the job's status, so a missed broadcast only costs one poll
//! interval.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A named wake-up channel keyed by job id.
#[async_trait]
pub trait ResumeSignal: Send + Sync {
    /// Wait until a resume notification for `job_id` arrives or `timeout`
    /// elapses. Returns `true` when signalled.
    async fn wait(&self, job_id: Uuid, timeout: Duration) -> bool;

    /// Announce that a resolution for `job_id` is ready.
    fn notify(&self, job_id: Uuid);
}

/// Broadcast-based in-process resume bus.
pub struct LocalResumeBus {
    tx: broadcast::Sender<Uuid>,
}

impl LocalResumeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }
}

impl Default for LocalResumeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResumeSignal for LocalResumeBus {
    async fn wait(&self, job_id: Uuid, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(id)) if id == job_id => return true,
                Ok(Ok(_)) => continue,
                // Lagged receivers may have dropped our id; report signalled
                // so the caller re-checks the store.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => return true,
                Ok(Err(broadcast::error::RecvError::Closed)) => return false,
                Err(_) => return false,
            }
        }
    }

    fn notify(&self, job_id: Uuid) {
        let _ = self.tx.send(job_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn wait_returns_on_matching_notify() {
        let bus = Arc::new(LocalResumeBus::new());
        let id = Uuid::new_v4();

        let waiter = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.wait(id, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.notify(id);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_ignores_other_jobs_and_times_out() {
        let bus = LocalResumeBus::new();
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();

        let wait = bus.wait(id, Duration::from_millis(50));
        bus.notify(other);
        assert!(!wait.await);
    }
}
