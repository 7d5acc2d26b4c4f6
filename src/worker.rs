//! Worker: claims pending jobs and runs them with bounded parallelism.
//!
//! Multiple worker processes may share one queue; the claim itself is the
//! mutual exclusion (a claimed job carries the worker id and leaves
//! `pending`). Poll sleeps are jittered so workers don't stampede the
//! queue in lockstep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;

use crate::config::OrchestratorConfig;
use crate::executor::JobExecutor;
use crate::notify::{CallbackEvent, CallbackNotifier};
use crate::store::JobStore;

pub struct Worker {
    id: String,
    store: Arc<dyn JobStore>,
    executor: Arc<JobExecutor>,
    notifier: Arc<dyn CallbackNotifier>,
    config: OrchestratorConfig,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn JobStore>,
        executor: Arc<JobExecutor>,
        notifier: Arc<dyn CallbackNotifier>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            id: id.into(),
            store,
            executor,
            notifier,
            config,
        }
    }

    /// Claim-and-execute loop. Runs until the surrounding task is aborted.
    pub async fn run(&self) {
        let slots = Arc::new(Semaphore::new(self.config.max_parallel_jobs));
        tracing::info!(
            worker = %self.id,
            parallelism = self.config.max_parallel_jobs,
            "Worker started"
        );

        loop {
            // Hold a slot before claiming so a claimed job never waits
            // un-heartbeated behind a full worker.
            let permit = match Arc::clone(&slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            match self.store.claim_next_pending(&self.id).await {
                Ok(Some(job)) => {
                    tracing::info!(worker = %self.id, job_id = %job.id, "Claimed job");
                    self.notifier
                        .notify(CallbackEvent::JobStarted {
                            job_id: job.id,
                            user_id: job.user_id.clone(),
                        })
                        .await;

                    let executor = Arc::clone(&self.executor);
                    tokio::spawn(async move {
                        let _slot = permit;
                        executor.execute(job).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::time::sleep(self.jittered_poll_interval()).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(worker = %self.id, error = %e, "Claim query failed");
                    tokio::time::sleep(self.config.claim_poll_interval).await;
                }
            }
        }
    }

    fn jittered_poll_interval(&self) -> Duration {
        let base = self.config.claim_poll_interval;
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Periodic sweep marking jobs past their deadline as `expired`. Covers
/// jobs whose worker died without releasing them.
pub async fn run_expiry_sweep(store: Arc<dyn JobStore>, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        match store.expire_overdue(Utc::now()).await {
            Ok(0) => {}
            Ok(expired) => {
                tracing::info!(expired, "Marked overdue jobs as expired");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Expiry sweep failed");
            }
        }
    }
}
