//! Fan-out loops and the bounded-concurrency worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mcp_relay_core::error::ReportContext;
use mcp_relay_core::model::{RemoteSessionId, RunId, SessionId};
use mcp_relay_core::queue::Job;
use mcp_relay_core::{ErrorReporter, JobQueue, RelayError, RelayStore, SecretReveal};
use mcp_relay_registry::ManagerRegistry;

/// Reconciliation tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Session fan-out cadence.
    pub session_interval: Duration,
    /// Run fan-out cadence.
    pub run_interval: Duration,
    /// Page size for fan-out listing and watermark pulls.
    pub batch_size: usize,
    /// Watermark overlap: re-query from this much before `last_sync_at`
    /// to tolerate clock skew.
    pub overlap: Duration,
    /// Minimum spacing between discovery attempts per variant.
    pub discovery_cooldown: Duration,
    /// Concurrently processed jobs.
    pub worker_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            session_interval: Duration::from_secs(30),
            run_interval: Duration::from_secs(15),
            batch_size: 100,
            overlap: Duration::from_secs(2),
            discovery_cooldown: Duration::from_secs(15 * 60),
            worker_concurrency: 4,
        }
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct SyncDeps {
    pub store: Arc<dyn RelayStore>,
    pub registry: Arc<ManagerRegistry>,
    pub secrets: Arc<dyn SecretReveal>,
    pub queue: Arc<dyn JobQueue>,
    pub reporter: Arc<dyn ErrorReporter>,
}

/// Reconciliation scheduler: cron-style fan-out plus a worker pool.
pub struct SyncScheduler {
    deps: SyncDeps,
    config: SyncConfig,
}

impl SyncScheduler {
    #[must_use]
    pub fn new(deps: SyncDeps, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self { deps, config })
    }

    /// Start the fan-out loops and the worker pool; all stop on
    /// cancellation (the worker also stops when the queue closes).
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_fan_out(cancel.clone(), self.config.session_interval, Kind::Sessions),
            self.spawn_fan_out(cancel.clone(), self.config.run_interval, Kind::Runs),
            self.spawn_worker(cancel),
        ]
    }

    fn spawn_fan_out(
        self: &Arc<Self>,
        cancel: CancellationToken,
        period: Duration,
        kind: Kind,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let result = match kind {
                            Kind::Sessions => scheduler.fan_out_sessions().await,
                            Kind::Runs => scheduler.fan_out_runs().await,
                        };
                        if let Err(e) = result {
                            scheduler.report(&e, ReportContext::default());
                        }
                    }
                }
            }
        })
    }

    fn spawn_worker(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let limit = Arc::new(Semaphore::new(self.config.worker_concurrency));
        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    () = cancel.cancelled() => break,
                    job = scheduler.deps.queue.dequeue() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
                    break;
                };
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    scheduler.handle_job(job).await;
                    drop(permit);
                });
            }
        })
    }

    /// Enqueue one idempotent job per non-finalized session mirror, in
    /// strictly increasing id order.
    ///
    /// # Errors
    /// Returns the first storage or queue failure.
    pub async fn fan_out_sessions(&self) -> Result<(), RelayError> {
        let mut after: Option<RemoteSessionId> = None;
        loop {
            let page = self
                .deps
                .store
                .list_unfinalized_sessions(after.as_ref(), self.config.batch_size)
                .await?;
            let full = page.len() == self.config.batch_size;
            after = page.last().map(|r| r.id.clone());
            for record in page {
                self.enqueue(Job::SyncSession(record.id)).await?;
            }
            if !full {
                return Ok(());
            }
        }
    }

    /// Enqueue one idempotent job per non-finalized run mirror.
    ///
    /// # Errors
    /// Returns the first storage or queue failure.
    pub async fn fan_out_runs(&self) -> Result<(), RelayError> {
        let mut after: Option<RunId> = None;
        loop {
            let page = self
                .deps
                .store
                .list_unfinalized_runs(after.as_ref(), self.config.batch_size)
                .await?;
            let full = page.len() == self.config.batch_size;
            after = page.last().map(|r| r.id.clone());
            for record in page {
                self.enqueue(Job::SyncRun(record.id)).await?;
            }
            if !full {
                return Ok(());
            }
        }
    }

    /// Recovery path: immediately enqueue session and run reconciliation
    /// for one local session, bypassing the cron cadence.
    ///
    /// # Errors
    /// Returns the first storage or queue failure.
    pub async fn force_sync(&self, session_id: SessionId) -> Result<(), RelayError> {
        if let Some(record) = self.deps.store.get_remote_session_for(session_id).await? {
            self.enqueue(Job::SyncSession(record.id)).await?;
        }
        for run in self.deps.store.list_runs_for_session(session_id).await? {
            if !run.is_finalized {
                self.enqueue(Job::SyncRun(run.id)).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_job(&self, job: Job) {
        tracing::debug!(key = %job.idempotency_key(), "processing job");
        let (result, context) = match job {
            Job::SyncSession(id) => (
                crate::session_sync::sync_session(&self.deps, &id).await,
                ReportContext {
                    remote_session_id: Some(id),
                    ..ReportContext::default()
                },
            ),
            Job::SyncRun(id) => (
                crate::run_sync::sync_run(&self.deps, &self.config, &id).await,
                ReportContext {
                    instance: Some(id),
                    ..ReportContext::default()
                },
            ),
            Job::Discover(id) => (
                crate::discovery::discover_variant(&self.deps, &self.config, id).await,
                ReportContext {
                    instance: Some(id.to_string()),
                    ..ReportContext::default()
                },
            ),
        };
        if let Err(e) = result {
            self.report(&e, context);
        }
    }

    async fn enqueue(&self, job: Job) -> Result<(), RelayError> {
        self.deps
            .queue
            .enqueue(job)
            .await
            .map_err(|e| RelayError::Queue(e.to_string()))
    }

    fn report(&self, error: &RelayError, context: ReportContext) {
        self.deps.reporter.report(error, &context);
    }
}

#[derive(Clone, Copy)]
enum Kind {
    Sessions,
    Runs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::{run_record, session_record, Fixture};
    use mcp_relay_core::RelayStore;
    use mcp_relay_core::model::RunState;

    #[tokio::test]
    async fn fan_out_enqueues_once_per_unfinalized_mirror() {
        let fx = Fixture::new().await;
        for id in ["rs-a", "rs-b", "rs-c"] {
            fx.store
                .upsert_remote_session(&session_record(id, fx.session_id, false))
                .await
                .unwrap();
        }
        fx.store
            .upsert_remote_session(&session_record("rs-retired", fx.session_id, true))
            .await
            .unwrap();

        // duplicate fan-out passes collapse onto the same pending jobs
        fx.scheduler.fan_out_sessions().await.unwrap();
        fx.scheduler.fan_out_sessions().await.unwrap();

        let jobs = fx.queue.drain().await;
        assert_eq!(
            jobs,
            vec![
                Job::SyncSession("rs-a".to_string()),
                Job::SyncSession("rs-b".to_string()),
                Job::SyncSession("rs-c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn fan_out_pages_through_large_sets() {
        let config = SyncConfig {
            batch_size: 2,
            ..SyncConfig::default()
        };
        let fx = Fixture::with_config(config).await;
        for id in ["run-1", "run-2", "run-3", "run-4", "run-5"] {
            fx.store
                .insert_run(&run_record(id, fx.session_id, RunState::Active))
                .await
                .unwrap();
        }

        fx.scheduler.fan_out_runs().await.unwrap();
        assert_eq!(fx.queue.drain().await.len(), 5);
    }

    #[tokio::test]
    async fn force_sync_enqueues_session_and_run_jobs() {
        let fx = Fixture::new().await;
        fx.store
            .upsert_remote_session(&session_record("rs-1", fx.session_id, false))
            .await
            .unwrap();
        fx.store
            .insert_run(&run_record("run-1", fx.session_id, RunState::Active))
            .await
            .unwrap();
        fx.store
            .insert_run(&run_record("run-2", fx.session_id, RunState::Completed))
            .await
            .unwrap();

        fx.scheduler.force_sync(fx.session_id).await.unwrap();

        let jobs = fx.queue.drain().await;
        assert!(jobs.contains(&Job::SyncSession("rs-1".to_string())));
        assert!(jobs.contains(&Job::SyncRun("run-1".to_string())));
        assert!(jobs.contains(&Job::SyncRun("run-2".to_string())));
    }

    #[tokio::test]
    async fn worker_processes_queued_jobs_until_cancelled() {
        let fx = Fixture::new().await;
        fx.queue
            .enqueue(Job::Discover(fx.variant_id))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handles = fx.scheduler.spawn(cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.manager.discover_calls() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("discovery job was never processed");

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
