//! Job scheduler — a self-renewing chain of one-shot timers.
//!
//! Each job gets one armed timer for its next cron occurrence. When it
//! fires, the job executes against the agent provider and then re-arms
//! itself, re-resolving the cron expression and timezone against the
//! current wall clock. Jobs are never modeled as interval timers: every
//! cycle recomputes the next instant, which keeps the chain correct
//! across daylight-saving transitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{JOB_SYSTEM_PROMPT, SchedulerConfig};
use crate::delivery::Delivery;
use crate::error::ScheduleError;
use crate::invoker::{AgentProvider, InvokeRequest};
use crate::store::JobStore;

use super::job::{RunStatus, ScheduledJob, next_fire};

/// Fires recurring agent invocations from cron expressions, guarding
/// against overlapping runs of the same job.
pub struct JobScheduler {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    agent: Arc<dyn AgentProvider>,
    delivery: Arc<dyn Delivery>,
    /// One-shot timer per job id.
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    /// Jobs with a run currently in flight.
    executing: Mutex<HashSet<Uuid>>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        agent: Arc<dyn AgentProvider>,
        delivery: Arc<dyn Delivery>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            agent,
            delivery,
            timers: Mutex::new(HashMap::new()),
            executing: Mutex::new(HashSet::new()),
        })
    }

    /// Load all enabled jobs from the store and arm a timer for each.
    pub async fn start(self: &Arc<Self>) -> Result<(), ScheduleError> {
        let jobs = self.store.list_enabled().await?;
        info!(count = jobs.len(), "Arming timers for enabled jobs");
        for job in jobs {
            self.schedule_job(&job).await;
        }
        Ok(())
    }

    /// Arm (or re-arm) the one-shot timer for a job.
    ///
    /// A cron or timezone the job's row cannot be evaluated with leaves the
    /// job unscheduled, with a warning. The computed next fire time is
    /// persisted back to the store.
    ///
    /// Boxed because `execute_job` awaits this to re-arm the chain.
    pub fn schedule_job<'a>(self: &'a Arc<Self>, job: &'a ScheduledJob) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.unschedule_job(job.id).await;

            if !job.enabled {
                debug!(job = %job.name, "Job disabled, not scheduling");
                return;
            }

            let fire_at = match next_fire(&job.cron, &job.timezone, Utc::now()) {
                Ok(at) => at,
                Err(e) => {
                    warn!(job = %job.name, error = %e, "Cannot schedule job");
                    return;
                }
            };

            if let Err(e) = self.store.set_next_run(job.id, fire_at).await {
                warn!(job = %job.name, error = %e, "Failed to persist next run time");
            }

            let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            info!(job = %job.name, fire_at = %fire_at, "Job scheduled");

            let job_id = job.id;
            let job = job.clone();
            let scheduler = Arc::clone(self);
            // The lock is held across the spawn so the timer task cannot
            // remove its entry before it is inserted.
            let mut timers = self.timers.lock().await;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // The timer drops its own entry and runs the job in a
                // separate task: aborting a timer must never abort a run,
                // and the re-arm at the end of the run must not abort the
                // task performing it.
                scheduler.timers.lock().await.remove(&job_id);
                let runner = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    runner.execute_job(job).await;
                });
            });
            timers.insert(job_id, handle);
        })
    }

    /// Clear the timer for a job, if any.
    pub async fn unschedule_job(&self, id: Uuid) {
        if let Some(handle) = self.timers.lock().await.remove(&id) {
            handle.abort();
        }
    }

    /// Begin a job run immediately, without waiting for its cron slot.
    ///
    /// Fire-and-forget: failures of the run itself surface only through
    /// logs and the job's stored last-run fields. Rejects if the job is
    /// already executing or unknown.
    pub async fn run_now(self: &Arc<Self>, id: Uuid) -> Result<(), ScheduleError> {
        if self.executing.lock().await.contains(&id) {
            return Err(ScheduleError::AlreadyRunning { id });
        }
        let job = self
            .store
            .get(id)
            .await?
            .ok_or(ScheduleError::JobNotFound { id })?;

        info!(job = %job.name, "Manual job run requested");
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.execute_job(job).await;
        });
        Ok(())
    }

    /// Whether a timer is currently armed for a job.
    pub async fn is_scheduled(&self, id: Uuid) -> bool {
        self.timers.lock().await.contains_key(&id)
    }

    /// Whether a run for a job is currently in flight.
    pub async fn is_executing(&self, id: Uuid) -> bool {
        self.executing.lock().await.contains(&id)
    }

    /// Abort all timers.
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
        info!("Job scheduler shut down");
    }

    /// Execute one job run, then re-arm the next occurrence.
    async fn execute_job(self: &Arc<Self>, job: ScheduledJob) {
        {
            let mut executing = self.executing.lock().await;
            if !executing.insert(job.id) {
                // A timer fired while a prior run (e.g. a manual one) is
                // still in flight.
                warn!(job = %job.name, "Job is still running, skipping overlapping fire");
                return;
            }
        }

        info!(job = %job.name, "Executing scheduled job");
        let started_at = Utc::now();

        if let Err(e) = self.store.record_run_started(job.id).await {
            warn!(job = %job.name, error = %e, "Failed to persist running status");
        }
        self.notify(&job, &format!("Running scheduled job: {}", job.name))
            .await;

        let typing = self.spawn_typing_loop(&job);
        let progress = self.spawn_progress_loop(&job);

        let request = InvokeRequest::new(job.prompt.clone(), self.config.tool_config.clone())
            .with_system_prompt(JOB_SYSTEM_PROMPT);
        let outcome = self.agent.invoke(request).await;

        typing.abort();
        progress.abort();

        let (status, run_error) = match outcome {
            Ok(reply) => {
                info!(job = %job.name, "Scheduled job succeeded");
                self.notify(&job, &reply.text).await;
                (RunStatus::Success, None)
            }
            Err(e) => {
                error!(job = %job.name, error = %e, "Scheduled job failed");
                self.notify(&job, &format!("Scheduled job '{}' failed: {}", job.name, e))
                    .await;
                (RunStatus::Failed, Some(e.to_string()))
            }
        };

        self.executing.lock().await.remove(&job.id);

        if let Err(e) = self
            .store
            .record_run_finished(job.id, started_at, status, run_error.as_deref())
            .await
        {
            warn!(job = %job.name, error = %e, "Failed to persist run outcome");
        }

        // Re-read the row so a disable or delete during the run wins.
        match self.store.get(job.id).await {
            Ok(Some(current)) if current.enabled => self.schedule_job(&current).await,
            Ok(_) => debug!(job = %job.name, "Job disabled or removed, not rescheduling"),
            Err(e) => warn!(job = %job.name, error = %e, "Failed to reload job for rescheduling"),
        }
    }

    /// Best-effort delivery; failures are logged and swallowed.
    async fn notify(&self, job: &ScheduledJob, text: &str) {
        if let Err(e) = self.delivery.send(&job.platform, &job.channel_id, text).await {
            debug!(job = %job.name, error = %e, "Delivery failed");
        }
    }

    /// Periodic platform "typing" signal while a run is in flight.
    fn spawn_typing_loop(&self, job: &ScheduledJob) -> JoinHandle<()> {
        let delivery = Arc::clone(&self.delivery);
        let platform = job.platform.clone();
        let channel_id = job.channel_id.clone();
        let period = self.config.typing_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // Skip immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = delivery.send_typing(&platform, &channel_id).await;
            }
        })
    }

    /// Periodic elapsed-time notification while a run is in flight.
    fn spawn_progress_loop(&self, job: &ScheduledJob) -> JoinHandle<()> {
        let delivery = Arc::clone(&self.delivery);
        let platform = job.platform.clone();
        let channel_id = job.channel_id.clone();
        let name = job.name.clone();
        let period = self.config.progress_interval;
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut ticker = tokio::time::interval(period);
            // Skip immediate first tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let minutes = started.elapsed().as_secs() / 60;
                let _ = delivery
                    .send(
                        &platform,
                        &channel_id,
                        &format!("Still working on '{name}' ({minutes} min elapsed)..."),
                    )
                    .await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::DateTime;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::{DeliveryError, InvokerError, StoreError};
    use crate::invoker::AgentReply;
    use crate::store::MemoryJobStore;

    /// Store whose next-run write yields, like any real async backend.
    struct SlowStore {
        inner: MemoryJobStore,
    }

    #[async_trait::async_trait]
    impl JobStore for SlowStore {
        async fn list_enabled(&self) -> Result<Vec<ScheduledJob>, StoreError> {
            self.inner.list_enabled().await
        }

        async fn get(&self, id: Uuid) -> Result<Option<ScheduledJob>, StoreError> {
            self.inner.get(id).await
        }

        async fn set_next_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.inner.set_next_run(id, at).await
        }

        async fn record_run_started(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.record_run_started(id).await
        }

        async fn record_run_finished(
            &self,
            id: Uuid,
            started_at: DateTime<Utc>,
            status: RunStatus,
            error: Option<&str>,
        ) -> Result<(), StoreError> {
            self.inner.record_run_finished(id, started_at, status, error).await
        }
    }

    struct FakeAgent {
        reply: String,
        fail: bool,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
    }

    impl FakeAgent {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                fail: false,
                gate: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: String::new(),
                fail: true,
                gate: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                reply: "gated reply".to_string(),
                fail: false,
                gate: Some(gate),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl AgentProvider for FakeAgent {
        async fn invoke(&self, _request: InvokeRequest) -> Result<AgentReply, InvokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(InvokerError::ProcessExit { code: 1 });
            }
            Ok(AgentReply {
                text: self.reply.clone(),
                ..AgentReply::default()
            })
        }
    }

    #[derive(Default)]
    struct RecordingDelivery {
        sent: std::sync::Mutex<Vec<(String, String, String)>>,
    }

    impl RecordingDelivery {
        fn messages(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, _, t)| t.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl Delivery for RecordingDelivery {
        async fn send(
            &self,
            platform: &str,
            channel_id: &str,
            text: &str,
        ) -> Result<(), DeliveryError> {
            self.sent.lock().unwrap().push((
                platform.to_string(),
                channel_id.to_string(),
                text.to_string(),
            ));
            Ok(())
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            tool_config: PathBuf::from("./tools.json"),
            typing_interval: Duration::from_millis(50),
            progress_interval: Duration::from_secs(60),
        }
    }

    fn make_job() -> ScheduledJob {
        ScheduledJob::new("digest", "Summarize the day", "0 9 * * *", "UTC", "cli", "chat-1")
    }

    async fn wait_until(mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn schedule_job_arms_a_future_timer_and_persists_it() {
        let store = Arc::new(MemoryJobStore::new());
        let job = make_job();
        store.upsert(job.clone()).await;

        let scheduler = JobScheduler::new(
            test_config(),
            store.clone(),
            FakeAgent::replying("ok"),
            Arc::new(RecordingDelivery::default()),
        );

        scheduler.schedule_job(&job).await;
        assert!(scheduler.is_scheduled(job.id).await);

        let stored = store.get(job.id).await.unwrap().unwrap();
        let next = stored.next_run_at.expect("next run persisted");
        assert!(next > Utc::now());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_cron_leaves_the_job_unscheduled() {
        let store = Arc::new(MemoryJobStore::new());
        let mut job = make_job();
        job.cron = "definitely not cron".to_string();
        store.upsert(job.clone()).await;

        let scheduler = JobScheduler::new(
            test_config(),
            store,
            FakeAgent::replying("ok"),
            Arc::new(RecordingDelivery::default()),
        );

        scheduler.schedule_job(&job).await;
        assert!(!scheduler.is_scheduled(job.id).await);
    }

    #[tokio::test]
    async fn start_arms_timers_for_enabled_jobs_only() {
        let store = Arc::new(MemoryJobStore::new());
        let enabled = make_job();
        let mut disabled = make_job();
        disabled.enabled = false;
        store.upsert(enabled.clone()).await;
        store.upsert(disabled.clone()).await;

        let scheduler = JobScheduler::new(
            test_config(),
            store,
            FakeAgent::replying("ok"),
            Arc::new(RecordingDelivery::default()),
        );
        scheduler.start().await.unwrap();

        assert!(scheduler.is_scheduled(enabled.id).await);
        assert!(!scheduler.is_scheduled(disabled.id).await);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn run_now_executes_and_delivers_the_reply() {
        let store = Arc::new(MemoryJobStore::new());
        let job = make_job();
        store.upsert(job.clone()).await;

        let delivery = Arc::new(RecordingDelivery::default());
        let scheduler = JobScheduler::new(
            test_config(),
            store.clone(),
            FakeAgent::replying("the daily digest"),
            delivery.clone(),
        );

        scheduler.run_now(job.id).await.unwrap();
        wait_until(async || {
            delivery.messages().iter().any(|m| m == "the daily digest")
        })
        .await;

        wait_until(async || {
            store.get(job.id).await.unwrap().unwrap().last_run_status
                == Some(RunStatus::Success)
        })
        .await;

        // The run re-armed the cron chain.
        wait_until(async || scheduler.is_scheduled(job.id).await).await;
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn run_now_rejects_unknown_jobs() {
        let scheduler = JobScheduler::new(
            test_config(),
            Arc::new(MemoryJobStore::new()),
            FakeAgent::replying("ok"),
            Arc::new(RecordingDelivery::default()),
        );

        let error = scheduler.run_now(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(error, ScheduleError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn run_now_rejects_an_already_running_job() {
        let store = Arc::new(MemoryJobStore::new());
        let job = make_job();
        store.upsert(job.clone()).await;

        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::gated(gate.clone());
        let scheduler = JobScheduler::new(
            test_config(),
            store,
            agent.clone(),
            Arc::new(RecordingDelivery::default()),
        );

        scheduler.run_now(job.id).await.unwrap();
        wait_until(async || scheduler.is_executing(job.id).await).await;

        let error = scheduler.run_now(job.id).await.unwrap_err();
        assert!(matches!(error, ScheduleError::AlreadyRunning { .. }));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        wait_until(async || !scheduler.is_executing(job.id).await).await;
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn overlapping_timer_fire_is_skipped() {
        let store = Arc::new(MemoryJobStore::new());
        let job = make_job();
        store.upsert(job.clone()).await;

        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::gated(gate.clone());
        let scheduler = JobScheduler::new(
            test_config(),
            store,
            agent.clone(),
            Arc::new(RecordingDelivery::default()),
        );

        let first = {
            let scheduler = scheduler.clone();
            let job = job.clone();
            tokio::spawn(async move { scheduler.execute_job(job).await })
        };
        wait_until(async || scheduler.is_executing(job.id).await).await;

        // A second fire for the same job returns without invoking the agent.
        scheduler.execute_job(job.clone()).await;
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        first.await.unwrap();
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn failed_run_records_the_error_and_notifies() {
        let store = Arc::new(MemoryJobStore::new());
        let job = make_job();
        store.upsert(job.clone()).await;

        let delivery = Arc::new(RecordingDelivery::default());
        let scheduler = JobScheduler::new(
            test_config(),
            store.clone(),
            FakeAgent::failing(),
            delivery.clone(),
        );

        scheduler.run_now(job.id).await.unwrap();
        wait_until(async || {
            store.get(job.id).await.unwrap().unwrap().last_run_status
                == Some(RunStatus::Failed)
        })
        .await;

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert!(stored.last_run_error.is_some());
        assert!(delivery.messages().iter().any(|m| m.contains("failed")));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_job_is_not_rescheduled_after_a_run() {
        let store = Arc::new(MemoryJobStore::new());
        let job = make_job();
        store.upsert(job.clone()).await;

        let gate = Arc::new(Notify::new());
        let scheduler = JobScheduler::new(
            test_config(),
            store.clone(),
            FakeAgent::gated(gate.clone()),
            Arc::new(RecordingDelivery::default()),
        );

        scheduler.run_now(job.id).await.unwrap();
        wait_until(async || scheduler.is_executing(job.id).await).await;

        // Disable while the run is in flight; the re-arm edge re-reads the row.
        let mut disabled = job.clone();
        disabled.enabled = false;
        store.upsert(disabled).await;
        gate.notify_one();

        wait_until(async || !scheduler.is_executing(job.id).await).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!scheduler.is_scheduled(job.id).await);
    }

    #[tokio::test]
    async fn timer_fired_run_rearms_the_chain() {
        let store = Arc::new(SlowStore {
            inner: MemoryJobStore::new(),
        });
        let mut job = make_job();
        // Every second
        job.cron = "* * * * * *".to_string();
        store.inner.upsert(job.clone()).await;

        let agent = FakeAgent::replying("tick");
        let scheduler = JobScheduler::new(
            test_config(),
            store,
            agent.clone(),
            Arc::new(RecordingDelivery::default()),
        );

        scheduler.schedule_job(&job).await;
        wait_until(async || agent.calls.load(Ordering::SeqCst) >= 1).await;

        // The run finished and armed the next occurrence.
        wait_until(async || {
            !scheduler.is_executing(job.id).await && scheduler.is_scheduled(job.id).await
        })
        .await;
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn unschedule_during_a_timer_fired_run_does_not_kill_it() {
        let store = Arc::new(MemoryJobStore::new());
        let mut job = make_job();
        job.cron = "* * * * * *".to_string();
        store.upsert(job.clone()).await;

        let gate = Arc::new(Notify::new());
        let agent = FakeAgent::gated(gate.clone());
        let scheduler = JobScheduler::new(
            test_config(),
            store.clone(),
            agent.clone(),
            Arc::new(RecordingDelivery::default()),
        );

        scheduler.schedule_job(&job).await;
        wait_until(async || scheduler.is_executing(job.id).await).await;

        // Clearing the timer must not touch the in-flight run.
        scheduler.unschedule_job(job.id).await;
        gate.notify_one();

        wait_until(async || !scheduler.is_executing(job.id).await).await;
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.last_run_status, Some(RunStatus::Success));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn unschedule_clears_the_timer() {
        let store = Arc::new(MemoryJobStore::new());
        let job = make_job();
        store.upsert(job.clone()).await;

        let scheduler = JobScheduler::new(
            test_config(),
            store,
            FakeAgent::replying("ok"),
            Arc::new(RecordingDelivery::default()),
        );

        scheduler.schedule_job(&job).await;
        assert!(scheduler.is_scheduled(job.id).await);
        scheduler.unschedule_job(job.id).await;
        assert!(!scheduler.is_scheduled(job.id).await);
    }
}
