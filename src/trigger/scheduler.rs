//! Timed continuations.
//!
//! The scheduler owns every deadline in the system: schedule triggers, due
//! timers of waiting executions and input expiries. A periodic sweep turns the
//! due ones into [`TriggerEvent`]s on the emitter and never runs flow logic
//! itself.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    common::Shutdown,
    config::SchedulerConfig,
    model::{ExecutionId, TriggerId},
    trigger::{FlowTrigger, TriggerEvent, TriggerEventEmitter},
    utils::time::after_millis,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum JobKey {
    Trigger(TriggerId),
    Resume(ExecutionId),
    Expire(ExecutionId),
}

#[derive(Debug, Clone)]
struct Job {
    tenant_id: String,
    at: DateTime<Utc>,
    /// step an expiry was armed at
    step: u32,
}

pub struct TriggerScheduler {
    jobs: Mutex<BTreeMap<JobKey, Job>>,
    emitter: Arc<TriggerEventEmitter>,
    poll_interval: Duration,

    shutdown: Arc<Shutdown>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TriggerScheduler {
    pub fn new(
        emitter: Arc<TriggerEventEmitter>,
        config: &SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(BTreeMap::new()),
            emitter,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown: Arc::new(Shutdown::new()),
            handle: Mutex::new(None),
        })
    }

    /// Fires `trigger` at `at`, replacing an earlier schedule of the same trigger.
    pub fn schedule_trigger(
        &self,
        trigger: &FlowTrigger,
        at: DateTime<Utc>,
    ) {
        debug!(trigger_id = %trigger.id, "schedule trigger at {}", at);
        self.arm(JobKey::Trigger(trigger.id.clone()), &trigger.tenant_id, at, 0);
    }

    /// Removes a scheduled trigger. Unknown ids are ignored.
    pub fn cancel_scheduled_trigger(
        &self,
        trigger_id: &str,
    ) {
        self.jobs.lock().remove(&JobKey::Trigger(trigger_id.to_string()));
    }

    pub fn schedule_resume(
        &self,
        tenant_id: &str,
        execution_id: &str,
        at: DateTime<Utc>,
    ) {
        debug!(execution_id, "schedule resume at {}", at);
        self.arm(JobKey::Resume(execution_id.to_string()), tenant_id, at, 0);
    }

    pub fn schedule_expiry(
        &self,
        tenant_id: &str,
        execution_id: &str,
        step: u32,
        at: DateTime<Utc>,
    ) {
        debug!(execution_id, step, "schedule input expiry at {}", at);
        self.arm(JobKey::Expire(execution_id.to_string()), tenant_id, at, step);
    }

    /// Drops pending resume and expiry jobs of an execution.
    pub fn cancel_execution_jobs(
        &self,
        execution_id: &str,
    ) {
        let mut jobs = self.jobs.lock();
        jobs.remove(&JobKey::Resume(execution_id.to_string()));
        jobs.remove(&JobKey::Expire(execution_id.to_string()));
    }

    /// When `trigger_id` fires next, if scheduled.
    pub fn next_trigger_run(
        &self,
        trigger_id: &str,
    ) -> Option<DateTime<Utc>> {
        self.jobs.lock().get(&JobKey::Trigger(trigger_id.to_string())).map(|j| j.at)
    }

    pub fn next_resume(
        &self,
        execution_id: &str,
    ) -> Option<DateTime<Utc>> {
        self.jobs.lock().get(&JobKey::Resume(execution_id.to_string())).map(|j| j.at)
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    fn arm(
        &self,
        key: JobKey,
        tenant_id: &str,
        at: DateTime<Utc>,
        step: u32,
    ) {
        self.jobs.lock().insert(
            key,
            Job {
                tenant_id: tenant_id.to_string(),
                at,
                step,
            },
        );
    }

    /// Emits every due job and returns how many were handed over.
    ///
    /// Resume and expiry jobs the emitter refused are re-armed one poll
    /// interval later.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let due: Vec<(JobKey, Job)> = {
            let mut jobs = self.jobs.lock();
            let keys: Vec<JobKey> = jobs.iter().filter(|(_, job)| job.at <= now).map(|(k, _)| k.clone()).collect();
            keys.into_iter().filter_map(|k| jobs.remove(&k).map(|job| (k, job))).collect()
        };

        let mut emitted = 0;
        for (key, job) in due {
            let event = match &key {
                JobKey::Trigger(id) => TriggerEvent::scheduled(&job.tenant_id, id),
                JobKey::Resume(id) => TriggerEvent::execution_resume(&job.tenant_id, id),
                JobKey::Expire(id) => TriggerEvent::execution_expire(&job.tenant_id, id, job.step),
            };

            match self.emitter.emit(event) {
                Ok(()) => emitted += 1,
                Err(err) => match key {
                    JobKey::Trigger(id) => warn!(trigger_id = %id, "dropping scheduled trigger: {}", err),
                    key => {
                        warn!("re-arming {:?}: {}", key, err);
                        let retry_at = after_millis(u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX));
                        let mut jobs = self.jobs.lock();
                        // a newer job under the same key wins
                        jobs.entry(key).or_insert(Job {
                            at: retry_at,
                            ..job
                        });
                    }
                },
            }
        }
        emitted
    }

    pub fn start(
        self: &Arc<Self>,
        runtime: &Handle,
    ) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let scheduler = self.clone();
        let shutdown = self.shutdown.clone();
        *handle = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        let emitted = scheduler.sweep();
                        if emitted > 0 {
                            debug!(emitted, "scheduler sweep");
                        }
                    }
                }
            }
        }));
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "trigger scheduler started");
    }

    /// Stops the sweep loop. Pending jobs are kept.
    pub async fn stop(&self) {
        self.shutdown.shutdown();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::{
        Result,
        trigger::{EXECUTION_ID_KEY, EventSink, TriggerConfig, TriggerEventType, TriggerType},
    };

    #[derive(Default)]
    struct Recorder(PlMutex<Vec<TriggerEvent>>);

    impl EventSink for Recorder {
        fn publish(
            &self,
            event: TriggerEvent,
        ) -> Result<()> {
            self.0.lock().push(event);
            Ok(())
        }
    }

    fn scheduler() -> (Arc<TriggerScheduler>, Arc<TriggerEventEmitter>) {
        let emitter = TriggerEventEmitter::new();
        let scheduler = TriggerScheduler::new(
            emitter.clone(),
            &SchedulerConfig {
                poll_interval_ms: 10,
            },
        );
        (scheduler, emitter)
    }

    #[test]
    fn test_sweep_emits_only_due_jobs() {
        let (scheduler, emitter) = scheduler();
        let recorder = Arc::new(Recorder::default());
        emitter.subscribe(recorder.clone());

        let trigger = FlowTrigger::new("t1", "f1", "daily", TriggerConfig::new(TriggerType::Schedule));
        scheduler.schedule_trigger(&trigger, Utc::now() - chrono::Duration::seconds(1));
        scheduler.schedule_resume("t1", "e1", Utc::now());
        scheduler.schedule_expiry("t1", "e2", 3, Utc::now() + chrono::Duration::hours(1));

        assert_eq!(scheduler.sweep(), 2);
        assert_eq!(scheduler.pending(), 1);
        let events = recorder.0.lock();
        assert!(events.iter().any(|e| e.event_type == TriggerEventType::Scheduled));
        assert!(events.iter().any(|e| e.event_type == TriggerEventType::ExecutionResume && e.metadata.get_str(EXECUTION_ID_KEY) == Some("e1")));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (scheduler, _) = scheduler();
        let trigger = FlowTrigger::new("t1", "f1", "daily", TriggerConfig::new(TriggerType::Schedule));
        scheduler.schedule_trigger(&trigger, Utc::now());
        scheduler.cancel_scheduled_trigger(&trigger.id);
        scheduler.cancel_scheduled_trigger(&trigger.id);
        scheduler.cancel_scheduled_trigger("unknown");
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_failed_resume_is_rearmed() {
        let (scheduler, _) = scheduler();
        scheduler.schedule_resume("t1", "e1", Utc::now());
        // no subscribers, the emit fails
        assert_eq!(scheduler.sweep(), 0);
        assert!(scheduler.next_resume("e1").is_some());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (scheduler, emitter) = scheduler();
        let recorder = Arc::new(Recorder::default());
        emitter.subscribe(recorder.clone());
        scheduler.start(&Handle::current());
        scheduler.schedule_resume("t1", "e1", Utc::now());

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.stop().await;
        assert_eq!(recorder.0.lock().len(), 1);
    }
}
