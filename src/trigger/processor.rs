//! Event intake and dispatch.
//!
//! Events are hashed onto one bounded partition per worker by conversation,
//! so the events of one conversation are handled in arrival order while
//! different conversations proceed in parallel.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    ChatflowError, FlowEngine, Result,
    common::{Queue, Shutdown},
    config::{OverflowPolicy, ProcessorConfig},
    runtime::{ExecutionContext, ExecutionStatus},
    trigger::{EXECUTION_ID_KEY, EventSink, FlowTrigger, STEP_KEY, TriggerEvent, TriggerEventType, TriggerMatch, TriggerMatcher, TriggerRegistry, TriggerType},
};

struct Partition {
    queue: Arc<Queue<TriggerEvent>>,
    /// held by producers, so a slot freed by shedding goes to the producer that freed it
    producers: Mutex<()>,
}

pub struct TriggerProcessor {
    engine: FlowEngine,
    registry: Arc<TriggerRegistry>,
    partitions: Vec<Partition>,
    config: ProcessorConfig,

    accepting: AtomicBool,
    shutdown: Arc<Shutdown>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TriggerProcessor {
    pub fn new(
        engine: FlowEngine,
        registry: Arc<TriggerRegistry>,
        config: &ProcessorConfig,
    ) -> Arc<Self> {
        let workers = config.workers.max(1);
        Arc::new(Self {
            engine,
            registry,
            partitions: (0..workers)
                .map(|_| Partition {
                    queue: Queue::new(config.queue_capacity.max(1)),
                    producers: Mutex::new(()),
                })
                .collect(),
            config: config.clone(),
            accepting: AtomicBool::new(true),
            shutdown: Arc::new(Shutdown::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn register_matcher(
        &self,
        matcher: Arc<dyn TriggerMatcher>,
    ) {
        self.registry.register_matcher(matcher);
    }

    /// Queues `event` for its conversation's worker and returns.
    ///
    /// Resume and expiry events are accepted only from the scheduler. Under
    /// [`OverflowPolicy::DropOldest`] a full partition sheds its oldest
    /// external event; internal events are never shed, and a refused one is
    /// re-armed by the scheduler.
    pub fn process_event(
        &self,
        event: TriggerEvent,
    ) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ChatflowError::Queue("trigger processor is stopped".to_string()));
        }
        if event.is_forged_internal() {
            return Err(ChatflowError::Trigger(format!("{} events are produced by the scheduler only", event.event_type.as_ref())));
        }

        let partition = &self.partitions[self.partition_of(&event)];
        let _producer = partition.producers.lock();
        let Err(event) = partition.queue.try_send(event) else {
            return Ok(());
        };

        match self.config.overflow {
            OverflowPolicy::RejectNew => {
                warn!(event_id = %event.id, tenant_id = %event.tenant_id, "partition full, rejecting {} event", event.event_type.as_ref());
                Err(ChatflowError::Queue(format!("partition full, event {} rejected", event.id)))
            }
            OverflowPolicy::DropOldest => {
                if !self.shed_external(&partition.queue) {
                    warn!(event_id = %event.id, tenant_id = %event.tenant_id, "partition holds only internal events, rejecting {} event", event.event_type.as_ref());
                    return Err(ChatflowError::Queue(format!("partition full, event {} rejected", event.id)));
                }
                partition.queue.try_send(event).map_err(|event| ChatflowError::Queue(format!("partition full, event {} rejected", event.id)))
            }
        }
    }

    /// Frees one slot by dropping the oldest external event. Internal events
    /// met on the way move to the back. False when every queued event is internal.
    fn shed_external(
        &self,
        queue: &Queue<TriggerEvent>,
    ) -> bool {
        for _ in 0..self.config.queue_capacity.max(1) {
            let Some(oldest) = queue.try_next() else {
                return true;
            };
            if !oldest.event_type.is_internal() {
                warn!(event_id = %oldest.id, tenant_id = %oldest.tenant_id, "partition full, dropping oldest {} event", oldest.event_type.as_ref());
                return true;
            }
            if let Err(lost) = queue.try_send(oldest) {
                error!(event_id = %lost.id, tenant_id = %lost.tenant_id, "fail to requeue {} event", lost.event_type.as_ref());
            }
        }
        false
    }

    /// Events waiting in every partition.
    pub fn pending(&self) -> usize {
        self.partitions.iter().map(|p| p.queue.len()).sum()
    }

    pub fn start(
        self: &Arc<Self>,
        runtime: &Handle,
    ) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }

        for (i, partition) in self.partitions.iter().enumerate() {
            let this = self.clone();
            let partition = partition.queue.clone();
            let shutdown = self.shutdown.clone();
            workers.push(runtime.spawn(async move {
                debug!(worker = i, "trigger worker started");
                loop {
                    tokio::select! {
                        _ = shutdown.wait() => {
                            while let Some(event) = partition.try_next() {
                                this.handle_guarded(event).await;
                            }
                            break;
                        }
                        Some(event) = partition.next_async() => this.handle_guarded(event).await,
                    }
                }
                debug!(worker = i, "trigger worker stopped");
            }));
        }
        info!("trigger processor started with {} workers", workers.len());
    }

    /// Rejects new events, drains what is queued and waits for the workers.
    pub async fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.shutdown();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                error!("trigger worker ended abnormally: {}", err);
            }
        }
        info!("trigger processor stopped");
    }

    fn partition_of(
        &self,
        event: &TriggerEvent,
    ) -> usize {
        let mut hasher = DefaultHasher::new();
        event.partition_key().hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    /// Handles `event`, keeping the worker alive when handling panics.
    async fn handle_guarded(
        &self,
        event: TriggerEvent,
    ) {
        let (event_id, tenant_id) = (event.id.clone(), event.tenant_id.clone());
        if AssertUnwindSafe(self.handle(event)).catch_unwind().await.is_err() {
            error!(event_id = %event_id, tenant_id = %tenant_id, "event handling panicked");
        }
    }

    async fn handle(
        &self,
        mut event: TriggerEvent,
    ) {
        event.processed_at = Some(Utc::now());
        debug!(event_id = %event.id, tenant_id = %event.tenant_id, "handle {} event", event.event_type.as_ref());

        match event.event_type {
            TriggerEventType::ExecutionResume => self.resume_due(&event).await,
            TriggerEventType::ExecutionExpire => self.expire_due(&event).await,
            TriggerEventType::MessageReceived if self.resume_waiting(&event).await => {}
            _ => self.dispatch(&event).await,
        }
    }

    async fn resume_due(
        &self,
        event: &TriggerEvent,
    ) {
        let Some(execution_id) = event.metadata.get_str(EXECUTION_ID_KEY) else {
            warn!(event_id = %event.id, "resume event without execution id");
            return;
        };
        match self.engine.resume_execution(execution_id, None).await {
            Ok(result) => debug!(execution_id, "resumed to {}", result.status.as_ref()),
            Err(err @ (ChatflowError::Conflict(_) | ChatflowError::State(_) | ChatflowError::NotFound(_))) => {
                debug!(execution_id, "skip resume: {}", err)
            }
            Err(err) => warn!(execution_id, "resume failed: {}", err),
        }
    }

    async fn expire_due(
        &self,
        event: &TriggerEvent,
    ) {
        let (Some(execution_id), Some(step)) = (event.metadata.get_str(EXECUTION_ID_KEY), event.metadata.get::<u32>(STEP_KEY)) else {
            warn!(event_id = %event.id, "expire event without execution id or step");
            return;
        };
        match self.engine.expire_execution(execution_id, step).await {
            Ok(Some(_)) => info!(execution_id, "input wait expired"),
            Ok(None) => debug!(execution_id, "expiry no longer applies"),
            Err(err) => warn!(execution_id, "expire failed: {}", err),
        }
    }

    /// Feeds an inbound message to the execution waiting on it. False when none waits.
    async fn resume_waiting(
        &self,
        event: &TriggerEvent,
    ) -> bool {
        let Some(conversation_id) = event.conversation_id.as_deref() else {
            return false;
        };
        let waiting = match self.engine.find_waiting_for_input(&event.tenant_id, conversation_id) {
            Ok(Some(waiting)) => waiting,
            Ok(None) => return false,
            Err(err) => {
                warn!(event_id = %event.id, "fail to look up waiting execution: {}", err);
                return false;
            }
        };

        let input = event.data.get_value("text").cloned().unwrap_or(Value::Null);
        match self.engine.resume_execution(&waiting.execution_id, Some(input)).await {
            Ok(result) => debug!(execution_id = %waiting.execution_id, "input resumed to {}", result.status.as_ref()),
            Err(err) => warn!(execution_id = %waiting.execution_id, "input resume failed: {}", err),
        }
        true
    }

    async fn dispatch(
        &self,
        event: &TriggerEvent,
    ) {
        let matches = match self.matches(event) {
            Ok(matches) => matches,
            Err(err) => {
                warn!(event_id = %event.id, "fail to load triggers: {}", err);
                return;
            }
        };
        if matches.is_empty() {
            debug!(event_id = %event.id, "no trigger matched");
            return;
        }

        let selected = if self.config.fan_out {
            matches
        } else {
            matches.into_iter().take(1).collect()
        };
        for (trigger, m) in selected {
            self.fire(event, &trigger, m).await;
        }
    }

    /// Matching triggers ranked by priority, then age.
    fn matches(
        &self,
        event: &TriggerEvent,
    ) -> Result<Vec<(FlowTrigger, TriggerMatch)>> {
        let mut matches = Vec::new();
        for trigger in self.registry.candidates(&event.tenant_id, event.event_type.trigger_types())? {
            let matched = self.registry.matcher(trigger.trigger_type).and_then(|matcher| matcher.match_event(event, &trigger));
            match matched {
                Ok(Some(m)) => matches.push((trigger, m)),
                Ok(None) => {}
                Err(err) => {
                    warn!(trigger_id = %trigger.id, event_id = %event.id, "matcher failed: {}", err);
                    if let Err(err) = self.registry.record_failure(&trigger.id, &err.to_string()) {
                        warn!(trigger_id = %trigger.id, "fail to record trigger failure: {}", err);
                    }
                }
            }
        }
        matches.sort_by(|(a, _), (b, _)| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(matches)
    }

    async fn fire(
        &self,
        event: &TriggerEvent,
        trigger: &FlowTrigger,
        m: TriggerMatch,
    ) {
        let mut ctx = ExecutionContext::new(&event.tenant_id).with_variables(m.variables).with_trigger(trigger.trigger_type.as_ref(), event.data.clone());
        ctx.contact_id = event.contact_id.clone();
        ctx.conversation_id = event.conversation_id.clone();
        ctx.context.extend(m.context);
        ctx.context.set("trigger_id", &trigger.id);
        ctx.context.set("event_id", &event.id);

        info!(trigger_id = %trigger.id, flow_id = %trigger.flow_id, event_id = %event.id, "trigger fired");
        let failure = match self.engine.execute_flow(&trigger.flow_id, ctx).await {
            Ok(result) if result.status == ExecutionStatus::Failed => Some(result.error.unwrap_or_else(|| "execution failed".to_string())),
            Ok(result) => {
                debug!(trigger_id = %trigger.id, execution_id = %result.execution_id, "execution {}", result.status.as_ref());
                None
            }
            Err(err @ (ChatflowError::Conflict(_) | ChatflowError::RateLimited(_))) => {
                info!(trigger_id = %trigger.id, flow_id = %trigger.flow_id, "flow not started: {}", err);
                Some(err.to_string())
            }
            Err(err) => {
                warn!(trigger_id = %trigger.id, flow_id = %trigger.flow_id, "flow start failed: {}", err);
                Some(err.to_string())
            }
        };

        if let Err(err) = self.registry.record_fire(&trigger.id) {
            warn!(trigger_id = %trigger.id, "fail to record trigger fire: {}", err);
        }
        if let Some(reason) = failure {
            if let Err(err) = self.registry.record_failure(&trigger.id, &reason) {
                warn!(trigger_id = %trigger.id, "fail to record trigger failure: {}", err);
            }
        }
        if trigger.trigger_type == TriggerType::Schedule {
            if let Err(err) = self.registry.after_fire(&trigger.id) {
                warn!(trigger_id = %trigger.id, "fail to re-arm schedule: {}", err);
            }
        }
    }
}

impl EventSink for TriggerProcessor {
    fn publish(
        &self,
        event: TriggerEvent,
    ) -> Result<()> {
        self.process_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatflowBuilder, Config};

    fn processor(capacity: usize) -> Arc<TriggerProcessor> {
        let mut config = Config::default();
        config.processor.workers = 1;
        config.processor.queue_capacity = capacity;
        config.processor.overflow = OverflowPolicy::DropOldest;
        ChatflowBuilder::new().config(config).build().unwrap().processor()
    }

    fn custom(conversation_id: &str) -> TriggerEvent {
        TriggerEvent::new("acme", TriggerEventType::Custom).with_conversation(conversation_id)
    }

    fn drain(processor: &TriggerProcessor) -> Vec<TriggerEventType> {
        std::iter::from_fn(|| processor.partitions[0].queue.try_next()).map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn test_internal_event_outlives_drop_oldest() {
        let processor = processor(1);
        processor.process_event(TriggerEvent::execution_resume("acme", &"e1".to_string())).unwrap();
        assert!(matches!(processor.process_event(custom("conv-1")), Err(ChatflowError::Queue(_))));
        assert_eq!(drain(&processor), vec![TriggerEventType::ExecutionResume]);

        let processor = self::processor(2);
        processor.process_event(custom("conv-1")).unwrap();
        processor.process_event(TriggerEvent::execution_expire("acme", &"e1".to_string(), 3)).unwrap();
        processor.process_event(custom("conv-2")).unwrap();
        assert_eq!(drain(&processor), vec![TriggerEventType::ExecutionExpire, TriggerEventType::Custom]);
    }

    #[tokio::test]
    async fn test_internal_event_sheds_external() {
        let processor = processor(1);
        processor.process_event(custom("conv-1")).unwrap();
        processor.process_event(TriggerEvent::execution_resume("acme", &"e1".to_string())).unwrap();
        assert_eq!(drain(&processor), vec![TriggerEventType::ExecutionResume]);
    }

    #[tokio::test]
    async fn test_forged_internal_event_rejected() {
        let processor = processor(4);
        let forged = TriggerEvent::new("acme", TriggerEventType::ExecutionResume).with_metadata(EXECUTION_ID_KEY, "e1");
        assert!(matches!(processor.process_event(forged.clone()), Err(ChatflowError::Trigger(_))));
        assert!(processor.publish(forged).is_err());
        assert_eq!(processor.pending(), 0);

        processor.process_event(TriggerEvent::execution_resume("acme", &"e1".to_string())).unwrap();
        assert_eq!(processor.pending(), 1);
    }
}
