//! Composition root tying the engine to the trigger subsystem.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::runtime::Handle;
use tracing::info;

use crate::{
    FlowEngine, Result,
    flow::Flow,
    model::FlowDefinition,
    trigger::{FlowTrigger, TriggerConfig, TriggerEventEmitter, TriggerProcessor, TriggerRegistry, TriggerScheduler},
};

/// A running chatbot: flows, triggers and the workers that connect them.
///
/// # Example
///
/// ```rust,ignore
/// let chatflow = ChatflowBuilder::new().services(services).build()?;
/// chatflow.start()?;
///
/// chatflow.deploy(FlowDefinition::from_json(json_str)?)?;
/// chatflow.register_trigger("acme", "welcome", "greeting", TriggerConfig::new(TriggerType::Keyword).with_conditions(conditions))?;
/// chatflow.emitter().message_received("acme", "conv-1", Some("contact-1"), "hello")?;
///
/// chatflow.shutdown().await;
/// ```
pub struct Chatflow {
    engine: FlowEngine,
    triggers: Arc<TriggerRegistry>,
    processor: Arc<TriggerProcessor>,
    scheduler: Arc<TriggerScheduler>,
    emitter: Arc<TriggerEventEmitter>,

    runtime: Handle,
    running: AtomicBool,
}

impl Chatflow {
    pub(crate) fn new(
        engine: FlowEngine,
        triggers: Arc<TriggerRegistry>,
        processor: Arc<TriggerProcessor>,
        scheduler: Arc<TriggerScheduler>,
        emitter: Arc<TriggerEventEmitter>,
        runtime: Handle,
    ) -> Self {
        Self {
            engine,
            triggers,
            processor,
            scheduler,
            emitter,
            runtime,
            running: AtomicBool::new(false),
        }
    }

    /// Starts event delivery, re-arms stored deadlines and spawns the workers.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.engine.launch();
        let executions = self.engine.recover()?;
        let schedules = self.triggers.arm_schedules()?;
        self.processor.start(&self.runtime);
        self.scheduler.start(&self.runtime);
        info!(executions, schedules, "chatflow started");
        Ok(())
    }

    /// Stops the scheduler, drains the processor and closes the event channel.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.scheduler.stop().await;
        self.processor.stop().await;
        self.emitter.clear();
        self.engine.shutdown();
        info!("chatflow stopped");
    }

    pub fn deploy(
        &self,
        def: FlowDefinition,
    ) -> Result<Arc<Flow>> {
        self.engine.deploy(def)
    }

    pub fn register_trigger(
        &self,
        tenant_id: &str,
        flow_id: &str,
        name: &str,
        config: TriggerConfig,
    ) -> Result<FlowTrigger> {
        self.triggers.register(tenant_id, flow_id, name, config)
    }

    pub fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    pub fn triggers(&self) -> Arc<TriggerRegistry> {
        self.triggers.clone()
    }

    pub fn processor(&self) -> Arc<TriggerProcessor> {
        self.processor.clone()
    }

    pub fn scheduler(&self) -> Arc<TriggerScheduler> {
        self.scheduler.clone()
    }

    pub fn emitter(&self) -> Arc<TriggerEventEmitter> {
        self.emitter.clone()
    }
}
