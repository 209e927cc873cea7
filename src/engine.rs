//! Flow engine - runs, suspends and resumes executions.
//!
//! The engine is the only component that mutates executions:
//! - Deploying and compiling flow definitions
//! - Starting executions after admission checks
//! - Resuming, pausing, cancelling and expiring suspended executions
//! - Fanning out split branches and closing their barriers
//! - Re-arming timers after a restart

mod barrier;
mod limiter;
mod monitor;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{
    ChannelEvent, ChannelOptions, ChatflowError, Result,
    common::{MemCache, Shutdown},
    config::EngineConfig,
    dispatcher::Dispatcher,
    events::{ExecutionEvent, GraphEvent, Message},
    flow::Flow,
    model::{ExecutionId, FlowDefinition},
    nodes::{NodeFactory, NodeRegistry},
    runtime::{Channel, ExecutionContext, ExecutionInfo, ExecutionResult, ExecutionSignal, ExecutionStatus, WaitState},
    services::Services,
    store::{Store, data::ExecutionStep},
    trigger::TriggerScheduler,
    utils,
};

use barrier::BarrierBook;
use limiter::RateLimiter;
use monitor::Monitor;

/// Maximum number of in-flight execution signals kept in memory.
const SIGNAL_CACHE_SIZE: usize = 4096;
/// How often idle rate limit windows are pruned.
const LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);
/// Rate limit windows without a hit for this long are dropped.
const LIMITER_MAX_AGE_SECS: u64 = 24 * 3600;

/// The flow execution engine.
///
/// Cloning is cheap; clones share every component.
///
/// # Example
///
/// ```rust,ignore
/// let engine = chatflow.engine();
/// engine.deploy(definition)?;
///
/// let ctx = ExecutionContext::new("acme").with_conversation("conv-1");
/// let result = engine.execute_flow("welcome", ctx).await?;
/// if result.is_waiting() {
///     engine.resume_execution(&result.execution_id, Some(json!("yes"))).await?;
/// }
/// ```
#[derive(Clone)]
pub struct FlowEngine {
    pub(crate) store: Arc<Store>,
    pub(crate) services: Arc<Services>,
    pub(crate) channel: Arc<Channel>,
    pub(crate) scheduler: Arc<TriggerScheduler>,
    pub(crate) barriers: Arc<BarrierBook>,
    pub(crate) monitor: Arc<Monitor>,
    pub(crate) config: EngineConfig,

    registry: Arc<NodeRegistry>,
    /// compiled flows keyed by `id` (latest) and `id@version`
    flows: Arc<MemCache<String, Arc<Flow>>>,
    signals: Arc<MemCache<ExecutionId, Arc<ExecutionSignal>>>,
    limiter: Arc<RateLimiter>,

    runtime: Handle,
    shutdown: Arc<Shutdown>,
}

impl FlowEngine {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<NodeRegistry>,
        services: Arc<Services>,
        scheduler: Arc<TriggerScheduler>,
        config: &EngineConfig,
        runtime: Handle,
    ) -> Self {
        let channel = Arc::new(Channel::new(runtime.clone()));
        let monitor = Arc::new(Monitor::new(services.clone(), channel.clone(), runtime.clone()));

        Self {
            store,
            services,
            channel,
            scheduler,
            barriers: Arc::new(BarrierBook::new()),
            monitor,
            config: config.clone(),
            registry,
            flows: Arc::new(MemCache::new(config.flow_cache_size.max(1))),
            signals: Arc::new(MemCache::new(SIGNAL_CACHE_SIZE)),
            limiter: Arc::new(RateLimiter::new()),
            runtime,
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    /// Starts event delivery, analytics forwarding and housekeeping.
    pub fn launch(&self) {
        // subscribe before listening so no event is missed
        self.monitor.monitor();
        self.channel.listen();

        let limiter = self.limiter.clone();
        let shutdown = self.shutdown.clone();
        self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(LIMITER_PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = interval.tick() => limiter.prune(LIMITER_MAX_AGE_SECS),
                }
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
        self.monitor.shutdown();
        self.channel.shutdown();
    }

    /// Compiles `def`, stores it as the latest version and caches it.
    pub fn deploy(
        &self,
        def: FlowDefinition,
    ) -> Result<Arc<Flow>> {
        let flow = Arc::new(Flow::compile(def, &self.registry)?);
        self.store.save_flow(flow.definition())?;
        self.flows.set(flow.definition().version_key(), flow.clone());
        self.flows.set(flow.id().to_string(), flow.clone());
        info!(flow_id = %flow.id(), version = flow.version(), "deploy flow with {} nodes", flow.node_count());
        Ok(flow)
    }

    /// Checks `def` without storing it.
    pub fn validate_flow(
        &self,
        def: &FlowDefinition,
    ) -> Result<()> {
        Flow::compile(def.clone(), &self.registry).map(|_| ())
    }

    /// Adds or replaces a node type. Cached flows are recompiled on next use.
    pub fn register_node(
        &self,
        node_type: &str,
        factory: NodeFactory,
    ) {
        self.registry.register(node_type, factory);
        self.flows.remove_if(|_| true);
    }

    /// Compiled flow at `version`, or the latest one.
    pub fn load_flow(
        &self,
        flow_id: &str,
        version: Option<u32>,
    ) -> Result<Arc<Flow>> {
        let key = match version {
            Some(v) => format!("{}@{}", flow_id, v),
            None => flow_id.to_string(),
        };
        if let Some(flow) = self.flows.get(&key) {
            return Ok(flow);
        }

        let def = self.store.get_flow(flow_id, version).map_err(|_| ChatflowError::NotFound(format!("flow {}", key)))?;
        let flow = Arc::new(Flow::compile(def, &self.registry)?);
        self.flows.set(key, flow.clone());
        Ok(flow)
    }

    /// Starts a new execution of the latest version of `flow_id`.
    ///
    /// Fails with [`ChatflowError::Conflict`] when the conversation already has
    /// an active execution of the flow, or the contact has one and the flow
    /// does not allow concurrency.
    pub async fn execute_flow(
        &self,
        flow_id: &str,
        mut ctx: ExecutionContext,
    ) -> Result<ExecutionResult> {
        let flow = self.load_flow(flow_id, None)?;
        let settings = flow.settings();

        let admission = match &ctx.conversation_id {
            Some(conversation_id) => {
                let lease = self.store.claim(&format!("{}|{}", flow_id, conversation_id))?;
                if let Some(active) = self.store.find_active_execution(flow_id, conversation_id)? {
                    return Err(ChatflowError::Conflict(format!(
                        "execution {} of flow {} is already active in conversation {}",
                        active.execution_id, flow_id, conversation_id
                    )));
                }
                Some(lease)
            }
            None => None,
        };
        if !settings.allow_concurrent {
            if let Some(contact_id) = &ctx.contact_id {
                if self.store.count_active_for_contact(flow_id, contact_id)? > 0 {
                    return Err(ChatflowError::Conflict(format!("contact {} already runs flow {}", contact_id, flow_id)));
                }
            }
        }
        prepare_variables(&flow, &mut ctx)?;
        if let Some(limit) = &settings.rate_limit {
            let key = match (&ctx.contact_id, limit.per_contact) {
                (Some(contact_id), true) => format!("{}|{}", flow_id, contact_id),
                _ => flow_id.to_string(),
            };
            self.limiter.acquire(&key, limit)?;
        }

        let now = Utc::now();
        if ctx.execution_id.is_empty() {
            ctx.execution_id = utils::longid();
        }
        ctx.flow_id = flow.id().to_string();
        ctx.flow_version = flow.version();
        ctx.current_node_id = flow.start_node().to_string();
        ctx.last_node_id = None;
        ctx.step_count = 0;
        ctx.status = ExecutionStatus::Pending;
        ctx.wait = None;
        ctx.started_at = now;
        ctx.last_activity_at = now;
        ctx.completed_at = None;

        let lease = self.store.claim(&ctx.execution_id)?;
        self.store.save_execution(&ctx)?;
        drop(admission);

        let ret = self.run(flow, ctx, None, false).await;
        drop(lease);
        ret
    }

    /// Continues a suspended execution, handing `input` to an input wait.
    pub async fn resume_execution(
        &self,
        execution_id: &str,
        input: Option<Value>,
    ) -> Result<ExecutionResult> {
        let lease = self.store.claim(execution_id)?;
        let ctx = self.store.get_execution(execution_id)?;
        self.admit(&ctx)?;

        let input = match &ctx.wait {
            Some(WaitState::Input {
                ..
            }) => input,
            _ => {
                if input.is_some() {
                    debug!(execution_id, "execution does not wait for input, dropping it");
                }
                None
            }
        };

        self.scheduler.cancel_execution_jobs(execution_id);
        let flow = self.load_flow(&ctx.flow_id, Some(ctx.flow_version))?;
        let ret = self.run(flow, ctx, input, true).await;
        drop(lease);
        ret
    }

    /// Pauses an execution: in flight at the next step boundary, otherwise at once.
    pub fn pause_execution(
        &self,
        execution_id: &str,
    ) -> Result<()> {
        if let Some(signal) = self.signals.get(&execution_id.to_string()) {
            debug!(execution_id, "request pause of in-flight execution");
            signal.request_pause();
            return Ok(());
        }

        let _lease = self.store.claim(execution_id)?;
        let mut ctx = self.store.get_execution(execution_id)?;
        if ctx.is_terminal() {
            return Err(ChatflowError::State(format!("execution {} is already {}", execution_id, ctx.status.as_ref())));
        }
        if ctx.status == ExecutionStatus::Paused {
            return Ok(());
        }

        ctx.status = ExecutionStatus::Paused;
        ctx.wait = None;
        ctx.touch();
        self.store.update_execution(&ctx)?;
        self.scheduler.cancel_execution_jobs(execution_id);
        info!(execution_id, "execution paused");
        self.emit(&ctx, GraphEvent::Execution(ExecutionEvent::Paused));
        Ok(())
    }

    /// Moves an execution and its open branches to Cancelled.
    ///
    /// The record is written at once; an in-flight step observes the cancel
    /// signal and its later writes are refused.
    pub fn cancel_execution(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionResult> {
        let mut ctx = self.store.get_execution(execution_id)?;
        if ctx.is_terminal() {
            return Err(ChatflowError::State(format!("execution {} is already {}", execution_id, ctx.status.as_ref())));
        }

        let barrier = match &ctx.wait {
            Some(WaitState::Barrier {
                key,
                ..
            }) => Some(key.clone()),
            _ => None,
        };
        ctx.finish(ExecutionStatus::Cancelled, Some(ChatflowError::Cancelled.to_string()));
        self.store.update_execution(&ctx)?;
        if let Some(signal) = self.signals.get(&ctx.execution_id) {
            signal.cancel();
        }
        info!(execution_id, "execution cancelled");
        self.on_terminal(&ctx, self.node_count(&ctx));

        let children = self
            .store
            .executions()?
            .scan(&|e: &ExecutionContext| !e.is_terminal() && e.branch.as_ref().is_some_and(|b| b.parent_execution_id == execution_id))?;
        for child in children {
            if let Err(err) = self.cancel_execution(&child.execution_id) {
                debug!(execution_id = %child.execution_id, "skip branch cancel: {}", err);
            }
        }

        if let Some(key) = barrier {
            self.store.barriers()?.delete(&key)?;
        }

        Ok(ExecutionResult::from_context(&ctx, utils::time::elapsed_millis(ctx.started_at)))
    }

    /// Fails an execution whose input wait armed at `step` ran out.
    ///
    /// Returns `None` when the execution moved on since the expiry was armed.
    pub async fn expire_execution(
        &self,
        execution_id: &str,
        step: u32,
    ) -> Result<Option<ExecutionResult>> {
        let _lease = match self.store.claim(execution_id) {
            Ok(lease) => lease,
            Err(ChatflowError::Conflict(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut ctx = self.store.get_execution(execution_id)?;
        let due = matches!(ctx.wait, Some(WaitState::Input { expires_at: Some(at), .. }) if at <= Utc::now());
        if ctx.status != ExecutionStatus::Waiting || ctx.step_count != step || !due {
            return Ok(None);
        }

        ctx.finish(ExecutionStatus::Failed, Some(ChatflowError::Timeout("waiting for input expired".to_string()).to_string()));
        self.store.update_execution(&ctx)?;
        self.on_terminal(&ctx, self.node_count(&ctx));
        Ok(Some(ExecutionResult::from_context(&ctx, utils::time::elapsed_millis(ctx.started_at))))
    }

    pub fn get_execution_info(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionInfo> {
        let ctx = self.store.get_execution(execution_id)?;
        Ok(ExecutionInfo::from_context(&ctx, self.node_count(&ctx)))
    }

    /// Audit trail of the steps an execution has run.
    pub fn get_execution_steps(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ExecutionStep>> {
        self.store.get_execution(execution_id)?;
        self.store.execution_steps(execution_id)
    }

    pub fn find_waiting_for_input(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ExecutionContext>> {
        self.store.find_waiting_for_input(tenant_id, conversation_id)
    }

    /// Re-arms the deadlines of every suspended execution. Returns how many were armed.
    pub fn recover(&self) -> Result<usize> {
        let now = Utc::now();
        let mut armed = 0;
        for ctx in self.store.suspended_executions()? {
            let id = &ctx.execution_id;
            match (&ctx.status, &ctx.wait) {
                (
                    ExecutionStatus::Waiting,
                    Some(WaitState::Input {
                        expires_at: Some(at),
                        ..
                    }),
                ) => self.scheduler.schedule_expiry(&ctx.tenant_id, id, ctx.step_count, *at),
                (
                    ExecutionStatus::Waiting,
                    Some(WaitState::Timer {
                        until,
                        ..
                    }),
                ) => self.scheduler.schedule_resume(&ctx.tenant_id, id, *until),
                (
                    ExecutionStatus::Waiting,
                    Some(WaitState::Barrier {
                        key,
                        until,
                    }),
                ) => {
                    let at = if self.barriers.is_ready(&self.store, key)? {
                        now
                    } else {
                        *until
                    };
                    self.scheduler.schedule_resume(&ctx.tenant_id, id, at);
                }
                (ExecutionStatus::Pending | ExecutionStatus::Running, _) if !self.store.is_claimed(id) => {
                    warn!(execution_id = %id, "execution was interrupted while {}, resuming", ctx.status.as_ref());
                    self.scheduler.schedule_resume(&ctx.tenant_id, id, now);
                }
                _ => continue,
            }
            armed += 1;
        }
        info!("recovered {} suspended executions", armed);
        Ok(armed)
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    /// Subscription to execution events matching `options`.
    pub fn subscribe(
        &self,
        options: ChannelOptions,
    ) -> Result<ChannelEvent> {
        ChannelEvent::channel(self.channel.clone(), options)
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Bookkeeping once an execution reached a terminal state.
    pub(crate) fn on_terminal(
        &self,
        ctx: &ExecutionContext,
        node_count: usize,
    ) {
        self.scheduler.cancel_execution_jobs(&ctx.execution_id);

        let info = ExecutionInfo::from_context(ctx, node_count);
        let event = match ctx.status {
            ExecutionStatus::Completed => ExecutionEvent::Completed(info),
            ExecutionStatus::Failed => ExecutionEvent::Failed(info),
            ExecutionStatus::Cancelled => ExecutionEvent::Cancelled(info),
            _ => return,
        };
        self.emit(ctx, GraphEvent::Execution(event));

        if ctx.branch.is_some() {
            match self.barriers.arrive(&self.store, ctx) {
                Ok(Some(parent)) => {
                    debug!(execution_id = %ctx.execution_id, "last branch arrived, resuming {}", parent);
                    self.scheduler.schedule_resume(&ctx.tenant_id, &parent, Utc::now());
                }
                Ok(None) => {}
                Err(err) => warn!(execution_id = %ctx.execution_id, "fail to record branch arrival: {}", err),
            }
        }
    }

    fn admit(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let id = &ctx.execution_id;
        if ctx.is_terminal() {
            return Err(ChatflowError::State(format!("execution {} is already {}", id, ctx.status.as_ref())));
        }
        match (&ctx.status, &ctx.wait) {
            (
                ExecutionStatus::Waiting,
                Some(WaitState::Timer {
                    until,
                    ..
                }),
            ) if *until > Utc::now() => Err(ChatflowError::State(format!("execution {} waits until {}", id, until))),
            (
                ExecutionStatus::Waiting,
                Some(WaitState::Barrier {
                    key,
                    until,
                }),
            ) if *until > Utc::now() && !self.barriers.is_ready(&self.store, key)? => Err(ChatflowError::State(format!("execution {} waits for branches of {}", id, key))),
            _ => Ok(()),
        }
    }

    async fn run(
        &self,
        flow: Arc<Flow>,
        ctx: ExecutionContext,
        input: Option<Value>,
        resumed: bool,
    ) -> Result<ExecutionResult> {
        let execution_id = ctx.execution_id.clone();
        let signal = Arc::new(ExecutionSignal::new());
        self.signals.set(execution_id.clone(), signal.clone());

        let ret = Dispatcher::new(self, flow, ctx, signal).run(input, resumed).await;
        self.signals.remove(&execution_id);
        ret
    }

    fn node_count(
        &self,
        ctx: &ExecutionContext,
    ) -> usize {
        self.load_flow(&ctx.flow_id, Some(ctx.flow_version)).map(|f| f.node_count()).unwrap_or(0)
    }

    fn emit(
        &self,
        ctx: &ExecutionContext,
        event: GraphEvent,
    ) {
        self.channel.emit(Message {
            flow_id: ctx.flow_id.clone(),
            execution_id: ctx.execution_id.clone(),
            node_id: ctx.current_node_id.clone(),
            event,
        });
    }
}

/// Fills declared defaults and checks required and typed variables.
fn prepare_variables(
    flow: &Flow,
    ctx: &mut ExecutionContext,
) -> Result<()> {
    for var in flow.definition().variables.iter() {
        match ctx.variables.get_value(&var.name) {
            Some(value) => var.check(value)?,
            None => match &var.default {
                Some(default) => ctx.variables.set(&var.name, default),
                None if var.required => return Err(ChatflowError::Validation(format!("required variable '{}' is missing", var.name))),
                None => {}
            },
        }
    }
    Ok(())
}
