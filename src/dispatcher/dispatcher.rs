//! Step loop for one run segment of an execution.
//!
//! The dispatcher is responsible for:
//! - Resolving and executing the current node
//! - Retrying retryable node failures with exponential backoff
//! - Merging node results into the execution context and persisting it
//! - Suspending on input, timers and split barriers
//! - Enforcing the step and wall-clock ceilings

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    ChatflowError, FlowEngine, Result,
    events::{ExecutionEvent, GraphEvent, Message, NodeEvent},
    flow::Flow,
    model::{NodeId, TimeoutAction},
    nodes::{NodeContext, NodeExecutor, NodeResult, input::LAST_INPUT, merge::barrier_key},
    runtime::{BranchRef, ExecutionContext, ExecutionResult, ExecutionSignal, ExecutionStatus, WaitState},
    store::data::{ExecutionStep, StepStatus},
    utils,
};

/// Default straggler deadline of a split without one.
const DEFAULT_BRANCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Drives one execution until it completes, fails or suspends.
///
/// The caller holds the execution lease for the lifetime of the dispatcher.
pub struct Dispatcher<'a> {
    engine: &'a FlowEngine,
    flow: Arc<Flow>,
    ctx: ExecutionContext,
    signal: Arc<ExecutionSignal>,
    started: Instant,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        engine: &'a FlowEngine,
        flow: Arc<Flow>,
        ctx: ExecutionContext,
        signal: Arc<ExecutionSignal>,
    ) -> Self {
        Self {
            engine,
            flow,
            ctx,
            signal,
            started: Instant::now(),
        }
    }

    /// Runs from the current node. `input` is handed to the first node only.
    pub async fn run(
        mut self,
        mut input: Option<Value>,
        resumed: bool,
    ) -> Result<ExecutionResult> {
        self.ctx.status = ExecutionStatus::Running;
        let finish_on_wake = matches!(self.ctx.wait, Some(WaitState::Timer { finish: true, .. }));
        self.ctx.wait = None;
        if let Err(err) = self.persist() {
            return self.abort(err);
        }
        self.emit_execution(if resumed {
            ExecutionEvent::Resumed
        } else {
            ExecutionEvent::Started
        });
        info!(flow_id = %self.ctx.flow_id, execution_id = %self.ctx.execution_id, node_id = %self.ctx.current_node_id, resumed, "run execution");

        if finish_on_wake {
            debug!(execution_id = %self.ctx.execution_id, "trailing wait elapsed");
            return self.finish(ExecutionStatus::Completed, None);
        }

        let settings = self.flow.settings().clone();
        let max_execution_time = Duration::from_secs(settings.max_execution_time_secs);
        let mut overtime_logged = false;

        loop {
            if self.signal.is_cancelled() {
                return self.cancelled();
            }
            if self.signal.take_pause() {
                return self.paused();
            }
            if self.ctx.step_count >= settings.max_steps {
                return self.fail(ChatflowError::Timeout(format!("step limit of {} reached", settings.max_steps)));
            }
            if self.started.elapsed() > max_execution_time {
                match settings.timeout_action {
                    TimeoutAction::Fail => {
                        return self.fail(ChatflowError::Timeout(format!("execution time limit of {}s reached", settings.max_execution_time_secs)));
                    }
                    TimeoutAction::Retry => return self.yield_segment(),
                    TimeoutAction::Continue => {
                        if !overtime_logged {
                            warn!(execution_id = %self.ctx.execution_id, "execution time limit reached, continuing");
                            overtime_logged = true;
                        }
                    }
                }
            }

            let node_id = self.ctx.current_node_id.clone();
            let node = match self.flow.node(&node_id) {
                Ok(node) => node,
                Err(err) => return self.fail(err),
            };

            let step_started = Utc::now();
            self.emit_node(&node_id, NodeEvent::Running(step_started.timestamp_millis()));
            let (ret, attempts) = self.execute_node(&node, input.take()).await;

            let result = match ret {
                Ok(result) => result,
                Err(ChatflowError::Cancelled) => return self.cancelled(),
                Err(err) => {
                    self.record_step(&node, StepStatus::Failed, attempts, step_started, Some(err.to_string()), None);
                    self.emit_node(&node_id, NodeEvent::Failed(err.to_string()));
                    return self.fail(err);
                }
            };

            if let Err(err) = self.apply(&node_id, &result) {
                self.record_step(&node, StepStatus::Failed, attempts, step_started, Some(err.to_string()), None);
                self.emit_node(&node_id, NodeEvent::Failed(err.to_string()));
                return self.fail(err);
            }

            if result.should_pause {
                self.record_step(&node, StepStatus::Paused, attempts, step_started, None, result.output.clone());
                self.emit_node(&node_id, NodeEvent::Paused);
                return self.wait_for_input(settings.wait_timeout_secs);
            }

            self.ctx.step_count += 1;
            self.ctx.last_node_id = Some(node_id.clone());
            self.record_step(&node, StepStatus::Succeeded, attempts, step_started, None, result.output.clone());
            self.emit_node(&node_id, NodeEvent::Succeeded(self.ctx.step_count));

            if !result.branches.is_empty() {
                return self.fork(&node_id, &result);
            }
            if result.complete {
                self.ctx.output = result.output.clone();
                return self.finish(ExecutionStatus::Completed, None);
            }

            let wait_until = result.should_wait.then(|| utils::time::after_millis(u64::try_from(result.wait_duration.unwrap_or_default().as_millis()).unwrap_or(u64::MAX)));
            match self.flow.resolve_next(&node_id, &result) {
                Err(err) => return self.fail(err),
                Ok(None) => {
                    if let Some(until) = wait_until {
                        return self.wait_for_timer(until, true);
                    }
                    return self.finish(ExecutionStatus::Completed, None);
                }
                Ok(Some(next)) => {
                    debug!(execution_id = %self.ctx.execution_id, "{} -> {}", node_id, next);
                    self.ctx.current_node_id = next;
                    if let Some(until) = wait_until {
                        return self.wait_for_timer(until, false);
                    }
                    if let Err(err) = self.persist() {
                        return self.abort(err);
                    }
                }
            }
        }
    }

    /// Runs `node` within its retry budget. Returns the outcome and the attempts made.
    async fn execute_node(
        &self,
        node: &Arc<dyn NodeExecutor>,
        input: Option<Value>,
    ) -> (Result<NodeResult>, u32) {
        let settings = self.flow.settings();
        let def = node.definition();
        let budget = def.retry.map(|r| r.times).unwrap_or(settings.retry_attempts);
        let base_backoff = def.retry.map(|r| r.interval).filter(|i| *i > 0).unwrap_or(settings.retry_backoff_ms);
        let call_timeout = Duration::from_millis(def.timeout.unwrap_or(settings.node_timeout_ms));
        // a node may make several calls, each bounded by call_timeout
        let ceiling = Duration::from_secs(settings.max_execution_time_secs).saturating_sub(self.started.elapsed()).max(call_timeout);

        let mut attempts = 0;
        loop {
            attempts += 1;
            let node_ctx = NodeContext {
                execution: &self.ctx,
                input: input.as_ref(),
                services: &self.engine.services,
                store: &self.engine.store,
                call_timeout,
            };

            let ret = tokio::select! {
                _ = self.signal.cancelled() => return (Err(ChatflowError::Cancelled), attempts),
                ret = tokio::time::timeout(ceiling, node.execute(&node_ctx)) => match ret {
                    Ok(ret) => ret,
                    Err(_) => Err(ChatflowError::retryable("node_timeout", format!("node '{}' did not finish within {}ms", def.id, ceiling.as_millis()))),
                },
            };
            let ret = ret.and_then(|result| {
                if result.success {
                    Ok(result)
                } else {
                    let code = result.error_code.clone().unwrap_or_else(|| "node_failed".to_string());
                    Err(ChatflowError::fatal(code, format!("node '{}' reported failure", def.id)))
                }
            });

            match ret {
                Err(err) if err.is_retryable() && attempts <= budget => {
                    let backoff = backoff_ms(base_backoff, attempts, self.engine.config.max_retry_backoff_ms);
                    warn!(execution_id = %self.ctx.execution_id, node_id = %def.id, attempt = attempts, "{}, retrying in {}ms", err, backoff);
                    self.emit_node(&def.id, NodeEvent::Retry(attempts));
                    tokio::select! {
                        _ = self.signal.cancelled() => return (Err(ChatflowError::Cancelled), attempts),
                        _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                    }
                }
                ret => return (ret, attempts),
            }
        }
    }

    /// Merges variable mutations, output and metadata into the context.
    fn apply(
        &mut self,
        node_id: &str,
        result: &NodeResult,
    ) -> Result<()> {
        for (name, value) in result.variables.iter() {
            if let Some(declared) = self.flow.definition().variable(name) {
                declared.check(value)?;
            }
        }
        self.ctx.variables.extend(result.variables.clone());
        if let Some(output) = &result.output {
            self.ctx.context.set(node_id, output);
        }
        if let Some(input) = result.metadata.get_value(LAST_INPUT) {
            self.ctx.context.set(LAST_INPUT, input);
        }
        Ok(())
    }

    /// Starts one child execution per branch and parks this one on the merge barrier.
    fn fork(
        mut self,
        node_id: &str,
        result: &NodeResult,
    ) -> Result<ExecutionResult> {
        let Some(merge_node_id) = result.next_node_id.clone() else {
            return self.fail(ChatflowError::Transition(format!("split '{}' names no merge node", node_id)));
        };
        let deadline = utils::time::after_millis(u64::try_from(result.wait_duration.unwrap_or(DEFAULT_BRANCH_TIMEOUT).as_millis()).unwrap_or(u64::MAX));
        let key = barrier_key(&self.ctx.execution_id, &merge_node_id);

        let children: Vec<ExecutionContext> = result.branches.iter().map(|target| self.child(target, &key)).collect();
        let expected: BTreeMap<String, String> = children
            .iter()
            .filter_map(|c| c.branch.as_ref().map(|b| (b.branch_id.clone(), c.execution_id.clone())))
            .collect();

        let store = &self.engine.store;
        let opened = self.engine.barriers.open(store, &key, &self.ctx, &merge_node_id, expected, deadline).and_then(|_| {
            for child in children.iter() {
                store.save_execution(child)?;
            }
            Ok(())
        });
        if let Err(err) = opened {
            return self.fail(err);
        }

        self.ctx.current_node_id = merge_node_id;
        self.ctx.status = ExecutionStatus::Waiting;
        self.ctx.wait = Some(WaitState::Barrier {
            key: key.clone(),
            until: deadline,
        });
        if let Err(err) = self.persist() {
            return self.abort(err);
        }

        let scheduler = &self.engine.scheduler;
        for child in children.iter() {
            scheduler.schedule_resume(&child.tenant_id, &child.execution_id, Utc::now());
        }
        scheduler.schedule_resume(&self.ctx.tenant_id, &self.ctx.execution_id, deadline);
        info!(execution_id = %self.ctx.execution_id, "split into {} branches, barrier {}", children.len(), key);

        self.emit_waiting();
        Ok(self.result())
    }

    fn child(
        &self,
        target: &NodeId,
        barrier_key: &str,
    ) -> ExecutionContext {
        let parent = &self.ctx;
        let mut child = ExecutionContext::new(&parent.tenant_id).with_variables(parent.variables.clone());
        child.execution_id = utils::longid();
        child.flow_id = parent.flow_id.clone();
        child.flow_version = parent.flow_version;
        child.contact_id = parent.contact_id.clone();
        child.conversation_id = parent.conversation_id.clone();
        child.context = parent.context.clone();
        child.trigger_type = parent.trigger_type.clone();
        child.trigger_data = parent.trigger_data.clone();
        child.current_node_id = target.clone();
        child.step_count = parent.step_count;
        child.status = ExecutionStatus::Waiting;
        child.wait = Some(WaitState::Timer {
            until: Utc::now(),
            finish: false,
        });
        child.branch = Some(BranchRef {
            parent_execution_id: parent.execution_id.clone(),
            branch_id: target.clone(),
            barrier_key: barrier_key.to_string(),
        });
        child
    }

    fn wait_for_input(
        mut self,
        wait_timeout_secs: u64,
    ) -> Result<ExecutionResult> {
        let now = Utc::now();
        let expires_at = utils::time::after_millis(wait_timeout_secs.saturating_mul(1000));
        self.ctx.status = ExecutionStatus::Waiting;
        self.ctx.wait = Some(WaitState::Input {
            since: now,
            expires_at: Some(expires_at),
        });
        if let Err(err) = self.persist() {
            return self.abort(err);
        }
        self.engine.scheduler.schedule_expiry(&self.ctx.tenant_id, &self.ctx.execution_id, self.ctx.step_count, expires_at);
        debug!(execution_id = %self.ctx.execution_id, node_id = %self.ctx.current_node_id, "waiting for input until {}", expires_at);

        self.emit_waiting();
        Ok(self.result())
    }

    fn wait_for_timer(
        mut self,
        until: DateTime<Utc>,
        finish: bool,
    ) -> Result<ExecutionResult> {
        self.ctx.status = ExecutionStatus::Waiting;
        self.ctx.wait = Some(WaitState::Timer {
            until,
            finish,
        });
        if let Err(err) = self.persist() {
            return self.abort(err);
        }
        self.engine.scheduler.schedule_resume(&self.ctx.tenant_id, &self.ctx.execution_id, until);
        debug!(execution_id = %self.ctx.execution_id, node_id = %self.ctx.current_node_id, "waiting until {}", until);

        self.emit_waiting();
        Ok(self.result())
    }

    /// Hands the rest of the run to a fresh segment through the scheduler.
    fn yield_segment(self) -> Result<ExecutionResult> {
        info!(execution_id = %self.ctx.execution_id, "execution time limit reached, yielding");
        self.wait_for_timer(Utc::now(), false)
    }

    fn paused(mut self) -> Result<ExecutionResult> {
        self.ctx.status = ExecutionStatus::Paused;
        if let Err(err) = self.persist() {
            return self.abort(err);
        }
        info!(execution_id = %self.ctx.execution_id, node_id = %self.ctx.current_node_id, "execution paused");
        self.emit_execution(ExecutionEvent::Paused);
        Ok(self.result())
    }

    fn fail(
        self,
        err: ChatflowError,
    ) -> Result<ExecutionResult> {
        error!(flow_id = %self.ctx.flow_id, execution_id = %self.ctx.execution_id, node_id = %self.ctx.current_node_id, "execution failed: {}", err);
        self.finish(ExecutionStatus::Failed, Some(err.to_string()))
    }

    fn finish(
        mut self,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<ExecutionResult> {
        self.ctx.finish(status, error);
        if let Err(err) = self.engine.store.update_execution(&self.ctx) {
            return self.abort(err);
        }
        info!(flow_id = %self.ctx.flow_id, execution_id = %self.ctx.execution_id, steps = self.ctx.step_count, "execution {}", status.as_ref());
        self.engine.on_terminal(&self.ctx, self.flow.node_count());
        Ok(self.result())
    }

    /// A cancelled record wins over whatever this segment was about to write.
    fn abort(
        self,
        err: ChatflowError,
    ) -> Result<ExecutionResult> {
        match err {
            ChatflowError::Cancelled => self.cancelled(),
            err => Err(err),
        }
    }

    fn cancelled(self) -> Result<ExecutionResult> {
        debug!(execution_id = %self.ctx.execution_id, "stop on cancellation");
        let stored = self.engine.store.get_execution(&self.ctx.execution_id)?;
        Ok(ExecutionResult::from_context(&stored, self.elapsed_ms()))
    }

    fn persist(&mut self) -> Result<()> {
        self.ctx.touch();
        self.engine.store.update_execution(&self.ctx)
    }

    fn record_step(
        &self,
        node: &Arc<dyn NodeExecutor>,
        status: StepStatus,
        attempts: u32,
        started_at: DateTime<Utc>,
        error: Option<String>,
        output: Option<Value>,
    ) {
        let finished_at = Utc::now();
        let step = ExecutionStep {
            id: format!("{}-{}", self.ctx.execution_id, utils::shortid()),
            execution_id: self.ctx.execution_id.clone(),
            flow_id: self.ctx.flow_id.clone(),
            node_id: node.id().to_string(),
            node_type: node.node_type().to_string(),
            step: self.ctx.step_count,
            status,
            attempts,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            error,
            output,
        };
        if let Err(err) = self.engine.store.save_execution_step(&step) {
            warn!(execution_id = %step.execution_id, node_id = %step.node_id, "fail to save step: {}", err);
        }
        self.engine.monitor.record_step(step);
    }

    fn emit_waiting(&self) {
        if let Some(wait) = &self.ctx.wait {
            self.emit_execution(ExecutionEvent::Waiting(wait.clone()));
        }
    }

    fn emit_execution(
        &self,
        event: ExecutionEvent,
    ) {
        self.engine.channel.emit(Message {
            flow_id: self.ctx.flow_id.clone(),
            execution_id: self.ctx.execution_id.clone(),
            node_id: self.ctx.current_node_id.clone(),
            event: GraphEvent::Execution(event),
        });
    }

    fn emit_node(
        &self,
        node_id: &str,
        event: NodeEvent,
    ) {
        self.engine.channel.emit(Message {
            flow_id: self.ctx.flow_id.clone(),
            execution_id: self.ctx.execution_id.clone(),
            node_id: node_id.to_string(),
            event: GraphEvent::Node(event),
        });
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn result(&self) -> ExecutionResult {
        ExecutionResult::from_context(&self.ctx, self.elapsed_ms())
    }
}

/// `base * 2^(attempt-1)`, capped at `max`.
fn backoff_ms(
    base: u64,
    attempt: u32,
    max: u64,
) -> u64 {
    base.saturating_mul(1u64 << attempt.saturating_sub(1).min(32)).min(max)
}
