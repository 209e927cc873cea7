use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    common::Vars,
    model::{ExecutionId, FlowId, NodeId},
    runtime::{BranchRef, ExecutionStatus, WaitState},
};

/// Durable runtime state of one execution.
///
/// The context is the unit of persistence: every engine step loads it, runs
/// exactly one node and writes it back. Nothing about an execution lives only
/// in memory between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub flow_id: FlowId,
    pub flow_version: u32,
    pub execution_id: ExecutionId,
    pub tenant_id: String,
    pub contact_id: Option<String>,
    pub conversation_id: Option<String>,

    /// Flow variables, validated against the flow declarations.
    pub variables: Vars,
    /// Auxiliary data (trigger extracts, last input, node outputs).
    pub context: Vars,

    pub current_node_id: NodeId,
    pub last_node_id: Option<NodeId>,
    pub step_count: u32,

    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    pub trigger_type: Option<String>,
    pub trigger_data: Vars,

    pub status: ExecutionStatus,
    pub wait: Option<WaitState>,
    pub branch: Option<BranchRef>,
    pub error: Option<String>,
    pub output: Option<Value>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            flow_id: String::new(),
            flow_version: 0,
            execution_id: String::new(),
            tenant_id: String::new(),
            contact_id: None,
            conversation_id: None,
            variables: Vars::new(),
            context: Vars::new(),
            current_node_id: String::new(),
            last_node_id: None,
            step_count: 0,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
            trigger_type: None,
            trigger_data: Vars::new(),
            status: ExecutionStatus::Pending,
            wait: None,
            branch: None,
            error: None,
            output: None,
        }
    }
}

impl ExecutionContext {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        }
    }

    pub fn with_contact(
        mut self,
        contact_id: &str,
    ) -> Self {
        self.contact_id = Some(contact_id.to_string());
        self
    }

    pub fn with_conversation(
        mut self,
        conversation_id: &str,
    ) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    pub fn with_variables(
        mut self,
        variables: Vars,
    ) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_trigger(
        mut self,
        trigger_type: &str,
        data: Vars,
    ) -> Self {
        self.trigger_type = Some(trigger_type.to_string());
        self.trigger_data = data;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True for executions that are not split branches.
    pub fn is_root(&self) -> bool {
        self.branch.is_none()
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Moves to a terminal status and stamps the completion time.
    pub fn finish(
        &mut self,
        status: ExecutionStatus,
        error: Option<String>,
    ) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.wait = None;
        self.completed_at = Some(now);
        self.last_activity_at = now;
    }

    /// Deadline of the current wait, if any.
    pub fn wait_until(&self) -> Option<DateTime<Utc>> {
        match &self.wait {
            Some(WaitState::Input {
                expires_at,
                ..
            }) => *expires_at,
            Some(WaitState::Timer {
                until,
                ..
            }) => Some(*until),
            Some(WaitState::Barrier {
                until,
                ..
            }) => Some(*until),
            None => None,
        }
    }
}
