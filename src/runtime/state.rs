use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    common::Vars,
    model::{ExecutionId, FlowId, NodeId},
    runtime::ExecutionContext,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Waiting,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, ExecutionStatus::Waiting | ExecutionStatus::Paused)
    }
}

/// What a waiting execution is waiting for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitState {
    /// The next inbound message; expires at `expires_at`.
    Input {
        since: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    },
    /// A timer owned by the scheduler.
    Timer {
        until: DateTime<Utc>,
        /// the node that waited has no successor; waking completes the execution
        #[serde(default)]
        finish: bool,
    },
    /// Split branches reporting to a merge barrier.
    Barrier {
        key: String,
        until: DateTime<Utc>,
    },
}

impl WaitState {
    pub fn kind(&self) -> &'static str {
        match self {
            WaitState::Input {
                ..
            } => "input",
            WaitState::Timer {
                ..
            } => "timer",
            WaitState::Barrier {
                ..
            } => "barrier",
        }
    }
}

/// Link from a split branch to its parent execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchRef {
    pub parent_execution_id: ExecutionId,
    pub branch_id: String,
    pub barrier_key: String,
}

/// Outcome of one engine call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub variables: Vars,
    pub last_node_id: Option<NodeId>,
    pub error: Option<String>,
    pub output: Option<Value>,
    /// Deadline of the wait the execution is parked on.
    pub wait_until: Option<DateTime<Utc>>,
}

/// Observable projection of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub execution_id: ExecutionId,
    pub flow_id: FlowId,
    pub flow_version: u32,
    pub status: ExecutionStatus,
    pub current_node_id: NodeId,
    pub last_node_id: Option<NodeId>,
    pub step_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Completed steps over node count, capped at 1.
    pub progress: f64,
}

impl ExecutionResult {
    pub fn from_context(
        ctx: &ExecutionContext,
        duration_ms: u64,
    ) -> Self {
        Self {
            execution_id: ctx.execution_id.clone(),
            status: ctx.status,
            completed_at: ctx.completed_at,
            duration_ms,
            variables: ctx.variables.clone(),
            last_node_id: ctx.last_node_id.clone(),
            error: ctx.error.clone(),
            output: ctx.output.clone(),
            wait_until: ctx.wait_until(),
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.status == ExecutionStatus::Waiting
    }
}

impl ExecutionInfo {
    pub fn from_context(
        ctx: &ExecutionContext,
        node_count: usize,
    ) -> Self {
        let progress = if ctx.status.is_terminal() {
            1.0
        } else if node_count == 0 {
            0.0
        } else {
            (ctx.step_count as f64 / node_count as f64).min(1.0)
        };
        let end = ctx.completed_at.unwrap_or(ctx.last_activity_at);

        Self {
            execution_id: ctx.execution_id.clone(),
            flow_id: ctx.flow_id.clone(),
            flow_version: ctx.flow_version,
            status: ctx.status,
            current_node_id: ctx.current_node_id.clone(),
            last_node_id: ctx.last_node_id.clone(),
            step_count: ctx.step_count,
            started_at: ctx.started_at,
            last_activity_at: ctx.last_activity_at,
            completed_at: ctx.completed_at,
            duration_ms: (end - ctx.started_at).num_milliseconds().max(0) as u64,
            error: ctx.error.clone(),
            progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_estimate() {
        let mut ctx = ExecutionContext::new("t1");
        ctx.step_count = 2;
        ctx.status = ExecutionStatus::Waiting;
        assert_eq!(ExecutionInfo::from_context(&ctx, 4).progress, 0.5);

        // loops can outrun the node count
        ctx.step_count = 9;
        assert_eq!(ExecutionInfo::from_context(&ctx, 4).progress, 1.0);

        ctx.step_count = 1;
        ctx.finish(ExecutionStatus::Completed, None);
        assert_eq!(ExecutionInfo::from_context(&ctx, 4).progress, 1.0);
        assert!(ctx.completed_at.is_some());
    }

    #[test]
    fn test_wait_state_serde() {
        let wait = WaitState::Timer {
            until: Utc::now(),
            finish: true,
        };
        let text = serde_json::to_string(&wait).unwrap();
        assert!(text.contains(r#""kind":"timer""#));
        assert_eq!(serde_json::from_str::<WaitState>(&text).unwrap(), wait);

        let legacy = serde_json::from_str::<WaitState>(r#"{"kind":"timer","until":"2024-05-01T09:00:00Z"}"#).unwrap();
        assert!(matches!(legacy, WaitState::Timer { finish: false, .. }));
    }
}
