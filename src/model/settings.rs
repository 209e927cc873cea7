use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlowSettings {
    /// wall-clock ceiling of one engine run segment
    pub max_execution_time_secs: u64,
    /// ceiling on completed steps over the whole execution
    pub max_steps: u32,
    pub retry_attempts: u32,
    /// exponential backoff base
    pub retry_backoff_ms: u64,
    /// ceiling of a single external call made by a node
    pub node_timeout_ms: u64,
    pub timeout_action: TimeoutAction,
    /// how long an execution may wait for input before it expires
    pub wait_timeout_secs: u64,
    /// when false, at most one active execution per flow and contact
    pub allow_concurrent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Fail,
    Continue,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub max_executions: u32,
    pub per_seconds: u64,
    /// count per contact instead of per flow
    #[serde(default)]
    pub per_contact: bool,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            max_execution_time_secs: 300,
            max_steps: 1000,
            retry_attempts: 2,
            retry_backoff_ms: 500,
            node_timeout_ms: 10_000,
            timeout_action: TimeoutAction::Fail,
            wait_timeout_secs: 7 * 24 * 3600,
            allow_concurrent: true,
            rate_limit: None,
        }
    }
}
