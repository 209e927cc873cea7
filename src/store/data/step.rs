use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{DbCollectionIden, StoreIden};

/// Audit row written for every node step.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ExecutionStep {
    pub id: String,
    pub execution_id: String,
    pub flow_id: String,
    pub node_id: String,
    pub node_type: String,
    /// step counter after this step; pauses keep the previous value
    pub step: u32,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub output: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Paused,
    Failed,
}

impl DbCollectionIden for ExecutionStep {
    fn iden() -> StoreIden {
        StoreIden::Steps
    }
}
