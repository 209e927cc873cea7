use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::{
    ChatflowError, Result,
    common::Vars,
    model::NodeDefinition,
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
    runtime::ExecutionStatus,
};

/// Key of the barrier a split parent waits on at `merge_node_id`.
pub fn barrier_key(
    execution_id: &str,
    merge_node_id: &str,
) -> String {
    format!("{}:{}", execution_id, merge_node_id)
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeTimeoutPolicy {
    /// Continue with the branches that arrived.
    #[default]
    Proceed,
    Fail,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MergeConfig {
    #[serde(default)]
    pub on_timeout: MergeTimeoutPolicy,
    #[serde(default)]
    pub fail_on_branch_error: bool,
}

/// Join point of a split.
///
/// A branch reaching its own merge node ends there. The parent runs the merge
/// once the barrier is complete or its deadline passed, folding the branch
/// variables into its own in branch id order.
#[derive(Debug, Clone)]
pub struct MergeNode {
    def: NodeDefinition,
    config: MergeConfig,
}

impl MergeNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        Ok(Self {
            def: def.clone(),
            config: parse_config(&def.config, &Self::schema())?,
        })
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "on_timeout": { "type": "string", "enum": ["proceed", "fail"] },
                "fail_on_branch_error": { "type": "boolean" }
            }
        })
    }
}

#[async_trait]
impl NodeExecutor for MergeNode {
    fn definition(&self) -> &NodeDefinition {
        &self.def
    }

    fn set_config(
        &mut self,
        config: Vars,
    ) -> Result<()> {
        self.config = parse_config(&config, &Self::schema())?;
        self.def.config = config;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeResult> {
        let execution = ctx.execution;
        if let Some(branch) = &execution.branch {
            if branch.barrier_key == barrier_key(&branch.parent_execution_id, &self.def.id) {
                return Ok(NodeResult::complete());
            }
        }

        let key = barrier_key(&execution.execution_id, &self.def.id);
        let barriers = ctx.store.barriers()?;
        if !barriers.exists(&key)? {
            debug!(execution_id = %execution.execution_id, node_id = %self.def.id, "merge reached without a barrier");
            return Ok(NodeResult::proceed());
        }

        let barrier = barriers.find(&key)?;
        let missing = barrier.missing();
        if !missing.is_empty() {
            if !barrier.is_expired() {
                return Err(ChatflowError::State(format!("barrier {} still waits for {}", key, missing.join(", "))));
            }
            if self.config.on_timeout == MergeTimeoutPolicy::Fail {
                barriers.delete(&key)?;
                return Err(ChatflowError::fatal("merge_timeout", format!("branches {} did not arrive in time", missing.join(", "))));
            }
        }

        let failed: Vec<&String> = barrier.arrivals.iter().filter(|(_, a)| a.status != ExecutionStatus::Completed).map(|(b, _)| b).collect();
        if self.config.fail_on_branch_error && !failed.is_empty() {
            barriers.delete(&key)?;
            let failed: Vec<&str> = failed.into_iter().map(String::as_str).collect();
            return Err(ChatflowError::fatal("branch_failed", format!("branches {} failed", failed.join(", "))));
        }

        let mut variables = Vars::new();
        let mut branches = Map::new();
        for (branch_id, arrival) in &barrier.arrivals {
            if arrival.status == ExecutionStatus::Completed {
                variables.extend(arrival.variables.clone());
            }
            branches.insert(
                branch_id.clone(),
                json!({
                    "execution_id": arrival.execution_id,
                    "status": arrival.status,
                    "error": arrival.error,
                }),
            );
        }
        barriers.delete(&key)?;

        Ok(NodeResult::proceed().with_variables(variables).with_output(json!({ "branches": branches, "missing": missing })))
    }
}
