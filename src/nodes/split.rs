use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    ChatflowError, Result,
    common::Vars,
    model::{NodeDefinition, NodeId},
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
};

fn default_straggler_timeout() -> u64 {
    300
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SplitConfig {
    /// Branch entry nodes; defaults to every connection target.
    #[serde(default)]
    pub branches: Vec<NodeId>,
    pub merge_node: NodeId,
    /// How long the merge waits for slow branches.
    #[serde(default = "default_straggler_timeout")]
    pub straggler_timeout_secs: u64,
}

/// Fans out into parallel child executions that rejoin at a merge node.
#[derive(Debug, Clone)]
pub struct SplitNode {
    def: NodeDefinition,
    config: SplitConfig,
    branches: Vec<NodeId>,
}

impl SplitNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        let config: SplitConfig = parse_config(&def.config, &Self::schema())?;
        let branches = if config.branches.is_empty() {
            def.connections.iter().map(|c| c.target.clone()).filter(|t| *t != config.merge_node).collect()
        } else {
            config.branches.clone()
        };
        Ok(Self {
            def: def.clone(),
            config,
            branches,
        })
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["merge_node"],
            "properties": {
                "branches": {
                    "type": "array",
                    "items": { "type": "string", "minLength": 1 }
                },
                "merge_node": { "type": "string", "minLength": 1 },
                "straggler_timeout_secs": { "type": "integer", "minimum": 1 }
            }
        })
    }

    pub fn branches(&self) -> &[NodeId] {
        &self.branches
    }
}

#[async_trait]
impl NodeExecutor for SplitNode {
    fn definition(&self) -> &NodeDefinition {
        &self.def
    }

    fn set_config(
        &mut self,
        config: Vars,
    ) -> Result<()> {
        let mut def = self.def.clone();
        def.config = config;
        *self = Self::create(&def)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.branches.is_empty() {
            return Err(ChatflowError::Validation(format!("split node '{}' has no branches", self.def.id)));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.branches.iter().find(|b| !seen.insert(b.as_str())) {
            return Err(ChatflowError::Validation(format!("split node '{}' lists branch '{}' twice", self.def.id, dup)));
        }
        Ok(())
    }

    fn next_node_ids(&self) -> Vec<NodeId> {
        let mut ids = self.branches.clone();
        ids.push(self.config.merge_node.clone());
        ids
    }

    fn is_branching(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        _: &NodeContext<'_>,
    ) -> Result<NodeResult> {
        let mut result = NodeResult::goto(&self.config.merge_node).with_output(json!({ "branches": self.branches }));
        result.branches = self.branches.clone();
        result.wait_duration = Some(Duration::from_secs(self.config.straggler_timeout_secs));
        Ok(result)
    }
}
