use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    Result,
    common::Vars,
    model::NodeDefinition,
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct EndConfig {
    /// variables copied into the execution output
    #[serde(default)]
    pub output_variables: Option<Vec<String>>,
}

/// Terminal node. Optionally snapshots variables into the execution output.
#[derive(Debug, Clone)]
pub struct EndNode {
    def: NodeDefinition,
    config: EndConfig,
}

impl EndNode {
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
                "output_variables": { "type": "array", "items": { "type": "string" } }
            }
        })
    }
}

#[async_trait]
impl NodeExecutor for EndNode {
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
        let mut result = NodeResult::complete();
        if let Some(names) = &self.config.output_variables {
            let snapshot: Map<String, Value> = names.iter().map(|name| (name.clone(), ctx.execution.variables.get_value(name).cloned().unwrap_or(Value::Null))).collect();
            result = result.with_output(Value::Object(snapshot));
        }
        Ok(result)
    }

    fn next_node_ids(&self) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{nodes::test_utils, runtime::ExecutionContext, services::Services};

    #[tokio::test]
    async fn test_end_snapshot() {
        let def = NodeDefinition::new("done", "end").with_config(Vars::from(json!({"output_variables": ["email", "missing"]})));
        let node = EndNode::create(&def).unwrap();

        let execution = ExecutionContext::new("t1").with_variables(Vars::new().with("email", "a@b.c").with("other", 1));
        let services = Services::default();
        let store = test_utils::store();
        let result = node.execute(&test_utils::node_ctx(&execution, None, &services, &store)).await.unwrap();

        assert!(result.complete);
        assert_eq!(result.output, Some(json!({"email": "a@b.c", "missing": null})));
    }
}
