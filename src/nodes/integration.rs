use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    Result,
    common::Vars,
    flow::template,
    model::NodeDefinition,
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
};

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IntegrationConfig {
    pub integration: String,
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    /// variable receiving the response
    #[serde(default)]
    pub output_variable: Option<String>,
    #[serde(default = "default_true")]
    pub retryable: bool,
}

/// Calls a named operation on an external integration.
#[derive(Debug, Clone)]
pub struct IntegrationNode {
    def: NodeDefinition,
    config: IntegrationConfig,
}

impl IntegrationNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        Ok(Self {
            def: def.clone(),
            config: parse_config(&def.config, &Self::schema())?,
        })
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["integration", "operation"],
            "properties": {
                "integration": { "type": "string", "minLength": 1 },
                "operation": { "type": "string", "minLength": 1 },
                "params": {},
                "output_variable": { "type": "string" },
                "retryable": { "type": "boolean" }
            }
        })
    }
}

#[async_trait]
impl NodeExecutor for IntegrationNode {
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
        let params = template::render_value(ctx.execution, &self.config.params);
        let response = ctx
            .guarded(
                "integration_failed",
                self.config.retryable,
                ctx.services.integrations.call(ctx.tenant_id(), &self.config.integration, &self.config.operation, &params),
            )
            .await?;

        let mut result = NodeResult::proceed();
        if let Some(variable) = &self.config.output_variable {
            result = result.with_variable(variable, response.clone());
        }
        Ok(result.with_output(response))
    }
}
