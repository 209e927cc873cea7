use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    Result,
    common::Vars,
    flow::template,
    model::NodeDefinition,
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
    services::AiRequest,
};

fn default_output_variable() -> String {
    "ai_response".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AiConfig {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_output_variable")]
    pub output_variable: String,
    #[serde(default = "default_true")]
    pub retryable: bool,
}

/// Asks the AI provider for a completion and stores the text.
#[derive(Debug, Clone)]
pub struct AiNode {
    def: NodeDefinition,
    config: AiConfig,
}

impl AiNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        Ok(Self {
            def: def.clone(),
            config: parse_config(&def.config, &Self::schema())?,
        })
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["prompt"],
            "properties": {
                "prompt": { "type": "string", "minLength": 1 },
                "system": { "type": "string" },
                "model": { "type": "string" },
                "temperature": { "type": "number", "minimum": 0 },
                "max_tokens": { "type": "integer", "minimum": 1 },
                "output_variable": { "type": "string", "minLength": 1 },
                "retryable": { "type": "boolean" }
            }
        })
    }
}

#[async_trait]
impl NodeExecutor for AiNode {
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
        let request = AiRequest {
            prompt: template::render(ctx.execution, &self.config.prompt),
            system: self.config.system.as_ref().map(|s| template::render(ctx.execution, s)),
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let text = ctx.guarded("ai_failed", self.config.retryable, ctx.services.ai.complete(ctx.tenant_id(), &request)).await?;

        Ok(NodeResult::proceed().with_variable(&self.config.output_variable, &text).with_output(json!({ "text": text })))
    }
}
