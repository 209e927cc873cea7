use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    ChatflowError, Result,
    common::Vars,
    flow::template,
    model::{NodeDefinition, ValidationRule},
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
};

/// Context key holding the last accepted input.
pub const LAST_INPUT: &str = "last_input";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InputConfig {
    /// variable that receives the input
    pub variable: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub validation: Option<ValidationRule>,
    /// sent when the input fails validation, defaults to the prompt
    #[serde(default)]
    pub retry_prompt: Option<String>,
}

/// Waits for the next inbound message and stores it in a variable.
#[derive(Debug, Clone)]
pub struct InputNode {
    def: NodeDefinition,
    config: InputConfig,
}

impl InputNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        Ok(Self {
            def: def.clone(),
            config: parse_config(&def.config, &Self::schema())?,
        })
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["variable"],
            "properties": {
                "variable": { "type": "string", "minLength": 1 },
                "prompt": { "type": "string" },
                "retry_prompt": { "type": "string" },
                "validation": {
                    "type": "object",
                    "properties": {
                        "pattern": { "type": "string" },
                        "min_length": { "type": "integer", "minimum": 0 },
                        "max_length": { "type": "integer", "minimum": 0 },
                        "min": { "type": "number" },
                        "max": { "type": "number" },
                        "enum": { "type": "array" }
                    }
                }
            }
        })
    }

    async fn say(
        &self,
        ctx: &NodeContext<'_>,
        text: &str,
    ) -> Result<()> {
        let conversation = ctx.conversation()?;
        let text = template::render(ctx.execution, text);
        ctx.guarded("send_failed", true, ctx.services.messenger.send(&conversation, &text, &[])).await?;
        Ok(())
    }
}

#[async_trait]
impl NodeExecutor for InputNode {
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

    fn validate(&self) -> Result<()> {
        if let Some(rule) = &self.config.validation {
            rule.compile()?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeResult> {
        let Some(input) = ctx.input else {
            if let Some(prompt) = &self.config.prompt {
                self.say(ctx, prompt).await?;
            }
            return Ok(NodeResult::pause());
        };

        let value = match input {
            Value::String(s) => Value::String(s.trim().to_string()),
            v => v.clone(),
        };

        if let Some(rule) = &self.config.validation {
            if let Err(reason) = rule.check(&value) {
                debug!(node_id = %self.def.id, "input rejected: {}", reason);
                if let Some(text) = self.config.retry_prompt.as_ref().or(self.config.prompt.as_ref()) {
                    self.say(ctx, text).await?;
                }
                return Ok(NodeResult::pause().with_metadata("invalid_input", reason));
            }
        }

        if self.config.variable.is_empty() {
            return Err(ChatflowError::fatal("bad_config", "input variable is empty"));
        }
        Ok(NodeResult::proceed().with_variable(&self.config.variable, value.clone()).with_metadata(LAST_INPUT, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{nodes::test_utils, runtime::ExecutionContext, services::Services};

    fn node() -> InputNode {
        let def = NodeDefinition::new("ask_email", "input").connect("thanks").with_config(Vars::from(json!({
            "variable": "email",
            "prompt": "What is your email?",
            "validation": { "pattern": "^[^@\\s]+@[^@\\s]+$" }
        })));
        InputNode::create(&def).unwrap()
    }

    #[tokio::test]
    async fn test_input_pauses_without_input() {
        let execution = ExecutionContext::new("t1").with_conversation("conv1");
        let services = Services::default();
        let store = test_utils::store();

        let result = node().execute(&test_utils::node_ctx(&execution, None, &services, &store)).await.unwrap();
        assert!(result.should_pause);
        assert!(result.variables.is_empty());
    }

    #[tokio::test]
    async fn test_input_stores_valid_value() {
        let execution = ExecutionContext::new("t1").with_conversation("conv1");
        let services = Services::default();
        let store = test_utils::store();

        let input = json!("  ada@example.com ");
        let result = node().execute(&test_utils::node_ctx(&execution, Some(&input), &services, &store)).await.unwrap();
        assert!(!result.should_pause);
        assert_eq!(result.variables.get_str("email"), Some("ada@example.com"));

        let bad = json!("nope");
        let result = node().execute(&test_utils::node_ctx(&execution, Some(&bad), &services, &store)).await.unwrap();
        assert!(result.should_pause);
        assert!(result.metadata.contains("invalid_input"));
    }
}
