use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    Result,
    common::Vars,
    flow::template,
    model::NodeDefinition,
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageConfig {
    /// text with `{{path}}` placeholders
    pub text: String,
    #[serde(default)]
    pub media: Vec<String>,
}

/// Sends a rendered message to the execution's conversation.
#[derive(Debug, Clone)]
pub struct MessageNode {
    def: NodeDefinition,
    config: MessageConfig,
}

impl MessageNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        Ok(Self {
            def: def.clone(),
            config: parse_config(&def.config, &Self::schema())?,
        })
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["text"],
            "properties": {
                "text": { "type": "string", "description": "Message text, supports {{variable}} placeholders" },
                "media": { "type": "array", "items": { "type": "string" } }
            }
        })
    }
}

#[async_trait]
impl NodeExecutor for MessageNode {
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
        let conversation = ctx.conversation()?;
        let text = template::render(ctx.execution, &self.config.text);
        let media: Vec<String> = self.config.media.iter().map(|m| template::render(ctx.execution, m)).collect();

        let ack = ctx.guarded("send_failed", true, ctx.services.messenger.send(&conversation, &text, &media)).await?;
        debug!(node_id = %self.def.id, message_id = %ack.message_id, "message sent");

        Ok(NodeResult::proceed().with_output(json!({
            "message_id": ack.message_id,
            "text": text,
        })))
    }
}
