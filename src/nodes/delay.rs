use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    ChatflowError, Result,
    common::Vars,
    model::NodeDefinition,
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DelayConfig {
    #[serde(default)]
    pub milliseconds: u64,
    #[serde(default)]
    pub seconds: u64,
    #[serde(default)]
    pub minutes: u64,
    #[serde(default)]
    pub hours: u64,
    #[serde(default)]
    pub days: u64,
}

impl DelayConfig {
    pub fn duration(&self) -> Duration {
        let secs = self.seconds.saturating_add(self.minutes.saturating_mul(60)).saturating_add(self.hours.saturating_mul(3600)).saturating_add(self.days.saturating_mul(86_400));
        Duration::from_secs(secs).saturating_add(Duration::from_millis(self.milliseconds))
    }
}

/// Suspends the execution for a fixed duration.
///
/// The wait is handed to the scheduler; no worker sleeps.
#[derive(Debug, Clone)]
pub struct DelayNode {
    def: NodeDefinition,
    duration: Duration,
}

impl DelayNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        let config: DelayConfig = parse_config(&def.config, &Self::schema())?;
        let duration = config.duration();
        if duration.is_zero() {
            return Err(ChatflowError::Validation(format!("delay node '{}' must wait longer than zero", def.id)));
        }
        Ok(Self {
            def: def.clone(),
            duration,
        })
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "milliseconds": { "type": "integer", "minimum": 0 },
                "seconds": { "type": "integer", "minimum": 0 },
                "minutes": { "type": "integer", "minimum": 0 },
                "hours": { "type": "integer", "minimum": 0 },
                "days": { "type": "integer", "minimum": 0 }
            }
        })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[async_trait]
impl NodeExecutor for DelayNode {
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

    async fn execute(
        &self,
        _: &NodeContext<'_>,
    ) -> Result<NodeResult> {
        Ok(NodeResult::wait(self.duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_duration() {
        let def = NodeDefinition::new("wait", "delay").with_config(Vars::from(json!({"minutes": 1, "seconds": 5, "milliseconds": 250})));
        assert_eq!(DelayNode::create(&def).unwrap().duration(), Duration::from_millis(65_250));

        let zero = NodeDefinition::new("wait", "delay");
        assert!(matches!(DelayNode::create(&zero), Err(ChatflowError::Validation(_))));
    }
}
