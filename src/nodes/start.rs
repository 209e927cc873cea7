use async_trait::async_trait;

use crate::{
    Result,
    common::Vars,
    model::NodeDefinition,
    nodes::{NodeContext, NodeExecutor, NodeResult},
};

/// Entry point of a flow; no side effects.
#[derive(Debug, Clone)]
pub struct StartNode {
    def: NodeDefinition,
}

impl StartNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        Ok(StartNode {
            def: def.clone(),
        })
    }
}

#[async_trait]
impl NodeExecutor for StartNode {
    fn definition(&self) -> &NodeDefinition {
        &self.def
    }

    fn set_config(
        &mut self,
        config: Vars,
    ) -> Result<()> {
        self.def.config = config;
        Ok(())
    }

    async fn execute(
        &self,
        _: &NodeContext<'_>,
    ) -> Result<NodeResult> {
        Ok(NodeResult::proceed())
    }
}
