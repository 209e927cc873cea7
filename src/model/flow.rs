use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    ChatflowError, Result,
    model::{FlowId, FlowSettings, NodeDefinition, NodeId, VariableDefinition},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: FlowId,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub start_node: NodeId,
    pub nodes: BTreeMap<NodeId, NodeDefinition>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    #[serde(default)]
    pub settings: FlowSettings,
    #[serde(default)]
    pub metadata: FlowMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowMetadata {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version_label: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
}

fn default_version() -> u32 {
    1
}

impl FlowDefinition {
    pub fn from_json(s: &str) -> Result<Self> {
        let mut flow = serde_json::from_str::<FlowDefinition>(s).map_err(|e| ChatflowError::Validation(format!("invalid flow definition: {}", e)))?;
        flow.normalize();
        Ok(flow)
    }

    /// Fills empty node ids from their map keys.
    pub fn normalize(&mut self) {
        for (key, node) in self.nodes.iter_mut() {
            if node.id.is_empty() {
                node.id = key.clone();
            }
        }
    }

    /// Storage key of this exact version.
    pub fn version_key(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }

    pub fn node(
        &self,
        id: &str,
    ) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    pub fn variable(
        &self,
        name: &str,
    ) -> Option<&VariableDefinition> {
        self.variables.iter().find(|v| v.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_from_json() {
        let flow = FlowDefinition::from_json(
            r#"{
                "id": "welcome",
                "start_node": "start",
                "nodes": {
                    "start": { "type": "start", "connections": [{ "target": "bye" }] },
                    "bye": { "id": "bye", "type": "end" }
                },
                "settings": { "max_steps": 20 }
            }"#,
        )
        .unwrap();

        assert_eq!(flow.version, 1);
        assert_eq!(flow.version_key(), "welcome@1");
        assert_eq!(flow.node("start").unwrap().id, "start");
        assert_eq!(flow.node("start").unwrap().connections[0].target, "bye");
        assert_eq!(flow.settings.max_steps, 20);
        assert_eq!(flow.settings.retry_attempts, 2);
    }

    #[test]
    fn test_flow_from_json_rejects_garbage() {
        let err = FlowDefinition::from_json(r#"{"id": "x"}"#).unwrap_err();
        assert!(matches!(err, ChatflowError::Validation(_)));
    }
}
