use serde::{Deserialize, Serialize};

use crate::{common::Vars, model::NodeId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDefinition {
    #[serde(default)]
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Vars,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// overrides the flow level retry budget
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// per-call timeout in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    pub target: NodeId,
    /// branch label such as `true`/`false`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    pub times: u32,
    /// base backoff in milliseconds
    #[serde(default)]
    pub interval: u64,
}

impl NodeDefinition {
    pub fn new(
        id: &str,
        node_type: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_config(
        mut self,
        config: Vars,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn connect(
        mut self,
        target: &str,
    ) -> Self {
        self.connections.push(Connection {
            target: target.to_string(),
            condition: None,
        });
        self
    }

    pub fn connect_when(
        mut self,
        label: &str,
        target: &str,
    ) -> Self {
        self.connections.push(Connection {
            target: target.to_string(),
            condition: Some(label.to_string()),
        });
        self
    }

    /// Target of the connection labelled `label`.
    pub fn connection_for(
        &self,
        label: &str,
    ) -> Option<&NodeId> {
        self.connections.iter().find(|c| c.condition.as_deref() == Some(label)).map(|c| &c.target)
    }
}
