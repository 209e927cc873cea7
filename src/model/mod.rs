//! Static flow definitions: nodes, connections, variables and settings.
//!
//! Everything here is plain data deserialized from JSON. Behavior lives in
//! [`crate::flow`] (compilation and validation) and [`crate::nodes`].

mod flow;
mod node;
mod settings;
mod variable;

pub use flow::{FlowDefinition, FlowMetadata};
pub use node::{Connection, NodeDefinition, RetryConfig};
pub use settings::{FlowSettings, RateLimit, TimeoutAction};
pub use variable::{ValidationRule, VariableDefinition, VariableType};

pub type FlowId = String;
pub type NodeId = String;
pub type ExecutionId = String;
pub type TriggerId = String;
