mod models;
mod node;

pub use models::{ConditionConfig, ConditionRule, LogicalOperator, Operator};
pub use node::ConditionNode;
