use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical operator joining several conditions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// Comparison operator
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Operator {
    // for string, array or any scalar
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    IsEmpty,
    IsNotEmpty,
    Regex,
    In,
    NotIn,
    // for number
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionRule {
    /// variable path, looked up like a template placeholder
    pub variable: String,
    pub operator: Operator,
    /// expected value; strings may contain placeholders
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub case_sensitive: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    /// single condition form
    #[serde(flatten)]
    pub single: Option<ConditionRule>,
    /// list form
    #[serde(default)]
    pub conditions: Vec<ConditionRule>,
    #[serde(default)]
    pub logic: LogicalOperator,
    #[serde(default)]
    pub true_node: Option<String>,
    #[serde(default)]
    pub false_node: Option<String>,
}

impl ConditionConfig {
    pub fn rules(&self) -> Vec<&ConditionRule> {
        self.single.iter().chain(self.conditions.iter()).collect()
    }
}
