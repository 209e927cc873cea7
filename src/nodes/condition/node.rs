use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};

use crate::{
    ChatflowError, Result,
    common::Vars,
    flow::template,
    model::{NodeDefinition, NodeId},
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
};

use super::models::*;

const TRUE_LABEL: &str = "true";
const FALSE_LABEL: &str = "false";

/// Evaluates conditions over variables and explicitly picks the true or false target.
#[derive(Debug, Clone)]
pub struct ConditionNode {
    def: NodeDefinition,
    config: ConditionConfig,
    true_target: Option<NodeId>,
    false_target: Option<NodeId>,
}

impl ConditionNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        let config: ConditionConfig = parse_config(&def.config, &Self::schema())?;
        let true_target = config.true_node.clone().or_else(|| def.connection_for(TRUE_LABEL).cloned());
        let false_target = config.false_node.clone().or_else(|| def.connection_for(FALSE_LABEL).cloned());
        Ok(Self {
            def: def.clone(),
            config,
            true_target,
            false_target,
        })
    }

    pub fn schema() -> Value {
        let rule = json!({
            "type": "object",
            "required": ["variable", "operator"],
            "properties": {
                "variable": { "type": "string" },
                "operator": {
                    "type": "string",
                    "enum": [
                        "equals", "not_equals", "contains", "not_contains", "starts_with", "ends_with",
                        "greater_than", "less_than", "greater_or_equal", "less_or_equal",
                        "is_empty", "is_not_empty", "regex", "in", "not_in"
                    ]
                },
                "value": {},
                "case_sensitive": { "type": "boolean" }
            }
        });
        let operator = rule["properties"]["operator"].clone();
        json!({
            "type": "object",
            "properties": {
                "variable": { "type": "string" },
                "operator": operator,
                "conditions": { "type": "array", "items": rule },
                "logic": { "type": "string", "enum": ["and", "or"] },
                "true_node": { "type": "string" },
                "false_node": { "type": "string" }
            },
            "anyOf": [
                { "required": ["variable", "operator"] },
                { "required": ["conditions"] }
            ]
        })
    }

    /// Evaluates one rule against the execution state.
    fn evaluate(
        &self,
        ctx: &NodeContext<'_>,
        rule: &ConditionRule,
    ) -> bool {
        let actual = template::resolve(ctx.execution, &rule.variable);
        let expected = rule.value.as_ref().map(|v| template::render_value(ctx.execution, v));
        let case_sensitive = rule.case_sensitive.unwrap_or(true);

        match rule.operator {
            Operator::IsEmpty => is_empty(actual.as_ref()),
            Operator::IsNotEmpty => !is_empty(actual.as_ref()),
            op => {
                let (Some(actual), Some(expected)) = (actual, expected) else {
                    // a missing variable only satisfies the negated operators
                    return matches!(op, Operator::NotEquals | Operator::NotContains | Operator::NotIn);
                };
                compare(&actual, op, &expected, case_sensitive)
            }
        }
    }
}

pub(crate) fn compare(
    actual: &Value,
    op: Operator,
    expected: &Value,
    case_sensitive: bool,
) -> bool {
    match op {
        Operator::Equals => loose_eq(actual, expected, case_sensitive),
        Operator::NotEquals => !loose_eq(actual, expected, case_sensitive),
        Operator::Contains => contains(actual, expected, case_sensitive),
        Operator::NotContains => !contains(actual, expected, case_sensitive),
        Operator::StartsWith => text_pair(actual, expected, case_sensitive).is_some_and(|(a, e)| a.starts_with(&e)),
        Operator::EndsWith => text_pair(actual, expected, case_sensitive).is_some_and(|(a, e)| a.ends_with(&e)),
        Operator::GreaterThan => num_cmp(actual, expected, |a, b| a > b),
        Operator::LessThan => num_cmp(actual, expected, |a, b| a < b),
        Operator::GreaterOrEqual => num_cmp(actual, expected, |a, b| a >= b),
        Operator::LessOrEqual => num_cmp(actual, expected, |a, b| a <= b),
        Operator::Regex => match (text(actual), expected.as_str()) {
            (Some(a), Some(pattern)) => {
                let pattern = if case_sensitive { pattern.to_string() } else { format!("(?i){}", pattern) };
                Regex::new(&pattern).map(|re| re.is_match(&a)).unwrap_or(false)
            }
            _ => false,
        },
        Operator::In => in_list(actual, expected, case_sensitive),
        Operator::NotIn => !in_list(actual, expected, case_sensitive),
        Operator::IsEmpty => is_empty(Some(actual)),
        Operator::IsNotEmpty => !is_empty(Some(actual)),
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(arr)) => arr.is_empty(),
        Some(Value::Object(obj)) => obj.is_empty(),
        _ => false,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn text_pair(
    actual: &Value,
    expected: &Value,
    case_sensitive: bool,
) -> Option<(String, String)> {
    let (a, e) = (text(actual)?, text(expected)?);
    if case_sensitive { Some((a, e)) } else { Some((a.to_lowercase(), e.to_lowercase())) }
}

fn loose_eq(
    actual: &Value,
    expected: &Value,
    case_sensitive: bool,
) -> bool {
    if let (Some(a), Some(e)) = (number(actual), number(expected)) {
        if actual.is_number() || expected.is_number() {
            return a == e;
        }
    }
    match text_pair(actual, expected, case_sensitive) {
        Some((a, e)) => a == e,
        None => actual == expected,
    }
}

fn contains(
    actual: &Value,
    expected: &Value,
    case_sensitive: bool,
) -> bool {
    match actual {
        Value::Array(arr) => arr.iter().any(|v| loose_eq(v, expected, case_sensitive)),
        Value::Object(obj) => expected.as_str().is_some_and(|k| obj.contains_key(k)),
        _ => text_pair(actual, expected, case_sensitive).is_some_and(|(a, e)| a.contains(&e)),
    }
}

fn in_list(
    actual: &Value,
    expected: &Value,
    case_sensitive: bool,
) -> bool {
    match expected {
        Value::Array(list) => list.iter().any(|e| loose_eq(actual, e, case_sensitive)),
        Value::String(s) => s.split(',').any(|e| loose_eq(actual, &Value::String(e.trim().to_string()), case_sensitive)),
        _ => false,
    }
}

fn num_cmp<F>(
    actual: &Value,
    expected: &Value,
    cmp: F,
) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (number(actual), number(expected)) {
        (Some(a), Some(e)) => cmp(a, e),
        _ => false,
    }
}

#[async_trait]
impl NodeExecutor for ConditionNode {
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

    fn validate(&self) -> Result<()> {
        if self.config.rules().is_empty() {
            return Err(ChatflowError::Validation(format!("condition node '{}' has no conditions", self.def.id)));
        }
        if self.true_target.is_none() || self.false_target.is_none() {
            return Err(ChatflowError::Validation(format!(
                "condition node '{}' needs both a true and a false target",
                self.def.id
            )));
        }
        for rule in self.config.rules() {
            if rule.operator == Operator::Regex {
                let pattern = rule.value.as_ref().and_then(Value::as_str).unwrap_or_default();
                Regex::new(pattern).map_err(|e| ChatflowError::Validation(format!("condition node '{}': {}", self.def.id, e)))?;
            }
        }
        Ok(())
    }

    fn next_node_ids(&self) -> Vec<NodeId> {
        self.true_target.iter().chain(self.false_target.iter()).cloned().collect()
    }

    fn is_branching(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeResult> {
        let mut results = self.config.rules().into_iter().map(|rule| self.evaluate(ctx, rule));
        let passed = match self.config.logic {
            LogicalOperator::And => results.all(|r| r),
            LogicalOperator::Or => results.any(|r| r),
        };

        let target = if passed { &self.true_target } else { &self.false_target };
        let target = target.as_ref().ok_or_else(|| ChatflowError::Transition(format!("condition node '{}' has no {} target", self.def.id, passed)))?;

        Ok(NodeResult::goto(target).with_output(json!({ "result": passed })))
    }
}
