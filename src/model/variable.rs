use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChatflowError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRule>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

impl VariableType {
    pub fn accepts(
        &self,
        value: &Value,
    ) -> bool {
        match self {
            VariableType::String => value.is_string(),
            VariableType::Number => value.is_number(),
            VariableType::Boolean => value.is_boolean(),
            VariableType::Object => value.is_object(),
            VariableType::Array => value.is_array(),
            VariableType::Any => true,
        }
    }
}

impl VariableDefinition {
    /// Checks `value` against the declared type and validation rule.
    pub fn check(
        &self,
        value: &Value,
    ) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        if !self.var_type.accepts(value) {
            return Err(ChatflowError::Validation(format!(
                "variable '{}' expects {} but got {}",
                self.name,
                self.var_type.as_ref(),
                value
            )));
        }
        if let Some(rule) = &self.validation {
            rule.check(value).map_err(|e| ChatflowError::Validation(format!("variable '{}': {}", self.name, e)))?;
        }
        Ok(())
    }
}

impl ValidationRule {
    /// Compiles the pattern, reporting a bad expression.
    pub fn compile(&self) -> Result<Option<Regex>> {
        self.pattern.as_deref().map(Regex::new).transpose().map_err(|e| ChatflowError::Validation(format!("invalid pattern: {}", e)))
    }

    pub fn check(
        &self,
        value: &Value,
    ) -> std::result::Result<(), String> {
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(format!("{} is not one of the allowed values", value));
            }
        }

        match value {
            Value::String(s) => {
                let len = s.chars().count();
                if let Some(min) = self.min_length {
                    if len < min {
                        return Err(format!("must be at least {} characters", min));
                    }
                }
                if let Some(max) = self.max_length {
                    if len > max {
                        return Err(format!("must be at most {} characters", max));
                    }
                }
                if let Some(re) = self.compile().map_err(|e| e.to_string())? {
                    if !re.is_match(s) {
                        return Err(format!("'{}' does not match the expected format", s));
                    }
                }
            }
            Value::Number(n) => {
                let n = n.as_f64().unwrap_or_default();
                if let Some(min) = self.min {
                    if n < min {
                        return Err(format!("must be at least {}", min));
                    }
                }
                if let Some(max) = self.max {
                    if n > max {
                        return Err(format!("must be at most {}", max));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
