//! `{{ path }}` placeholder rendering.
//!
//! Paths resolve against the execution variables first, then the auxiliary
//! context map, descending into objects and arrays on dots. Placeholders that
//! do not resolve are left in the output verbatim.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::runtime::ExecutionContext;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][\w.\-]*)\s*\}\}").expect("valid placeholder pattern"));

/// Looks up a dotted path in variables, then in the auxiliary context.
pub fn resolve(
    ctx: &ExecutionContext,
    path: &str,
) -> Option<Value> {
    ctx.variables.lookup(path).or_else(|| ctx.context.lookup(path)).cloned()
}

/// Renders every placeholder in `template` as text.
pub fn render(
    ctx: &ExecutionContext,
    template: &str,
) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| match resolve(ctx, &caps[1]) {
            Some(value) => to_text(&value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Renders strings inside a JSON value recursively.
///
/// A string made of exactly one placeholder keeps the resolved value's type.
pub fn render_value(
    ctx: &ExecutionContext,
    value: &Value,
) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = PLACEHOLDER.captures(s) {
                if caps[0].len() == s.trim().len() {
                    if let Some(resolved) = resolve(ctx, &caps[1]) {
                        return resolved;
                    }
                }
            }
            Value::String(render(ctx, s))
        }
        Value::Array(arr) => Value::Array(arr.iter().map(|v| render_value(ctx, v)).collect()),
        Value::Object(obj) => Value::Object(obj.iter().map(|(k, v)| (k.clone(), render_value(ctx, v))).collect()),
        _ => value.clone(),
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        v => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::common::Vars;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new("t1").with_variables(Vars::new().with("name", "Ada").with("age", 36).with("user", json!({"plan": {"tier": "pro"}})));
        ctx.context.set("last_input", "hello");
        ctx
    }

    #[test]
    fn test_render_variables_and_context() {
        let ctx = ctx();
        assert_eq!(render(&ctx, "Hi {{name}}, you are {{ age }}"), "Hi Ada, you are 36");
        assert_eq!(render(&ctx, "tier={{user.plan.tier}}"), "tier=pro");
        assert_eq!(render(&ctx, "you said {{last_input}}"), "you said hello");
    }

    #[test]
    fn test_render_unresolved_passthrough() {
        let ctx = ctx();
        assert_eq!(render(&ctx, "Hello {{missing}}!"), "Hello {{missing}}!");
        assert_eq!(render(&ctx, "{{user.plan.nope}}"), "{{user.plan.nope}}");
        assert_eq!(render(&ctx, "no placeholders"), "no placeholders");
    }

    #[test]
    fn test_render_value_keeps_types() {
        let ctx = ctx();
        let rendered = render_value(&ctx, &json!({"age": "{{age}}", "plan": "{{user.plan}}", "greeting": "hi {{name}}", "n": 1}));
        assert_eq!(rendered, json!({"age": 36, "plan": {"tier": "pro"}, "greeting": "hi Ada", "n": 1}));
    }
}
