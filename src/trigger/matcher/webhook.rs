use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    Result,
    trigger::{FlowTrigger, TriggerConfig, TriggerEvent, TriggerEventType, TriggerMatch, TriggerType, matcher::parse_conditions},
};

/// Header carrying the shared secret of a webhook call.
pub const SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Deserialize, Debug, Clone)]
pub struct WebhookConditions {
    pub webhook_id: String,
    /// Accepted HTTP methods; empty accepts any.
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

impl WebhookConditions {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["webhook_id"],
            "properties": {
                "webhook_id": { "type": "string", "minLength": 1 },
                "methods": {
                    "type": "array",
                    "items": { "type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"] }
                },
                "secret": { "type": "string", "minLength": 1 }
            }
        })
    }
}

/// Matches inbound webhook and API calls addressed to a webhook id.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebhookMatcher;

impl super::TriggerMatcher for WebhookMatcher {
    fn supported_types(&self) -> Vec<TriggerType> {
        vec![TriggerType::Webhook]
    }

    fn validate(
        &self,
        config: &TriggerConfig,
    ) -> Result<()> {
        parse_conditions::<WebhookConditions>(config, &WebhookConditions::schema()).map(|_| ())
    }

    fn match_event(
        &self,
        event: &TriggerEvent,
        trigger: &FlowTrigger,
    ) -> Result<Option<TriggerMatch>> {
        if !matches!(event.event_type, TriggerEventType::Webhook | TriggerEventType::ApiCall) {
            return Ok(None);
        }

        let conditions: WebhookConditions = parse_conditions(&trigger.config, &WebhookConditions::schema())?;
        if event.data.get_str("webhook_id") != Some(conditions.webhook_id.as_str()) {
            return Ok(None);
        }

        let method = event.data.get_str("method").unwrap_or("POST").to_uppercase();
        if !conditions.methods.is_empty() && !conditions.methods.iter().any(|m| m.eq_ignore_ascii_case(&method)) {
            return Ok(None);
        }

        if let Some(secret) = &conditions.secret {
            let presented = event.data.lookup(&format!("headers.{}", SECRET_HEADER)).and_then(Value::as_str);
            if presented != Some(secret.as_str()) {
                return Ok(None);
            }
        }

        let body = event.data.get_value("body").cloned().unwrap_or(Value::Null);
        Ok(Some(TriggerMatch::new(trigger, event).with_variable("webhook", body).with_context("webhook_method", method)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::Vars, trigger::TriggerMatcher};

    fn call(
        method: &str,
        secret: Option<&str>,
    ) -> TriggerEvent {
        let headers = secret.map(|s| Vars::new().with(SECRET_HEADER, s)).unwrap_or_default();
        TriggerEvent::new("t1", TriggerEventType::Webhook).with_data(Vars::new().with("webhook_id", "orders").with("method", method).with("headers", headers).with("body", json!({"id": 7})))
    }

    #[test]
    fn test_webhook_filters() {
        let trigger = FlowTrigger::new(
            "t1",
            "f1",
            "orders",
            TriggerConfig::new(TriggerType::Webhook).with_conditions(Vars::from(json!({"webhook_id": "orders", "methods": ["POST"], "secret": "s3"}))),
        );

        let m = WebhookMatcher.match_event(&call("post", Some("s3")), &trigger).unwrap().unwrap();
        assert_eq!(m.variables.lookup("webhook.id"), Some(&json!(7)));
        assert!(WebhookMatcher.match_event(&call("GET", Some("s3")), &trigger).unwrap().is_none());
        assert!(WebhookMatcher.match_event(&call("POST", Some("nope")), &trigger).unwrap().is_none());
        assert!(WebhookMatcher.match_event(&call("POST", None), &trigger).unwrap().is_none());
    }
}
