use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    Result,
    trigger::{FlowTrigger, TriggerConfig, TriggerEvent, TriggerEventType, TriggerMatch, TriggerType, matcher::parse_conditions},
};

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ContactConditions {
    /// Event kinds to accept; empty accepts every contact event.
    #[serde(default)]
    pub events: Vec<TriggerEventType>,
    /// For `tag_added`, the tags that count.
    #[serde(default)]
    pub tags: Vec<String>,
    /// For `contact_updated`, fields whose change counts.
    #[serde(default)]
    pub fields: Vec<String>,
    /// For `custom`, the event names that count.
    #[serde(default)]
    pub custom_events: Vec<String>,
}

impl ContactConditions {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "events": {
                    "type": "array",
                    "items": { "type": "string", "enum": ["contact_created", "contact_updated", "tag_added", "custom"] }
                },
                "tags": { "type": "array", "items": { "type": "string" } },
                "fields": { "type": "array", "items": { "type": "string" } },
                "custom_events": { "type": "array", "items": { "type": "string" } }
            }
        })
    }
}

/// Matches contact lifecycle and custom events.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContactEventMatcher;

impl super::TriggerMatcher for ContactEventMatcher {
    fn supported_types(&self) -> Vec<TriggerType> {
        vec![TriggerType::ContactEvent]
    }

    fn validate(
        &self,
        config: &TriggerConfig,
    ) -> Result<()> {
        parse_conditions::<ContactConditions>(config, &ContactConditions::schema()).map(|_| ())
    }

    fn match_event(
        &self,
        event: &TriggerEvent,
        trigger: &FlowTrigger,
    ) -> Result<Option<TriggerMatch>> {
        if !TriggerEventType::trigger_types(&event.event_type).contains(&TriggerType::ContactEvent) {
            return Ok(None);
        }

        let conditions: ContactConditions = parse_conditions(&trigger.config, &ContactConditions::schema())?;
        if !conditions.events.is_empty() && !conditions.events.contains(&event.event_type) {
            return Ok(None);
        }

        let accepted = match event.event_type {
            TriggerEventType::TagAdded => conditions.tags.is_empty() || event.data.get_str("tag").is_some_and(|t| conditions.tags.iter().any(|c| c == t)),
            TriggerEventType::ContactUpdated => {
                let changed: Vec<String> = event.data.get("changed_fields").unwrap_or_default();
                conditions.fields.is_empty() || changed.iter().any(|f| conditions.fields.contains(f))
            }
            TriggerEventType::Custom => conditions.custom_events.is_empty() || event.data.get_str("event").is_some_and(|n| conditions.custom_events.iter().any(|c| c == n)),
            _ => true,
        };
        if !accepted {
            return Ok(None);
        }

        let mut m = TriggerMatch::new(trigger, event).with_variable("contact_event", event.event_type.as_ref());
        for (key, value) in event.data.iter() {
            m = m.with_context(key, value);
        }
        Ok(Some(m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::Vars, trigger::TriggerMatcher};

    fn trigger(conditions: Value) -> FlowTrigger {
        FlowTrigger::new("t1", "f1", "contact", TriggerConfig::new(TriggerType::ContactEvent).with_conditions(Vars::from(conditions)))
    }

    #[test]
    fn test_tag_and_field_filters() {
        let vip = trigger(json!({"events": ["tag_added"], "tags": ["vip"]}));
        let tagged = |tag: &str| TriggerEvent::new("t1", TriggerEventType::TagAdded).with_contact("c1").with_data(Vars::new().with("tag", tag));
        assert!(ContactEventMatcher.match_event(&tagged("vip"), &vip).unwrap().is_some());
        assert!(ContactEventMatcher.match_event(&tagged("lead"), &vip).unwrap().is_none());

        let email = trigger(json!({"fields": ["email"]}));
        let updated = TriggerEvent::new("t1", TriggerEventType::ContactUpdated).with_data(Vars::new().with("changed_fields", ["email", "name"]));
        assert!(ContactEventMatcher.match_event(&updated, &email).unwrap().is_some());
        let created = TriggerEvent::new("t1", TriggerEventType::ContactCreated);
        assert!(ContactEventMatcher.match_event(&created, &email).unwrap().is_some());
    }

    #[test]
    fn test_custom_event_names() {
        let paid = trigger(json!({"events": ["custom"], "custom_events": ["order_paid"]}));
        let event = |name: &str| TriggerEvent::new("t1", TriggerEventType::Custom).with_data(Vars::new().with("event", name));
        assert!(ContactEventMatcher.match_event(&event("order_paid"), &paid).unwrap().is_some());
        assert!(ContactEventMatcher.match_event(&event("cart_abandoned"), &paid).unwrap().is_none());
        assert!(ContactEventMatcher.validate(&trigger(json!({"events": ["scheduled"]})).config).is_err());
    }
}
