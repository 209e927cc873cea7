use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    ChatflowError, Result,
    trigger::{FlowTrigger, TriggerConfig, TriggerEvent, TriggerEventType, TriggerMatch, TriggerType, matcher::parse_conditions},
};

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ButtonConditions {
    #[serde(default)]
    pub button_ids: Vec<String>,
    #[serde(default)]
    pub payloads: Vec<String>,
}

impl ButtonConditions {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "button_ids": { "type": "array", "items": { "type": "string", "minLength": 1 } },
                "payloads": { "type": "array", "items": { "type": "string" } }
            }
        })
    }
}

/// Matches button clicks by button id or payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct ButtonMatcher;

impl super::TriggerMatcher for ButtonMatcher {
    fn supported_types(&self) -> Vec<TriggerType> {
        vec![TriggerType::Button]
    }

    fn validate(
        &self,
        config: &TriggerConfig,
    ) -> Result<()> {
        let conditions: ButtonConditions = parse_conditions(config, &ButtonConditions::schema())?;
        if conditions.button_ids.is_empty() && conditions.payloads.is_empty() {
            return Err(ChatflowError::Trigger("button trigger needs button_ids or payloads".to_string()));
        }
        Ok(())
    }

    fn match_event(
        &self,
        event: &TriggerEvent,
        trigger: &FlowTrigger,
    ) -> Result<Option<TriggerMatch>> {
        if event.event_type != TriggerEventType::ButtonClicked {
            return Ok(None);
        }

        let conditions: ButtonConditions = parse_conditions(&trigger.config, &ButtonConditions::schema())?;
        let button_id = event.data.get_str("button_id");
        let payload = event.data.get_str("payload");

        let by_id = button_id.is_some_and(|id| conditions.button_ids.iter().any(|b| b == id));
        let by_payload = payload.is_some_and(|p| conditions.payloads.iter().any(|b| b == p));
        if !by_id && !by_payload {
            return Ok(None);
        }

        Ok(Some(TriggerMatch::new(trigger, event).with_variable("button_id", button_id).with_variable("button_payload", payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::Vars, trigger::TriggerMatcher};

    #[test]
    fn test_button_match() {
        let trigger = FlowTrigger::new("t1", "f1", "buy", TriggerConfig::new(TriggerType::Button).with_conditions(Vars::from(json!({"button_ids": ["buy"], "payloads": ["BUY_NOW"]}))));
        let click = |id: &str, payload: Option<&str>| {
            TriggerEvent::new("t1", TriggerEventType::ButtonClicked).with_data(Vars::new().with("button_id", id).with("payload", payload))
        };

        assert!(ButtonMatcher.match_event(&click("buy", None), &trigger).unwrap().is_some());
        assert!(ButtonMatcher.match_event(&click("other", Some("BUY_NOW")), &trigger).unwrap().is_some());
        assert!(ButtonMatcher.match_event(&click("other", None), &trigger).unwrap().is_none());
        assert!(ButtonMatcher.validate(&TriggerConfig::new(TriggerType::Button)).is_err());
    }
}
