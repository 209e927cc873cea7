use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    ChatflowError, Result,
    common::MemCache,
    trigger::{FlowTrigger, TriggerConfig, TriggerEvent, TriggerEventType, TriggerMatch, TriggerType, matcher::parse_conditions},
};

const REGEX_CACHE_SIZE: usize = 1024;

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    #[default]
    Exact,
    Contains,
    StartsWith,
    Regex,
}

#[derive(Deserialize, Debug, Clone)]
pub struct KeywordConditions {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub mode: MatchMode,
    #[serde(default)]
    pub case_sensitive: bool,
}

impl KeywordConditions {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["keywords"],
            "properties": {
                "keywords": {
                    "type": "array",
                    "minItems": 1,
                    "items": { "type": "string", "minLength": 1 }
                },
                "mode": { "type": "string", "enum": ["exact", "contains", "starts_with", "regex"] },
                "case_sensitive": { "type": "boolean" }
            }
        })
    }
}

/// Trims and collapses runs of whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Matches inbound message text against a keyword list.
///
/// Keywords are alternatives; the first one that matches wins. Named groups
/// of a regex keyword become execution variables.
pub struct KeywordMatcher {
    regexes: MemCache<String, Regex>,
}

impl Default for KeywordMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl KeywordMatcher {
    pub fn new() -> Self {
        Self {
            regexes: MemCache::new(REGEX_CACHE_SIZE),
        }
    }

    fn regex(
        &self,
        pattern: &str,
        case_sensitive: bool,
    ) -> Result<Regex> {
        let key = format!("{}:{}", case_sensitive, pattern);
        if let Some(re) = self.regexes.get(&key) {
            return Ok(re);
        }
        let re = RegexBuilder::new(pattern).case_insensitive(!case_sensitive).build().map_err(|e| ChatflowError::Trigger(format!("invalid keyword regex '{}': {}", pattern, e)))?;
        self.regexes.set(key, re.clone());
        Ok(re)
    }
}

impl super::TriggerMatcher for KeywordMatcher {
    fn supported_types(&self) -> Vec<TriggerType> {
        vec![TriggerType::Keyword]
    }

    fn validate(
        &self,
        config: &TriggerConfig,
    ) -> Result<()> {
        let conditions: KeywordConditions = parse_conditions(config, &KeywordConditions::schema())?;
        if conditions.mode == MatchMode::Regex {
            for keyword in conditions.keywords.iter() {
                self.regex(keyword, conditions.case_sensitive)?;
            }
        }
        Ok(())
    }

    fn match_event(
        &self,
        event: &TriggerEvent,
        trigger: &FlowTrigger,
    ) -> Result<Option<TriggerMatch>> {
        if event.event_type != TriggerEventType::MessageReceived {
            return Ok(None);
        }
        let Some(text) = event.text() else {
            return Ok(None);
        };

        let conditions: KeywordConditions = parse_conditions(&trigger.config, &KeywordConditions::schema())?;
        let text = normalize(text);
        let folded = if conditions.case_sensitive {
            text.clone()
        } else {
            text.to_lowercase()
        };

        for keyword in conditions.keywords.iter() {
            if conditions.mode == MatchMode::Regex {
                let re = self.regex(keyword, conditions.case_sensitive)?;
                let Some(caps) = re.captures(&text) else {
                    continue;
                };
                let mut m = TriggerMatch::new(trigger, event).with_variable("matched_keyword", keyword).with_context("message_text", &text);
                for name in re.capture_names().flatten() {
                    if let Some(value) = caps.name(name) {
                        m = m.with_variable(name, value.as_str());
                    }
                }
                return Ok(Some(m));
            }

            let keyword_norm = normalize(keyword);
            let keyword_norm = if conditions.case_sensitive {
                keyword_norm
            } else {
                keyword_norm.to_lowercase()
            };
            let hit = match conditions.mode {
                MatchMode::Exact => folded == keyword_norm,
                MatchMode::Contains => folded.contains(&keyword_norm),
                MatchMode::StartsWith => folded.starts_with(&keyword_norm),
                MatchMode::Regex => false,
            };
            if hit {
                return Ok(Some(TriggerMatch::new(trigger, event).with_variable("matched_keyword", keyword).with_context("message_text", &text)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::Vars,
        trigger::{TriggerMatcher, TriggerType},
    };

    fn trigger(conditions: Value) -> FlowTrigger {
        FlowTrigger::new("t1", "f1", "kw", TriggerConfig::new(TriggerType::Keyword).with_conditions(Vars::from(conditions)))
    }

    fn message(text: &str) -> TriggerEvent {
        TriggerEvent::new("t1", TriggerEventType::MessageReceived).with_conversation("conv1").with_data(Vars::new().with("text", text))
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  hello \n  world\t"), "hello world");
    }

    #[test]
    fn test_modes_and_case() {
        let matcher = KeywordMatcher::new();
        let exact = trigger(json!({"keywords": ["menu", "help"]}));
        assert!(matcher.match_event(&message("  HELP "), &exact).unwrap().is_some());
        assert!(matcher.match_event(&message("help me"), &exact).unwrap().is_none());

        let contains = trigger(json!({"keywords": ["order"], "mode": "contains", "case_sensitive": true}));
        assert!(matcher.match_event(&message("where is my order?"), &contains).unwrap().is_some());
        assert!(matcher.match_event(&message("ORDER status"), &contains).unwrap().is_none());

        let starts = trigger(json!({"keywords": ["hi"], "mode": "starts_with"}));
        assert!(matcher.match_event(&message("Hi   there"), &starts).unwrap().is_some());
    }

    #[test]
    fn test_regex_named_captures() {
        let matcher = KeywordMatcher::new();
        let t = trigger(json!({"keywords": [r"order\s+#?(?P<order_id>\d+)"], "mode": "regex"}));
        let m = matcher.match_event(&message("Order #1234 please"), &t).unwrap().unwrap();
        assert_eq!(m.variables.get_str("order_id"), Some("1234"));
        assert_eq!(m.flow_id, "f1");
    }

    #[test]
    fn test_validate() {
        let matcher = KeywordMatcher::new();
        assert!(matcher.validate(&trigger(json!({"keywords": []})).config).is_err());
        assert!(matcher.validate(&trigger(json!({"keywords": ["(unclosed"], "mode": "regex"})).config).is_err());
        assert!(matcher.validate(&trigger(json!({"keywords": ["ok"]})).config).is_ok());
    }
}
