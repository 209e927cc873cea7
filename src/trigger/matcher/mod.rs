//! Per-type trigger matching strategies.

pub mod button;
pub mod contact;
pub mod keyword;
pub mod schedule;
pub mod webhook;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    ChatflowError, Result,
    nodes::parse_config,
    trigger::{FlowTrigger, TriggerConfig, TriggerEvent, TriggerMatch, TriggerType},
};

pub use button::ButtonMatcher;
pub use contact::ContactEventMatcher;
pub use keyword::KeywordMatcher;
pub use schedule::{ScheduleConditions, ScheduleMatcher};
pub use webhook::WebhookMatcher;

pub trait TriggerMatcher: Send + Sync {
    fn supported_types(&self) -> Vec<TriggerType>;

    /// Rejects malformed conditions before a trigger is stored.
    fn validate(
        &self,
        config: &TriggerConfig,
    ) -> Result<()>;

    /// `Ok(None)` when `event` does not concern `trigger`.
    fn match_event(
        &self,
        event: &TriggerEvent,
        trigger: &FlowTrigger,
    ) -> Result<Option<TriggerMatch>>;
}

/// Every built-in matcher.
pub fn builtins() -> Vec<std::sync::Arc<dyn TriggerMatcher>> {
    vec![
        std::sync::Arc::new(KeywordMatcher::new()),
        std::sync::Arc::new(ButtonMatcher),
        std::sync::Arc::new(WebhookMatcher),
        std::sync::Arc::new(ContactEventMatcher),
        std::sync::Arc::new(ScheduleMatcher),
    ]
}

/// Schema-checks and deserializes trigger conditions.
pub(crate) fn parse_conditions<T: DeserializeOwned>(
    config: &TriggerConfig,
    schema: &Value,
) -> Result<T> {
    parse_config(&config.conditions, schema).map_err(|err| ChatflowError::Trigger(format!("invalid {} conditions: {}", config.trigger_type.as_ref(), err)))
}
