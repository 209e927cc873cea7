//! Trigger model and dispatch.
//!
//! External producers publish [`TriggerEvent`]s through the
//! [`TriggerEventEmitter`]. The [`TriggerProcessor`] queues them per
//! conversation, runs the registered [`TriggerMatcher`]s against the tenant's
//! active triggers and starts or resumes flows on the engine. The
//! [`TriggerScheduler`] turns due schedules, timers and expiries back into
//! events.

pub mod emitter;
pub mod matcher;
pub mod processor;
pub mod registry;
pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    common::Vars,
    model::{ExecutionId, FlowId, TriggerId},
    utils,
};

pub use emitter::{EventSink, TriggerEventEmitter};
pub use matcher::TriggerMatcher;
pub use processor::TriggerProcessor;
pub use registry::TriggerRegistry;
pub use scheduler::TriggerScheduler;

/// Metadata key carrying the trigger id of a scheduled event.
pub const TRIGGER_ID_KEY: &str = "trigger_id";
/// Metadata key carrying the execution id of an internal event.
pub const EXECUTION_ID_KEY: &str = "execution_id";
/// Metadata key carrying the step an expiry was armed at.
pub const STEP_KEY: &str = "step";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString, strum::EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerType {
    Keyword,
    Button,
    Webhook,
    ContactEvent,
    Schedule,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerStatus {
    #[default]
    Active,
    Inactive,
    Paused,
    Expired,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerEventType {
    MessageReceived,
    ButtonClicked,
    Webhook,
    ApiCall,
    ContactCreated,
    ContactUpdated,
    TagAdded,
    Scheduled,
    Custom,
    /// A timer or barrier of a waiting execution is due.
    ExecutionResume,
    /// An execution waiting for input ran out of time.
    ExecutionExpire,
}

impl TriggerEventType {
    /// Trigger types that may match an event of this type.
    pub fn trigger_types(&self) -> &'static [TriggerType] {
        match self {
            TriggerEventType::MessageReceived => &[TriggerType::Keyword],
            TriggerEventType::ButtonClicked => &[TriggerType::Button],
            TriggerEventType::Webhook | TriggerEventType::ApiCall => &[TriggerType::Webhook],
            TriggerEventType::ContactCreated | TriggerEventType::ContactUpdated | TriggerEventType::TagAdded | TriggerEventType::Custom => &[TriggerType::ContactEvent],
            TriggerEventType::Scheduled => &[TriggerType::Schedule],
            TriggerEventType::ExecutionResume | TriggerEventType::ExecutionExpire => &[],
        }
    }

    /// Produced by the scheduler for the engine, never matched against triggers.
    pub fn is_internal(&self) -> bool {
        matches!(self, TriggerEventType::ExecutionResume | TriggerEventType::ExecutionExpire)
    }
}

fn default_enabled() -> bool {
    true
}

/// Authoring form of a trigger.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Type specific match conditions.
    #[serde(default)]
    pub conditions: Vars,
    #[serde(default)]
    pub settings: Vars,
    /// Higher wins.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl TriggerConfig {
    pub fn new(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            conditions: Vars::new(),
            settings: Vars::new(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_conditions(
        mut self,
        conditions: Vars,
    ) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_priority(
        mut self,
        priority: i32,
    ) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FlowTrigger {
    pub id: TriggerId,
    pub tenant_id: String,
    pub flow_id: FlowId,
    pub name: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub status: TriggerStatus,
    pub priority: i32,
    pub config: TriggerConfig,
    pub trigger_count: u64,
    pub error_count: u64,
    pub last_triggered: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowTrigger {
    pub fn new(
        tenant_id: &str,
        flow_id: &str,
        name: &str,
        config: TriggerConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: utils::longid(),
            tenant_id: tenant_id.to_string(),
            flow_id: flow_id.to_string(),
            name: name.to_string(),
            trigger_type: config.trigger_type,
            status: TriggerStatus::Active,
            priority: config.priority,
            config,
            trigger_count: 0,
            error_count: 0,
            last_triggered: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Eligible for matching.
    pub fn is_live(&self) -> bool {
        self.status == TriggerStatus::Active && self.config.enabled
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TriggerEvent {
    pub id: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub event_type: TriggerEventType,
    pub contact_id: Option<String>,
    pub conversation_id: Option<String>,
    pub data: Vars,
    pub metadata: Vars,
    pub timestamp: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// set only on resume and expiry events armed by the scheduler
    #[serde(skip)]
    scheduled_internally: bool,
}

impl TriggerEvent {
    pub fn new(
        tenant_id: &str,
        event_type: TriggerEventType,
    ) -> Self {
        Self {
            id: utils::longid(),
            tenant_id: tenant_id.to_string(),
            event_type,
            contact_id: None,
            conversation_id: None,
            data: Vars::new(),
            metadata: Vars::new(),
            timestamp: Utc::now(),
            processed_at: None,
            scheduled_internally: false,
        }
    }

    pub fn with_contact(
        mut self,
        contact_id: &str,
    ) -> Self {
        self.contact_id = Some(contact_id.to_string());
        self
    }

    pub fn with_conversation(
        mut self,
        conversation_id: &str,
    ) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    pub fn with_data(
        mut self,
        data: Vars,
    ) -> Self {
        self.data.extend(data);
        self
    }

    pub fn with_metadata<T: Serialize>(
        mut self,
        key: &str,
        value: T,
    ) -> Self {
        self.metadata.set(key, value);
        self
    }

    /// Inbound text of a message event.
    pub fn text(&self) -> Option<&str> {
        self.data.get_str("text")
    }

    pub(crate) fn execution_resume(
        tenant_id: &str,
        execution_id: &ExecutionId,
    ) -> Self {
        let mut event = Self::new(tenant_id, TriggerEventType::ExecutionResume).with_metadata(EXECUTION_ID_KEY, execution_id);
        event.scheduled_internally = true;
        event
    }

    pub(crate) fn execution_expire(
        tenant_id: &str,
        execution_id: &ExecutionId,
        step: u32,
    ) -> Self {
        let mut event = Self::new(tenant_id, TriggerEventType::ExecutionExpire).with_metadata(EXECUTION_ID_KEY, execution_id).with_metadata(STEP_KEY, step);
        event.scheduled_internally = true;
        event
    }

    /// A resume or expiry that did not come from the scheduler.
    pub(crate) fn is_forged_internal(&self) -> bool {
        self.event_type.is_internal() && !self.scheduled_internally
    }

    pub fn scheduled(
        tenant_id: &str,
        trigger_id: &TriggerId,
    ) -> Self {
        Self::new(tenant_id, TriggerEventType::Scheduled).with_metadata(TRIGGER_ID_KEY, trigger_id)
    }

    /// Key of the processor partition this event is queued on.
    pub fn partition_key(&self) -> &str {
        self.conversation_id.as_deref().or(self.contact_id.as_deref()).unwrap_or(&self.id)
    }
}

/// A trigger that accepted an event.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TriggerMatch {
    pub trigger_id: TriggerId,
    pub flow_id: FlowId,
    pub event_id: String,
    /// Seeded into the execution variables.
    pub variables: Vars,
    /// Seeded into the execution's auxiliary context.
    pub context: Vars,
    pub matched_at: DateTime<Utc>,
    pub priority: i32,
}

impl TriggerMatch {
    pub fn new(
        trigger: &FlowTrigger,
        event: &TriggerEvent,
    ) -> Self {
        Self {
            trigger_id: trigger.id.clone(),
            flow_id: trigger.flow_id.clone(),
            event_id: event.id.clone(),
            variables: Vars::new(),
            context: Vars::new(),
            matched_at: Utc::now(),
            priority: trigger.priority,
        }
    }

    pub fn with_variable<T: Serialize>(
        mut self,
        key: &str,
        value: T,
    ) -> Self {
        self.variables.set(key, value);
        self
    }

    pub fn with_context<T: Serialize>(
        mut self,
        key: &str,
        value: T,
    ) -> Self {
        self.context.set(key, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_routing_tables() {
        assert_eq!(TriggerEventType::MessageReceived.trigger_types(), &[TriggerType::Keyword]);
        assert_eq!(TriggerEventType::TagAdded.trigger_types(), &[TriggerType::ContactEvent]);
        assert!(TriggerEventType::ExecutionResume.trigger_types().is_empty());
        assert!(TriggerEventType::ExecutionExpire.is_internal());
    }

    #[test]
    fn test_partition_key_fallbacks() {
        let event = TriggerEvent::new("t1", TriggerEventType::Custom);
        assert_eq!(event.partition_key(), event.id);
        let event = event.with_contact("c1");
        assert_eq!(event.partition_key(), "c1");
        let event = event.with_conversation("conv1");
        assert_eq!(event.partition_key(), "conv1");
    }

    #[test]
    fn test_trigger_config_from_json() {
        let config: TriggerConfig = serde_json::from_str(r#"{"type": "keyword", "conditions": {"keywords": ["hi"]}, "priority": 5}"#).unwrap();
        assert_eq!(config.trigger_type, TriggerType::Keyword);
        assert!(config.enabled);
        let trigger = FlowTrigger::new("t1", "f1", "greet", config);
        assert_eq!(trigger.priority, 5);
        assert!(trigger.is_live());
    }
}
