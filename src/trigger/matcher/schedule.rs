use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    ChatflowError, Result,
    trigger::{FlowTrigger, TRIGGER_ID_KEY, TriggerConfig, TriggerEvent, TriggerEventType, TriggerMatch, TriggerType, matcher::parse_conditions},
    utils::time::try_secs,
};

/// When a schedule trigger fires. Exactly one of the fields is set.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ScheduleConditions {
    /// Cron expression; a five-field expression gets a leading seconds field.
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// One-shot fire time.
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

impl ScheduleConditions {
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "cron": { "type": "string", "minLength": 1 },
                "interval_secs": { "type": "integer", "minimum": 1 },
                "at": { "type": "string" }
            }
        })
    }

    pub fn from_config(config: &TriggerConfig) -> Result<Self> {
        let conditions: Self = parse_conditions(config, &Self::schema())?;
        let set = [conditions.cron.is_some(), conditions.interval_secs.is_some(), conditions.at.is_some()].iter().filter(|s| **s).count();
        if set != 1 {
            return Err(ChatflowError::Trigger("schedule trigger needs exactly one of cron, interval_secs or at".to_string()));
        }
        if let Some(expr) = &conditions.cron {
            cron_schedule(expr)?;
        }
        if let Some(secs) = conditions.interval_secs {
            conditions.next_fire(Utc::now()).map_err(|_| ChatflowError::Trigger(format!("interval of {}s is out of range", secs)))?;
        }
        Ok(conditions)
    }

    pub fn is_recurring(&self) -> bool {
        self.at.is_none()
    }

    /// The first fire time strictly after `after`; `None` once a one-shot has passed.
    pub fn next_fire(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        if let Some(expr) = &self.cron {
            return Ok(cron_schedule(expr)?.after(&after).next());
        }
        if let Some(secs) = self.interval_secs {
            let next = try_secs(secs).and_then(|delta| after.checked_add_signed(delta));
            return next.map(Some).ok_or_else(|| ChatflowError::Trigger(format!("interval of {}s overflows after {}", secs, after)));
        }
        Ok(self.at.filter(|at| *at > after))
    }
}

fn cron_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|err| ChatflowError::Trigger(format!("invalid cron expression '{}': {}", expr, err)))
}

/// Accepts the scheduler's fire events for the trigger they were armed for.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScheduleMatcher;

impl super::TriggerMatcher for ScheduleMatcher {
    fn supported_types(&self) -> Vec<TriggerType> {
        vec![TriggerType::Schedule]
    }

    fn validate(
        &self,
        config: &TriggerConfig,
    ) -> Result<()> {
        ScheduleConditions::from_config(config).map(|_| ())
    }

    fn match_event(
        &self,
        event: &TriggerEvent,
        trigger: &FlowTrigger,
    ) -> Result<Option<TriggerMatch>> {
        if event.event_type != TriggerEventType::Scheduled || event.metadata.get_str(TRIGGER_ID_KEY) != Some(trigger.id.as_str()) {
            return Ok(None);
        }
        Ok(Some(TriggerMatch::new(trigger, event).with_variable("scheduled_at", event.timestamp)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Timelike};

    use super::*;
    use crate::{common::Vars, trigger::TriggerMatcher};

    fn config(conditions: Value) -> TriggerConfig {
        TriggerConfig::new(TriggerType::Schedule).with_conditions(Vars::from(conditions))
    }

    #[test]
    fn test_next_fire() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();

        let daily = ScheduleConditions::from_config(&config(json!({"cron": "0 9 * * *"}))).unwrap();
        let next = daily.next_fire(now).unwrap().unwrap();
        assert_eq!((next.hour(), next.minute()), (9, 0));
        assert!(daily.is_recurring());

        let every = ScheduleConditions::from_config(&config(json!({"interval_secs": 60}))).unwrap();
        assert_eq!(every.next_fire(now).unwrap(), Some(now + Duration::seconds(60)));

        let once = ScheduleConditions::from_config(&config(json!({"at": "2024-05-01T09:00:00Z"}))).unwrap();
        assert!(!once.is_recurring());
        assert!(once.next_fire(now).unwrap().is_some());
        assert_eq!(once.next_fire(now + Duration::hours(1)).unwrap(), None);
    }

    #[test]
    fn test_validate_exactly_one() {
        assert!(ScheduleMatcher.validate(&config(json!({}))).is_err());
        assert!(ScheduleMatcher.validate(&config(json!({"cron": "0 9 * * *", "interval_secs": 5}))).is_err());
        assert!(ScheduleMatcher.validate(&config(json!({"cron": "not a cron"}))).is_err());
    }

    #[test]
    fn test_interval_out_of_range() {
        let err = ScheduleConditions::from_config(&config(json!({"interval_secs": 10_000_000_000_000_000u64}))).unwrap_err();
        assert!(matches!(err, ChatflowError::Trigger(_)));
        assert!(ScheduleMatcher.validate(&config(json!({"interval_secs": u64::MAX}))).is_err());

        let near_end = ScheduleConditions {
            interval_secs: Some(60),
            ..Default::default()
        };
        assert!(near_end.next_fire(DateTime::<Utc>::MAX_UTC).is_err());
    }

    #[test]
    fn test_match_only_own_fire_events() {
        let trigger = FlowTrigger::new("t1", "f1", "nightly", config(json!({"interval_secs": 60})));
        let own = TriggerEvent::scheduled("t1", &trigger.id);
        let other = TriggerEvent::scheduled("t1", &"someone-else".to_string());
        assert!(ScheduleMatcher.match_event(&own, &trigger).unwrap().is_some());
        assert!(ScheduleMatcher.match_event(&other, &trigger).unwrap().is_none());
    }
}
