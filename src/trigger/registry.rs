//! Trigger bookkeeping: validation, persistence and schedule arming.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    ChatflowError, Result,
    store::Store,
    trigger::{
        FlowTrigger, TriggerConfig, TriggerMatcher, TriggerScheduler, TriggerStatus, TriggerType,
        matcher::{self, ScheduleConditions},
    },
};

pub struct TriggerRegistry {
    store: Arc<Store>,
    matchers: RwLock<HashMap<TriggerType, Arc<dyn TriggerMatcher>>>,
    scheduler: Arc<TriggerScheduler>,
    /// serializes read-modify-write of stored triggers
    writes: Mutex<()>,
}

impl TriggerRegistry {
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<TriggerScheduler>,
    ) -> Arc<Self> {
        let registry = Self {
            store,
            matchers: RwLock::new(HashMap::new()),
            scheduler,
            writes: Mutex::new(()),
        };
        for m in matcher::builtins() {
            registry.register_matcher(m);
        }
        Arc::new(registry)
    }

    /// Installs `matcher` for every type it supports, replacing earlier ones.
    pub fn register_matcher(
        &self,
        matcher: Arc<dyn TriggerMatcher>,
    ) {
        let mut matchers = self.matchers.write();
        for t in matcher.supported_types() {
            matchers.insert(t, matcher.clone());
        }
    }

    pub fn matcher(
        &self,
        trigger_type: TriggerType,
    ) -> Result<Arc<dyn TriggerMatcher>> {
        self.matchers.read().get(&trigger_type).cloned().ok_or_else(|| ChatflowError::Trigger(format!("no matcher for trigger type '{}'", trigger_type.as_ref())))
    }

    /// Validates and stores a new trigger, arming it when it is a schedule.
    pub fn register(
        &self,
        tenant_id: &str,
        flow_id: &str,
        name: &str,
        config: TriggerConfig,
    ) -> Result<FlowTrigger> {
        self.matcher(config.trigger_type)?.validate(&config)?;
        let trigger = FlowTrigger::new(tenant_id, flow_id, name, config);
        self.store.triggers()?.create(&trigger)?;
        info!(trigger_id = %trigger.id, flow_id, "register {} trigger '{}'", trigger.trigger_type.as_ref(), name);
        self.arm(&trigger)?;
        Ok(trigger)
    }

    /// Replaces the configuration of an existing trigger.
    pub fn update(
        &self,
        trigger_id: &str,
        config: TriggerConfig,
    ) -> Result<FlowTrigger> {
        self.matcher(config.trigger_type)?.validate(&config)?;
        let _writes = self.writes.lock();
        let trigger = self.modify(trigger_id, |trigger| {
            trigger.trigger_type = config.trigger_type;
            trigger.priority = config.priority;
            trigger.config = config;
        })?;
        self.arm(&trigger)?;
        Ok(trigger)
    }

    pub fn set_status(
        &self,
        trigger_id: &str,
        status: TriggerStatus,
    ) -> Result<FlowTrigger> {
        let _writes = self.writes.lock();
        let trigger = self.modify(trigger_id, |trigger| trigger.status = status)?;
        self.arm(&trigger)?;
        Ok(trigger)
    }

    pub fn delete(
        &self,
        trigger_id: &str,
    ) -> Result<bool> {
        let _writes = self.writes.lock();
        self.scheduler.cancel_scheduled_trigger(trigger_id);
        self.store.triggers()?.delete(trigger_id)
    }

    pub fn get(
        &self,
        trigger_id: &str,
    ) -> Result<FlowTrigger> {
        self.store.triggers()?.find(trigger_id)
    }

    /// Triggers of a tenant, optionally restricted to one flow.
    pub fn list(
        &self,
        tenant_id: &str,
        flow_id: Option<&str>,
    ) -> Result<Vec<FlowTrigger>> {
        let mut triggers = self.store.triggers()?.scan(&|t: &FlowTrigger| t.tenant_id == tenant_id && flow_id.is_none_or(|f| t.flow_id == f))?;
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(triggers)
    }

    /// Live triggers of a tenant whose type is one of `types`.
    pub fn candidates(
        &self,
        tenant_id: &str,
        types: &[TriggerType],
    ) -> Result<Vec<FlowTrigger>> {
        if types.is_empty() {
            return Ok(Vec::new());
        }
        self.store.triggers()?.scan(&|t: &FlowTrigger| t.tenant_id == tenant_id && t.is_live() && types.contains(&t.trigger_type))
    }

    /// Counts one firing, whatever its outcome.
    pub fn record_fire(
        &self,
        trigger_id: &str,
    ) -> Result<()> {
        let _writes = self.writes.lock();
        self.modify(trigger_id, |trigger| {
            trigger.trigger_count += 1;
            trigger.last_triggered = Some(Utc::now());
        })?;
        Ok(())
    }

    pub fn record_failure(
        &self,
        trigger_id: &str,
        error: &str,
    ) -> Result<()> {
        let _writes = self.writes.lock();
        self.modify(trigger_id, |trigger| {
            trigger.error_count += 1;
            trigger.last_error = Some(error.to_string());
        })?;
        Ok(())
    }

    /// Re-arms a schedule after it fired, or expires a one-shot.
    pub fn after_fire(
        &self,
        trigger_id: &str,
    ) -> Result<()> {
        let _writes = self.writes.lock();
        let trigger = self.get(trigger_id)?;
        if trigger.trigger_type != TriggerType::Schedule {
            return Ok(());
        }
        let conditions = ScheduleConditions::from_config(&trigger.config)?;
        if conditions.is_recurring() {
            return self.arm(&trigger);
        }
        debug!(trigger_id, "one-shot schedule fired, expiring");
        self.modify(trigger_id, |trigger| trigger.status = TriggerStatus::Expired)?;
        self.scheduler.cancel_scheduled_trigger(trigger_id);
        Ok(())
    }

    /// Arms every live schedule trigger; used after a restart.
    pub fn arm_schedules(&self) -> Result<usize> {
        let schedules = self.store.triggers()?.scan(&|t: &FlowTrigger| t.trigger_type == TriggerType::Schedule && t.is_live())?;
        let mut armed = 0;
        for trigger in schedules.iter() {
            match self.arm(trigger) {
                Ok(()) => armed += 1,
                Err(err) => warn!(trigger_id = %trigger.id, "fail to arm schedule: {}", err),
            }
        }
        Ok(armed)
    }

    /// Applies `change` to the stored trigger. Callers hold `writes`.
    fn modify(
        &self,
        trigger_id: &str,
        change: impl FnOnce(&mut FlowTrigger),
    ) -> Result<FlowTrigger> {
        let mut trigger = self.get(trigger_id)?;
        change(&mut trigger);
        trigger.updated_at = Utc::now();
        self.store.triggers()?.update(&trigger)?;
        Ok(trigger)
    }

    fn arm(
        &self,
        trigger: &FlowTrigger,
    ) -> Result<()> {
        if trigger.trigger_type != TriggerType::Schedule {
            return Ok(());
        }
        if !trigger.is_live() {
            self.scheduler.cancel_scheduled_trigger(&trigger.id);
            return Ok(());
        }
        match ScheduleConditions::from_config(&trigger.config)?.next_fire(Utc::now())? {
            Some(at) => self.scheduler.schedule_trigger(trigger, at),
            None => self.scheduler.cancel_scheduled_trigger(&trigger.id),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        common::Vars,
        config::SchedulerConfig,
        store::{DbStore, MemStore},
        trigger::TriggerEventEmitter,
    };

    fn registry() -> (Arc<TriggerRegistry>, Arc<TriggerScheduler>) {
        let store = Arc::new(Store::new());
        MemStore::new().init(&store);
        let scheduler = TriggerScheduler::new(TriggerEventEmitter::new(), &SchedulerConfig::default());
        (TriggerRegistry::new(store, scheduler.clone()), scheduler)
    }

    #[test]
    fn test_register_rejects_bad_conditions() {
        let (registry, _) = registry();
        let err = registry.register("t1", "f1", "greet", TriggerConfig::new(TriggerType::Keyword)).unwrap_err();
        assert!(matches!(err, ChatflowError::Trigger(_)));
        assert!(registry.list("t1", None).unwrap().is_empty());
    }

    #[test]
    fn test_candidates_only_live() {
        let (registry, _) = registry();
        let config = TriggerConfig::new(TriggerType::Keyword).with_conditions(Vars::from(json!({"keywords": ["hi"]})));
        let a = registry.register("t1", "f1", "a", config.clone()).unwrap();
        registry.register("t1", "f2", "b", config.clone()).unwrap();
        registry.register("t2", "f3", "c", config).unwrap();
        registry.set_status(&a.id, TriggerStatus::Paused).unwrap();

        let found = registry.candidates("t1", &[TriggerType::Keyword]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].flow_id, "f2");
        assert!(registry.candidates("t1", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_schedule_arming() {
        let (registry, scheduler) = registry();
        let config = TriggerConfig::new(TriggerType::Schedule).with_conditions(Vars::from(json!({"interval_secs": 3600})));
        let trigger = registry.register("t1", "f1", "hourly", config).unwrap();
        assert!(scheduler.next_trigger_run(&trigger.id).is_some());

        registry.set_status(&trigger.id, TriggerStatus::Inactive).unwrap();
        assert!(scheduler.next_trigger_run(&trigger.id).is_none());

        let once = TriggerConfig::new(TriggerType::Schedule).with_conditions(Vars::from(json!({"at": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339()})));
        let once = registry.register("t1", "f1", "once", once).unwrap();
        registry.after_fire(&once.id).unwrap();
        assert_eq!(registry.get(&once.id).unwrap().status, TriggerStatus::Expired);
        assert!(scheduler.next_trigger_run(&once.id).is_none());

        registry.delete(&trigger.id).unwrap();
        assert!(registry.get(&trigger.id).is_err());
    }

    #[test]
    fn test_counters() {
        let (registry, _) = registry();
        let config = TriggerConfig::new(TriggerType::Button).with_conditions(Vars::from(json!({"button_ids": ["buy"]})));
        let trigger = registry.register("t1", "f1", "buy", config).unwrap();
        registry.record_fire(&trigger.id).unwrap();
        registry.record_failure(&trigger.id, "boom").unwrap();
        let stored = registry.get(&trigger.id).unwrap();
        assert_eq!((stored.trigger_count, stored.error_count), (1, 1));
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(stored.last_triggered.is_some());
    }

    #[test]
    fn test_concurrent_counters_and_status() {
        let (registry, _) = registry();
        let config = TriggerConfig::new(TriggerType::Button).with_conditions(Vars::from(json!({"button_ids": ["buy"]})));
        let trigger = registry.register("t1", "f1", "buy", config).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                let id = trigger.id.clone();
                std::thread::spawn(move || {
                    for n in 0..500 {
                        registry.record_fire(&id).unwrap();
                        if i == 0 && n == 250 {
                            registry.set_status(&id, TriggerStatus::Paused).unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stored = registry.get(&trigger.id).unwrap();
        assert_eq!(stored.trigger_count, 4000);
        assert_eq!(stored.status, TriggerStatus::Paused);
    }
}
