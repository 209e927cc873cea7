use std::{any::Any, collections::HashMap, convert::AsRef, sync::Arc};

use parking_lot::RwLock;
use tracing::trace;

use crate::{
    ChatflowError, Result, ShareLock,
    model::FlowDefinition,
    runtime::{ExecutionContext, ExecutionStatus, WaitState},
    trigger::FlowTrigger,
    utils,
};

use super::{DbCollection, DbCollectionIden, Lease, LeaseTable, data::*};

#[derive(Clone)]
pub struct DynDbSetRef<T>(Arc<dyn DbCollection<Item = T>>);

pub struct Store {
    collections: ShareLock<HashMap<super::StoreIden, Arc<dyn Any + Send + Sync + 'static>>>,
    leases: LeaseTable,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            leases: LeaseTable::new(),
        }
    }

    pub fn collection<DATA>(&self) -> Result<Arc<dyn DbCollection<Item = DATA>>>
    where
        DATA: DbCollectionIden + Send + Sync + 'static,
    {
        let collections = self.collections.read();
        collections
            .get(&DATA::iden())
            .and_then(|collection| collection.downcast_ref::<DynDbSetRef<DATA>>())
            .map(|v| v.0.clone())
            .ok_or_else(|| ChatflowError::Store(format!("fail to get collection: {}", DATA::iden().as_ref())))
    }

    pub fn register<DATA>(
        &self,
        collection: Arc<dyn DbCollection<Item = DATA> + Send + Sync + 'static>,
    ) where
        DATA: DbCollectionIden + 'static,
    {
        let mut collections = self.collections.write();
        collections.insert(DATA::iden(), Arc::new(DynDbSetRef::<DATA>(collection)));
    }

    pub fn flows(&self) -> Result<Arc<dyn DbCollection<Item = Flow>>> {
        self.collection()
    }

    pub fn flow_versions(&self) -> Result<Arc<dyn DbCollection<Item = FlowVersion>>> {
        self.collection()
    }

    pub fn executions(&self) -> Result<Arc<dyn DbCollection<Item = ExecutionContext>>> {
        self.collection()
    }

    pub fn steps(&self) -> Result<Arc<dyn DbCollection<Item = ExecutionStep>>> {
        self.collection()
    }

    pub fn triggers(&self) -> Result<Arc<dyn DbCollection<Item = FlowTrigger>>> {
        self.collection()
    }

    pub fn barriers(&self) -> Result<Arc<dyn DbCollection<Item = MergeBarrier>>> {
        self.collection()
    }

    /// Stores `flow` as the latest definition and as an immutable `id@version` copy.
    pub fn save_flow(
        &self,
        flow: &FlowDefinition,
    ) -> Result<bool> {
        trace!("store::save_flow({})", flow.id);
        if flow.id.is_empty() {
            return Err(ChatflowError::Validation("missing id in flow".into()));
        }
        let text = serde_json::to_string(flow)?;
        let now = utils::time::time_millis();

        let versions = self.flow_versions()?;
        let version = FlowVersion {
            id: flow.version_key(),
            flow_id: flow.id.clone(),
            version: flow.version,
            data: text.clone(),
            create_time: now,
        };
        if versions.exists(&version.id)? {
            versions.update(&version)?;
        } else {
            versions.create(&version)?;
        }

        let flows = self.flows()?;
        match flows.find(&flow.id) {
            Ok(m) => {
                let data = Flow {
                    id: flow.id.clone(),
                    tenant_id: flow.tenant_id.clone(),
                    name: flow.name.clone(),
                    version: flow.version,
                    data: text,
                    create_time: m.create_time,
                    update_time: now,
                };
                flows.update(&data)
            }
            Err(_) => {
                let data = Flow {
                    id: flow.id.clone(),
                    tenant_id: flow.tenant_id.clone(),
                    name: flow.name.clone(),
                    version: flow.version,
                    data: text,
                    create_time: now,
                    update_time: 0,
                };
                flows.create(&data)
            }
        }
    }

    /// Loads the latest definition, or a pinned version.
    pub fn get_flow(
        &self,
        flow_id: &str,
        version: Option<u32>,
    ) -> Result<FlowDefinition> {
        let data = match version {
            Some(v) => self.flow_versions()?.find(&format!("{}@{}", flow_id, v))?.data,
            None => self.flows()?.find(flow_id)?.data,
        };
        FlowDefinition::from_json(&data)
    }

    pub fn save_execution(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<bool> {
        self.executions()?.create(ctx)
    }

    /// Writes `ctx` unless the stored record already reached a terminal state.
    pub fn update_execution(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<()> {
        let executions = self.executions()?;
        if executions.update_if(ctx, &|stored: &ExecutionContext| !stored.status.is_terminal())? {
            return Ok(());
        }

        let stored = executions.find(&ctx.execution_id)?;
        match stored.status {
            ExecutionStatus::Cancelled => Err(ChatflowError::Cancelled),
            status => Err(ChatflowError::State(format!("execution {} is already {}", ctx.execution_id, status.as_ref()))),
        }
    }

    pub fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionContext> {
        self.executions()?.find(execution_id)
    }

    pub fn save_execution_step(
        &self,
        step: &ExecutionStep,
    ) -> Result<bool> {
        self.steps()?.create(step)
    }

    /// Audit trail of one execution in step order.
    pub fn execution_steps(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ExecutionStep>> {
        let mut steps = self.steps()?.scan(&|s: &ExecutionStep| s.execution_id == execution_id)?;
        steps.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.step.cmp(&b.step)));
        Ok(steps)
    }

    /// Active root execution of `flow_id` in a conversation.
    pub fn find_active_execution(
        &self,
        flow_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ExecutionContext>> {
        let found = self.executions()?.scan(&|e: &ExecutionContext| {
            e.is_root() && !e.is_terminal() && e.flow_id == flow_id && e.conversation_id.as_deref() == Some(conversation_id)
        })?;
        Ok(found.into_iter().next())
    }

    /// Number of active root executions of `flow_id` for a contact.
    pub fn count_active_for_contact(
        &self,
        flow_id: &str,
        contact_id: &str,
    ) -> Result<usize> {
        let found = self
            .executions()?
            .scan(&|e: &ExecutionContext| e.is_root() && !e.is_terminal() && e.flow_id == flow_id && e.contact_id.as_deref() == Some(contact_id))?;
        Ok(found.len())
    }

    /// Root execution of a conversation waiting for the next inbound message.
    pub fn find_waiting_for_input(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ExecutionContext>> {
        let mut found = self.executions()?.scan(&|e: &ExecutionContext| {
            e.is_root()
                && e.status == ExecutionStatus::Waiting
                && matches!(e.wait, Some(WaitState::Input { .. }))
                && e.tenant_id == tenant_id
                && e.conversation_id.as_deref() == Some(conversation_id)
        })?;
        // the most recently active one owns the conversation
        found.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(found.into_iter().next())
    }

    /// Every execution that is not terminal.
    pub fn suspended_executions(&self) -> Result<Vec<ExecutionContext>> {
        self.executions()?.scan(&|e: &ExecutionContext| !e.is_terminal())
    }

    /// Takes an exclusive lease on `key`.
    pub fn claim(
        &self,
        key: &str,
    ) -> Result<Lease> {
        self.leases.claim(key)
    }

    pub fn is_claimed(
        &self,
        key: &str,
    ) -> bool {
        self.leases.is_held(key)
    }
}
