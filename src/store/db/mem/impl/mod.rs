use crate::{
    runtime::ExecutionContext,
    store::{data::*, db::mem::DbDocument},
    trigger::FlowTrigger,
};

impl DbDocument for Flow {
    fn id(&self) -> &str {
        &self.id
    }
}

impl DbDocument for FlowVersion {
    fn id(&self) -> &str {
        &self.id
    }
}

impl DbDocument for ExecutionContext {
    fn id(&self) -> &str {
        &self.execution_id
    }
}

impl DbDocument for ExecutionStep {
    fn id(&self) -> &str {
        &self.id
    }
}

impl DbDocument for FlowTrigger {
    fn id(&self) -> &str {
        &self.id
    }
}

impl DbDocument for MergeBarrier {
    fn id(&self) -> &str {
        &self.key
    }
}
