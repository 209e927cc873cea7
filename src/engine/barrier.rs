use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    Result,
    model::{ExecutionId, NodeId},
    runtime::ExecutionContext,
    store::{
        Store,
        data::{BranchArrival, MergeBarrier},
    },
};

/// Serializes read-modify-write access to merge barriers.
#[derive(Debug, Default)]
pub struct BarrierBook {
    lock: Mutex<()>,
}

impl BarrierBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the barrier of a split, replacing a stale one under the same key.
    pub fn open(
        &self,
        store: &Store,
        key: &str,
        parent: &ExecutionContext,
        merge_node_id: &NodeId,
        expected: BTreeMap<String, ExecutionId>,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.lock.lock();
        let barriers = store.barriers()?;
        if barriers.exists(key)? {
            warn!(execution_id = %parent.execution_id, "replacing stale barrier {}", key);
            barriers.delete(key)?;
        }
        barriers.create(&MergeBarrier {
            key: key.to_string(),
            parent_execution_id: parent.execution_id.clone(),
            merge_node_id: merge_node_id.clone(),
            expected,
            arrivals: BTreeMap::new(),
            deadline,
            created_at: Utc::now(),
        })?;
        Ok(())
    }

    /// Records a finished branch. Returns the parent id once every branch arrived.
    pub fn arrive(
        &self,
        store: &Store,
        child: &ExecutionContext,
    ) -> Result<Option<ExecutionId>> {
        let Some(branch) = &child.branch else {
            return Ok(None);
        };

        let _guard = self.lock.lock();
        let barriers = store.barriers()?;
        if !barriers.exists(&branch.barrier_key)? {
            debug!(execution_id = %child.execution_id, "barrier {} already closed", branch.barrier_key);
            return Ok(None);
        }

        let mut barrier = barriers.find(&branch.barrier_key)?;
        if barrier.arrivals.contains_key(&branch.branch_id) {
            return Ok(None);
        }
        barrier.arrivals.insert(
            branch.branch_id.clone(),
            BranchArrival {
                execution_id: child.execution_id.clone(),
                status: child.status,
                variables: child.variables.clone(),
                error: child.error.clone(),
                arrived_at: Utc::now(),
            },
        );
        barriers.update(&barrier)?;

        debug!(
            execution_id = %child.execution_id,
            parent = %barrier.parent_execution_id,
            "branch {} arrived, {} missing",
            branch.branch_id,
            barrier.missing().len()
        );
        Ok(barrier.is_complete().then(|| barrier.parent_execution_id.clone()))
    }

    /// True when the barrier is gone, complete, or past its deadline.
    pub fn is_ready(
        &self,
        store: &Store,
        key: &str,
    ) -> Result<bool> {
        let barriers = store.barriers()?;
        if !barriers.exists(key)? {
            return Ok(true);
        }
        let barrier = barriers.find(key)?;
        Ok(barrier.is_complete() || barrier.is_expired())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        nodes::merge::barrier_key,
        runtime::{BranchRef, ExecutionStatus},
        store::{DbStore, MemStore},
    };

    fn child(
        id: &str,
        branch: &str,
    ) -> ExecutionContext {
        let mut ctx = ExecutionContext::new("t1");
        ctx.execution_id = id.to_string();
        ctx.status = ExecutionStatus::Completed;
        ctx.branch = Some(BranchRef {
            parent_execution_id: "p1".to_string(),
            branch_id: branch.to_string(),
            barrier_key: barrier_key("p1", "join"),
        });
        ctx
    }

    #[test]
    fn test_count_down() {
        let store = Store::new();
        MemStore::new().init(&store);
        let book = BarrierBook::new();

        let mut parent = ExecutionContext::new("t1");
        parent.execution_id = "p1".to_string();
        let expected = BTreeMap::from([("a".to_string(), "c1".to_string()), ("b".to_string(), "c2".to_string())]);
        let key = barrier_key("p1", "join");
        book.open(&store, &key, &parent, &"join".to_string(), expected, Utc::now() + Duration::minutes(1)).unwrap();

        assert!(!book.is_ready(&store, &key).unwrap());
        assert_eq!(book.arrive(&store, &child("c1", "a")).unwrap(), None);
        // duplicate arrivals do not count twice
        assert_eq!(book.arrive(&store, &child("c1", "a")).unwrap(), None);
        assert_eq!(book.arrive(&store, &child("c2", "b")).unwrap().as_deref(), Some("p1"));
        assert!(book.is_ready(&store, &key).unwrap());
    }
}
