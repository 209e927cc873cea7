use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    common::Vars,
    runtime::ExecutionStatus,
    store::{DbCollectionIden, StoreIden},
};

/// Count-down latch shared by the branches of one split.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MergeBarrier {
    /// `parent execution id:merge node id`
    pub key: String,
    pub parent_execution_id: String,
    pub merge_node_id: String,
    /// branch id -> child execution id
    pub expected: BTreeMap<String, String>,
    pub arrivals: BTreeMap<String, BranchArrival>,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BranchArrival {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub variables: Vars,
    pub error: Option<String>,
    pub arrived_at: DateTime<Utc>,
}

impl MergeBarrier {
    pub fn is_complete(&self) -> bool {
        self.expected.keys().all(|b| self.arrivals.contains_key(b))
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.deadline
    }

    /// Branch ids that have not arrived yet.
    pub fn missing(&self) -> Vec<String> {
        self.expected.keys().filter(|b| !self.arrivals.contains_key(*b)).cloned().collect()
    }
}

impl DbCollectionIden for MergeBarrier {
    fn iden() -> StoreIden {
        StoreIden::Barriers
    }
}
