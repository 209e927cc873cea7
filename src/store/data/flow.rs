use serde::{Deserialize, Serialize};

use crate::store::{DbCollectionIden, StoreIden};

/// Latest deployed definition of a flow.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Flow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub version: u32,
    /// serialized `FlowDefinition`
    pub data: String,
    pub create_time: i64,
    pub update_time: i64,
}

/// Immutable copy of one flow version, keyed `id@version`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowVersion {
    pub id: String,
    pub flow_id: String,
    pub version: u32,
    pub data: String,
    pub create_time: i64,
}

impl DbCollectionIden for Flow {
    fn iden() -> StoreIden {
        StoreIden::Flows
    }
}

impl DbCollectionIden for FlowVersion {
    fn iden() -> StoreIden {
        StoreIden::FlowVersions
    }
}
