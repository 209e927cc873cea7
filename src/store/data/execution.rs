use crate::{
    runtime::ExecutionContext,
    store::{DbCollectionIden, StoreIden},
};

impl DbCollectionIden for ExecutionContext {
    fn iden() -> StoreIden {
        StoreIden::Executions
    }
}
