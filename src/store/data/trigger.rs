use crate::{
    store::{DbCollectionIden, StoreIden},
    trigger::FlowTrigger,
};

impl DbCollectionIden for FlowTrigger {
    fn iden() -> StoreIden {
        StoreIden::Triggers
    }
}
