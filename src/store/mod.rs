//! Storage layer for flow definitions, executions, steps, triggers and barriers.
//!
//! Backends implement [`DbStore`] and register one [`DbCollection`] per record
//! type with the [`Store`]. The crate ships the in-memory [`MemStore`]; durable
//! backends plug in through the same traits.

pub mod data;
mod db;
mod lease;
mod store;

use strum::{AsRefStr, EnumIter};

use crate::Result;

pub use db::MemStore;
pub use lease::{Lease, LeaseTable};
pub use store::Store;

/// Identifiers for the storage collections.
#[derive(Debug, Clone, AsRefStr, PartialEq, Hash, Eq, EnumIter)]
pub enum StoreIden {
    /// Latest flow definitions.
    #[strum(serialize = "flows")]
    Flows,
    /// Immutable `id@version` flow definitions.
    #[strum(serialize = "flow_versions")]
    FlowVersions,
    /// Execution contexts.
    #[strum(serialize = "executions")]
    Executions,
    /// Per-step audit rows.
    #[strum(serialize = "steps")]
    Steps,
    /// Flow triggers.
    #[strum(serialize = "triggers")]
    Triggers,
    /// Split/merge barriers.
    #[strum(serialize = "barriers")]
    Barriers,
}

/// Trait for types that can identify their storage collection.
pub trait DbCollectionIden {
    /// Returns the collection identifier for this type.
    fn iden() -> StoreIden;
}

/// Predicate over stored records.
pub type Filter<'a, T> = &'a (dyn Fn(&T) -> bool + Send + Sync);

/// Trait for database collection operations.
pub trait DbCollection: Send + Sync {
    /// The type of items stored in this collection.
    type Item;

    /// Checks if a record with the given ID exists.
    fn exists(
        &self,
        id: &str,
    ) -> Result<bool>;

    /// Finds a record by ID.
    fn find(
        &self,
        id: &str,
    ) -> Result<Self::Item>;

    /// Returns every record accepted by `filter`.
    fn scan(
        &self,
        filter: Filter<'_, Self::Item>,
    ) -> Result<Vec<Self::Item>>;

    /// Creates a new record.
    fn create(
        &self,
        data: &Self::Item,
    ) -> Result<bool>;

    /// Updates an existing record.
    fn update(
        &self,
        data: &Self::Item,
    ) -> Result<bool>;

    /// Updates an existing record only when `guard` accepts the stored version.
    ///
    /// The check and the write are atomic. Returns `Ok(false)` when the guard
    /// rejects the stored record.
    fn update_if(
        &self,
        data: &Self::Item,
        guard: Filter<'_, Self::Item>,
    ) -> Result<bool>;

    /// Deletes a record by ID.
    fn delete(
        &self,
        id: &str,
    ) -> Result<bool>;
}

/// Trait for database store initialization.
pub trait DbStore {
    /// Initializes the database and registers collections with the store.
    fn init(
        &self,
        s: &Store,
    );
}
