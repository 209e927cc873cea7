use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::trace;

use crate::{
    ChatflowError, Result,
    store::{DbCollection, Filter},
};

use super::DbDocument;

/// One in-memory collection keyed by document id.
#[derive(Debug)]
pub struct Collect<T> {
    name: String,
    items: RwLock<HashMap<String, T>>,
}

impl<T> Collect<T>
where
    T: DbDocument,
{
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: RwLock::new(HashMap::new()),
        }
    }

    fn not_found(
        &self,
        id: &str,
    ) -> ChatflowError {
        ChatflowError::NotFound(format!("{} '{}'", self.name, id))
    }
}

impl<T> DbCollection for Collect<T>
where
    T: DbDocument,
{
    type Item = T;

    fn exists(
        &self,
        id: &str,
    ) -> Result<bool> {
        Ok(self.items.read().contains_key(id))
    }

    fn find(
        &self,
        id: &str,
    ) -> Result<Self::Item> {
        self.items.read().get(id).cloned().ok_or_else(|| self.not_found(id))
    }

    fn scan(
        &self,
        filter: Filter<'_, Self::Item>,
    ) -> Result<Vec<Self::Item>> {
        Ok(self.items.read().values().filter(|item| filter(item)).cloned().collect())
    }

    fn create(
        &self,
        data: &Self::Item,
    ) -> Result<bool> {
        trace!("{}::create({})", self.name, data.id());
        let mut items = self.items.write();
        if items.contains_key(data.id()) {
            return Err(ChatflowError::Store(format!("{} '{}' already exists", self.name, data.id())));
        }
        items.insert(data.id().to_string(), data.clone());
        Ok(true)
    }

    fn update(
        &self,
        data: &Self::Item,
    ) -> Result<bool> {
        trace!("{}::update({})", self.name, data.id());
        let mut items = self.items.write();
        match items.get_mut(data.id()) {
            Some(item) => {
                *item = data.clone();
                Ok(true)
            }
            None => Err(self.not_found(data.id())),
        }
    }

    fn update_if(
        &self,
        data: &Self::Item,
        guard: Filter<'_, Self::Item>,
    ) -> Result<bool> {
        trace!("{}::update_if({})", self.name, data.id());
        let mut items = self.items.write();
        match items.get_mut(data.id()) {
            Some(item) if guard(item) => {
                *item = data.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(self.not_found(data.id())),
        }
    }

    fn delete(
        &self,
        id: &str,
    ) -> Result<bool> {
        trace!("{}::delete({})", self.name, id);
        Ok(self.items.write().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        runtime::{ExecutionContext, ExecutionStatus},
        store::DbCollection,
    };

    use super::Collect;

    fn execution(
        id: &str,
        status: ExecutionStatus,
    ) -> ExecutionContext {
        let mut ctx = ExecutionContext::new("t1");
        ctx.execution_id = id.to_string();
        ctx.status = status;
        ctx
    }

    #[test]
    fn test_collect_crud() {
        let collect = Collect::<ExecutionContext>::new("executions");
        assert!(collect.create(&execution("e1", ExecutionStatus::Running)).unwrap());
        assert!(collect.create(&execution("e1", ExecutionStatus::Running)).is_err());
        assert!(collect.exists("e1").unwrap());

        collect.update(&execution("e1", ExecutionStatus::Waiting)).unwrap();
        assert_eq!(collect.find("e1").unwrap().status, ExecutionStatus::Waiting);
        assert!(collect.update(&execution("e2", ExecutionStatus::Waiting)).is_err());

        let waiting = collect.scan(&|e: &ExecutionContext| e.status == ExecutionStatus::Waiting).unwrap();
        assert_eq!(waiting.len(), 1);

        assert!(collect.delete("e1").unwrap());
        assert!(!collect.delete("e1").unwrap());
        assert!(collect.find("e1").is_err());
    }

    #[test]
    fn test_collect_update_if() {
        let collect = Collect::<ExecutionContext>::new("executions");
        collect.create(&execution("e1", ExecutionStatus::Cancelled)).unwrap();

        let not_terminal = |e: &ExecutionContext| !e.status.is_terminal();
        assert!(!collect.update_if(&execution("e1", ExecutionStatus::Running), &not_terminal).unwrap());
        assert_eq!(collect.find("e1").unwrap().status, ExecutionStatus::Cancelled);
    }
}
