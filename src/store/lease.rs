use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;

use crate::{ChatflowError, Result};

/// Set of exclusively held keys.
///
/// A key is either an execution id (one writer per execution) or a
/// `flow:conversation` pair (one admission at a time per conversation).
#[derive(Debug, Default, Clone)]
pub struct LeaseTable {
    held: Arc<Mutex<HashSet<String>>>,
}

/// Exclusive hold on a key, released on drop.
#[derive(Debug)]
pub struct Lease {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lease or fails with [`ChatflowError::Conflict`] when another holder has it.
    pub fn claim(
        &self,
        key: &str,
    ) -> Result<Lease> {
        let mut held = self.held.lock();
        if !held.insert(key.to_string()) {
            return Err(ChatflowError::Conflict(format!("'{}' is held by another worker", key)));
        }
        Ok(Lease {
            key: key.to_string(),
            held: self.held.clone(),
        })
    }

    pub fn is_held(
        &self,
        key: &str,
    ) -> bool {
        self.held.lock().contains(key)
    }
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}
