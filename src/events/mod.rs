//! Event types for flow execution.
//!
//! Events are emitted during execution to notify subscribers (dashboards,
//! tests, the composition root) about state changes, completions and errors.
//! Delivery is best effort.

mod execution;
mod node;

pub use execution::*;
pub use node::*;

use crate::model::{ExecutionId, FlowId, NodeId};

/// Generic event wrapper.
#[derive(Debug, Clone)]
pub struct Event<T> {
    inner: T,
}

/// Top-level event type for flow graph events.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// Execution-level events (started, waiting, completed, etc.).
    Execution(ExecutionEvent),
    /// Node-level events (running, succeeded, failed, etc.).
    Node(NodeEvent),
}

/// Event message containing flow, execution and node context.
#[derive(Debug, Clone)]
pub struct Message {
    pub flow_id: FlowId,
    pub execution_id: ExecutionId,
    /// Empty for execution-level events emitted outside a node.
    pub node_id: NodeId,
    pub event: GraphEvent,
}

impl<T> std::ops::Deref for Event<T>
where
    T: std::fmt::Debug + Clone,
{
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> Event<T>
where
    T: std::fmt::Debug + Clone,
{
    pub fn new(inner: &T) -> Self {
        Self {
            inner: inner.clone(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl GraphEvent {
    pub fn is_complete(&self) -> bool {
        matches!(self, GraphEvent::Execution(ExecutionEvent::Completed(_)))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, GraphEvent::Execution(ExecutionEvent::Failed(_)))
    }

    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphEvent::Execution(ExecutionEvent::Completed(_) | ExecutionEvent::Failed(_) | ExecutionEvent::Cancelled(_))
        )
    }
}
