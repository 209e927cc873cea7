use crate::runtime::{ExecutionInfo, WaitState};

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Started,
    Resumed,
    Waiting(WaitState),
    Paused,
    Completed(ExecutionInfo),
    Failed(ExecutionInfo),
    Cancelled(ExecutionInfo),
}

impl ExecutionEvent {
    pub fn str(&self) -> &str {
        match self {
            ExecutionEvent::Started => "Started",
            ExecutionEvent::Resumed => "Resumed",
            ExecutionEvent::Waiting(_) => "Waiting",
            ExecutionEvent::Paused => "Paused",
            ExecutionEvent::Completed(_) => "Completed",
            ExecutionEvent::Failed(_) => "Failed",
            ExecutionEvent::Cancelled(_) => "Cancelled",
        }
    }

    /// Projection carried by terminal events.
    pub fn info(&self) -> Option<&ExecutionInfo> {
        match self {
            ExecutionEvent::Completed(info) | ExecutionEvent::Failed(info) | ExecutionEvent::Cancelled(info) => Some(info),
            _ => None,
        }
    }
}
