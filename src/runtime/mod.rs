//! Execution runtime state and the execution event channel.

mod channel;
mod context;
mod signal;
mod state;

pub use channel::{Channel, ChannelEvent, ChannelOptions};
pub use context::ExecutionContext;
pub use signal::ExecutionSignal;
pub use state::{BranchRef, ExecutionInfo, ExecutionResult, ExecutionStatus, WaitState};
