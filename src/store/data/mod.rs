mod barrier;
mod execution;
mod flow;
mod step;
mod trigger;

pub use barrier::{BranchArrival, MergeBarrier};
pub use flow::{Flow, FlowVersion};
pub use step::{ExecutionStep, StepStatus};
