#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// Start timestamp in milliseconds.
    Running(i64),
    /// Completed step number.
    Succeeded(u32),
    Failed(String),
    /// Attempt about to be retried.
    Retry(u32),
    Paused,
}

impl NodeEvent {
    pub fn str(&self) -> &str {
        match self {
            NodeEvent::Running(_) => "Running",
            NodeEvent::Succeeded(_) => "Succeeded",
            NodeEvent::Failed(_) => "Failed",
            NodeEvent::Retry(_) => "Retry",
            NodeEvent::Paused => "Paused",
        }
    }
}
