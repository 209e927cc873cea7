use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::Shutdown;

/// Control flags observed by the step loop of one in-flight execution.
#[derive(Debug, Default)]
pub struct ExecutionSignal {
    cancel: Shutdown,
    pause: AtomicBool,
}

impl ExecutionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.shutdown();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_terminated()
    }

    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        self.cancel.wait()
    }

    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending pause request.
    pub fn take_pause(&self) -> bool {
        self.pause.swap(false, Ordering::SeqCst)
    }
}
