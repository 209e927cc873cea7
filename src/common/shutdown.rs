//! One-shot termination signal shared between tasks.

use std::future::Future;

use tokio::sync::watch;

/// A latch that flips once from running to terminated.
///
/// Used for component shutdown and for per-execution cancellation. Waiters
/// created after the latch flipped resolve immediately.
#[derive(Debug)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender,
        }
    }

    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_terminated(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.sender.subscribe();
        async move {
            let _ = receiver.wait_for(|terminated| *terminated).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_resolves_after_shutdown() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.wait();
        assert!(!shutdown.is_terminated());
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap();
        assert!(shutdown.is_terminated());

        // late waiters resolve immediately
        tokio::time::timeout(Duration::from_millis(50), shutdown.wait()).await.unwrap();
    }
}
