use std::sync::Arc;

use tokio::{runtime::Handle, sync::broadcast::error::RecvError};
use tracing::{trace, warn};

use crate::{
    common::Shutdown,
    events::GraphEvent,
    runtime::Channel,
    services::Services,
    store::data::ExecutionStep,
};

/// Forwards execution activity to the analytics sink.
///
/// Every call is fire-and-forget; sink failures are logged and never reach
/// the execution that produced them.
pub struct Monitor {
    services: Arc<Services>,
    channel: Arc<Channel>,

    runtime: Handle,
    shutdown: Arc<Shutdown>,
}

impl Monitor {
    pub fn new(
        services: Arc<Services>,
        channel: Arc<Channel>,
        runtime: Handle,
    ) -> Self {
        Self {
            services,
            channel,
            runtime,
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    pub fn monitor(&self) {
        let services = self.services.clone();
        let shutdown = self.shutdown.clone();
        let mut event_queue = self.channel.event_queue().subscribe();

        self.runtime.spawn(async move {
            loop {
                let event_msg = tokio::select! {
                    _ = shutdown.wait() => break,
                    received = event_queue.recv() => match received {
                        Ok(e) => e,
                        Err(RecvError::Lagged(n)) => {
                            warn!(skipped = n, "monitor lagged behind execution events");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                let event = &event_msg;
                match &event.event {
                    GraphEvent::Execution(e) => {
                        trace!(flow_id = %event.flow_id, execution_id = %event.execution_id, "execution {}", e.str());
                        if let Some(info) = e.info() {
                            if let Err(err) = services.analytics.record_execution(info).await {
                                warn!(execution_id = %event.execution_id, "analytics record_execution failed: {}", err);
                            }
                        }
                    }
                    GraphEvent::Node(n) => {
                        trace!(flow_id = %event.flow_id, execution_id = %event.execution_id, node_id = %event.node_id, "node {}", n.str());
                    }
                }
            }
        });
    }

    pub fn record_step(
        &self,
        step: ExecutionStep,
    ) {
        let services = self.services.clone();
        self.runtime.spawn(async move {
            if let Err(err) = services.analytics.record_node_execution(&step).await {
                warn!(execution_id = %step.execution_id, node_id = %step.node_id, "analytics record_node_execution failed: {}", err);
            }
        });
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }
}
