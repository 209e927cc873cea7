use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::runtime::Handle;

use crate::{
    ChatflowError, Result, ShareLock,
    common::{BroadcastQueue, Shutdown},
    events::{Event, Message},
    model::ExecutionId,
};

macro_rules! dispatch_event {
    ($handles:expr, $(&$item:ident), +) => {
        let handlers = $handles.read().clone();
        for handle in handlers.iter() {
            (handle)($(&$item),+);
        }
    };
}

macro_rules! dispatch_event_async {
    ($handles:expr, $(&$item:ident), +) => {
        let handles = $handles.clone();

        tokio::spawn(async move {
            let handlers = handles.read().clone();
            for handle in handlers.iter() {
                (handle)($(&$item),+).await;
            }
        });
    };
}

const EVENT_QUEUE_SIZE: usize = 2048;

pub type ExecutionEventHandle = Arc<dyn Fn(&Event<Message>) + Send + Sync>;
pub type ExecutionEventHandleAsync = Arc<dyn Fn(&Event<Message>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// use the glob pattern to match the flow id
    /// eg. onboarding*
    pub flow_id: String,

    /// use the glob pattern to match the execution id
    pub execution_id: String,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            flow_id: "*".to_string(),
            execution_id: "*".to_string(),
        }
    }
}

impl ChannelOptions {
    pub fn new(
        flow_id: &str,
        execution_id: &str,
    ) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            execution_id: execution_id.to_string(),
        }
    }

    pub fn with_flow(flow_id: &str) -> Self {
        Self::new(flow_id, "*")
    }

    pub fn with_execution(execution_id: &str) -> Self {
        Self::new("*", execution_id)
    }
}

/// Best-effort fan-out of execution events to live subscribers.
#[derive(Clone)]
pub struct Channel {
    event_queue: Arc<BroadcastQueue<Event<Message>>>,

    events: ShareLock<Vec<ExecutionEventHandle>>,
    events_async: ShareLock<Vec<ExecutionEventHandleAsync>>,

    runtime: Handle,
    shutdown: Arc<Shutdown>,
}

impl Channel {
    pub(crate) fn new(runtime: Handle) -> Self {
        Self {
            event_queue: BroadcastQueue::new(EVENT_QUEUE_SIZE),
            events: Arc::new(RwLock::new(Vec::new())),
            events_async: Arc::new(RwLock::new(Vec::new())),
            runtime,
            shutdown: Arc::new(Shutdown::new()),
        }
    }

    pub(crate) fn event_queue(&self) -> Arc<BroadcastQueue<Event<Message>>> {
        self.event_queue.clone()
    }

    /// Publishes an event, dropping it when nobody listens.
    pub(crate) fn emit(
        &self,
        msg: Message,
    ) {
        let _ = self.event_queue.send(Event::new(&msg));
    }

    pub(crate) fn listen(&self) {
        let mut event_queue = self.event_queue.subscribe();
        let events = self.events.clone();
        let events_async = self.events_async.clone();

        let shutdown = self.shutdown.clone();
        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    received = event_queue.recv() => match received {
                        Ok(e) => {
                            let evt = e.clone();
                            dispatch_event!(events, &evt);
                            dispatch_event_async!(events_async, &e);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "execution event subscribers lagged");
                        }
                        Err(_) => break,
                    }
                }
            }
        });
    }

    pub(crate) fn shutdown(&self) {
        self.shutdown.shutdown();
    }
}

/// Subscription builder filtering events by flow and execution id.
#[derive(Clone)]
pub struct ChannelEvent {
    channel: Arc<Channel>,

    glob: (globset::GlobMatcher, globset::GlobMatcher),
}

impl ChannelEvent {
    pub fn channel(
        channel: Arc<Channel>,
        options: ChannelOptions,
    ) -> Result<Self> {
        let compile = |pattern: &str| globset::Glob::new(pattern).map(|g| g.compile_matcher()).map_err(|e| ChatflowError::Config(e.to_string()));

        Ok(Self {
            channel,
            glob: (compile(&options.flow_id)?, compile(&options.execution_id)?),
        })
    }

    pub fn on_complete(
        &self,
        f: impl Fn(ExecutionId) + Send + Sync + 'static,
    ) {
        let glob = self.glob.clone();

        self.channel.events.write().push(Arc::new(move |e| {
            if e.event.is_complete() && is_match(&glob, e) {
                f(e.execution_id.clone());
            }
        }));
    }

    pub fn on_error(
        &self,
        f: impl Fn(&Event<Message>) + Send + Sync + 'static,
    ) {
        let glob = self.glob.clone();

        self.channel.events.write().push(Arc::new(move |e| {
            if e.event.is_error() && is_match(&glob, e) {
                f(e);
            }
        }));
    }

    pub fn on_event(
        &self,
        f: impl Fn(&Event<Message>) + Send + Sync + 'static,
    ) {
        let glob = self.glob.clone();

        self.channel.events.write().push(Arc::new(move |e| {
            if is_match(&glob, e) {
                f(e);
            }
        }));
    }

    pub fn on_event_async<F>(
        &self,
        f: F,
    ) where
        F: Fn(&Event<Message>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let glob = self.glob.clone();

        self.channel.events_async.write().push(Arc::new(move |e| {
            if is_match(&glob, e) {
                f(e)
            } else {
                Box::pin(async {})
            }
        }));
    }
}

fn is_match(
    glob: &(globset::GlobMatcher, globset::GlobMatcher),
    e: &Event<Message>,
) -> bool {
    let (pat_flow, pat_exec) = glob;
    pat_flow.is_match(&e.flow_id) && pat_exec.is_match(&e.execution_id)
}
