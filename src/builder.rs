use std::sync::Arc;

use tokio::runtime::Handle;

use crate::{
    Chatflow, ChatflowError, Config, FlowEngine, Result,
    model::NodeDefinition,
    nodes::{NodeExecutor, NodeFactory, NodeRegistry},
    services::Services,
    store::{DbStore, MemStore, Store},
    trigger::{TriggerEventEmitter, TriggerMatcher, TriggerProcessor, TriggerRegistry, TriggerScheduler},
};

/// Wires the engine, the trigger subsystem and their collaborators.
pub struct ChatflowBuilder {
    config: Config,
    services: Services,
    db: Box<dyn DbStore>,
    runtime: Option<Handle>,
    nodes: Vec<(String, NodeFactory)>,
    matchers: Vec<Arc<dyn TriggerMatcher>>,
}

impl Default for ChatflowBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            services: Services::default(),
            db: Box::new(MemStore::new()),
            runtime: None,
            nodes: Vec::new(),
            matchers: Vec::new(),
        }
    }
}

impl ChatflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(
        mut self,
        config: Config,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn services(
        mut self,
        services: Services,
    ) -> Self {
        self.services = services;
        self
    }

    /// Storage backend, in-memory by default.
    pub fn store(
        mut self,
        db: impl DbStore + 'static,
    ) -> Self {
        self.db = Box::new(db);
        self
    }

    /// Runtime to spawn workers on; defaults to the current one.
    pub fn runtime(
        mut self,
        runtime: Handle,
    ) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Adds or replaces a node type.
    pub fn node(
        mut self,
        node_type: &str,
        factory: impl Fn(&NodeDefinition) -> Result<Box<dyn NodeExecutor>> + Send + Sync + 'static,
    ) -> Self {
        self.nodes.push((node_type.to_string(), Arc::new(factory)));
        self
    }

    /// Adds or replaces the matcher of the trigger types it supports.
    pub fn matcher(
        mut self,
        matcher: Arc<dyn TriggerMatcher>,
    ) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn build(self) -> Result<Chatflow> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| ChatflowError::Engine(format!("no tokio runtime available: {}", e)))?,
        };

        let store = Store::new();
        self.db.init(&store);
        let store = Arc::new(store);

        let nodes = NodeRegistry::with_builtins();
        for (node_type, factory) in self.nodes {
            nodes.register(&node_type, factory);
        }

        let emitter = TriggerEventEmitter::new();
        let scheduler = TriggerScheduler::new(emitter.clone(), &self.config.scheduler);
        let engine = FlowEngine::new(store.clone(), Arc::new(nodes), Arc::new(self.services), scheduler.clone(), &self.config.engine, runtime.clone());

        let triggers = TriggerRegistry::new(store, scheduler.clone());
        for matcher in self.matchers {
            triggers.register_matcher(matcher);
        }
        let processor = TriggerProcessor::new(engine.clone(), triggers.clone(), &self.config.processor);
        emitter.subscribe(processor.clone());

        Ok(Chatflow::new(engine, triggers, processor, scheduler, emitter, runtime))
    }
}
