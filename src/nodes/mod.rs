//! Node executors and the node type registry.
//!
//! Every node type implements [`NodeExecutor`]. The engine only ever calls
//! `execute`; what happens next is described by the returned [`NodeResult`].
//! New types are added through [`NodeRegistry::register`] without touching the
//! step loop.

pub mod action;
pub mod ai;
pub mod condition;
pub mod delay;
pub mod end;
pub mod input;
pub mod integration;
pub mod merge;
pub mod message;
pub mod split;
pub mod start;
pub mod webhook;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    ChatflowError, Result,
    common::Vars,
    model::{NodeDefinition, NodeId},
    runtime::ExecutionContext,
    services::{ConversationRef, Services},
    store::Store,
};

pub use action::ActionNode;
pub use ai::AiNode;
pub use condition::ConditionNode;
pub use delay::DelayNode;
pub use end::EndNode;
pub use input::InputNode;
pub use integration::IntegrationNode;
pub use merge::MergeNode;
pub use message::MessageNode;
pub use split::SplitNode;
pub use start::StartNode;
pub use webhook::WebhookNode;

#[derive(Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr, strum::EnumString, strum::EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeType {
    Start,
    Message,
    Input,
    Question,
    Condition,
    Delay,
    Action,
    Integration,
    Webhook,
    Ai,
    Split,
    Merge,
    End,
}

pub type NodeFactory = Arc<dyn Fn(&NodeDefinition) -> Result<Box<dyn NodeExecutor>> + Send + Sync>;

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// The definition this executor was built from.
    fn definition(&self) -> &NodeDefinition;

    /// Replaces the configuration, re-validating it.
    fn set_config(
        &mut self,
        config: Vars,
    ) -> Result<()>;

    /// Runs the node once.
    ///
    /// Returns `Err` for failures; retryable ones carry
    /// [`ChatflowError::Execution`] with `retryable: true`.
    async fn execute(
        &self,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeResult>;

    fn id(&self) -> &str {
        &self.definition().id
    }

    fn node_type(&self) -> &str {
        &self.definition().node_type
    }

    fn name(&self) -> &str {
        &self.definition().name
    }

    fn config(&self) -> &Vars {
        &self.definition().config
    }

    /// Config-only correctness checks beyond the schema.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Every node id this node may continue to.
    fn next_node_ids(&self) -> Vec<NodeId> {
        self.definition().connections.iter().map(|c| c.target.clone()).collect()
    }

    /// Branching nodes always choose their next node explicitly.
    fn is_branching(&self) -> bool {
        false
    }
}

/// What a node sees while executing.
pub struct NodeContext<'a> {
    pub execution: &'a ExecutionContext,
    /// Input supplied by the resume call that woke this execution.
    pub input: Option<&'a Value>,
    pub services: &'a Services,
    pub store: &'a Store,
    /// Ceiling for any single external call.
    pub call_timeout: Duration,
}

impl NodeContext<'_> {
    pub fn tenant_id(&self) -> &str {
        &self.execution.tenant_id
    }

    pub fn conversation(&self) -> Result<ConversationRef> {
        let conversation_id = self.execution.conversation_id.clone().ok_or_else(|| ChatflowError::fatal("missing_conversation", "execution has no conversation"))?;
        Ok(ConversationRef {
            tenant_id: self.execution.tenant_id.clone(),
            conversation_id,
            contact_id: self.execution.contact_id.clone(),
        })
    }

    pub fn contact_id(&self) -> Result<&str> {
        self.execution.contact_id.as_deref().ok_or_else(|| ChatflowError::fatal("missing_contact", "execution has no contact"))
    }

    /// Runs an external call under the call timeout.
    ///
    /// A timeout is retryable. When `retryable` is false every failure of the
    /// call is downgraded to fatal.
    pub async fn guarded<T>(
        &self,
        code: &str,
        retryable: bool,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        let ret = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(ret) => ret,
            Err(_) => Err(ChatflowError::retryable(format!("{}_timeout", code), format!("no response within {}ms", self.call_timeout.as_millis()))),
        };

        ret.map_err(|err| match err {
            ChatflowError::Execution {
                code,
                message,
                retryable: r,
            } => ChatflowError::Execution {
                code,
                message,
                retryable: r && retryable,
            },
            other if retryable => ChatflowError::retryable(code, other.to_string()),
            other => ChatflowError::fatal(code, other.to_string()),
        })
    }
}

/// Outcome of one node execution.
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    pub success: bool,
    /// Explicit choice of the next node.
    pub next_node_id: Option<NodeId>,
    /// Merged into the execution variables, last write wins.
    pub variables: Vars,
    pub output: Option<Value>,
    pub should_wait: bool,
    pub wait_duration: Option<Duration>,
    pub should_pause: bool,
    /// The execution completes after this node.
    pub complete: bool,
    /// Split targets, each run in its own child execution.
    pub branches: Vec<NodeId>,
    pub error_code: Option<String>,
    pub metadata: Vars,
}

impl NodeResult {
    /// Continue along the single outgoing connection.
    pub fn proceed() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn goto(next: &str) -> Self {
        Self {
            success: true,
            next_node_id: Some(next.to_string()),
            ..Default::default()
        }
    }

    /// Stay on this node until resumed.
    pub fn pause() -> Self {
        Self {
            success: true,
            should_pause: true,
            ..Default::default()
        }
    }

    /// Continue after `duration` without holding a worker.
    pub fn wait(duration: Duration) -> Self {
        Self {
            success: true,
            should_wait: true,
            wait_duration: Some(duration),
            ..Default::default()
        }
    }

    pub fn complete() -> Self {
        Self {
            success: true,
            complete: true,
            ..Default::default()
        }
    }

    /// Reports a non-retryable failure without raising an error.
    pub fn failed(code: &str) -> Self {
        Self {
            success: false,
            error_code: Some(code.to_string()),
            ..Default::default()
        }
    }

    pub fn with_variables(
        mut self,
        variables: Vars,
    ) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_variable<T: Serialize>(
        mut self,
        key: &str,
        value: T,
    ) -> Self {
        self.variables.set(key, value);
        self
    }

    pub fn with_output(
        mut self,
        output: Value,
    ) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_metadata<T: Serialize>(
        mut self,
        key: &str,
        value: T,
    ) -> Self {
        self.metadata.set(key, value);
        self
    }
}

/// Node type to factory mapping.
pub struct NodeRegistry {
    factories: RwLock<HashMap<String, NodeFactory>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl NodeRegistry {
    /// A registry without any node types.
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with every built-in node type.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register_fn(NodeType::Start.as_ref(), |def| Ok(Box::new(StartNode::create(def)?)));
        registry.register_fn(NodeType::Message.as_ref(), |def| Ok(Box::new(MessageNode::create(def)?)));
        registry.register_fn(NodeType::Input.as_ref(), |def| Ok(Box::new(InputNode::create(def)?)));
        registry.register_fn(NodeType::Question.as_ref(), |def| Ok(Box::new(InputNode::create(def)?)));
        registry.register_fn(NodeType::Condition.as_ref(), |def| Ok(Box::new(ConditionNode::create(def)?)));
        registry.register_fn(NodeType::Delay.as_ref(), |def| Ok(Box::new(DelayNode::create(def)?)));
        registry.register_fn(NodeType::Action.as_ref(), |def| Ok(Box::new(ActionNode::create(def)?)));
        registry.register_fn(NodeType::Integration.as_ref(), |def| Ok(Box::new(IntegrationNode::create(def)?)));
        registry.register_fn(NodeType::Webhook.as_ref(), |def| Ok(Box::new(WebhookNode::create(def)?)));
        registry.register_fn(NodeType::Ai.as_ref(), |def| Ok(Box::new(AiNode::create(def)?)));
        registry.register_fn(NodeType::Split.as_ref(), |def| Ok(Box::new(SplitNode::create(def)?)));
        registry.register_fn(NodeType::Merge.as_ref(), |def| Ok(Box::new(MergeNode::create(def)?)));
        registry.register_fn(NodeType::End.as_ref(), |def| Ok(Box::new(EndNode::create(def)?)));
        registry
    }

    /// Registers or replaces the factory of `node_type`.
    pub fn register(
        &self,
        node_type: &str,
        factory: NodeFactory,
    ) {
        self.factories.write().insert(node_type.to_string(), factory);
    }

    pub fn register_fn(
        &self,
        node_type: &str,
        factory: impl Fn(&NodeDefinition) -> Result<Box<dyn NodeExecutor>> + Send + Sync + 'static,
    ) {
        self.register(node_type, Arc::new(factory));
    }

    pub fn contains(
        &self,
        node_type: &str,
    ) -> bool {
        self.factories.read().contains_key(node_type)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Builds the executor of `def`.
    pub fn create(
        &self,
        def: &NodeDefinition,
    ) -> Result<Box<dyn NodeExecutor>> {
        let factory = self
            .factories
            .read()
            .get(&def.node_type)
            .cloned()
            .ok_or_else(|| ChatflowError::Validation(format!("node '{}' has unknown type '{}'", def.id, def.node_type)))?;
        factory(def).map_err(|e| match e {
            ChatflowError::Validation(msg) => ChatflowError::Validation(msg),
            other => ChatflowError::Validation(format!("node '{}': {}", def.id, other)),
        })
    }
}

/// Validates `config` against `schema` and deserializes it.
pub(crate) fn parse_config<T: DeserializeOwned>(
    config: &Vars,
    schema: &Value,
) -> Result<T> {
    let params: Value = config.clone().into();
    jsonschema::validate(schema, &params)?;
    let parsed = serde_json::from_value::<T>(params)?;
    Ok(parsed)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::time::Duration;

    use super::*;
    use crate::store::{DbStore, MemStore};

    pub fn store() -> Store {
        let store = Store::new();
        MemStore::new().init(&store);
        store
    }

    pub fn node_ctx<'a>(
        execution: &'a ExecutionContext,
        input: Option<&'a Value>,
        services: &'a Services,
        store: &'a Store,
    ) -> NodeContext<'a> {
        NodeContext {
            execution,
            input,
            services,
            store,
            call_timeout: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_registry_unknown_type() {
        let registry = NodeRegistry::with_builtins();
        assert!(registry.contains("question"));
        let err = registry.create(&NodeDefinition::new("n1", "teleport")).err().unwrap();
        assert!(err.to_string().contains("unknown type 'teleport'"));
    }

    #[test]
    fn test_registry_bad_config_is_validation_error() {
        let registry = NodeRegistry::with_builtins();
        let def = NodeDefinition::new("wait", "delay").with_config(Vars::from(json!({"seconds": "soon"})));
        assert!(matches!(registry.create(&def), Err(ChatflowError::Validation(_))));
    }
}
