//! Compiled flow graphs.
//!
//! A [`Flow`] is a validated [`FlowDefinition`] with one executor built per
//! node and the connections laid out as a directed graph. Compilation is the
//! only place a definition is checked; a flow that compiled never produces a
//! configuration error at run time except for transitions a node resolves
//! dynamically.

pub mod template;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use petgraph::{
    graph::{DiGraph, NodeIndex},
    visit::Dfs,
};
use tracing::warn;

use crate::{
    ChatflowError, Result,
    model::{FlowDefinition, FlowSettings, NodeId},
    nodes::{NodeExecutor, NodeRegistry, NodeResult},
    utils::time::try_secs,
};

pub struct Flow {
    def: FlowDefinition,
    /// node id per graph index; edge weights carry the connection label
    graph: DiGraph<NodeId, Option<String>>,
    index: HashMap<NodeId, NodeIndex>,
    executors: HashMap<NodeId, Arc<dyn NodeExecutor>>,
}

impl std::fmt::Debug for Flow {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Flow").field("id", &self.def.id).field("version", &self.def.version).field("nodes", &self.graph.node_count()).finish()
    }
}

impl Flow {
    /// Validates `def` and builds every node executor.
    ///
    /// All problems found are reported together in one
    /// [`ChatflowError::Validation`].
    pub fn compile(
        mut def: FlowDefinition,
        registry: &NodeRegistry,
    ) -> Result<Self> {
        def.normalize();
        let mut errors = Vec::new();

        if def.id.is_empty() {
            errors.push("flow id is empty".to_string());
        }
        if !def.nodes.contains_key(&def.start_node) {
            errors.push(format!("start node '{}' does not exist", def.start_node));
        }
        if let Some(limit) = &def.settings.rate_limit {
            if try_secs(limit.per_seconds).is_none() {
                errors.push(format!("rate limit window of {}s is out of range", limit.per_seconds));
            }
        }

        let mut executors: HashMap<NodeId, Arc<dyn NodeExecutor>> = HashMap::new();
        for (key, node) in def.nodes.iter() {
            if key != &node.id {
                errors.push(format!("node key '{}' does not match node id '{}'", key, node.id));
            }
            for conn in node.connections.iter() {
                if !def.nodes.contains_key(&conn.target) {
                    errors.push(format!("node '{}' connects to missing node '{}'", node.id, conn.target));
                }
            }

            let executor = match registry.create(node) {
                Ok(executor) => executor,
                Err(err) => {
                    errors.push(message_of(err));
                    continue;
                }
            };
            if let Err(err) = executor.validate() {
                errors.push(message_of(err));
            }
            for target in executor.next_node_ids() {
                if !def.nodes.contains_key(&target) && !node.connections.iter().any(|c| c.target == target) {
                    errors.push(format!("node '{}' refers to missing node '{}'", node.id, target));
                }
            }
            if !executor.is_branching() && node.connections.len() > 1 {
                errors.push(format!(
                    "node '{}' has {} outgoing connections but does not choose between them",
                    node.id,
                    node.connections.len()
                ));
            }
            executors.insert(key.clone(), Arc::from(executor));
        }

        let mut names = HashSet::new();
        for var in def.variables.iter() {
            if !names.insert(var.name.as_str()) {
                errors.push(format!("variable '{}' is declared twice", var.name));
            }
            if let Some(rule) = &var.validation {
                if let Err(err) = rule.compile() {
                    errors.push(format!("variable '{}': {}", var.name, message_of(err)));
                }
            }
            if let Some(default) = &var.default {
                if let Err(err) = var.check(default) {
                    errors.push(format!("default of {}", message_of(err)));
                }
            }
        }

        if !errors.is_empty() {
            return Err(ChatflowError::Validation(errors.join("; ")));
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for id in def.nodes.keys() {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }
        for (id, executor) in executors.iter() {
            let from = index[id];
            let node = executor.definition();
            let mut targets: Vec<(NodeId, Option<String>)> = node.connections.iter().map(|c| (c.target.clone(), c.condition.clone())).collect();
            for target in executor.next_node_ids() {
                if !targets.iter().any(|(t, _)| *t == target) {
                    targets.push((target, None));
                }
            }
            for (target, label) in targets {
                if let Some(to) = index.get(&target) {
                    graph.add_edge(from, *to, label);
                }
            }
        }

        let flow = Self {
            def,
            graph,
            index,
            executors,
        };

        let reachable = flow.reachable();
        let unreachable: Vec<&str> = flow.def.nodes.keys().filter(|id| !reachable.contains(id.as_str())).map(String::as_str).collect();
        if !unreachable.is_empty() {
            warn!(flow_id = %flow.def.id, "nodes not reachable from start: {}", unreachable.join(", "));
        }

        Ok(flow)
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.def
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn version(&self) -> u32 {
        self.def.version
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.def.settings
    }

    pub fn start_node(&self) -> &str {
        &self.def.start_node
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn node(
        &self,
        id: &str,
    ) -> Result<Arc<dyn NodeExecutor>> {
        self.executors.get(id).cloned().ok_or_else(|| ChatflowError::Transition(format!("node '{}' does not exist in flow '{}'", id, self.def.id)))
    }

    /// Node ids reachable from the start node.
    pub fn reachable(&self) -> HashSet<&str> {
        let mut seen = HashSet::new();
        let Some(start) = self.index.get(&self.def.start_node) else {
            return seen;
        };
        let mut dfs = Dfs::new(&self.graph, *start);
        while let Some(idx) = dfs.next(&self.graph) {
            seen.insert(self.graph[idx].as_str());
        }
        seen
    }

    /// Picks the node that follows `node_id` after it returned `result`.
    ///
    /// An explicit choice wins; otherwise the single outgoing connection is
    /// taken. `None` means the execution has nowhere left to go.
    pub fn resolve_next(
        &self,
        node_id: &str,
        result: &NodeResult,
    ) -> Result<Option<NodeId>> {
        if let Some(next) = &result.next_node_id {
            if !self.executors.contains_key(next) {
                return Err(ChatflowError::Transition(format!("node '{}' chose missing node '{}'", node_id, next)));
            }
            return Ok(Some(next.clone()));
        }

        let node = self.node(node_id)?;
        let connections = &node.definition().connections;
        match connections.len() {
            0 => Ok(None),
            1 => Ok(Some(connections[0].target.clone())),
            n => Err(ChatflowError::Transition(format!("node '{}' has {} outgoing connections and chose none", node_id, n))),
        }
    }
}

fn message_of(err: ChatflowError) -> String {
    match err {
        ChatflowError::Validation(msg) => msg,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        common::Vars,
        model::{NodeDefinition, VariableDefinition},
    };

    fn def(nodes: Vec<NodeDefinition>) -> FlowDefinition {
        FlowDefinition {
            id: "f1".to_string(),
            start_node: "start".to_string(),
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_compile_linear_flow() {
        let flow = Flow::compile(
            def(vec![
                NodeDefinition::new("start", "start").connect("hello"),
                NodeDefinition::new("hello", "message").with_config(Vars::from(json!({"text": "hi"}))).connect("end"),
                NodeDefinition::new("end", "end"),
            ]),
            &NodeRegistry::default(),
        )
        .unwrap();

        assert_eq!(flow.node_count(), 3);
        assert_eq!(flow.reachable().len(), 3);
        assert_eq!(flow.resolve_next("start", &NodeResult::proceed()).unwrap().as_deref(), Some("hello"));
        assert_eq!(flow.resolve_next("end", &NodeResult::proceed()).unwrap(), None);
    }

    #[test]
    fn test_dangling_target_named_in_error() {
        let err = Flow::compile(def(vec![NodeDefinition::new("start", "start").connect("ghost")]), &NodeRegistry::default()).unwrap_err();
        assert!(matches!(err, ChatflowError::Validation(_)));
        assert!(err.to_string().contains("'ghost'"));
    }

    #[test]
    fn test_missing_start_and_ambiguous_edges() {
        let mut d = def(vec![
            NodeDefinition::new("a", "start").connect("b").connect("c"),
            NodeDefinition::new("b", "end"),
            NodeDefinition::new("c", "end"),
        ]);
        d.start_node = "nope".to_string();
        let msg = Flow::compile(d, &NodeRegistry::default()).unwrap_err().to_string();
        assert!(msg.contains("start node 'nope'"));
        assert!(msg.contains("node 'a' has 2 outgoing connections"));
    }

    #[test]
    fn test_condition_may_fork() {
        let condition = NodeDefinition::new("check", "condition")
            .with_config(Vars::from(json!({"variable": "x", "operator": "equals", "value": "vip"})))
            .connect_when("true", "vip")
            .connect_when("false", "regular");
        let flow = Flow::compile(
            def(vec![
                NodeDefinition::new("start", "start").connect("check"),
                condition,
                NodeDefinition::new("vip", "end"),
                NodeDefinition::new("regular", "end"),
            ]),
            &NodeRegistry::default(),
        )
        .unwrap();
        assert_eq!(flow.resolve_next("check", &NodeResult::goto("vip")).unwrap().as_deref(), Some("vip"));
        assert!(matches!(flow.resolve_next("check", &NodeResult::goto("gone")), Err(ChatflowError::Transition(_))));
    }

    #[test]
    fn test_bad_variable_default() {
        let mut d = def(vec![NodeDefinition::new("start", "start")]);
        d.variables.push(VariableDefinition {
            name: "age".to_string(),
            var_type: crate::model::VariableType::Number,
            default: Some(json!("old")),
            required: false,
            validation: None,
        });
        let msg = Flow::compile(d, &NodeRegistry::default()).unwrap_err().to_string();
        assert!(msg.contains("variable 'age' expects number"));
    }

    #[test]
    fn test_rate_limit_window_out_of_range() {
        let mut d = def(vec![NodeDefinition::new("start", "start")]);
        d.settings.rate_limit = Some(crate::model::RateLimit {
            max_executions: 1,
            per_seconds: 100_000_000_000_000_000,
            per_contact: false,
        });
        let msg = Flow::compile(d, &NodeRegistry::default()).unwrap_err().to_string();
        assert!(msg.contains("rate limit window"));
    }
}
