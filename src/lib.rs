//! # Chatflow
//!
//! Chatflow is an embeddable engine for chatbot conversation flows.
//! Flows are directed graphs of typed nodes that send messages, wait for
//! replies, branch on conditions, call external services and fork into
//! parallel branches. Executions are durable: a flow waiting for a reply or a
//! timer holds no worker and resumes from its stored context.
//!
//! ## Core Features
//!
//! - **Resumable Executions**: every step is persisted; input waits, timers and split barriers survive restarts
//! - **Trigger Dispatch**: keyword, button, webhook, contact event and schedule triggers ranked by priority
//! - **Per-Conversation Ordering**: events are partitioned by conversation and handled in arrival order
//! - **Pluggable Collaborators**: messaging, contacts, integrations, AI and analytics behind traits
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chatflow::{ChatflowBuilder, FlowDefinition, TriggerConfig, TriggerType};
//!
//! let chatflow = ChatflowBuilder::new().build()?;
//! chatflow.start()?;
//!
//! chatflow.deploy(FlowDefinition::from_json(json_str)?)?;
//! chatflow.register_trigger("acme", "welcome", "greeting", TriggerConfig::new(TriggerType::Keyword).with_conditions(conditions))?;
//! chatflow.emitter().message_received("acme", "conv-1", Some("contact-1"), "hi")?;
//! ```

mod builder;
mod chatflow;
mod dispatcher;
mod engine;
mod error;
mod utils;

pub mod common;
pub mod config;
pub mod events;
pub mod flow;
pub mod model;
pub mod nodes;
pub mod runtime;
pub mod services;
pub mod store;
pub mod trigger;

use std::sync::Arc;

use parking_lot::RwLock;

pub use builder::ChatflowBuilder;
pub use chatflow::Chatflow;
pub use common::Vars;
pub use config::Config;
pub use engine::FlowEngine;
pub use error::ChatflowError;
pub use model::*;
pub use runtime::{ChannelEvent, ChannelOptions, ExecutionContext, ExecutionInfo, ExecutionResult, ExecutionStatus, WaitState};
pub use trigger::{FlowTrigger, TriggerConfig, TriggerEvent, TriggerEventType, TriggerMatch, TriggerStatus, TriggerType};

/// Result type alias for Chatflow operations.
pub type Result<T> = std::result::Result<T, ChatflowError>;

/// Thread-safe shared lock wrapper using Arc<RwLock<T>>.
pub(crate) type ShareLock<T> = Arc<RwLock<T>>;
