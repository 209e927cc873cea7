//! External collaborators consumed by node executors and the engine.
//!
//! Channel delivery, contact management, integrations, AI completion and
//! analytics live outside this crate. Each is a trait; [`Services`] bundles one
//! implementation of each and defaults to the stand-alone versions in
//! [`defaults`].

pub mod defaults;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, common::Vars, runtime::ExecutionInfo, store::data::ExecutionStep};

pub use defaults::{LogMessenger, MemContacts, NoopAnalytics, Unconfigured};

/// Address of a conversation on some channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRef {
    pub tenant_id: String,
    pub conversation_id: String,
    pub contact_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAck {
    pub message_id: String,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fields: Vars,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Delivers rendered text (and media references) to a conversation.
    async fn send(
        &self,
        conversation: &ConversationRef,
        text: &str,
        media: &[String],
    ) -> Result<MessageAck>;
}

#[async_trait]
pub trait ContactService: Send + Sync {
    async fn get_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Contact>;

    /// Merges `fields` into the contact and returns the updated record.
    async fn update_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
        fields: &Vars,
    ) -> Result<Contact>;

    async fn add_tag(
        &self,
        tenant_id: &str,
        contact_id: &str,
        tag: &str,
    ) -> Result<()>;

    async fn get_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation>;

    async fn update_conversation_status(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        status: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait IntegrationClient: Send + Sync {
    async fn call(
        &self,
        tenant_id: &str,
        integration: &str,
        operation: &str,
        params: &Value,
    ) -> Result<Value>;
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn complete(
        &self,
        tenant_id: &str,
        request: &AiRequest,
    ) -> Result<String>;
}

/// Fire-and-forget analytics. Errors are logged by the caller and never fail a flow.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record_execution(
        &self,
        info: &ExecutionInfo,
    ) -> Result<()>;

    async fn record_node_execution(
        &self,
        step: &ExecutionStep,
    ) -> Result<()>;
}

/// One implementation of every collaborator.
#[derive(Clone)]
pub struct Services {
    pub messenger: Arc<dyn MessageSender>,
    pub contacts: Arc<dyn ContactService>,
    pub integrations: Arc<dyn IntegrationClient>,
    pub ai: Arc<dyn AiProvider>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub http: reqwest::Client,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            messenger: Arc::new(LogMessenger),
            contacts: Arc::new(MemContacts::new()),
            integrations: Arc::new(Unconfigured),
            ai: Arc::new(Unconfigured),
            analytics: Arc::new(NoopAnalytics),
            http: reqwest::Client::new(),
        }
    }
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messenger(
        mut self,
        messenger: Arc<dyn MessageSender>,
    ) -> Self {
        self.messenger = messenger;
        self
    }

    pub fn with_contacts(
        mut self,
        contacts: Arc<dyn ContactService>,
    ) -> Self {
        self.contacts = contacts;
        self
    }

    pub fn with_integrations(
        mut self,
        integrations: Arc<dyn IntegrationClient>,
    ) -> Self {
        self.integrations = integrations;
        self
    }

    pub fn with_ai(
        mut self,
        ai: Arc<dyn AiProvider>,
    ) -> Self {
        self.ai = ai;
        self
    }

    pub fn with_analytics(
        mut self,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn with_http(
        mut self,
        http: reqwest::Client,
    ) -> Self {
        self.http = http;
        self
    }
}
