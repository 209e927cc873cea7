//! Stand-alone collaborator implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    ChatflowError, Result,
    common::Vars,
    runtime::ExecutionInfo,
    services::{AiProvider, AiRequest, AnalyticsSink, Contact, ContactService, Conversation, ConversationRef, IntegrationClient, MessageAck, MessageSender},
    store::data::ExecutionStep,
    utils,
};

/// Writes outbound messages to the log instead of a channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMessenger;

#[async_trait]
impl MessageSender for LogMessenger {
    async fn send(
        &self,
        conversation: &ConversationRef,
        text: &str,
        media: &[String],
    ) -> Result<MessageAck> {
        info!(conversation_id = %conversation.conversation_id, media = media.len(), "outbound message: {}", text);
        Ok(MessageAck {
            message_id: utils::longid(),
            delivered_at: Utc::now(),
        })
    }
}

/// Collaborator that has not been wired; every call fails without retry.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unconfigured;

#[async_trait]
impl IntegrationClient for Unconfigured {
    async fn call(
        &self,
        _tenant_id: &str,
        integration: &str,
        _operation: &str,
        _params: &Value,
    ) -> Result<Value> {
        Err(ChatflowError::fatal("service_unavailable", format!("no integration client configured for '{}'", integration)))
    }
}

#[async_trait]
impl AiProvider for Unconfigured {
    async fn complete(
        &self,
        _tenant_id: &str,
        _request: &AiRequest,
    ) -> Result<String> {
        Err(ChatflowError::fatal("service_unavailable", "no ai provider configured"))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAnalytics;

#[async_trait]
impl AnalyticsSink for NoopAnalytics {
    async fn record_execution(
        &self,
        info: &ExecutionInfo,
    ) -> Result<()> {
        debug!(execution_id = %info.execution_id, status = info.status.as_ref(), "analytics: execution");
        Ok(())
    }

    async fn record_node_execution(
        &self,
        _step: &ExecutionStep,
    ) -> Result<()> {
        Ok(())
    }
}

/// Contact and conversation records held in memory.
///
/// Unknown contacts and conversations are created on first write.
#[derive(Debug, Default)]
pub struct MemContacts {
    contacts: RwLock<HashMap<(String, String), Contact>>,
    conversations: RwLock<HashMap<(String, String), Conversation>>,
}

impl MemContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_contact(
        &self,
        contact: Contact,
    ) {
        self.contacts.write().insert((contact.tenant_id.clone(), contact.id.clone()), contact);
    }

    pub fn insert_conversation(
        &self,
        conversation: Conversation,
    ) {
        self.conversations.write().insert((conversation.tenant_id.clone(), conversation.id.clone()), conversation);
    }
}

#[async_trait]
impl ContactService for MemContacts {
    async fn get_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
    ) -> Result<Contact> {
        self.contacts
            .read()
            .get(&(tenant_id.to_string(), contact_id.to_string()))
            .cloned()
            .ok_or_else(|| ChatflowError::fatal("contact_not_found", format!("contact '{}' not found", contact_id)))
    }

    async fn update_contact(
        &self,
        tenant_id: &str,
        contact_id: &str,
        fields: &Vars,
    ) -> Result<Contact> {
        let mut contacts = self.contacts.write();
        let contact = contacts.entry((tenant_id.to_string(), contact_id.to_string())).or_insert_with(|| Contact {
            id: contact_id.to_string(),
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        });
        for (key, value) in fields.iter() {
            match (key.as_str(), value) {
                ("name", Value::String(s)) => contact.name = Some(s.clone()),
                ("phone", Value::String(s)) => contact.phone = Some(s.clone()),
                ("email", Value::String(s)) => contact.email = Some(s.clone()),
                _ => contact.fields.set(key, value),
            }
        }
        Ok(contact.clone())
    }

    async fn add_tag(
        &self,
        tenant_id: &str,
        contact_id: &str,
        tag: &str,
    ) -> Result<()> {
        let mut contacts = self.contacts.write();
        let contact = contacts.entry((tenant_id.to_string(), contact_id.to_string())).or_insert_with(|| Contact {
            id: contact_id.to_string(),
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        });
        if !contact.tags.iter().any(|t| t == tag) {
            contact.tags.push(tag.to_string());
        }
        Ok(())
    }

    async fn get_conversation(
        &self,
        tenant_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation> {
        self.conversations
            .read()
            .get(&(tenant_id.to_string(), conversation_id.to_string()))
            .cloned()
            .ok_or_else(|| ChatflowError::fatal("conversation_not_found", format!("conversation '{}' not found", conversation_id)))
    }

    async fn update_conversation_status(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        status: &str,
    ) -> Result<()> {
        let mut conversations = self.conversations.write();
        let conversation = conversations.entry((tenant_id.to_string(), conversation_id.to_string())).or_insert_with(|| Conversation {
            id: conversation_id.to_string(),
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        });
        conversation.status = status.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_mem_contacts() {
        let contacts = MemContacts::new();
        assert!(contacts.get_contact("t1", "c1").await.is_err());

        contacts.add_tag("t1", "c1", "vip").await.unwrap();
        contacts.add_tag("t1", "c1", "vip").await.unwrap();
        let updated = contacts.update_contact("t1", "c1", &Vars::new().with("email", "a@b.c").with("plan", "pro")).await.unwrap();
        assert_eq!(updated.tags, vec!["vip"]);
        assert_eq!(updated.email.as_deref(), Some("a@b.c"));
        assert_eq!(updated.fields.get_value("plan"), Some(&json!("pro")));

        contacts.update_conversation_status("t1", "conv1", "closed").await.unwrap();
        assert_eq!(contacts.get_conversation("t1", "conv1").await.unwrap().status, "closed");
    }
}
