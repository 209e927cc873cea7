use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    Result,
    common::Vars,
    flow::template,
    model::NodeDefinition,
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
};

fn default_contact_variable() -> String {
    "contact".to_string()
}

/// Built-in side effects of the action node.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    SetVariable {
        variable: String,
        value: Value,
    },
    AddTag {
        tag: String,
    },
    UpdateContact {
        fields: Vars,
    },
    GetContact {
        #[serde(default = "default_contact_variable")]
        variable: String,
    },
    UpdateConversationStatus {
        status: String,
    },
}

/// Performs one contact, conversation or variable action.
#[derive(Debug, Clone)]
pub struct ActionNode {
    def: NodeDefinition,
    action: ActionKind,
    /// failed contact calls may be retried; on unless `retryable: false`
    retryable: bool,
}

impl ActionNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        Ok(Self {
            def: def.clone(),
            action: parse_config(&def.config, &Self::schema())?,
            retryable: retryable_of(&def.config),
        })
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["set_variable", "add_tag", "update_contact", "get_contact", "update_conversation_status"]
                },
                "variable": { "type": "string", "minLength": 1 },
                "value": {},
                "tag": { "type": "string", "minLength": 1 },
                "fields": { "type": "object" },
                "status": { "type": "string", "minLength": 1 },
                "retryable": { "type": "boolean" }
            }
        })
    }
}

#[async_trait]
impl NodeExecutor for ActionNode {
    fn definition(&self) -> &NodeDefinition {
        &self.def
    }

    fn set_config(
        &mut self,
        config: Vars,
    ) -> Result<()> {
        self.action = parse_config(&config, &Self::schema())?;
        self.retryable = retryable_of(&config);
        self.def.config = config;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeResult> {
        let contacts = &ctx.services.contacts;
        let tenant_id = ctx.tenant_id();

        match &self.action {
            ActionKind::SetVariable {
                variable,
                value,
            } => Ok(NodeResult::proceed().with_variable(variable, template::render_value(ctx.execution, value))),
            ActionKind::AddTag {
                tag,
            } => {
                let contact_id = ctx.contact_id()?;
                let tag = template::render(ctx.execution, tag);
                ctx.guarded("add_tag_failed", self.retryable, contacts.add_tag(tenant_id, contact_id, &tag)).await?;
                Ok(NodeResult::proceed().with_output(json!({ "tag": tag })))
            }
            ActionKind::UpdateContact {
                fields,
            } => {
                let contact_id = ctx.contact_id()?;
                let fields = Vars::from(template::render_value(ctx.execution, &fields.clone().into()));
                let contact = ctx.guarded("update_contact_failed", self.retryable, contacts.update_contact(tenant_id, contact_id, &fields)).await?;
                Ok(NodeResult::proceed().with_output(serde_json::to_value(contact)?))
            }
            ActionKind::GetContact {
                variable,
            } => {
                let contact_id = ctx.contact_id()?;
                let contact = ctx.guarded("get_contact_failed", self.retryable, contacts.get_contact(tenant_id, contact_id)).await?;
                Ok(NodeResult::proceed().with_variable(variable, contact))
            }
            ActionKind::UpdateConversationStatus {
                status,
            } => {
                let conversation = ctx.conversation()?;
                let status = template::render(ctx.execution, status);
                ctx.guarded(
                    "update_conversation_failed",
                    self.retryable,
                    contacts.update_conversation_status(tenant_id, &conversation.conversation_id, &status),
                )
                .await?;
                Ok(NodeResult::proceed().with_output(json!({ "status": status })))
            }
        }
    }
}

fn retryable_of(config: &Vars) -> bool {
    config.get::<bool>("retryable").unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::{
        ChatflowError,
        nodes::test_utils,
        runtime::ExecutionContext,
        services::{Contact, ContactService, Conversation, Services},
    };

    struct ContactsDown;

    #[async_trait]
    impl ContactService for ContactsDown {
        async fn get_contact(
            &self,
            _tenant_id: &str,
            _contact_id: &str,
        ) -> Result<Contact> {
            Err(ChatflowError::Store("contacts unavailable".to_string()))
        }

        async fn update_contact(
            &self,
            _tenant_id: &str,
            _contact_id: &str,
            _fields: &Vars,
        ) -> Result<Contact> {
            Err(ChatflowError::Store("contacts unavailable".to_string()))
        }

        async fn add_tag(
            &self,
            _tenant_id: &str,
            _contact_id: &str,
            _tag: &str,
        ) -> Result<()> {
            Err(ChatflowError::Store("contacts unavailable".to_string()))
        }

        async fn get_conversation(
            &self,
            _tenant_id: &str,
            _conversation_id: &str,
        ) -> Result<Conversation> {
            Err(ChatflowError::Store("contacts unavailable".to_string()))
        }

        async fn update_conversation_status(
            &self,
            _tenant_id: &str,
            _conversation_id: &str,
            _status: &str,
        ) -> Result<()> {
            Err(ChatflowError::Store("contacts unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_set_variable_renders_value() {
        let def = NodeDefinition::new("set", "action").with_config(Vars::from(json!({
            "action": "set_variable",
            "variable": "greeting",
            "value": "hi {{name}}"
        })));
        let node = ActionNode::create(&def).unwrap();

        let execution = ExecutionContext::new("t1").with_variables(Vars::new().with("name", "Ada"));
        let services = Services::default();
        let store = test_utils::store();
        let result = node.execute(&test_utils::node_ctx(&execution, None, &services, &store)).await.unwrap();
        assert_eq!(result.variables.get_str("greeting"), Some("hi Ada"));
    }

    #[tokio::test]
    async fn test_contact_actions() {
        let services = Services::default();
        let store = test_utils::store();
        let execution = ExecutionContext::new("t1").with_contact("c1").with_variables(Vars::new().with("plan", "pro"));

        let tag = ActionNode::create(&NodeDefinition::new("tag", "action").with_config(Vars::from(json!({"action": "add_tag", "tag": "plan-{{plan}}"})))).unwrap();
        tag.execute(&test_utils::node_ctx(&execution, None, &services, &store)).await.unwrap();

        let get = ActionNode::create(&NodeDefinition::new("get", "action").with_config(Vars::from(json!({"action": "get_contact"})))).unwrap();
        let result = get.execute(&test_utils::node_ctx(&execution, None, &services, &store)).await.unwrap();
        assert_eq!(result.variables.lookup("contact.tags.0"), Some(&json!("plan-pro")));

        let anonymous = ExecutionContext::new("t1");
        let err = tag.execute(&test_utils::node_ctx(&anonymous, None, &services, &store)).await.unwrap_err();
        assert_eq!(err.code(), "missing_contact");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_contact_failure_retryable_unless_disabled() {
        let services = Services::default().with_contacts(Arc::new(ContactsDown));
        let store = test_utils::store();
        let execution = ExecutionContext::new("t1").with_contact("c1");

        let tag = ActionNode::create(&NodeDefinition::new("tag", "action").with_config(Vars::from(json!({"action": "add_tag", "tag": "vip"})))).unwrap();
        let err = tag.execute(&test_utils::node_ctx(&execution, None, &services, &store)).await.unwrap_err();
        assert_eq!(err.code(), "add_tag_failed");
        assert!(err.is_retryable());

        let once = ActionNode::create(&NodeDefinition::new("tag", "action").with_config(Vars::from(json!({"action": "add_tag", "tag": "vip", "retryable": false})))).unwrap();
        let err = once.execute(&test_utils::node_ctx(&execution, None, &services, &store)).await.unwrap_err();
        assert_eq!(err.code(), "add_tag_failed");
        assert!(!err.is_retryable());
    }
}
