use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_output_variable() -> String {
    "webhook_response".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, strum::AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[default]
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: Option<String>,
    },
    ApiKey {
        header: String,
        value: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: WebhookMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// json body, placeholders rendered
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub auth: WebhookAuth,
    #[serde(default = "default_output_variable")]
    pub output_variable: String,
    #[serde(default = "default_true")]
    pub retryable: bool,
}
