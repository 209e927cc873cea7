use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{
    Method, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    ChatflowError, Result,
    common::Vars,
    flow::template,
    model::NodeDefinition,
    nodes::{NodeContext, NodeExecutor, NodeResult, parse_config},
    runtime::ExecutionContext,
};

use super::models::*;

const STATUS_CODE_KEY: &str = "status_code";
const HEADERS_KEY: &str = "headers";
const BODY_KEY: &str = "body";

/// Calls an HTTP endpoint and stores the response.
#[derive(Debug, Clone)]
pub struct WebhookNode {
    def: NodeDefinition,
    config: WebhookConfig,
}

impl WebhookNode {
    pub fn create(def: &NodeDefinition) -> Result<Self> {
        Ok(Self {
            def: def.clone(),
            config: parse_config(&def.config, &Self::schema())?,
        })
    }

    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {
                    "type": "string",
                    "minLength": 1,
                    "description": "Request URL, supports {{variable}} placeholders"
                },
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"]
                },
                "headers": {
                    "type": "object",
                    "additionalProperties": { "type": "string" }
                },
                "query": {
                    "type": "object",
                    "additionalProperties": { "type": "string" }
                },
                "body": {},
                "auth": {
                    "type": "object",
                    "required": ["type"],
                    "properties": {
                        "type": { "type": "string", "enum": ["none", "bearer", "basic", "api_key"] }
                    }
                },
                "output_variable": { "type": "string", "minLength": 1 },
                "retryable": { "type": "boolean" }
            }
        })
    }

    fn build_request(
        &self,
        client: &reqwest::Client,
        ctx: &ExecutionContext,
    ) -> Result<reqwest::RequestBuilder> {
        let url = template::render(ctx, &self.config.url);
        let method: Method = self.config.method.as_ref().parse().map_err(|_| ChatflowError::fatal("invalid_method", format!("invalid method '{:?}'", self.config.method)))?;

        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("accept"), HeaderValue::from_static("*/*"));
        for (key, value) in &self.config.headers {
            let value = template::render(ctx, value);
            headers.insert(
                key.parse::<HeaderName>().map_err(|err| ChatflowError::fatal("invalid_header", err.to_string()))?,
                value.parse::<HeaderValue>().map_err(|err| ChatflowError::fatal("invalid_header", err.to_string()))?,
            );
        }
        if let WebhookAuth::ApiKey {
            header,
            value,
        } = &self.config.auth
        {
            headers.insert(
                header.parse::<HeaderName>().map_err(|err| ChatflowError::fatal("invalid_header", err.to_string()))?,
                template::render(ctx, value).parse::<HeaderValue>().map_err(|err| ChatflowError::fatal("invalid_header", err.to_string()))?,
            );
        }

        let query: Vec<(String, String)> = self.config.query.iter().map(|(k, v)| (k.clone(), template::render(ctx, v))).collect();

        let mut request = client.request(method, &url).headers(headers).query(&query);
        request = match &self.config.auth {
            WebhookAuth::Bearer {
                token,
            } => request.bearer_auth(template::render(ctx, token)),
            WebhookAuth::Basic {
                username,
                password,
            } => request.basic_auth(template::render(ctx, username), password.as_ref().map(|p| template::render(ctx, p))),
            WebhookAuth::None
            | WebhookAuth::ApiKey {
                ..
            } => request,
        };
        if let Some(body) = &self.config.body {
            request = request.json(&template::render_value(ctx, body));
        }
        Ok(request)
    }

    async fn call(
        &self,
        ctx: &NodeContext<'_>,
    ) -> Result<Value> {
        let request = self.build_request(&ctx.services.http, ctx.execution)?;
        let response = request.send().await.map_err(|err| ChatflowError::retryable("http_error", err.to_string()))?;

        let status = response.status();
        let headers: HashMap<String, String> = response.headers().iter().map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string())).collect();
        let text = response.text().await.map_err(|err| ChatflowError::retryable("http_error", err.to_string()))?;
        debug!(node_id = %self.def.id, status = status.as_u16(), "webhook responded");

        if !status.is_success() {
            let code = format!("http_{}", status.as_u16());
            return Err(if is_retryable_status(status) {
                ChatflowError::retryable(code, text)
            } else {
                ChatflowError::fatal(code, text)
            });
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(Vars::new().with(STATUS_CODE_KEY, status.as_u16()).with(HEADERS_KEY, headers).with(BODY_KEY, body).into())
    }
}

/// Client errors are final except for request timeout and throttling.
fn is_retryable_status(status: StatusCode) -> bool {
    if status.is_client_error() {
        return matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS);
    }
    true
}

#[async_trait]
impl NodeExecutor for WebhookNode {
    fn definition(&self) -> &NodeDefinition {
        &self.def
    }

    fn set_config(
        &mut self,
        config: Vars,
    ) -> Result<()> {
        self.config = parse_config(&config, &Self::schema())?;
        self.def.config = config;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for key in self.config.headers.keys() {
            key.parse::<HeaderName>().map_err(|err| ChatflowError::Validation(format!("webhook node '{}' header '{}': {}", self.def.id, key, err)))?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeResult> {
        let response = ctx.guarded("webhook_failed", self.config.retryable, self.call(ctx)).await?;
        Ok(NodeResult::proceed().with_variable(&self.config.output_variable, response.clone()).with_output(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
    }

    #[test]
    fn test_build_request_renders_templates() {
        let def = NodeDefinition::new("hook", "webhook").with_config(Vars::from(json!({
            "url": "https://api.example.com/orders/{{order_id}}",
            "method": "POST",
            "headers": { "x-tenant": "{{tenant}}" },
            "auth": { "type": "bearer", "token": "secret" },
            "body": { "id": "{{order_id}}" }
        })));
        let node = WebhookNode::create(&def).unwrap();
        node.validate().unwrap();

        let ctx = ExecutionContext::new("t1").with_variables(Vars::new().with("order_id", 42).with("tenant", "acme"));
        let request = node.build_request(&reqwest::Client::new(), &ctx).unwrap().build().unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().as_str(), "https://api.example.com/orders/42");
        assert_eq!(request.headers()["x-tenant"], "acme");
        assert_eq!(request.headers()["authorization"], "Bearer secret");
    }

    #[test]
    fn test_invalid_method_rejected() {
        let def = NodeDefinition::new("hook", "webhook").with_config(Vars::from(json!({"url": "http://x", "method": "TRACE"})));
        assert!(WebhookNode::create(&def).is_err());
    }
}
