mod models;
mod node;

pub use models::{WebhookAuth, WebhookConfig, WebhookMethod};
pub use node::WebhookNode;
