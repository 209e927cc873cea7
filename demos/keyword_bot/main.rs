use std::time::Duration;

use chatflow::{ChannelEvent, ChannelOptions, ChatflowBuilder, FlowDefinition, TriggerConfig, TriggerType, Vars};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let chatflow = ChatflowBuilder::new().build().unwrap();
    chatflow.start().unwrap();

    let def = FlowDefinition::from_json(include_str!("./flow.json")).unwrap();
    chatflow.deploy(def).unwrap();

    let conditions = Vars::new().with("keywords", ["order", "where is my"]).with("mode", "contains");
    chatflow.register_trigger("acme", "order_status", "order keywords", TriggerConfig::new(TriggerType::Keyword).with_conditions(conditions)).unwrap();

    ChannelEvent::channel(chatflow.engine().channel(), ChannelOptions::with_flow("order_status")).unwrap().on_complete(move |execution_id| {
        println!("Flow completed, execution: {}", execution_id);
    });

    let emitter = chatflow.emitter();
    for text in ["hi, where is my order?", "12ab", "90210"] {
        println!("> {}", text);
        emitter.message_received("acme", "conv-1", Some("contact-1"), text).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    chatflow.shutdown().await;
}
