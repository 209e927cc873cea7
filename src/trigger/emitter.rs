//! Publish side of the trigger system.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{trace, warn};

use crate::{
    ChatflowError, Result,
    common::Vars,
    trigger::{TriggerEvent, TriggerEventType},
};

/// Consumer of published trigger events.
pub trait EventSink: Send + Sync {
    /// Accepts `event` without processing it inline.
    fn publish(
        &self,
        event: TriggerEvent,
    ) -> Result<()>;
}

/// Pub/sub bus between event producers and the processor.
#[derive(Default)]
pub struct TriggerEventEmitter {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl TriggerEventEmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(
        &self,
        sink: Arc<dyn EventSink>,
    ) {
        self.sinks.write().push(sink);
    }

    /// Drops every subscription.
    pub fn clear(&self) {
        self.sinks.write().clear();
    }

    pub fn subscribers(&self) -> usize {
        self.sinks.read().len()
    }

    /// Hands `event` to every sink.
    ///
    /// Fails when nobody is subscribed or a sink refused the event; the other
    /// sinks still receive it.
    pub fn emit(
        &self,
        event: TriggerEvent,
    ) -> Result<()> {
        let sinks = self.sinks.read().clone();
        if sinks.is_empty() {
            return Err(ChatflowError::Queue(format!("no subscriber for event {}", event.id)));
        }

        trace!(event_id = %event.id, tenant_id = %event.tenant_id, "emit {}", event.event_type.as_ref());
        let mut failure = None;
        for sink in sinks.iter() {
            if let Err(err) = sink.publish(event.clone()) {
                warn!(event_id = %event.id, "event sink refused event: {}", err);
                failure.get_or_insert(err);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    pub fn message_received(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        contact_id: Option<&str>,
        text: &str,
    ) -> Result<()> {
        let mut event = TriggerEvent::new(tenant_id, TriggerEventType::MessageReceived).with_conversation(conversation_id).with_data(Vars::new().with("text", text));
        event.contact_id = contact_id.map(str::to_string);
        self.emit(event)
    }

    pub fn button_clicked(
        &self,
        tenant_id: &str,
        conversation_id: &str,
        contact_id: Option<&str>,
        button_id: &str,
        payload: Option<&str>,
    ) -> Result<()> {
        let mut event = TriggerEvent::new(tenant_id, TriggerEventType::ButtonClicked)
            .with_conversation(conversation_id)
            .with_data(Vars::new().with("button_id", button_id).with("payload", payload));
        event.contact_id = contact_id.map(str::to_string);
        self.emit(event)
    }

    pub fn webhook(
        &self,
        tenant_id: &str,
        webhook_id: &str,
        method: &str,
        headers: Vars,
        body: Value,
    ) -> Result<()> {
        let event = TriggerEvent::new(tenant_id, TriggerEventType::Webhook)
            .with_data(Vars::new().with("webhook_id", webhook_id).with("method", method.to_uppercase()).with("headers", headers).with("body", body));
        self.emit(event)
    }

    /// Publishes a contact lifecycle event (`contact_created`, `contact_updated`, `tag_added`).
    pub fn contact_event(
        &self,
        tenant_id: &str,
        event_type: TriggerEventType,
        contact_id: &str,
        data: Vars,
    ) -> Result<()> {
        if !matches!(event_type, TriggerEventType::ContactCreated | TriggerEventType::ContactUpdated | TriggerEventType::TagAdded) {
            return Err(ChatflowError::Trigger(format!("{} is not a contact event", event_type.as_ref())));
        }
        self.emit(TriggerEvent::new(tenant_id, event_type).with_contact(contact_id).with_data(data))
    }

    pub fn custom(
        &self,
        tenant_id: &str,
        name: &str,
        contact_id: Option<&str>,
        data: Vars,
    ) -> Result<()> {
        let mut event = TriggerEvent::new(tenant_id, TriggerEventType::Custom).with_data(data.with("event", name));
        event.contact_id = contact_id.map(str::to_string);
        self.emit(event)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TriggerEvent>>);

    impl EventSink for Recorder {
        fn publish(
            &self,
            event: TriggerEvent,
        ) -> Result<()> {
            self.0.lock().push(event);
            Ok(())
        }
    }

    #[test]
    fn test_emit_reaches_all_sinks() {
        let emitter = TriggerEventEmitter::new();
        assert!(emitter.message_received("t1", "conv1", None, "hi").is_err());

        let (a, b) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        emitter.subscribe(a.clone());
        emitter.subscribe(b.clone());
        emitter.message_received("t1", "conv1", Some("c1"), "hi").unwrap();
        emitter.custom("t1", "order_paid", None, Vars::new()).unwrap();

        assert_eq!(a.0.lock().len(), 2);
        assert_eq!(b.0.lock()[0].text(), Some("hi"));
        assert_eq!(b.0.lock()[1].data.get_str("event"), Some("order_paid"));
        assert!(emitter.contact_event("t1", TriggerEventType::Scheduled, "c1", Vars::new()).is_err());
    }
}
