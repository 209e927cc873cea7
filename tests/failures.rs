use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chatflow::{
    Chatflow, ChatflowBuilder, ChatflowError, Config, ExecutionContext, ExecutionStatus, FlowSettings, Result, TimeoutAction, Vars,
    model::{FlowDefinition, NodeDefinition},
    services::{ConversationRef, IntegrationClient, MessageAck, MessageSender, Services},
    store::{MemStore, data::StepStatus},
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<String>>,
}

impl Recorder {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MessageSender for Recorder {
    async fn send(
        &self,
        _conversation: &ConversationRef,
        text: &str,
        _media: &[String],
    ) -> Result<MessageAck> {
        let mut sent = self.sent.lock();
        sent.push(text.to_string());
        Ok(MessageAck {
            message_id: format!("m{}", sent.len()),
            delivered_at: Utc::now(),
        })
    }
}

/// Fails its first `failures` calls with `error`, then answers.
struct Flaky {
    calls: AtomicUsize,
    failures: usize,
    error: fn() -> ChatflowError,
    delay: Duration,
}

impl Flaky {
    fn new(
        failures: usize,
        error: fn() -> ChatflowError,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures,
            error,
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: 0,
            error: || ChatflowError::fatal("unused", "unused"),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrationClient for Flaky {
    async fn call(
        &self,
        _tenant_id: &str,
        _integration: &str,
        _operation: &str,
        _params: &Value,
    ) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if n < self.failures {
            return Err((self.error)());
        }
        Ok(json!({ "order": "shipped" }))
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.scheduler.poll_interval_ms = 10;
    config
}

fn build(
    recorder: Arc<Recorder>,
    services: Services,
    db: MemStore,
) -> Chatflow {
    let chatflow = ChatflowBuilder::new().config(config()).services(services.with_messenger(recorder)).store(db).build().unwrap();
    chatflow.start().unwrap();
    chatflow
}

fn flow(
    id: &str,
    settings: FlowSettings,
    nodes: Vec<NodeDefinition>,
) -> FlowDefinition {
    FlowDefinition {
        id: id.to_string(),
        tenant_id: "acme".to_string(),
        start_node: "start".to_string(),
        nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        settings,
        ..Default::default()
    }
}

fn lookup(next: &str) -> NodeDefinition {
    NodeDefinition::new("lookup", "integration").with_config(Vars::new().with("integration", "shop").with("operation", "order_status").with("output_variable", "order")).connect(next)
}

fn message(
    id: &str,
    text: &str,
) -> NodeDefinition {
    NodeDefinition::new(id, "message").with_config(Vars::new().with("text", text))
}

fn ctx(conversation_id: &str) -> ExecutionContext {
    ExecutionContext::new("acme").with_conversation(conversation_id).with_contact("contact-1")
}

async fn wait_for_status(
    chatflow: &Chatflow,
    execution_id: &str,
    status: ExecutionStatus,
) {
    for _ in 0..300 {
        if chatflow.engine().get_execution_info(execution_id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {} never reached {}", execution_id, status.as_ref());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retryable_failure_backs_off_then_succeeds() {
    let recorder = Arc::new(Recorder::default());
    let shop = Flaky::new(2, || ChatflowError::retryable("shop_busy", "try later"));
    let chatflow = build(recorder.clone(), Services::default().with_integrations(shop.clone()), MemStore::new());
    let settings = FlowSettings {
        retry_attempts: 3,
        retry_backoff_ms: 20,
        ..Default::default()
    };
    chatflow
        .deploy(flow("orders", settings, vec![NodeDefinition::new("start", "start").connect("lookup"), lookup("reply"), message("reply", "Order {{order.order}}")]))
        .unwrap();

    let started = Instant::now();
    let result = chatflow.engine().execute_flow("orders", ctx("conv-1")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(shop.calls(), 3);
    // 20ms then 40ms
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(recorder.texts(), vec!["Order shipped"]);

    let steps = chatflow.engine().get_execution_steps(&result.execution_id).unwrap();
    let lookup = steps.iter().find(|s| s.node_id == "lookup").unwrap();
    assert_eq!((lookup.attempts, lookup.status), (3, StepStatus::Succeeded));
    assert_eq!(steps.iter().map(|s| s.node_id.as_str()).collect::<Vec<_>>(), vec!["start", "lookup", "reply"]);
    chatflow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retries_exhausted_fail_execution() {
    let recorder = Arc::new(Recorder::default());
    let shop = Flaky::new(usize::MAX, || ChatflowError::retryable("shop_busy", "try later"));
    let chatflow = build(recorder.clone(), Services::default().with_integrations(shop.clone()), MemStore::new());
    let settings = FlowSettings {
        retry_attempts: 2,
        retry_backoff_ms: 5,
        ..Default::default()
    };
    chatflow
        .deploy(flow("orders", settings, vec![NodeDefinition::new("start", "start").connect("lookup"), lookup("reply"), message("reply", "unreachable")]))
        .unwrap();

    let result = chatflow.engine().execute_flow("orders", ctx("conv-2")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(shop.calls(), 3);
    assert!(result.error.unwrap().contains("try later"));
    assert!(recorder.texts().is_empty());

    let steps = chatflow.engine().get_execution_steps(&result.execution_id).unwrap();
    assert_eq!(steps.last().map(|s| (s.attempts, s.status)), Some((3, StepStatus::Failed)));
    chatflow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fatal_failure_is_not_retried() {
    let recorder = Arc::new(Recorder::default());
    let shop = Flaky::new(usize::MAX, || ChatflowError::fatal("unknown_order", "no such order"));
    let chatflow = build(recorder.clone(), Services::default().with_integrations(shop.clone()), MemStore::new());
    let settings = FlowSettings {
        retry_attempts: 3,
        retry_backoff_ms: 5,
        ..Default::default()
    };
    chatflow
        .deploy(flow("orders", settings, vec![NodeDefinition::new("start", "start").connect("lookup"), lookup("reply"), message("reply", "unreachable")]))
        .unwrap();

    let result = chatflow.engine().execute_flow("orders", ctx("conv-3")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(shop.calls(), 1);
    assert!(result.error.unwrap().contains("no such order"));
    chatflow.shutdown().await;
}

fn overtime_flow(action: TimeoutAction) -> FlowDefinition {
    let settings = FlowSettings {
        max_execution_time_secs: 1,
        timeout_action: action,
        ..Default::default()
    };
    flow(
        &format!("overtime-{}", action.as_ref()),
        settings,
        vec![NodeDefinition::new("start", "start").connect("lookup"), lookup("reply"), message("reply", "done")],
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_time_limit_actions() {
    let recorder = Arc::new(Recorder::default());
    let shop = Flaky::slow(Duration::from_millis(1100));
    let chatflow = build(recorder.clone(), Services::default().with_integrations(shop), MemStore::new());
    for action in [TimeoutAction::Fail, TimeoutAction::Continue, TimeoutAction::Retry] {
        chatflow.deploy(overtime_flow(action)).unwrap();
    }

    let failed = chatflow.engine().execute_flow("overtime-fail", ctx("conv-4")).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.error.unwrap().contains("time limit"));

    let continued = chatflow.engine().execute_flow("overtime-continue", ctx("conv-5")).await.unwrap();
    assert_eq!(continued.status, ExecutionStatus::Completed);
    assert_eq!(recorder.texts(), vec!["done"]);

    // the rest of the run moves to a fresh segment through the scheduler
    let retried = chatflow.engine().execute_flow("overtime-retry", ctx("conv-6")).await.unwrap();
    assert_eq!(retried.status, ExecutionStatus::Waiting);
    wait_for_status(&chatflow, &retried.execution_id, ExecutionStatus::Completed).await;
    assert_eq!(recorder.texts(), vec!["done", "done"]);
    chatflow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pause_then_resume() {
    let recorder = Arc::new(Recorder::default());
    let chatflow = build(recorder.clone(), Services::default(), MemStore::new());
    chatflow
        .deploy(flow(
            "nudge",
            FlowSettings::default(),
            vec![
                NodeDefinition::new("start", "start").connect("later"),
                NodeDefinition::new("later", "delay").with_config(Vars::new().with("seconds", 60)).connect("ping"),
                message("ping", "still there?"),
            ],
        ))
        .unwrap();

    let result = chatflow.engine().execute_flow("nudge", ctx("conv-7")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Waiting);
    assert!(chatflow.scheduler().next_resume(&result.execution_id).is_some());

    chatflow.engine().pause_execution(&result.execution_id).unwrap();
    assert_eq!(chatflow.engine().get_execution_info(&result.execution_id).unwrap().status, ExecutionStatus::Paused);
    assert!(chatflow.scheduler().next_resume(&result.execution_id).is_none());

    let resumed = chatflow.engine().resume_execution(&result.execution_id, None).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(recorder.texts(), vec!["still there?"]);
    chatflow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_input_wait_expires() {
    let recorder = Arc::new(Recorder::default());
    let chatflow = build(recorder.clone(), Services::default(), MemStore::new());
    let settings = FlowSettings {
        wait_timeout_secs: 1,
        ..Default::default()
    };
    chatflow
        .deploy(flow(
            "survey",
            settings,
            vec![
                NodeDefinition::new("start", "start").connect("ask"),
                NodeDefinition::new("ask", "input").with_config(Vars::new().with("variable", "score").with("prompt", "Rate us")).connect("thanks"),
                message("thanks", "thanks"),
            ],
        ))
        .unwrap();

    let result = chatflow.engine().execute_flow("survey", ctx("conv-8")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Waiting);
    let step = chatflow.engine().get_execution_info(&result.execution_id).unwrap().step_count;

    // not due yet, and a stale step never applies
    assert!(chatflow.engine().expire_execution(&result.execution_id, step).await.unwrap().is_none());
    assert!(chatflow.engine().expire_execution(&result.execution_id, step + 1).await.unwrap().is_none());

    wait_for_status(&chatflow, &result.execution_id, ExecutionStatus::Failed).await;
    let info = chatflow.engine().get_execution_info(&result.execution_id).unwrap();
    assert!(info.error.unwrap().contains("expired"));
    assert_eq!(recorder.texts(), vec!["Rate us"]);

    // a late reply finds nothing waiting
    assert!(chatflow.engine().find_waiting_for_input("acme", "conv-8").unwrap().is_none());
    assert!(chatflow.engine().expire_execution(&result.execution_id, step).await.unwrap().is_none());
    chatflow.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recover_rearms_timers_after_restart() {
    let db = MemStore::new();
    let recorder = Arc::new(Recorder::default());
    let before = build(recorder.clone(), Services::default(), db.clone());
    before
        .deploy(flow(
            "later",
            FlowSettings::default(),
            vec![
                NodeDefinition::new("start", "start").connect("pause"),
                NodeDefinition::new("pause", "delay").with_config(Vars::new().with("milliseconds", 300)).connect("ping"),
                message("ping", "back again"),
            ],
        ))
        .unwrap();
    let result = before.engine().execute_flow("later", ctx("conv-9")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Waiting);
    before.shutdown().await;

    let after = build(recorder.clone(), Services::default(), db);
    assert!(after.scheduler().next_resume(&result.execution_id).is_some());
    wait_for_status(&after, &result.execution_id, ExecutionStatus::Completed).await;
    assert_eq!(recorder.texts(), vec!["back again"]);
    after.shutdown().await;
}

/// Answers every request with `status` and counts the hits.
async fn http_stub(status: &'static str) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/orders", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!("HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (url, hits)
}

fn webhook_flow(
    id: &str,
    url: &str,
) -> FlowDefinition {
    let settings = FlowSettings {
        retry_attempts: 2,
        retry_backoff_ms: 5,
        ..Default::default()
    };
    flow(
        id,
        settings,
        vec![
            NodeDefinition::new("start", "start").connect("notify"),
            NodeDefinition::new("notify", "webhook").with_config(Vars::new().with("url", url).with("method", "POST").with("body", json!({"id": "{{order_id}}"}))),
        ],
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_webhook_client_error_is_final() {
    let chatflow = build(Arc::new(Recorder::default()), Services::default(), MemStore::new());

    let (missing, missing_hits) = http_stub("404 Not Found").await;
    chatflow.deploy(webhook_flow("notify-missing", &missing)).unwrap();
    let result = chatflow.engine().execute_flow("notify-missing", ctx("conv-10")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(missing_hits.load(Ordering::SeqCst), 1);

    let (busy, busy_hits) = http_stub("503 Service Unavailable").await;
    chatflow.deploy(webhook_flow("notify-busy", &busy)).unwrap();
    let result = chatflow.engine().execute_flow("notify-busy", ctx("conv-11")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(busy_hits.load(Ordering::SeqCst), 3);
    chatflow.shutdown().await;
}
