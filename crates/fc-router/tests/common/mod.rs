//! Shared fixtures for router integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use fc_common::{MediationType, Message};
use fc_queue::{MemoryQueue, MessageCallback, QueueClient, ReceivedMessage};
use fc_router::{MediationResult, Mediator};

type StartHook = Box<dyn Fn(&str) + Send + Sync>;

/// Mediator with scripted per-message results and delays that records call
/// order, start times and the peak number of concurrent calls
pub struct ScriptedMediator {
    delay: Duration,
    delays: Mutex<HashMap<String, Duration>>,
    results: Mutex<HashMap<String, MediationResult>>,
    calls: Mutex<Vec<String>>,
    starts: Mutex<Vec<Instant>>,
    on_start: Option<StartHook>,
    current: AtomicU32,
    peak: AtomicU32,
}

impl ScriptedMediator {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            delays: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            starts: Mutex::new(Vec::new()),
            on_start: None,
            current: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        }
    }

    /// Result for one message id; everything else succeeds
    pub fn script(self, message_id: &str, result: MediationResult) -> Self {
        self.results.lock().insert(message_id.to_string(), result);
        self
    }

    /// Delay for one message id instead of the default
    pub fn script_delay(self, message_id: &str, delay: Duration) -> Self {
        self.delays.lock().insert(message_id.to_string(), delay);
        self
    }

    /// Called with the message id as each mediation starts
    pub fn on_start(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.starts.lock().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mediator for ScriptedMediator {
    async fn mediate(&self, message: &Message) -> MediationResult {
        if let Some(hook) = &self.on_start {
            hook(&message.id);
        }
        self.calls.lock().push(message.id.clone());
        self.starts.lock().push(Instant::now());
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().get(&message.id).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.results
            .lock()
            .get(&message.id)
            .cloned()
            .unwrap_or(MediationResult::Success)
    }
}

pub fn message(id: &str, pool_code: &str, group_id: Option<&str>) -> Message {
    Message {
        id: id.to_string(),
        pool_code: pool_code.to_string(),
        auth_token: None,
        signing_secret: None,
        mediation_type: MediationType::HTTP,
        mediation_target: "http://localhost:8080/process".to_string(),
        message_group_id: group_id.map(str::to_string),
    }
}

/// Publish `message` and receive it straight back, the way a consumer would
pub async fn deliver(queue: &Arc<MemoryQueue>, message: Message) -> ReceivedMessage {
    queue.publish(&message).unwrap();
    let raw = queue.receive(1).await.unwrap().remove(0);
    ReceivedMessage {
        message,
        callback: Arc::new(MessageCallback::detached(queue.clone(), raw.receipt_handle, 30)),
        broker_message_id: raw.broker_message_id,
        queue_identifier: queue.identifier().to_string(),
    }
}

/// Poll `condition` every 10ms until it holds, panicking after `timeout`
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
