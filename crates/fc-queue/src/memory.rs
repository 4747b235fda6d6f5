//! In-process queue with SQS-style visibility semantics.
//!
//! Used in dev mode and as the broker in tests. Every receive issues a fresh
//! receipt handle, so redelivery behaves like a real broker: the old handle
//! goes stale and the broker message id stays the same.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use fc_common::Message;
use crate::{QueueClient, QueueDepth, QueueError, RawMessage, Result};

#[derive(Debug)]
struct Entry {
    broker_id: String,
    body: String,
    visible_at: Instant,
    receipt_handle: Option<String>,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct Journal {
    deleted: Vec<String>,
    visibility_changes: Vec<u32>,
}

pub struct MemoryQueue {
    name: String,
    visibility_timeout: u32,
    entries: Mutex<Vec<Entry>>,
    journal: Mutex<Journal>,
    reachable: AtomicBool,
    fail_receives: AtomicBool,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, visibility_timeout: u32) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            entries: Mutex::new(Vec::new()),
            journal: Mutex::new(Journal::default()),
            reachable: AtomicBool::new(true),
            fail_receives: AtomicBool::new(false),
        }
    }

    /// Enqueue a message as its JSON body. Returns the broker message id.
    pub fn publish(&self, message: &Message) -> Result<String> {
        let body = serde_json::to_string(message)?;
        Ok(self.publish_body(&body))
    }

    /// Enqueue an arbitrary body, parseable or not.
    pub fn publish_body(&self, body: &str) -> String {
        let broker_id = uuid::Uuid::new_v4().to_string();
        self.entries.lock().push(Entry {
            broker_id: broker_id.clone(),
            body: body.to_string(),
            visible_at: Instant::now(),
            receipt_handle: None,
            receive_count: 0,
        });
        broker_id
    }

    /// Make `connect` fail, simulating an unreachable broker
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every `receive` fail until cleared, simulating a transient outage
    pub fn set_fail_receives(&self, fail: bool) {
        self.fail_receives.store(fail, Ordering::SeqCst);
    }

    /// Messages still stored, visible or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deleted_count(&self) -> usize {
        self.journal.lock().deleted.len()
    }

    pub fn visibility_change_count(&self) -> usize {
        self.journal.lock().visibility_changes.len()
    }

    /// Every visibility change applied so far, in order, in seconds
    pub fn visibility_changes(&self) -> Vec<u32> {
        self.journal.lock().visibility_changes.clone()
    }

    /// How many times the message with this broker id has been received
    pub fn receive_count(&self, broker_id: &str) -> Option<u32> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.broker_id == broker_id)
            .map(|e| e.receive_count)
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Connection {
                queue: self.name.clone(),
                reason: "broker unreachable".to_string(),
            })
        }
    }

    async fn receive(&self, max_messages: u32) -> Result<Vec<RawMessage>> {
        if self.fail_receives.load(Ordering::SeqCst) {
            return Err(QueueError::Connection {
                queue: self.name.clone(),
                reason: "receive failed".to_string(),
            });
        }

        let now = Instant::now();
        let hidden_until = now + Duration::from_secs(self.visibility_timeout as u64);
        let mut entries = self.entries.lock();

        let received: Vec<RawMessage> = entries
            .iter_mut()
            .filter(|e| e.visible_at <= now)
            .take(max_messages as usize)
            .map(|e| {
                let handle = uuid::Uuid::new_v4().to_string();
                e.receipt_handle = Some(handle.clone());
                e.visible_at = hidden_until;
                e.receive_count += 1;
                RawMessage {
                    body: e.body.clone(),
                    receipt_handle: handle,
                    broker_message_id: Some(e.broker_id.clone()),
                }
            })
            .collect();

        if !received.is_empty() {
            debug!(queue = %self.name, count = received.len(), "Received messages from memory queue");
        }
        Ok(received)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let position = entries
            .iter()
            .position(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;
        let entry = entries.remove(position);
        self.journal.lock().deleted.push(entry.broker_id);
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::NotFound(receipt_handle.to_string()))?;
        entry.visible_at = Instant::now() + Duration::from_secs(seconds as u64);
        self.journal.lock().visibility_changes.push(seconds);
        Ok(())
    }

    async fn depth(&self) -> Result<Option<QueueDepth>> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let pending = entries.iter().filter(|e| e.visible_at <= now).count() as u64;
        Ok(Some(QueueDepth {
            pending,
            not_visible: entries.len() as u64 - pending,
        }))
    }
}
