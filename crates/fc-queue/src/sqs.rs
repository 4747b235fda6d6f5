use async_trait::async_trait;
use aws_sdk_sqs::{types::QueueAttributeName, Client};
use tracing::{debug, info};

use crate::{QueueClient, QueueDepth, QueueError, RawMessage, Result};

/// AWS SQS adapter
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout_seconds: i32,
    wait_time_seconds: i32,
}

impl SqsQueue {
    /// Long poll wait in seconds, the SQS maximum.
    /// `QueueConsumer::stop` waits for at most one such poll.
    pub const DEFAULT_WAIT_TIME_SECONDS: i32 = 20;

    /// SQS refuses more than 10 messages per receive
    pub const MAX_BATCH: u32 = 10;

    pub fn new(client: Client, queue_url: String, visibility_timeout_seconds: i32) -> Self {
        let queue_name = queue_name_from_url(&queue_url);
        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds,
            wait_time_seconds: Self::DEFAULT_WAIT_TIME_SECONDS,
        }
    }

    /// Set the long poll wait time in seconds (clamped to 0..=20)
    pub fn with_wait_time_seconds(mut self, seconds: i32) -> Self {
        self.wait_time_seconds = seconds.clamp(0, 20);
        self
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

fn queue_name_from_url(queue_url: &str) -> String {
    queue_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(queue_url)
        .to_string()
}

fn sqs_error(e: impl std::fmt::Display) -> QueueError {
    QueueError::Sqs(e.to_string())
}

#[async_trait]
impl QueueClient for SqsQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn connect(&self) -> Result<()> {
        self.client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| QueueError::Connection {
                queue: self.queue_name.clone(),
                reason: e.to_string(),
            })?;
        info!(queue = %self.queue_name, "Connected to SQS queue");
        Ok(())
    }

    async fn receive(&self, max_messages: u32) -> Result<Vec<RawMessage>> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, Self::MAX_BATCH) as i32)
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(self.wait_time_seconds)
            .send()
            .await
            .map_err(sqs_error)?;

        let messages: Vec<RawMessage> = result
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| {
                let receipt_handle = m.receipt_handle?;
                Some(RawMessage {
                    body: m.body.unwrap_or_default(),
                    receipt_handle,
                    broker_message_id: m.message_id,
                })
            })
            .collect();

        if !messages.is_empty() {
            debug!(queue = %self.queue_name, count = messages.len(), "Received messages from SQS");
        }
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(sqs_error)?;
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(sqs_error)?;
        Ok(())
    }

    async fn depth(&self) -> Result<Option<QueueDepth>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(sqs_error)?;

        let attributes = result.attributes();
        let read = |name: &QueueAttributeName| {
            attributes
                .and_then(|attrs| attrs.get(name))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        Ok(Some(QueueDepth {
            pending: read(&QueueAttributeName::ApproximateNumberOfMessages),
            not_visible: read(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
        }))
    }
}
