//! SQS adapter tests against LocalStack.
//!
//! Skipped unless LocalStack answers on localhost:4566:
//! docker run -p 4566:4566 localstack/localstack

#![cfg(feature = "sqs")]

use std::sync::Arc;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::Client;

use fc_common::{MediationType, Message};
use fc_queue::sqs::SqsQueue;
use fc_queue::{MessageCallback, QueueClient};

const LOCALSTACK_ENDPOINT: &str = "http://localhost:4566";

async fn create_test_client() -> Client {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .endpoint_url(LOCALSTACK_ENDPOINT)
        .load()
        .await;

    Client::new(&config)
}

async fn setup_test_queue(client: &Client, name: &str) -> String {
    let _ = client
        .delete_queue()
        .queue_url(format!("{}/000000000000/{}", LOCALSTACK_ENDPOINT, name))
        .send()
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let result = client
        .create_queue()
        .queue_name(name)
        .send()
        .await
        .expect("Failed to create queue");

    result.queue_url().unwrap().to_string()
}

fn create_test_message(id: &str) -> Message {
    Message {
        id: id.to_string(),
        pool_code: "DEFAULT".to_string(),
        auth_token: None,
        signing_secret: None,
        mediation_type: MediationType::HTTP,
        mediation_target: "http://localhost:8080/test".to_string(),
        message_group_id: None,
    }
}

async fn send(client: &Client, queue_url: &str, body: String) {
    client
        .send_message()
        .queue_url(queue_url)
        .message_body(body)
        .send()
        .await
        .expect("Failed to send message");
}

async fn is_localstack_available() -> bool {
    reqwest::Client::new()
        .get(format!("{}/_localstack/health", LOCALSTACK_ENDPOINT))
        .timeout(Duration::from_secs(2))
        .send()
        .await
        .map(|resp| resp.status().is_success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_receive_and_delete() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue_url = setup_test_queue(&client, "fc-receive-delete").await;
    send(&client, &queue_url, serde_json::to_string(&create_test_message("msg-1")).unwrap()).await;

    let queue = SqsQueue::new(client, queue_url, 30).with_wait_time_seconds(1);
    queue.connect().await.expect("connect failed");
    assert_eq!(queue.identifier(), "fc-receive-delete");

    let received = queue.receive(10).await.expect("receive failed");
    assert_eq!(received.len(), 1);
    assert!(received[0].broker_message_id.is_some());

    queue.delete(&received[0].receipt_handle).await.expect("delete failed");
    assert!(queue.receive(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_callback_nack_hides_message() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue_url = setup_test_queue(&client, "fc-callback-nack").await;
    send(&client, &queue_url, serde_json::to_string(&create_test_message("msg-nack")).unwrap()).await;

    let queue = Arc::new(SqsQueue::new(client, queue_url, 30).with_wait_time_seconds(1));
    let raw = queue.receive(10).await.unwrap().remove(0);

    let callback = MessageCallback::detached(queue.clone(), raw.receipt_handle, 30);
    assert!(callback.nack(Some(60)).await.unwrap());
    assert!(!callback.nack(Some(60)).await.unwrap());

    assert!(queue.receive(10).await.unwrap().is_empty());
    let depth = queue.depth().await.unwrap().unwrap();
    assert_eq!(depth.not_visible, 1);
}

#[tokio::test]
async fn test_connect_fails_for_missing_queue() {
    if !is_localstack_available().await {
        eprintln!("Skipping test - LocalStack not available");
        return;
    }

    let client = create_test_client().await;
    let queue = SqsQueue::new(
        client,
        format!("{}/000000000000/does-not-exist", LOCALSTACK_ENDPOINT),
        30,
    );
    assert!(queue.connect().await.is_err());
}
