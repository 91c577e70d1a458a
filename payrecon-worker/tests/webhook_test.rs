//! Webhook delivery against an in-process receiver.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use payrecon::messages::{webhook_delivery_type, WebhookDelivery};
use payrecon::{MessageId, OutboxHandler, OutboxMessage, OutboxStatus, WorkerId};
use payrecon_worker::{WebhookHandler, EVENT_HEADER, IDEMPOTENCY_KEY_HEADER};
use serde_json::{json, Value};

#[derive(Debug, Clone)]
struct Received {
    idempotency_key: Option<String>,
    event: Option<String>,
    body: Value,
}

#[derive(Clone)]
struct Receiver {
    status: StatusCode,
    received: Arc<Mutex<Vec<Received>>>,
}

async fn receive(
    State(receiver): State<Receiver>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    receiver.received.lock().unwrap().push(Received {
        idempotency_key: header(IDEMPOTENCY_KEY_HEADER),
        event: header(EVENT_HEADER),
        body,
    });
    receiver.status
}

async fn spawn_receiver(status: StatusCode) -> (String, Arc<Mutex<Vec<Received>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/hooks", post(receive))
        .with_state(Receiver {
            status,
            received: Arc::clone(&received),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{address}/hooks"), received)
}

fn message(payload: Value) -> OutboxMessage {
    let now = Utc::now();
    OutboxMessage {
        id: MessageId::try_new(42).unwrap(),
        message_type: webhook_delivery_type().unwrap(),
        payload,
        partition_key: None,
        status: OutboxStatus::Processing,
        retry_count: 0,
        next_attempt_at: now,
        claimed_by: Some(WorkerId::try_new("dispatcher-test").unwrap()),
        created_at: now,
        processed_at: None,
        last_error: None,
    }
}

fn delivery(url: &str) -> OutboxMessage {
    message(
        serde_json::to_value(WebhookDelivery {
            url: url.to_owned(),
            event: "order.paid".to_owned(),
            body: json!({"order_id": "ORD-1", "amount": "150.00"}),
        })
        .unwrap(),
    )
}

fn handler() -> WebhookHandler {
    WebhookHandler::new(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn delivers_body_with_event_and_idempotency_headers() {
    let (url, received) = spawn_receiver(StatusCode::OK).await;

    handler().handle(&delivery(&url)).await.unwrap();

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].idempotency_key.as_deref(), Some("42"));
    assert_eq!(received[0].event.as_deref(), Some("order.paid"));
    assert_eq!(received[0].body["order_id"], "ORD-1");
}

#[tokio::test]
async fn receiver_outage_is_retryable() {
    let (url, _) = spawn_receiver(StatusCode::SERVICE_UNAVAILABLE).await;

    let error = handler().handle(&delivery(&url)).await.unwrap_err();

    assert!(error.is_retryable());
}

#[tokio::test]
async fn receiver_rejection_is_fatal() {
    let (url, _) = spawn_receiver(StatusCode::GONE).await;

    let error = handler().handle(&delivery(&url)).await.unwrap_err();

    assert!(!error.is_retryable());
}

#[tokio::test]
async fn unreachable_receiver_is_retryable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let error = handler()
        .handle(&delivery(&format!("http://{address}/hooks")))
        .await
        .unwrap_err();

    assert!(error.is_retryable());
}

#[tokio::test]
async fn malformed_payload_is_fatal() {
    let error = handler()
        .handle(&message(json!({"event": "order.paid"})))
        .await
        .unwrap_err();

    assert!(!error.is_retryable());
}
