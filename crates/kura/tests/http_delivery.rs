#![cfg(feature = "http")]

use kura::queue::{HttpDelivery, ITEM_ID_HEADER};
use kura::value::encode_value;
use kura::{Delivery, ErrorKind, ItemStatus, LocalQueue, Queue, QueueItem, RetryPolicy, Value, WorldError};
use mockito::Matcher;
use std::sync::Arc;
use std::time::Duration;

fn approval() -> QueueItem {
    QueueItem::with_id(
        "msg_1",
        "approve",
        Value::map([
            ("approved", Value::Bool(true)),
            ("token", Value::Bytes(vec![0, 1, 2])),
        ]),
    )
}

#[tokio::test]
async fn test_posts_json_with_item_id_header() {
    let mut server = mockito::Server::new_async().await;
    let item = approval();
    let body = String::from_utf8(encode_value(&item.payload).unwrap()).unwrap();
    let mock = server
        .mock("POST", "/hooks/approve")
        .match_header(ITEM_ID_HEADER, "msg_1")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Exact(body))
        .with_status(204)
        .create_async()
        .await;

    let delivery = HttpDelivery::new(format!("{}/hooks/", server.url()));
    delivery.deliver(&item).await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_status_codes_map_to_error_kinds() {
    let mut server = mockito::Server::new_async().await;
    let delivery = HttpDelivery::new(server.url());

    for (status, kind) in [
        (500, ErrorKind::Transient),
        (503, ErrorKind::Transient),
        (429, ErrorKind::Transient),
        (404, ErrorKind::Delivery),
        (400, ErrorKind::Delivery),
    ] {
        let mock = server
            .mock("POST", "/approve")
            .with_status(status)
            .create_async()
            .await;
        let error = delivery.deliver(&approval()).await.unwrap_err();
        assert_eq!(error.kind(), kind, "status {status} gave {error}");
        mock.remove_async().await;
    }
}

#[tokio::test]
async fn test_unreachable_endpoint_is_transient() {
    let delivery = HttpDelivery::new("http://127.0.0.1:1");
    let error = delivery.deliver(&approval()).await.unwrap_err();
    assert!(error.is_retryable(), "{error}");
}

#[tokio::test]
async fn test_queue_retries_server_errors_up_to_bound() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/approve")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let queue = LocalQueue::new(
        Arc::new(HttpDelivery::new(server.url())),
        RetryPolicy::fixed(3, Duration::from_millis(5)),
    );
    queue.start().await.unwrap();
    queue.enqueue(approval()).await.unwrap();
    queue.wait_idle().await;

    mock.assert_async().await;
    assert!(matches!(
        queue.status(&"msg_1".into()),
        Some(ItemStatus::Failed {
            attempts: 3,
            error: WorldError::Delivery { .. }
        })
    ));
}
