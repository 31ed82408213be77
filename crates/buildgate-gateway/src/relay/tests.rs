#![allow(clippy::unwrap_used)]

use std::time::Duration;

use tokio::sync::mpsc;

use super::*;

fn sink(capacity: usize) -> (ResponseSink, mpsc::Receiver<Result<DockerBuildResponse, Status>>) {
    mpsc::channel(capacity)
}

#[tokio::test]
async fn preserves_enqueue_order_across_producers() {
    let (tx, mut rx) = sink(16);
    let relay = StreamRelay::spawn(tx, 4);

    let progress = relay.handle();
    let logs = relay.handle();
    progress.content("M1").await;
    logs.content("M2").await;
    progress.content("M3").await;
    drop((progress, logs));

    let stats = relay.finish().await;
    assert_eq!(stats.delivered, 3);

    let mut seen = Vec::new();
    while let Some(item) = rx.recv().await {
        seen.push(item.unwrap().content);
    }
    assert_eq!(seen, ["M1", "M2", "M3"]);
}

#[tokio::test]
async fn error_message_carries_only_the_error() {
    let (tx, mut rx) = sink(4);
    let relay = StreamRelay::spawn(tx, 4);
    let handle = relay.handle();
    handle.error("upload failed").await;
    drop(handle);
    relay.finish().await;

    let response = rx.recv().await.unwrap().unwrap();
    assert!(response.content.is_empty());
    assert_eq!(response.error.unwrap().message, "upload failed");
    assert!(!response.id.is_empty());
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn every_response_gets_a_fresh_id() {
    let (tx, mut rx) = sink(4);
    let relay = StreamRelay::spawn(tx, 4);
    let handle = relay.handle();
    handle.content("a").await;
    handle.content("b").await;
    drop(handle);
    relay.finish().await;

    let first = rx.recv().await.unwrap().unwrap();
    let second = rx.recv().await.unwrap().unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn write_failure_is_absorbed_and_raises_client_gone() {
    let (tx, rx) = sink(4);
    let relay = StreamRelay::spawn(tx, 4);
    let mut gone = relay.client_gone();
    drop(rx);

    tokio::time::timeout(Duration::from_secs(5), gone.wait())
        .await
        .unwrap();
    assert!(gone.is_gone());

    // Producers keep working after the client left.
    let handle = relay.handle();
    handle.content("lost").await;
    handle.error("also lost").await;
    drop(handle);

    let stats = relay.finish().await;
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.dropped, 2);
}

#[tokio::test]
async fn client_gone_stays_pending_while_the_client_listens() {
    let (tx, _rx) = sink(4);
    let relay = StreamRelay::spawn(tx, 4);
    let mut gone = relay.client_gone();

    let waited = tokio::time::timeout(Duration::from_millis(50), gone.wait()).await;
    assert!(waited.is_err());
    assert!(!gone.is_gone());
    relay.finish().await;
}
