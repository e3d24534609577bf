//! Exactly-once producer protocol over HTTP.

mod common;

use common::{client, start_memory_server, url};
use reqwest::StatusCode;

async fn create_stream(addr: std::net::SocketAddr, path: &str) {
    let response = client()
        .put(url(addr, path))
        .header("content-type", "application/octet-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

fn producer_post(
    addr: std::net::SocketAddr,
    path: &str,
    id: &str,
    epoch: u64,
    seq: u64,
    body: &'static str,
) -> reqwest::RequestBuilder {
    client()
        .post(url(addr, path))
        .header("content-type", "application/octet-stream")
        .header("producer-id", id)
        .header("producer-epoch", epoch.to_string())
        .header("producer-seq", seq.to_string())
        .body(body)
}

// ---------------------------------------------------------------------------
// Scenario: producer idempotency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepted_retried_gapped_and_reclaimed() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/s").await;

    // First write at (epoch 0, seq 0) is accepted with a 200.
    let accepted = producer_post(addr, "/s", "p", 0, 0, "a").send().await.unwrap();
    assert_eq!(accepted.status(), StatusCode::OK);
    let offset_after_a = accepted.headers()["stream-next-offset"]
        .to_str()
        .unwrap()
        .to_owned();
    assert_eq!(accepted.headers()["producer-seq"], "0");

    // Identical triple: 204, same offset, nothing appended.
    let retried = producer_post(addr, "/s", "p", 0, 0, "a").send().await.unwrap();
    assert_eq!(retried.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        retried.headers()["stream-next-offset"].to_str().unwrap(),
        offset_after_a
    );
    assert_eq!(retried.headers()["producer-seq"], "0");

    let body = client()
        .get(url(addr, "/s?offset=-1"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(body.as_ref(), b"a", "duplicate must not append bytes");

    // Sequence gap: 409 with expected/received headers.
    let gap = producer_post(addr, "/s", "p", 0, 2, "b").send().await.unwrap();
    assert_eq!(gap.status(), StatusCode::CONFLICT);
    assert_eq!(gap.headers()["producer-expected-seq"], "1");
    assert_eq!(gap.headers()["producer-received-seq"], "2");

    // A new epoch restarts the sequence space.
    let reclaimed = producer_post(addr, "/s", "p", 1, 0, "b").send().await.unwrap();
    assert_eq!(reclaimed.status(), StatusCode::OK);
}

#[tokio::test]
async fn stale_epoch_is_403_with_the_current_epoch() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/s").await;

    producer_post(addr, "/s", "p", 3, 0, "x").send().await.unwrap();
    let stale = producer_post(addr, "/s", "p", 2, 0, "y").send().await.unwrap();
    assert_eq!(stale.status(), StatusCode::FORBIDDEN);
    assert_eq!(stale.headers()["producer-epoch"], "3");
}

#[tokio::test]
async fn higher_epoch_with_nonzero_seq_is_invalid() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/s").await;

    producer_post(addr, "/s", "p", 0, 0, "x").send().await.unwrap();
    let invalid = producer_post(addr, "/s", "p", 5, 3, "y").send().await.unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_producer_must_begin_at_seq_zero() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/s").await;

    let gap = producer_post(addr, "/s", "fresh", 0, 4, "x").send().await.unwrap();
    assert_eq!(gap.status(), StatusCode::CONFLICT);
    assert_eq!(gap.headers()["producer-expected-seq"], "0");
    assert_eq!(gap.headers()["producer-received-seq"], "4");
}

#[tokio::test]
async fn partial_producer_headers_are_a_client_error() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/s").await;

    let partial = client()
        .post(url(addr, "/s"))
        .header("content-type", "application/octet-stream")
        .header("producer-id", "p")
        .header("producer-seq", "0")
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(partial.status(), StatusCode::BAD_REQUEST);

    let unparseable = client()
        .post(url(addr, "/s"))
        .header("content-type", "application/octet-stream")
        .header("producer-id", "p")
        .header("producer-epoch", "zero")
        .header("producer-seq", "0")
        .body("x")
        .send()
        .await
        .unwrap();
    assert_eq!(unparseable.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn independent_producers_do_not_interfere() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/s").await;

    producer_post(addr, "/s", "alpha", 0, 0, "a0").send().await.unwrap();
    producer_post(addr, "/s", "beta", 0, 0, "b0").send().await.unwrap();
    let a1 = producer_post(addr, "/s", "alpha", 0, 1, "a1").send().await.unwrap();
    assert_eq!(a1.status(), StatusCode::OK);
    let b1 = producer_post(addr, "/s", "beta", 0, 1, "b1").send().await.unwrap();
    assert_eq!(b1.status(), StatusCode::OK);

    let body = client()
        .get(url(addr, "/s?offset=-1"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(body.as_ref(), b"a0b0a1b1");
}

#[tokio::test]
async fn stream_seq_conflicts_are_409_after_producer_dedup() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/s").await;

    let first = producer_post(addr, "/s", "p", 0, 0, "a")
        .header("stream-seq", "10")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    // Plain writer with a stale watermark: conflict.
    let stale = client()
        .post(url(addr, "/s"))
        .header("content-type", "application/octet-stream")
        .header("stream-seq", "10")
        .body("b")
        .send()
        .await
        .unwrap();
    assert_eq!(stale.status(), StatusCode::CONFLICT);

    // The producer retry carrying the same watermark dedups instead.
    let retry = producer_post(addr, "/s", "p", 0, 0, "a")
        .header("stream-seq", "10")
        .send()
        .await
        .unwrap();
    assert_eq!(retry.status(), StatusCode::NO_CONTENT);
    assert_eq!(retry.headers()["producer-seq"], "0");
}
