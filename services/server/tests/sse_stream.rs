//! SSE delivery: event framing, control events, payload encoding, closure.

mod common;

use common::{client, start_memory_server, url};
use reqwest::StatusCode;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Minimal SSE parsing for assertions
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
struct SseEvent {
    event: String,
    data: String,
}

fn parse_events(body: &str) -> Vec<SseEvent> {
    body.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(|block| {
            let mut event = String::new();
            let mut data_lines = Vec::new();
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event = rest.trim_start().to_owned();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_owned());
                }
            }
            SseEvent {
                event,
                data: data_lines.join("\n"),
            }
        })
        .collect()
}

fn control_json(event: &SseEvent) -> serde_json::Value {
    serde_json::from_str(&event.data).expect("control event carries JSON")
}

async fn create_stream(addr: std::net::SocketAddr, path: &str, content_type: &str) {
    client()
        .put(url(addr, path))
        .header("content-type", content_type)
        .send()
        .await
        .unwrap();
}

async fn append(addr: std::net::SocketAddr, path: &str, content_type: &str, body: &'static str) {
    client()
        .post(url(addr, path))
        .header("content-type", content_type)
        .body(body)
        .send()
        .await
        .unwrap();
}

async fn close_stream(addr: std::net::SocketAddr, path: &str) {
    client()
        .post(url(addr, path))
        .header("stream-closed", "true")
        .send()
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Catch-up over SSE
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sse_replays_text_history_and_terminates_on_closed() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/t", "text/plain").await;
    append(addr, "/t", "text/plain", "hello").await;
    append(addr, "/t", "text/plain", "world").await;
    close_stream(addr, "/t").await;

    let response = client()
        .get(url(addr, "/t?offset=-1&live=sse"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert!(!response.headers().contains_key("stream-sse-data-encoding"));

    // The closed control event terminates the body, so it can be collected.
    let body = response.text().await.unwrap();
    let events = parse_events(&body);
    let data: Vec<&str> = events
        .iter()
        .filter(|e| e.event == "data")
        .map(|e| e.data.as_str())
        .collect();
    assert_eq!(data, ["hello", "world"]);

    let control = events.iter().find(|e| e.event == "control").unwrap();
    let json = control_json(control);
    assert_eq!(json["streamNextOffset"], "0000000000000000_0000000000000010");
    assert_eq!(json["upToDate"], true);

    let last = events.last().unwrap();
    assert_eq!(last.event, "control");
    assert_eq!(control_json(last)["streamClosed"], true);
}

#[tokio::test]
async fn sse_binary_payloads_are_base64_and_advertised() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/b", "application/octet-stream").await;
    append(addr, "/b", "application/octet-stream", "AB").await;
    close_stream(addr, "/b").await;

    let response = client()
        .get(url(addr, "/b?offset=-1&live=sse"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.headers()["stream-sse-data-encoding"], "base64");

    let body = response.text().await.unwrap();
    let events = parse_events(&body);
    let data_event = events.iter().find(|e| e.event == "data").unwrap();
    assert_eq!(data_event.data, "QUI=");
}

#[tokio::test]
async fn sse_payload_newlines_become_multiple_data_lines() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/t", "text/plain").await;
    append(addr, "/t", "text/plain", "line1\r\nline2").await;
    close_stream(addr, "/t").await;

    let body = client()
        .get(url(addr, "/t?offset=-1&live=sse"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let events = parse_events(&body);
    let data_event = events.iter().find(|e| e.event == "data").unwrap();
    // CRLF collapses to a single logical newline across two data: lines.
    assert_eq!(data_event.data, "line1\nline2");
    assert!(!body.contains("line1\r"));
}

// ---------------------------------------------------------------------------
// Live tailing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sse_at_tail_delivers_appends_as_they_arrive() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/live", "text/plain").await;
    append(addr, "/live", "text/plain", "history").await;

    let reader = tokio::spawn(async move {
        client()
            .get(url(addr, "/live?offset=now&live=sse"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(80)).await;
    append(addr, "/live", "text/plain", "fresh").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    close_stream(addr, "/live").await;

    let body = reader.await.unwrap();
    let events = parse_events(&body);
    let data: Vec<&str> = events
        .iter()
        .filter(|e| e.event == "data")
        .map(|e| e.data.as_str())
        .collect();
    // offset=now resolved at connect time: history is skipped.
    assert_eq!(data, ["fresh"]);
    assert_eq!(control_json(events.last().unwrap())["streamClosed"], true);
}

#[tokio::test]
async fn sse_emits_keepalive_controls_while_idle() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/idle", "text/plain").await;

    let reader = tokio::spawn(async move {
        client()
            .get(url(addr, "/idle?offset=now&live=sse"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    });
    // One 400 ms long-poll window expires before the close lands.
    tokio::time::sleep(Duration::from_millis(600)).await;
    close_stream(addr, "/idle").await;

    let body = reader.await.unwrap();
    let events = parse_events(&body);
    let controls: Vec<serde_json::Value> = events
        .iter()
        .filter(|e| e.event == "control")
        .map(control_json)
        .collect();
    assert!(controls.len() >= 2, "expected keep-alive plus closed control");
    let keepalive = &controls[0];
    assert_eq!(keepalive["upToDate"], true);
    assert!(keepalive.get("streamClosed").is_none());
    assert_eq!(controls.last().unwrap()["streamClosed"], true);
}

#[tokio::test]
async fn sse_controls_carry_an_advancing_cursor() {
    let (addr, _state) = start_memory_server().await;
    create_stream(addr, "/c", "text/plain").await;
    append(addr, "/c", "text/plain", "x").await;
    close_stream(addr, "/c").await;

    let body = client()
        .get(url(addr, "/c?offset=-1&live=sse&cursor=5"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let events = parse_events(&body);
    let control = events.iter().find(|e| e.event == "control").unwrap();
    let cursor: u64 = control_json(control)["streamCursor"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(cursor > 5);
}

#[tokio::test]
async fn sse_on_missing_stream_is_404() {
    let (addr, _state) = start_memory_server().await;
    let response = client()
        .get(url(addr, "/absent?offset=-1&live=sse"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
