//! Wire-contract examples for the offset and ETag helpers.
//!
//! These pin the exact token strings peers see on the wire; changing any of
//! them is a protocol break, not a refactor.

use std::cmp::Ordering;

use ds_protocol::{
    compare_offsets, format_etag, initial_offset, is_valid_offset, normalize_offset, Offset,
    SseControl,
};

#[test]
fn append_offsets_advance_by_payload_length() {
    // PUT /s; POST "AB"; POST "CD" — the offsets a client observes.
    let start = initial_offset();
    assert_eq!(start, "0000000000000000_0000000000000000");

    let after_ab = Offset::parse(&start).unwrap().advance(2).to_string();
    assert_eq!(after_ab, "0000000000000000_0000000000000002");

    let after_cd = Offset::parse(&after_ab).unwrap().advance(2).to_string();
    assert_eq!(after_cd, "0000000000000000_0000000000000004");

    assert_eq!(compare_offsets(&after_ab, &after_cd), Ordering::Less);
}

#[test]
fn start_sentinel_and_zero_token_address_the_same_position() {
    assert_eq!(
        normalize_offset("-1").as_deref(),
        Some("0000000000000000_0000000000000000")
    );
    assert!(is_valid_offset("-1"));
    assert!(is_valid_offset("0000000000000000_0000000000000000"));
}

#[test]
fn offsets_issued_in_order_compare_in_order() {
    let mut last = initial_offset();
    for len in [1u64, 7, 100, 4096] {
        let next = Offset::parse(&last).unwrap().advance(len).to_string();
        assert_eq!(compare_offsets(&last, &next), Ordering::Less);
        last = next;
    }
}

#[test]
fn etag_differs_between_open_and_closed_responses() {
    let open = format_etag("/tokens/run1", "-1", "0000000000000000_0000000000000008", false);
    let closed = format_etag("/tokens/run1", "-1", "0000000000000000_0000000000000008", true);
    assert!(closed.ends_with(":c"));
    assert_ne!(open, closed);
}

#[test]
fn control_event_round_trips_through_json() {
    let control = SseControl {
        stream_next_offset: "0000000000000000_0000000000000004".to_owned(),
        stream_cursor: None,
        up_to_date: Some(true),
        stream_closed: Some(true),
    };
    let json = serde_json::to_string(&control).unwrap();
    let parsed: SseControl = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, control);
}
