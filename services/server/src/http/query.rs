//! Read-path query-string parsing.
//!
//! Stricter than a serde `Query` extractor on purpose: repeated parameters
//! are client errors, an empty or malformed `offset` is a client error, and
//! a live mode without an offset is a client error.

use ds_protocol::{Offset, OFFSET_NOW, OFFSET_START};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMode {
    LongPoll,
    Sse,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadQuery {
    /// Canonicalized: `-1` | `now` | 16-digit token.
    pub offset: Option<String>,
    pub live: Option<LiveMode>,
    pub cursor: Option<String>,
}

pub fn parse_read_query(raw: Option<&str>) -> Result<ReadQuery, String> {
    let mut offset: Option<String> = None;
    let mut live: Option<LiveMode> = None;
    let mut cursor: Option<String> = None;

    for pair in raw.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "offset" => {
                if offset.is_some() {
                    return Err("offset specified more than once".to_owned());
                }
                offset = Some(canonicalize_offset(value)?);
            }
            "live" => {
                if live.is_some() {
                    return Err("live specified more than once".to_owned());
                }
                live = Some(match value {
                    "long-poll" => LiveMode::LongPoll,
                    "sse" => LiveMode::Sse,
                    other => return Err(format!("invalid live mode: {other}")),
                });
            }
            "cursor" => {
                if cursor.is_some() {
                    return Err("cursor specified more than once".to_owned());
                }
                cursor = Some(value.to_owned());
            }
            // Unknown parameters are ignored for forward compatibility.
            _ => {}
        }
    }

    if live.is_some() && offset.is_none() {
        return Err("live mode requires an offset".to_owned());
    }

    Ok(ReadQuery {
        offset,
        live,
        cursor,
    })
}

/// Accept `-1 | now | \d+_\d+` and re-emit the canonical zero-padded form,
/// so downstream comparisons stay purely lexicographic.
fn canonicalize_offset(value: &str) -> Result<String, String> {
    if value == OFFSET_START || value == OFFSET_NOW {
        return Ok(value.to_owned());
    }
    let malformed = || format!("invalid offset: {value}");
    let (seq, pos) = value.split_once('_').ok_or_else(malformed)?;
    if seq.is_empty()
        || pos.is_empty()
        || !seq.bytes().all(|b| b.is_ascii_digit())
        || !pos.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(malformed());
    }
    let read_seq: u64 = seq.parse().map_err(|_| malformed())?;
    let byte_offset: u64 = pos.parse().map_err(|_| malformed())?;
    Ok(Offset {
        read_seq,
        byte_offset,
    }
    .to_string())
}
