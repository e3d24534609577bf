//! JSON append processing and response-body assembly.
//!
//! JSON streams store every value with a trailing comma so a response body
//! can be assembled by concatenating raw stored bytes, wrapping them in
//! `[` … `]`, and stripping the final comma — no re-parse on the read path.

use serde_json::Value;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JsonFramingError {
    #[error("invalid JSON: {0}")]
    Invalid(String),
    #[error("empty JSON array appends are not allowed")]
    EmptyArray,
}

/// Convert a JSON request body into its stored form.
///
/// Arrays are flattened to `elem1,elem2,...,` (trailing comma); a single
/// value is re-serialized with a trailing comma. An empty array produces
/// zero bytes on initial create and is rejected on append.
pub fn process_json_append(
    body: &[u8],
    is_initial_create: bool,
) -> Result<Vec<u8>, JsonFramingError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| JsonFramingError::Invalid(e.to_string()))?;
    let elements: Vec<Value> = match value {
        Value::Array(items) => {
            if items.is_empty() {
                if is_initial_create {
                    return Ok(Vec::new());
                }
                return Err(JsonFramingError::EmptyArray);
            }
            items
        }
        single => vec![single],
    };
    let mut out = Vec::with_capacity(body.len() + elements.len());
    for element in &elements {
        // Compact form; the request's own whitespace is not preserved.
        out.extend_from_slice(&serde_json::to_vec(element).map_err(|e| {
            JsonFramingError::Invalid(e.to_string())
        })?);
        out.push(b',');
    }
    Ok(out)
}

/// Assemble a JSON response body from concatenated stored bytes.
pub fn format_json_response(raw: &[u8]) -> Vec<u8> {
    let trimmed = raw.strip_suffix(b",").unwrap_or(raw);
    let mut out = Vec::with_capacity(trimmed.len() + 2);
    out.push(b'[');
    out.extend_from_slice(trimmed);
    out.push(b']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_value_gets_a_trailing_comma() {
        let stored = process_json_append(br#"{"x": 1}"#, false).unwrap();
        assert_eq!(stored, br#"{"x":1},"#);
    }

    #[test]
    fn arrays_are_flattened_element_by_element() {
        let stored = process_json_append(br#"[{"x":2}, {"x":3}]"#, false).unwrap();
        assert_eq!(stored, br#"{"x":2},{"x":3},"#);
    }

    #[test]
    fn scalars_and_nested_arrays_are_valid_values() {
        assert_eq!(process_json_append(b"42", false).unwrap(), b"42,");
        assert_eq!(process_json_append(b"\"s\"", false).unwrap(), b"\"s\",");
        assert_eq!(process_json_append(b"null", false).unwrap(), b"null,");
        // A nested array is an element, not another level of flattening.
        assert_eq!(
            process_json_append(b"[[1,2],[3]]", false).unwrap(),
            b"[1,2],[3],"
        );
    }

    #[test]
    fn empty_array_is_create_only() {
        assert_eq!(process_json_append(b"[]", true).unwrap(), b"");
        assert_eq!(
            process_json_append(b"[]", false),
            Err(JsonFramingError::EmptyArray)
        );
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            process_json_append(b"{not json", false),
            Err(JsonFramingError::Invalid(_))
        ));
        assert!(matches!(
            process_json_append(b"", false),
            Err(JsonFramingError::Invalid(_))
        ));
    }

    #[test]
    fn response_assembly_wraps_and_strips_the_trailing_comma() {
        assert_eq!(format_json_response(b""), b"[]");
        assert_eq!(format_json_response(br#"{"x":1},"#), br#"[{"x":1}]"#);
        assert_eq!(
            format_json_response(br#"{"x":1},{"x":2},{"x":3},"#),
            br#"[{"x":1},{"x":2},{"x":3}]"#
        );
    }
}
