//! JSON-RPC Inspector (C4): classification and surgical rewriting of
//! `tools/call` bodies observed on the ext-proc stream.
//!
//! `rewrite_tool_call` below does not deserialize-then-reserialize through
//! a `serde_json::Value`: that round-trip is lossy for anything `Value`
//! doesn't model byte-for-byte (number formatting such as `1.0` vs `1e0`,
//! original whitespace), which would violate §4.4's "preserve byte-for-byte
//! anything outside the mutated string literals" requirement. Instead it
//! locates the exact byte span of each `params.name` string literal with a
//! minimal JSON scanner and splices only that span.

use serde_json::Value;

/// The method and id of a single JSON-RPC element, extracted without
/// fully deserializing the request into a typed struct (so unrelated
/// fields survive untouched).
#[derive(Debug, Clone, PartialEq)]
pub struct MessageShape {
    pub method: String,
    pub id: Option<Value>,
}

/// The result of classifying a raw HTTP body.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Single(MessageShape),
    Batch(Vec<MessageShape>),
    NotJsonRpc,
    ParseError,
}

/// Classify raw body bytes per the body grammar in §4.4: a single
/// JSON-RPC object, or a JSON array of such objects.
#[must_use]
pub fn classify(bytes: &[u8]) -> Classification {
    if bytes.is_empty() {
        return Classification::NotJsonRpc;
    }

    let text = match std::str::from_utf8(bytes) {
        Ok(t) => t,
        Err(_) => return Classification::ParseError,
    };

    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Classification::ParseError,
    };

    match value {
        Value::Object(_) => match shape_of(&value) {
            Some(shape) => Classification::Single(shape),
            None => Classification::NotJsonRpc,
        },
        Value::Array(elements) => {
            let shapes: Vec<MessageShape> = elements.iter().filter_map(shape_of).collect();
            if shapes.is_empty() {
                Classification::NotJsonRpc
            } else {
                Classification::Batch(shapes)
            }
        }
        _ => Classification::NotJsonRpc,
    }
}

fn shape_of(value: &Value) -> Option<MessageShape> {
    let object = value.as_object()?;
    if !object.contains_key("jsonrpc") {
        return None;
    }
    let method = object.get("method")?.as_str()?.to_string();
    let id = object.get("id").cloned();
    Some(MessageShape { method, id })
}

/// Extract `params.name` from a single `tools/call` JSON-RPC object.
#[must_use]
pub fn tool_call_name(element: &Value) -> Option<&str> {
    element.get("params")?.get("name")?.as_str()
}

/// Rewrite every `tools/call` element's `params.name` field using
/// `mapping`, leaving everything else byte-identical. Elements whose name
/// is not found in `mapping` are left untouched (the caller is expected to
/// have already rejected/short-circuited on unresolved names before
/// calling this, per §4.5 step 2c).
///
/// Splices only the byte span of each matched `name` string literal;
/// everything else in `bytes` — whitespace, key order, original number
/// formatting — is copied through unchanged.
pub fn rewrite_tool_call(
    bytes: &[u8],
    mut mapping: impl FnMut(&str) -> Option<String>,
) -> Result<Vec<u8>, serde_json::Error> {
    // Validate the document parses as JSON so malformed input is reported
    // the same way a full deserialize would report it; the scan below
    // assumes well-formed JSON.
    serde_json::from_slice::<Value>(bytes)?;

    let mut splices: Vec<(usize, usize, Vec<u8>)> = Vec::new();

    if let Some(elements) = scan::top_level_spans(bytes) {
        for (elem_start, elem_end) in elements {
            if let Some((name_start, name_end)) = tool_call_name_span(bytes, elem_start, elem_end) {
                let Ok(raw_name) = std::str::from_utf8(&bytes[name_start..name_end]) else { continue };
                let Ok(exposed_name): Result<String, _> = serde_json::from_str(raw_name) else { continue };
                if let Some(original_name) = mapping(&exposed_name) {
                    let literal = serde_json::to_string(&Value::String(original_name)).unwrap_or_default();
                    splices.push((name_start, name_end, literal.into_bytes()));
                }
            }
        }
    }

    splices.sort_by_key(|(start, _, _)| *start);

    let mut output = Vec::with_capacity(bytes.len());
    let mut cursor = 0usize;
    for (start, end, replacement) in splices {
        output.extend_from_slice(&bytes[cursor..start]);
        output.extend_from_slice(&replacement);
        cursor = end;
    }
    output.extend_from_slice(&bytes[cursor..]);

    Ok(output)
}

/// Locate the byte span (including surrounding quotes) of `params.name`'s
/// string value within one top-level element spanning `elem_start..elem_end`,
/// provided that element's `method` is `tools/call`.
fn tool_call_name_span(bytes: &[u8], elem_start: usize, elem_end: usize) -> Option<(usize, usize)> {
    let (method_start, method_end) = scan::find_key_span(bytes, elem_start, elem_end, "method")?;
    if bytes.get(method_start) != Some(&b'"') {
        return None;
    }
    let raw_method = std::str::from_utf8(&bytes[method_start..method_end]).ok()?;
    let method: String = serde_json::from_str(raw_method).ok()?;
    if method != "tools/call" {
        return None;
    }

    let (params_start, params_end) = scan::find_key_span(bytes, elem_start, elem_end, "params")?;
    if bytes.get(params_start) != Some(&b'{') {
        return None;
    }

    let (name_start, name_end) = scan::find_key_span(bytes, params_start, params_end, "name")?;
    if bytes.get(name_start) != Some(&b'"') {
        return None;
    }
    Some((name_start, name_end))
}

/// A minimal JSON scanner used only to locate byte spans within an
/// already-validated JSON document — it never builds a `Value`, so it
/// never loses the original formatting of anything it doesn't touch.
mod scan {
    fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
        while matches!(bytes.get(i), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            i += 1;
        }
        i
    }

    /// End index (exclusive) of the string literal starting at `i`, where
    /// `bytes[i] == b'"'`.
    fn skip_string(bytes: &[u8], i: usize) -> Option<usize> {
        let mut j = i + 1;
        while j < bytes.len() {
            match bytes[j] {
                b'\\' => j += 2,
                b'"' => return Some(j + 1),
                _ => j += 1,
            }
        }
        None
    }

    /// End index (exclusive) of the bracketed value starting at `i`, where
    /// `bytes[i] == open`, respecting nested brackets and string contents.
    fn skip_bracketed(bytes: &[u8], i: usize, open: u8, close: u8) -> Option<usize> {
        let mut depth = 0usize;
        let mut j = i;
        while j < bytes.len() {
            match bytes[j] {
                b'"' => j = skip_string(bytes, j)?,
                c if c == open => {
                    depth += 1;
                    j += 1;
                }
                c if c == close => {
                    depth -= 1;
                    j += 1;
                    if depth == 0 {
                        return Some(j);
                    }
                }
                _ => j += 1,
            }
        }
        None
    }

    /// End index (exclusive) of the JSON value starting at `i` (which must
    /// point at the value's first non-whitespace byte).
    fn skip_value(bytes: &[u8], i: usize) -> Option<usize> {
        match *bytes.get(i)? {
            b'"' => skip_string(bytes, i),
            b'{' => skip_bracketed(bytes, i, b'{', b'}'),
            b'[' => skip_bracketed(bytes, i, b'[', b']'),
            _ => {
                let mut j = i;
                while j < bytes.len() && !matches!(bytes[j], b',' | b'}' | b']' | b' ' | b'\t' | b'\n' | b'\r') {
                    j += 1;
                }
                Some(j)
            }
        }
    }

    /// Split a top-level JSON document into the byte spans of its elements:
    /// a single span for a bare object, or one span per array element for a
    /// batch. Returns `None` for any other top-level shape.
    pub(super) fn top_level_spans(bytes: &[u8]) -> Option<Vec<(usize, usize)>> {
        let start = skip_ws(bytes, 0);
        match *bytes.get(start)? {
            b'{' => Some(vec![(start, skip_value(bytes, start)?)]),
            b'[' => {
                let mut spans = Vec::new();
                let mut i = skip_ws(bytes, start + 1);
                if bytes.get(i) == Some(&b']') {
                    return Some(spans);
                }
                loop {
                    let elem_end = skip_value(bytes, i)?;
                    spans.push((i, elem_end));
                    i = skip_ws(bytes, elem_end);
                    match bytes.get(i) {
                        Some(b',') => i = skip_ws(bytes, i + 1),
                        Some(b']') => break,
                        _ => return None,
                    }
                }
                Some(spans)
            }
            _ => None,
        }
    }

    /// Find the byte span of the value associated with `key` among the
    /// top-level keys of the JSON object spanning `obj_start..obj_end`
    /// (inclusive of the braces). Does not descend into nested objects —
    /// only this object's own keys are considered.
    pub(super) fn find_key_span(bytes: &[u8], obj_start: usize, obj_end: usize, key: &str) -> Option<(usize, usize)> {
        if bytes.get(obj_start) != Some(&b'{') {
            return None;
        }
        let mut i = skip_ws(bytes, obj_start + 1);
        while i < obj_end.saturating_sub(1) {
            if bytes.get(i) != Some(&b'"') {
                break;
            }
            let key_start = i;
            let key_end = skip_string(bytes, i)?;
            let raw_key = std::str::from_utf8(&bytes[key_start..key_end]).ok()?;
            let decoded_key: String = serde_json::from_str(raw_key).ok()?;

            i = skip_ws(bytes, key_end);
            if bytes.get(i) != Some(&b':') {
                return None;
            }
            i = skip_ws(bytes, i + 1);
            let value_start = i;
            let value_end = skip_value(bytes, i)?;

            if decoded_key == key {
                return Some((value_start, value_end));
            }

            i = skip_ws(bytes, value_end);
            match bytes.get(i) {
                Some(b',') => i = skip_ws(bytes, i + 1),
                _ => break,
            }
        }
        None
    }
}
