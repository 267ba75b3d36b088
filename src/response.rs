//! Response normalizer (spec §4.4): envelope unwrap, `__metadata` stripping,
//! GUID and legacy-date rewriting, item/byte bounding, pagination hints.
//!
//! Modeled as a recursive transform over `serde_json::Value` (spec §9
//! "Response walker") rather than in-place mutation, so the bounding pass
//! composes cleanly with the rewriting pass and both are independently
//! testable.

use base64::Engine;
use serde_json::{Map, Value};

use crate::metadata::{EntitySet, EntityType, Property};

///////////////////////////////////////////////////////////////////////////////
// Config carried from RuntimeConfig into the walk.

#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    pub legacy_dates: bool,
    pub response_metadata: bool,
    pub max_items: usize,
    pub max_response_size: usize,
    pub pagination_hints: bool,
}

///////////////////////////////////////////////////////////////////////////////
// Envelope unwrap (spec §4.4 item 1)

/// A decoded list payload once the `{ "d": ... }` and `results` envelopes
/// have been peeled off.
pub struct UnwrappedList {
    pub items: Vec<Value>,
    pub total_count: Option<i64>,
    pub next_link: Option<String>,
}

/// Removes the outer `{"d": ...}` envelope if present, otherwise returns the
/// value unchanged.
pub fn unwrap_d_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut obj) if obj.len() == 1 && obj.contains_key("d") => {
            obj.remove("d").unwrap()
        }
        other => other,
    }
}

/// Unwraps a `{"results": [...], "__count": "N", "__next": "..."}` list
/// envelope. Returns `None` if `value` isn't list-shaped.
pub fn unwrap_list(value: Value) -> Option<UnwrappedList> {
    match value {
        Value::Array(items) => Some(UnwrappedList {
            items,
            total_count: None,
            next_link: None,
        }),
        Value::Object(mut obj) => {
            let results = obj.remove("results")?;
            let items = match results {
                Value::Array(a) => a,
                other => vec![other],
            };
            let total_count = obj
                .remove("__count")
                .and_then(|v| match v {
                    Value::String(s) => s.parse().ok(),
                    Value::Number(n) => n.as_i64(),
                    _ => None,
                });
            let next_link = obj.remove("__next").and_then(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            });
            Some(UnwrappedList {
                items,
                total_count,
                next_link,
            })
        }
        _ => None,
    }
}

///////////////////////////////////////////////////////////////////////////////
// GUID normalization (spec §4.4 item 3, Invariant 6)

/// A property is GUID-shaped if declared `Edm.Guid`, or `Edm.Binary` with
/// `MaxLength=16` and a name containing `ID`/`GUID`/`F`/`T` (case-insensitive).
pub fn is_guid_shaped(prop: &Property) -> bool {
    if prop.edm_type == "Edm.Guid" {
        return true;
    }
    if prop.edm_type == "Edm.Binary" && prop.max_length == Some(16) {
        let upper = prop.name.to_uppercase();
        return ["ID", "GUID", "F", "T"].iter().any(|s| upper.contains(s));
    }
    false
}

/// Decodes a base64 string to exactly 16 bytes, or returns `None`.
fn base64_to_16_bytes(s: &str) -> Option<[u8; 16]> {
    if s.len() != 24 {
        return None;
    }
    let bytes = base64::engine::general_purpose::STANDARD.decode(s).ok()?;
    bytes.try_into().ok()
}

/// Rewrites a base64 GUID-shaped value into canonical hyphenated lower-case
/// form (spec §9 open question: lower-case chosen, matches `uuid`'s
/// `Display`). Returns the input unchanged if it isn't a valid 16-byte
/// base64 string.
pub fn guid_base64_to_canonical(s: &str) -> Option<String> {
    let bytes = base64_to_16_bytes(s)?;
    Some(uuid::Builder::from_bytes(bytes).into_uuid().to_string())
}

/// Inverse of [`guid_base64_to_canonical`]: parses a canonical
/// (hyphenated or not) GUID string back into its original 16 raw bytes.
/// Used by the key formatter and by create/update payload rewriting.
pub fn guid_string_to_bytes(s: &str) -> Option<[u8; 16]> {
    uuid::Uuid::parse_str(s).ok().map(|u| *u.as_bytes())
}

/// Converts a canonical GUID string into the base64 form expected on the
/// wire for `Edm.Binary(MaxLength=16)` fields.
pub fn guid_canonical_to_base64(s: &str) -> Option<String> {
    let bytes = guid_string_to_bytes(s)?;
    Some(base64::engine::general_purpose::STANDARD.encode(bytes))
}

///////////////////////////////////////////////////////////////////////////////
// Date normalization (spec §4.4 item 4)

/// `/Date(1234567890)/` or `/Date(1234567890+0200)/` -> ISO-8601.
pub fn legacy_date_to_iso8601(s: &str) -> Option<String> {
    let inner = s.strip_prefix("/Date(")?.strip_suffix(")/")?;
    let (ms_part, _tz) = match inner.find(['+', '-']) {
        // A leading '-' is part of a negative timestamp, not a timezone
        // offset, so only split on an interior sign.
        Some(idx) if idx > 0 => inner.split_at(idx),
        _ => (inner, ""),
    };
    let ms: i64 = ms_part.parse().ok()?;
    let dt = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)?;
    Some(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

/// ISO-8601 -> `/Date(ms)/` (no timezone suffix; legacy form is always UTC
/// millis on write per spec §4.2).
pub fn iso8601_to_legacy_date(s: &str) -> Option<String> {
    let dt = chrono::DateTime::parse_from_rfc3339(s).ok()?;
    Some(format!("/Date({})/", dt.timestamp_millis()))
}

fn is_legacy_date(s: &str) -> bool {
    s.starts_with("/Date(") && s.ends_with(")/")
}

///////////////////////////////////////////////////////////////////////////////
// The walk

/// Recursively normalizes a single entity object (not a list): strips
/// `__metadata` (unless `response_metadata`), rewrites GUID-shaped and
/// date-shaped fields using `entity_type`'s declared properties.
pub fn normalize_entity(mut obj: Map<String, Value>, entity_type: &EntityType, opts: NormalizeOptions) -> Map<String, Value> {
    if !opts.response_metadata {
        obj.remove("__metadata");
    }

    for prop in &entity_type.properties {
        let Some(value) = obj.get_mut(&prop.name) else {
            continue;
        };
        if let Value::String(s) = value {
            if is_guid_shaped(prop) {
                if let Some(canonical) = guid_base64_to_canonical(s) {
                    *s = canonical;
                }
            } else if opts.legacy_dates && is_legacy_date(s) {
                if let Some(iso) = legacy_date_to_iso8601(s) {
                    *s = iso;
                }
            }
        }
    }

    // Nested expanded navigation properties arrive as `{"results": [...]}`
    // or deferred `{"__deferred": {...}}`; normalize any expanded arrays
    // using the same entity type (best-effort: expanded entities often
    // differ, but we don't have their schema here, so we only rewrite
    // primitives that match by coincidence and leave structure intact).
    for (_, value) in obj.iter_mut() {
        if let Value::Object(inner) = value {
            if let Some(Value::Array(items)) = inner.get_mut("results") {
                for item in items.iter_mut() {
                    if let Value::Object(item_obj) = item {
                        *item_obj = normalize_entity(std::mem::take(item_obj), entity_type, opts);
                    }
                }
            }
        }
    }

    obj
}

/// Applies [`normalize_entity`] across every entry of a list, then enforces
/// the item-count and byte-size bounds (spec §4.4 items 5, 6). `total_count`
/// and `next_link` come from the unwrapped envelope; `entity_set` supplies
/// the entity type used to drive field rewriting and the tool name used in
/// pagination hints.
pub fn normalize_list_response(
    unwrapped: UnwrappedList,
    entity_type: &EntityType,
    entity_set: &EntitySet,
    tool_name: &str,
    skip: i64,
    opts: NormalizeOptions,
) -> Value {
    let mut items: Vec<Value> = unwrapped
        .items
        .into_iter()
        .map(|v| match v {
            Value::Object(obj) => Value::Object(normalize_entity(obj, entity_type, opts)),
            other => other,
        })
        .collect();

    let original_len = items.len();
    let mut truncated = false;
    if original_len > opts.max_items {
        items.truncate(opts.max_items);
        truncated = true;
    }

    let mut out = Map::new();
    out.insert("results".to_string(), Value::Array(items));
    if let Some(tc) = unwrapped.total_count {
        out.insert("total_count".to_string(), Value::from(tc));
    }
    if let Some(next) = &unwrapped.next_link {
        out.insert("next_link".to_string(), Value::from(next.clone()));
    }
    if truncated {
        out.insert("truncated".to_string(), Value::Bool(true));
    }

    if opts.pagination_hints && (truncated || unwrapped.next_link.is_some()) {
        out.insert(
            "suggested_next_call".to_string(),
            pagination_hint(tool_name, entity_set, skip, opts.max_items as i64, unwrapped.next_link.as_deref()),
        );
    }

    let value = Value::Object(out);
    bound_by_bytes(value, opts.max_response_size, original_len)
}

fn pagination_hint(tool_name: &str, _entity_set: &EntitySet, skip: i64, page_size: i64, skiptoken: Option<&str>) -> Value {
    let mut hint = Map::new();
    hint.insert("tool".to_string(), Value::from(tool_name));
    if let Some(token) = skiptoken {
        hint.insert("skiptoken".to_string(), Value::from(token));
    } else {
        hint.insert("skip".to_string(), Value::from(skip + page_size));
    }
    Value::Object(hint)
}

/// Enforces the byte budget (spec §4.4 item 5, Invariant 5): if the
/// serialized value exceeds `max_bytes`, it's replaced with an abbreviated
/// summary — never a partial-object prefix.
pub fn bound_by_bytes(value: Value, max_bytes: usize, item_count: usize) -> Value {
    let serialized = serde_json::to_string(&value).unwrap_or_default();
    if serialized.len() <= max_bytes {
        return value;
    }

    serde_json::json!({
        "truncated": true,
        "item_count": item_count,
        "original_size_bytes": serialized.len(),
        "message": format!(
            "Response of {} bytes exceeds the configured limit of {} bytes; only a summary is returned. Narrow the query with $select/$filter/$top.",
            serialized.len(),
            max_bytes
        ),
    })
}

/// Normalizes a single-entity (`get`/`create`/`update`) response body.
pub fn normalize_entity_response(value: Value, entity_type: &EntityType, opts: NormalizeOptions) -> Value {
    let unwrapped = unwrap_d_envelope(value);
    match unwrapped {
        Value::Object(obj) => {
            let normalized = normalize_entity(obj, entity_type, opts);
            bound_by_bytes(Value::Object(normalized), opts.max_response_size, 1)
        }
        other => other,
    }
}

/// Rewrites a write payload's GUID-shaped fields from canonical string back
/// to base64 before it goes on the wire (inverse of item 3).
pub fn denormalize_write_payload(entity_type: &EntityType, mut payload: Map<String, Value>) -> Map<String, Value> {
    for prop in &entity_type.properties {
        if !is_guid_shaped(prop) {
            continue;
        }
        if let Some(Value::String(s)) = payload.get_mut(&prop.name) {
            if let Some(b64) = guid_canonical_to_base64(s) {
                *s = b64;
            }
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> NormalizeOptions {
        NormalizeOptions {
            legacy_dates: true,
            response_metadata: false,
            max_items: 100,
            max_response_size: 5 * 1024 * 1024,
            pagination_hints: false,
        }
    }

    #[test]
    fn guid_roundtrip() {
        let b64 = "AkkEEAAEH9CL4dDCiWvlwg==";
        let canonical = guid_base64_to_canonical(b64).unwrap();
        assert_eq!(canonical, "02490410-0004-1fd0-8be1-d0c2896be5c2");
        assert_eq!(guid_canonical_to_base64(&canonical).unwrap(), b64);
    }

    #[test]
    fn legacy_date_roundtrip() {
        let legacy = "/Date(1318435200000)/";
        let iso = legacy_date_to_iso8601(legacy).unwrap();
        let back = iso8601_to_legacy_date(&iso).unwrap();
        assert_eq!(back, legacy);
    }

    #[test]
    fn d_envelope_unwrapped() {
        let v = serde_json::json!({"d": {"ProductID": 1}});
        assert_eq!(unwrap_d_envelope(v), serde_json::json!({"ProductID": 1}));
    }

    #[test]
    fn list_truncation_sets_marker() {
        let items: Vec<Value> = (0..10).map(|i| serde_json::json!({"ID": i})).collect();
        let unwrapped = UnwrappedList {
            items,
            total_count: Some(10),
            next_link: None,
        };
        let entity_type = EntityType {
            name: "T".into(),
            qualified_name: "T".into(),
            properties: vec![],
        };
        let entity_set = EntitySet {
            name: "Ts".into(),
            entity_type_name: "T".into(),
            capabilities: crate::metadata::Capabilities::default(),
        };
        let mut o = opts();
        o.max_items = 3;
        let out = normalize_list_response(unwrapped, &entity_type, &entity_set, "filter_Ts", 0, o);
        assert_eq!(out["results"].as_array().unwrap().len(), 3);
        assert_eq!(out["truncated"], serde_json::json!(true));
    }

    #[test]
    fn byte_bound_yields_summary_not_prefix() {
        let big = Value::Array(vec![serde_json::json!({"x": "y".repeat(100)}); 50]);
        let bounded = bound_by_bytes(big, 200, 50);
        assert_eq!(bounded["truncated"], serde_json::json!(true));
        assert!(bounded.get("item_count").is_some());
    }

    #[test]
    fn exact_byte_bound_not_truncated() {
        let v = serde_json::json!({"a": "x"});
        let size = serde_json::to_string(&v).unwrap().len();
        let bounded = bound_by_bytes(v.clone(), size, 1);
        assert_eq!(bounded, v);
    }
}
