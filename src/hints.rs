//! Hints file model and pattern merge (spec §6 "Hints file").
//!
//! Hints are opaque advisory JSON keyed by a URL pattern; this module never
//! interprets their content, only selects and merges the entries whose
//! pattern matches the service URL.

use serde::Deserialize;
use serde_json::{Map, Value};

///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Deserialize)]
pub struct HintEntry {
    pub pattern: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HintsFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub hints: Vec<HintEntry>,
}

pub fn parse_hints_file(json: &str) -> Result<HintsFile, serde_json::Error> {
    serde_json::from_str(json)
}

/// `*`/`?` wildcard match against a service URL (spec §6 "Selection").
/// Case-insensitive: hosts and path segments in hint patterns are commonly
/// authored in a different case than the actual service URL.
fn pattern_matches(pattern: &str, url: &str) -> bool {
    let mut regex_str = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            other => regex_str.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_str.push('$');
    regex::Regex::new(&regex_str).map(|r| r.is_match(url)).unwrap_or(false)
}

/// Selects every entry whose pattern matches `service_url`, then merges
/// them ascending by `priority`: later entries win per scalar key; array
/// values concatenate (spec §6 "Selection").
pub fn merge_matching_hints(file: &HintsFile, service_url: &str, inline_hint: Option<&str>) -> Value {
    let mut matching: Vec<&HintEntry> = file
        .hints
        .iter()
        .filter(|h| pattern_matches(&h.pattern, service_url))
        .collect();
    matching.sort_by_key(|h| h.priority);

    let mut merged = Map::new();
    for hint in matching {
        merge_object(&mut merged, &hint.rest);
    }

    if let Some(extra) = inline_hint {
        if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(extra) {
            merge_object(&mut merged, &obj);
        } else {
            merged.insert("cli_hint".to_string(), Value::String(extra.to_string()));
        }
    }

    Value::Object(merged)
}

fn merge_object(dest: &mut Map<String, Value>, src: &Map<String, Value>) {
    for (key, value) in src {
        match (dest.get_mut(key), value) {
            (Some(Value::Array(existing)), Value::Array(incoming)) => {
                existing.extend(incoming.clone());
            }
            _ => {
                dest.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": "1",
        "hints": [
            {"pattern": "*northwind*", "priority": 1, "known_issues": ["a"]},
            {"pattern": "*Northwind*", "priority": 2, "known_issues": ["b"], "notes": "hi"}
        ]
    }"#;

    #[test]
    fn merges_ascending_by_priority() {
        let file = parse_hints_file(SAMPLE).unwrap();
        let merged = merge_matching_hints(&file, "https://services.odata.org/V2/Northwind/Northwind.svc/", None);
        assert_eq!(merged["known_issues"], serde_json::json!(["a", "b"]));
        assert_eq!(merged["notes"], serde_json::json!("hi"));
    }

    #[test]
    fn non_matching_pattern_excluded() {
        let file = parse_hints_file(SAMPLE).unwrap();
        let merged = merge_matching_hints(&file, "https://example.com/odata/", None);
        assert_eq!(merged, serde_json::json!({}));
    }
}
