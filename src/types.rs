//! OData primitive -> abstract type mapping, key formatting, and the value
//! coercer applied to write payloads (spec §4.2).

use percent_encoding::{AsciiSet, CONTROLS};

use crate::metadata::Property;

///////////////////////////////////////////////////////////////////////////////

/// Abstract type used by the schema generator (`tools.rs`) and by the value
/// coercer below. Every `Edm.*` primitive maps to exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbstractType {
    Integer,
    Decimal,
    Number,
    Boolean,
    String,
}

/// Maps an `Edm.*` type name to its abstract shape (spec §4.2).
pub fn abstract_type_of(edm_type: &str) -> AbstractType {
    match edm_type {
        "Edm.Int16" | "Edm.Int32" | "Edm.Int64" | "Edm.Byte" | "Edm.SByte" => {
            AbstractType::Integer
        }
        "Edm.Decimal" => AbstractType::Decimal,
        "Edm.Double" | "Edm.Single" => AbstractType::Number,
        "Edm.Boolean" => AbstractType::Boolean,
        // Edm.String | Edm.Guid | Edm.Binary | Edm.DateTime | Edm.DateTimeOffset | Edm.Time
        _ => AbstractType::String,
    }
}

/// JSON Schema `"type"` value a given abstract type maps to in a tool's
/// input schema.
pub fn json_schema_type(t: AbstractType) -> &'static str {
    match t {
        AbstractType::Integer => "integer",
        AbstractType::Decimal | AbstractType::String => "string",
        AbstractType::Number => "number",
        AbstractType::Boolean => "boolean",
    }
}

///////////////////////////////////////////////////////////////////////////////
// Key formatting (spec §4.2 "Key formatter" + Invariant 3, 4, boundary cases)

/// Every octet outside the unreserved set gets percent-encoded, including
/// `/` -- critical for SAP identifiers like `/NS/NAME` (spec §4.2).
const KEY_ESCAPE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'!')
    .add(b'"')
    .add(b'#')
    .add(b'$')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// One key component: the property it belongs to, and its literal OData
/// value split into an unescaped delimiter shell (quotes, or the `X'...'`
/// hex-binary wrapper) and an inner value that still needs percent-encoding.
/// The delimiters themselves must reach the wire unescaped — only the inner
/// octets are subject to `KEY_ESCAPE_SET` (spec §8 scenario 2: a slash in
/// the value is escaped to `%2F` but the surrounding `'...'` stay literal).
struct FormattedKeyPart {
    name: String,
    prefix: &'static str,
    inner: String,
    suffix: &'static str,
}

/// Render the key segment of an entity URL, e.g. `(1)` or
/// `(Program='%2FIWFND%2FSUTIL_GW_CLIENT')` or `(a=1,b='x')`.
///
/// `key_values` must supply one (property-name, raw-string-value) pair per
/// key property, in the order declared on the entity type.
pub fn format_key(key_properties: &[Property], key_values: &[(&str, &str)]) -> String {
    let parts: Vec<FormattedKeyPart> = key_properties
        .iter()
        .map(|prop| {
            let raw = key_values
                .iter()
                .find(|(name, _)| *name == prop.name)
                .map(|(_, v)| *v)
                .unwrap_or_default();
            let (prefix, inner, suffix) = format_key_literal(prop, raw);
            FormattedKeyPart {
                name: prop.name.clone(),
                prefix,
                inner: percent_encode_key(&inner),
                suffix,
            }
        })
        .collect();

    if parts.len() == 1 {
        let p = &parts[0];
        format!("({}{}{})", p.prefix, p.inner, p.suffix)
    } else {
        let joined = parts
            .iter()
            .map(|p| format!("{}={}{}{}", p.name, p.prefix, p.inner, p.suffix))
            .collect::<Vec<_>>()
            .join(",");
        format!("({joined})")
    }
}

fn percent_encode_key(literal: &str) -> String {
    percent_encoding::utf8_percent_encode(literal, KEY_ESCAPE_SET).to_string()
}

/// Format a single key value as an OData URL literal: an unescaped
/// (prefix, suffix) delimiter shell and an inner value still awaiting
/// percent-encoding. Numerics are left bare; string-shaped types are quoted
/// with internal quotes doubled (the doubled quotes are themselves part of
/// the inner value, so they get percent-encoded along with everything else).
fn format_key_literal(prop: &Property, raw: &str) -> (&'static str, String, &'static str) {
    match abstract_type_of(&prop.edm_type) {
        AbstractType::Integer | AbstractType::Number => ("", raw.to_string(), ""),
        AbstractType::Decimal => ("", format!("{raw}M"), ""),
        AbstractType::Boolean => ("", raw.to_string(), ""),
        AbstractType::String => {
            if prop.edm_type == "Edm.Binary" {
                // A standard GUID literal, if provided, is converted back to
                // base64 for the wire; otherwise emit the X'...' hex form.
                if let Some(bytes) = crate::response::guid_string_to_bytes(raw) {
                    use base64::Engine;
                    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
                    ("'", b64.replace('\'', "''"), "'")
                } else {
                    ("X'", raw.to_uppercase(), "'")
                }
            } else {
                ("'", raw.replace('\'', "''"), "'")
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Value coercer on write (spec §4.2 "Value coercer on write")

/// Rewrites a create/update payload so that:
/// - `Edm.Decimal` numeric JSON values become strings (works around an
///   upstream "Failed to read property" defect).
/// - legacy `/Date(ms)/` / `/Date(ms+zzzz)/` strings and ISO-8601 strings
///   are normalized to whichever form the target expects.
pub fn coerce_write_payload(
    properties: &[Property],
    mut payload: serde_json::Map<String, serde_json::Value>,
    legacy_dates: bool,
) -> serde_json::Map<String, serde_json::Value> {
    for prop in properties {
        let Some(value) = payload.get_mut(&prop.name) else {
            continue;
        };

        match abstract_type_of(&prop.edm_type) {
            AbstractType::Decimal => {
                if let Some(n) = value.as_f64() {
                    *value = serde_json::Value::String(format_decimal(n));
                } else if let Some(n) = value.as_i64() {
                    *value = serde_json::Value::String(n.to_string());
                }
            }
            AbstractType::String
                if matches!(prop.edm_type.as_str(), "Edm.DateTime" | "Edm.DateTimeOffset") =>
            {
                if let Some(s) = value.as_str() {
                    let rewritten = if legacy_dates {
                        crate::response::iso8601_to_legacy_date(s).unwrap_or_else(|| s.to_string())
                    } else {
                        crate::response::legacy_date_to_iso8601(s).unwrap_or_else(|| s.to_string())
                    };
                    *value = serde_json::Value::String(rewritten);
                }
            }
            _ => {}
        }
    }

    payload
}

fn format_decimal(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}
