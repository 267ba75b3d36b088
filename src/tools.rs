//! Tool projector (spec §4.5): derives, per entity set and function import,
//! the set of `ToolDescriptor`s honoring enable/disable filters, read-only
//! modes, name shortening, and service-qualified name suffixes/prefixes.

use regex::Regex;
use serde_json::{Map, Value};

use crate::metadata::{EntitySet, EntityType, FunctionImport, FunctionMethod, ServiceMetadata};
use crate::types::{abstract_type_of, json_schema_type};

///////////////////////////////////////////////////////////////////////////////

/// Operation class (spec §3 `ToolDescriptor`, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Create,
    Search,
    Filter,
    Get,
    Update,
    Delete,
    Action,
    Info,
}

impl OperationClass {
    /// Single-letter code used by `--enable`/`--disable` (spec §6).
    pub fn code(self) -> char {
        match self {
            Self::Create => 'C',
            Self::Search => 'S',
            Self::Filter => 'F',
            Self::Get => 'G',
            Self::Update => 'U',
            Self::Delete => 'D',
            Self::Action => 'A',
            Self::Info => 'I',
        }
    }
}

/// Where a tool dispatches to: entity-set name + verb, a function import
/// name, or the info tool. Spec §9 "Dynamic per-entity function signatures":
/// no code generation, just a data tag plus a schema value.
#[derive(Debug, Clone)]
pub enum ToolHandler {
    Filter(String),
    Count(String),
    Search(String),
    Get(String),
    Create(String),
    Update(String),
    Delete(String),
    Function(String),
    Info,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub class: OperationClass,
    pub handler: ToolHandler,
}

///////////////////////////////////////////////////////////////////////////////
// Filtering policy (spec §4.5 "Filtering policy, evaluated in order")

#[derive(Debug, Clone, Default)]
pub struct ProjectionPolicy {
    pub mode_read_only: bool,
    pub mode_read_only_but_functions: bool,
    /// `--disable` code set; `R` pseudo-code expands to `S|F|G` before
    /// reaching here (spec §4.5 step 3).
    pub disable: Vec<char>,
    /// `--enable`; mutually exclusive with `disable` at the CLI layer.
    pub enable: Option<Vec<char>>,
    pub entity_allowlist: Vec<String>,
    pub function_allowlist: Vec<String>,
    pub name_shrink: bool,
    pub sort_tools: bool,
    pub prefix_mode: bool,
    pub custom_prefix: Option<String>,
    pub custom_postfix: Option<String>,
    pub no_postfix: bool,
}

/// Expands the `R` pseudo-code into `S|F|G` (spec §4.5 step 3).
fn expand_pseudo_codes(codes: &[char]) -> Vec<char> {
    let mut out = Vec::new();
    for c in codes {
        if c.to_ascii_uppercase() == 'R' {
            out.extend(['S', 'F', 'G']);
        } else {
            out.push(c.to_ascii_uppercase());
        }
    }
    out
}

fn class_allowed(class: OperationClass, policy: &ProjectionPolicy) -> bool {
    if class == OperationClass::Info {
        return true;
    }

    if policy.mode_read_only
        && matches!(
            class,
            OperationClass::Create | OperationClass::Update | OperationClass::Delete | OperationClass::Action
        )
    {
        return false;
    }
    if policy.mode_read_only_but_functions
        && matches!(class, OperationClass::Create | OperationClass::Update | OperationClass::Delete)
    {
        return false;
    }

    let code = class.code();
    if let Some(enable) = &policy.enable {
        let expanded = expand_pseudo_codes(enable);
        return expanded.contains(&code);
    }
    let disabled = expand_pseudo_codes(&policy.disable);
    !disabled.contains(&code)
}

/// Glob-style `*`/`?` matcher (no other metacharacters).
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let mut regex_str = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            other => regex_str.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex_str.push('$');
    Regex::new(&regex_str).map(|r| r.is_match(value)).unwrap_or(false)
}

fn allowlisted(name: &str, patterns: &[String]) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| wildcard_match(p, name))
}

///////////////////////////////////////////////////////////////////////////////
// Name synthesis (spec §4.5 "Name synthesis")

fn base_name(class: OperationClass, entity_or_func: &str) -> String {
    match class {
        OperationClass::Filter => format!("filter_{entity_or_func}"),
        OperationClass::Search => format!("search_{entity_or_func}"),
        OperationClass::Get => format!("get_{entity_or_func}"),
        OperationClass::Create => format!("create_{entity_or_func}"),
        OperationClass::Update => format!("update_{entity_or_func}"),
        OperationClass::Delete => format!("delete_{entity_or_func}"),
        OperationClass::Action => entity_or_func.to_string(),
        OperationClass::Info => entity_or_func.to_string(),
    }
}

/// `filter_*`/`count_*` share the same class (`Filter`) in the dispatch
/// sense but are separate tools; `count_` is synthesized directly since it
/// has no `OperationClass` of its own in the §6 enable/disable alphabet
/// (it rides along with `F`).
fn count_name(entity_set: &str) -> String {
    format!("count_{entity_set}")
}

fn qualify_name(base: &str, service_id: &str, policy: &ProjectionPolicy) -> String {
    if let Some(custom) = &policy.custom_prefix {
        return format!("{custom}{base}");
    }
    if let Some(custom) = &policy.custom_postfix {
        return format!("{base}{custom}");
    }
    if policy.no_postfix {
        return base.to_string();
    }
    if policy.prefix_mode {
        format!("{service_id}_{base}")
    } else {
        format!("{base}_for_{service_id}")
    }
}

///////////////////////////////////////////////////////////////////////////////
// Optional name shortening (spec §4.5 "Optional name shortening")

const TARGET_LENGTH: usize = 40;

const GENERIC_WORDS: &[&str] = &["DATA", "SET", "INFO", "SERVICE", "ENTITY", "SRV"];

const SYNONYMS: &[(&str, &str)] = &[
    ("SCREENING", "Scrn"),
    ("ADDRESS", "Addr"),
    ("DOCUMENT", "Doc"),
    ("CUSTOMER", "Cust"),
    ("MATERIAL", "Matl"),
    ("PRODUCT", "Prod"),
    ("PURCHASE", "Purch"),
    ("ORGANIZATION", "Org"),
    ("BUSINESS", "Biz"),
    ("PARTNER", "Ptnr"),
];

const VERB_SYNONYMS: &[(&str, &str)] = &[
    ("update", "upd"),
    ("delete", "del"),
    ("create", "crt"),
    ("filter", "flt"),
    ("search", "srch"),
];

fn tokenize(name: &str) -> Vec<String> {
    name.split(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .flat_map(decompose_camel_case)
        .collect()
}

fn decompose_camel_case(token: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = token.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && !current.is_empty() {
            let prev_lower = chars[i - 1].is_lowercase();
            let next_lower = chars.get(i + 1).map(|c| c.is_lowercase()).unwrap_or(false);
            if prev_lower || next_lower {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
    }
    if !current.is_empty() {
        words.push(current);
    }
    if words.is_empty() {
        vec![token.to_string()]
    } else {
        words
    }
}

fn strip_interior_vowels(word: &str) -> String {
    if word.len() <= 3 {
        return word.to_string();
    }
    let mut chars: Vec<char> = word.chars().collect();
    let first = chars.remove(0);
    let last = chars.pop();
    let middle: String = chars
        .into_iter()
        .filter(|c| !"aeiouAEIOU".contains(*c))
        .collect();
    match last {
        Some(l) => format!("{first}{middle}{l}"),
        None => format!("{first}{middle}"),
    }
}

/// Deterministic, idempotent shortening pipeline (spec §4.5, Invariant 8):
/// tokenize, decompose CamelCase, drop generic words, apply the synonym
/// table, shorten verbs, then strip interior vowels if still too long.
pub fn shorten_tool_name(name: &str) -> String {
    if name.len() <= TARGET_LENGTH {
        return name.to_string();
    }

    let mut verb = String::new();
    let mut rest = name;
    for (long, short) in VERB_SYNONYMS {
        if let Some(stripped) = name.strip_prefix(&format!("{long}_")) {
            verb = short.to_string();
            rest = stripped;
            break;
        }
    }

    let mut tokens = tokenize(rest);
    tokens.retain(|t| !GENERIC_WORDS.contains(&t.to_uppercase().as_str()));

    for t in tokens.iter_mut() {
        let upper = t.to_uppercase();
        if let Some((_, short)) = SYNONYMS.iter().find(|(long, _)| *long == upper) {
            *t = short.to_string();
        }
    }

    let mut shortened = if verb.is_empty() {
        tokens.join("_")
    } else {
        format!("{verb}_{}", tokens.join("_"))
    };

    if shortened.len() > TARGET_LENGTH {
        let parts: Vec<String> = shortened.split('_').map(strip_interior_vowels).collect();
        shortened = parts.join("_");
    }

    if shortened.is_empty() {
        name.to_string()
    } else {
        shortened
    }
}

///////////////////////////////////////////////////////////////////////////////
// Argument schema derivation (spec §4.5 "Argument schema per tool")

#[derive(Debug, Clone)]
struct SchemaField {
    name: String,
    json_type: &'static str,
    required: bool,
    description: String,
}

fn build_schema(fields: &[SchemaField]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for f in fields {
        properties.insert(
            f.name.clone(),
            serde_json::json!({ "type": f.json_type, "description": f.description }),
        );
        if f.required {
            required.push(Value::String(f.name.clone()));
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": Value::Object(properties),
        "required": Value::Array(required),
    })
}

fn query_option_fields() -> Vec<SchemaField> {
    vec![
        SchemaField { name: "filter".into(), json_type: "string", required: false, description: "OData $filter expression".into() },
        SchemaField { name: "select".into(), json_type: "string", required: false, description: "Comma-separated properties to return ($select)".into() },
        SchemaField { name: "expand".into(), json_type: "string", required: false, description: "Comma-separated navigation properties to expand ($expand)".into() },
        SchemaField { name: "orderby".into(), json_type: "string", required: false, description: "OData $orderby expression".into() },
        SchemaField { name: "top".into(), json_type: "integer", required: false, description: "Maximum number of entities to return ($top)".into() },
        SchemaField { name: "skip".into(), json_type: "integer", required: false, description: "Number of entities to skip ($skip)".into() },
        SchemaField { name: "skiptoken".into(), json_type: "string", required: false, description: "Server-supplied continuation token ($skiptoken)".into() },
        SchemaField { name: "count".into(), json_type: "boolean", required: false, description: "Include total count in the response ($inlinecount=allpages)".into() },
    ]
}

fn key_field(prop: &crate::metadata::Property) -> SchemaField {
    let t = abstract_type_of(&prop.edm_type);
    SchemaField {
        name: prop.name.clone(),
        json_type: json_schema_type(t),
        required: true,
        description: format!("{} ({}) (key)", prop.name, prop.edm_type),
    }
}

fn property_field(prop: &crate::metadata::Property, required: bool) -> SchemaField {
    let t = abstract_type_of(&prop.edm_type);
    SchemaField {
        name: prop.name.clone(),
        json_type: json_schema_type(t),
        required,
        description: format!("{} ({})", prop.name, prop.edm_type),
    }
}

///////////////////////////////////////////////////////////////////////////////
// Projection entry point

/// Projects every tool for one entity set, applying the policy. Returns an
/// empty vec if nothing survives filtering (e.g. `addressable=false`).
pub fn project_entity_set_tools(
    set: &EntitySet,
    entity_type: &EntityType,
    service_id: &str,
    policy: &ProjectionPolicy,
) -> Vec<ToolDescriptor> {
    if !set.capabilities.addressable || !allowlisted(&set.name, &policy.entity_allowlist) {
        return Vec::new();
    }

    let mut out = Vec::new();
    let keys: Vec<_> = entity_type.key_properties();

    // filter_ (always, spec §4.5)
    if class_allowed(OperationClass::Filter, policy) {
        let name = finalize_name(&base_name(OperationClass::Filter, &set.name), service_id, policy);
        out.push(ToolDescriptor {
            name,
            description: format!("Query {} with OData filter/select/orderby/paging options", set.name),
            input_schema: build_schema(&query_option_fields()),
            class: OperationClass::Filter,
            handler: ToolHandler::Filter(set.name.clone()),
        });

        // count_ rides along with filter (spec §4.5 argument schema table).
        let count_name_final = finalize_name(&count_name(&set.name), service_id, policy);
        out.push(ToolDescriptor {
            name: count_name_final,
            description: format!("Count {} matching an optional OData filter", set.name),
            input_schema: build_schema(&[SchemaField {
                name: "filter".into(),
                json_type: "string",
                required: false,
                description: "OData $filter expression".into(),
            }]),
            class: OperationClass::Filter,
            handler: ToolHandler::Count(set.name.clone()),
        });
    }

    // search_ (gated by searchable)
    if set.capabilities.searchable && class_allowed(OperationClass::Search, policy) {
        let name = finalize_name(&base_name(OperationClass::Search, &set.name), service_id, policy);
        let mut fields = vec![SchemaField {
            name: "search_term".into(),
            json_type: "string",
            required: true,
            description: "Free-text search term ($search)".into(),
        }];
        fields.push(SchemaField { name: "top".into(), json_type: "integer", required: false, description: "Maximum number of entities to return".into() });
        fields.push(SchemaField { name: "skip".into(), json_type: "integer", required: false, description: "Number of entities to skip".into() });
        out.push(ToolDescriptor {
            name,
            description: format!("Free-text search over {}", set.name),
            input_schema: build_schema(&fields),
            class: OperationClass::Search,
            handler: ToolHandler::Search(set.name.clone()),
        });
    }

    // get_ (always, requires keys)
    if !keys.is_empty() && class_allowed(OperationClass::Get, policy) {
        let name = finalize_name(&base_name(OperationClass::Get, &set.name), service_id, policy);
        let mut fields: Vec<SchemaField> = keys.iter().map(|k| key_field(*k)).collect();
        fields.push(SchemaField { name: "select".into(), json_type: "string", required: false, description: "Comma-separated properties to return".into() });
        fields.push(SchemaField { name: "expand".into(), json_type: "string", required: false, description: "Comma-separated navigation properties to expand".into() });
        out.push(ToolDescriptor {
            name,
            description: format!("Fetch a single {} entity by key", entity_type.name),
            input_schema: build_schema(&fields),
            class: OperationClass::Get,
            handler: ToolHandler::Get(set.name.clone()),
        });
    }

    // create_
    if set.capabilities.creatable && class_allowed(OperationClass::Create, policy) {
        let name = finalize_name(&base_name(OperationClass::Create, &set.name), service_id, policy);
        let fields: Vec<SchemaField> = entity_type
            .properties
            .iter()
            .filter(|p| !p.is_key)
            .map(|p| property_field(p, !p.nullable))
            .collect();
        out.push(ToolDescriptor {
            name,
            description: format!("Create a new {} entity", entity_type.name),
            input_schema: build_schema(&fields),
            class: OperationClass::Create,
            handler: ToolHandler::Create(set.name.clone()),
        });
    }

    // update_
    if set.capabilities.updatable && !keys.is_empty() && class_allowed(OperationClass::Update, policy) {
        let name = finalize_name(&base_name(OperationClass::Update, &set.name), service_id, policy);
        let mut fields: Vec<SchemaField> = keys.iter().map(|k| key_field(*k)).collect();
        fields.extend(entity_type.properties.iter().filter(|p| !p.is_key).map(|p| property_field(p, false)));
        out.push(ToolDescriptor {
            name,
            description: format!("Update an existing {} entity", entity_type.name),
            input_schema: build_schema(&fields),
            class: OperationClass::Update,
            handler: ToolHandler::Update(set.name.clone()),
        });
    }

    // delete_
    if set.capabilities.deletable && !keys.is_empty() && class_allowed(OperationClass::Delete, policy) {
        let name = finalize_name(&base_name(OperationClass::Delete, &set.name), service_id, policy);
        let fields: Vec<SchemaField> = keys.iter().map(|k| key_field(*k)).collect();
        out.push(ToolDescriptor {
            name,
            description: format!("Delete a {} entity by key", entity_type.name),
            input_schema: build_schema(&fields),
            class: OperationClass::Delete,
            handler: ToolHandler::Delete(set.name.clone()),
        });
    }

    out
}

pub fn project_function_import_tool(
    func: &FunctionImport,
    service_id: &str,
    policy: &ProjectionPolicy,
) -> Option<ToolDescriptor> {
    if !class_allowed(OperationClass::Action, policy) || !allowlisted(&func.name, &policy.function_allowlist) {
        return None;
    }

    let name = finalize_name(&func.name, service_id, policy);
    let fields: Vec<SchemaField> = func
        .params
        .iter()
        .map(|p| {
            let t = abstract_type_of(&p.edm_type);
            SchemaField {
                name: p.name.clone(),
                json_type: json_schema_type(t),
                required: !p.nullable,
                description: format!("{} ({})", p.name, p.edm_type),
            }
        })
        .collect();

    let method = match func.method {
        FunctionMethod::Get => "GET",
        FunctionMethod::Post => "POST",
    };

    Some(ToolDescriptor {
        name,
        description: format!("Invoke the {} function import ({method})", func.name),
        input_schema: build_schema(&fields),
        class: OperationClass::Action,
        handler: ToolHandler::Function(func.name.clone()),
    })
}

fn finalize_name(base: &str, service_id: &str, policy: &ProjectionPolicy) -> String {
    let qualified = qualify_name(base, service_id, policy);
    if policy.name_shrink {
        shorten_tool_name(&qualified)
    } else {
        qualified
    }
}

/// Projects every tool in the service, in deterministic (insertion or
/// alphabetical) order per `policy.sort_tools` (spec §4.6 `tools/list`).
pub fn project_all_tools(metadata: &ServiceMetadata, policy: &ProjectionPolicy) -> Vec<ToolDescriptor> {
    let mut out = Vec::new();

    for set_name in metadata.entity_set_names_sorted() {
        let set = &metadata.entity_sets[set_name];
        if let Some(entity_type) = metadata.entity_types.get(&set.entity_type_name) {
            out.extend(project_entity_set_tools(set, entity_type, &metadata.service_id, policy));
        }
    }

    let mut funcs: Vec<&FunctionImport> = metadata.function_imports.iter().collect();
    funcs.sort_by(|a, b| a.name.cmp(&b.name));
    for func in funcs {
        if let Some(tool) = project_function_import_tool(func, &metadata.service_id, policy) {
            out.push(tool);
        }
    }

    if policy.sort_tools {
        out.sort_by(|a, b| a.name.cmp(&b.name));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Capabilities, Property};

    fn sample_entity_type() -> EntityType {
        EntityType {
            name: "Product".into(),
            qualified_name: "NS.Product".into(),
            properties: vec![
                Property { name: "ProductID".into(), edm_type: "Edm.Int32".into(), nullable: false, is_key: true, max_length: None },
                Property { name: "Name".into(), edm_type: "Edm.String".into(), nullable: false, is_key: false, max_length: None },
                Property { name: "Price".into(), edm_type: "Edm.Decimal".into(), nullable: true, is_key: false, max_length: None },
            ],
        }
    }

    fn sample_entity_set(caps: Capabilities) -> EntitySet {
        EntitySet {
            name: "Products".into(),
            entity_type_name: "Product".into(),
            capabilities: caps,
        }
    }

    #[test]
    fn non_creatable_set_has_no_create_tool() {
        let mut caps = Capabilities::default();
        caps.creatable = false;
        let set = sample_entity_set(caps);
        let et = sample_entity_type();
        let policy = ProjectionPolicy::default();
        let tools = project_entity_set_tools(&set, &et, "svc", &policy);
        assert!(!tools.iter().any(|t| t.class == OperationClass::Create));
    }

    #[test]
    fn read_only_drops_write_and_action_classes() {
        let set = sample_entity_set(Capabilities::default());
        let et = sample_entity_type();
        let policy = ProjectionPolicy { mode_read_only: true, ..Default::default() };
        let tools = project_entity_set_tools(&set, &et, "svc", &policy);
        assert!(!tools.iter().any(|t| matches!(t.class, OperationClass::Create | OperationClass::Update | OperationClass::Delete)));
    }

    #[test]
    fn create_requires_exactly_non_key_non_nullable() {
        let set = sample_entity_set(Capabilities::default());
        let et = sample_entity_type();
        let policy = ProjectionPolicy::default();
        let tools = project_entity_set_tools(&set, &et, "svc", &policy);
        let create = tools.iter().find(|t| t.class == OperationClass::Create).unwrap();
        let required = create.input_schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], "Name");
    }

    #[test]
    fn get_requires_only_keys() {
        let set = sample_entity_set(Capabilities::default());
        let et = sample_entity_type();
        let policy = ProjectionPolicy::default();
        let tools = project_entity_set_tools(&set, &et, "svc", &policy);
        let get = tools.iter().find(|t| t.class == OperationClass::Get).unwrap();
        let required = get.input_schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], "ProductID");
    }

    #[test]
    fn name_suffix_applied_by_default() {
        let name = qualify_name("filter_Products", "Northwind_svc", &ProjectionPolicy::default());
        assert_eq!(name, "filter_Products_for_Northwind_svc");
    }

    #[test]
    fn name_prefix_mode() {
        let policy = ProjectionPolicy { prefix_mode: true, ..Default::default() };
        let name = qualify_name("filter_Products", "Northwind_svc", &policy);
        assert_eq!(name, "Northwind_svc_filter_Products");
    }

    #[test]
    fn shorten_is_idempotent_on_short_names() {
        let short = "filter_Products";
        assert_eq!(shorten_tool_name(short), short);
    }

    #[test]
    fn shorten_is_idempotent_when_applied_twice() {
        let long = "update_ZCL_SCREENING_ADDRESS_DATA_MASTER_SET_for_ZGW_CLIENT_PROXY_SRV";
        let once = shorten_tool_name(long);
        let twice = shorten_tool_name(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn wildcard_entity_allowlist() {
        assert!(wildcard_match("Prod*", "Products"));
        assert!(wildcard_match("Pro?ucts", "Products"));
        assert!(!wildcard_match("Cust*", "Products"));
    }

    #[test]
    fn disabled_codes_drop_matching_classes() {
        let set = sample_entity_set(Capabilities::default());
        let et = sample_entity_type();
        let policy = ProjectionPolicy { disable: vec!['D'], ..Default::default() };
        let tools = project_entity_set_tools(&set, &et, "svc", &policy);
        assert!(!tools.iter().any(|t| t.class == OperationClass::Delete));
    }

    #[test]
    fn pseudo_code_r_expands() {
        let expanded = expand_pseudo_codes(&['R']);
        assert_eq!(expanded, vec!['S', 'F', 'G']);
    }

    #[test]
    fn zero_entity_sets_projects_no_tools() {
        let metadata = ServiceMetadata {
            base_url: "https://example.com/".into(),
            entity_types: std::collections::HashMap::new(),
            entity_sets: std::collections::HashMap::new(),
            function_imports: Vec::new(),
            service_id: "example_com".into(),
        };
        let tools = project_all_tools(&metadata, &ProjectionPolicy::default());
        assert!(tools.is_empty());
    }
}
