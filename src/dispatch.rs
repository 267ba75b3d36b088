//! JSON-RPC dispatcher: registers the synthesized tool table, accepts
//! `initialize`/`tools/list`/`tools/call`, routes to handlers, and wraps
//! results/errors in the MCP content envelope (spec §4.6 "dispatch" half).

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::BridgeError;
use crate::hints::merge_matching_hints;
use crate::info::{build_info_response, README_ALIAS};
use crate::metadata::ServiceMetadata;
use crate::request::{QueryOptions, RequestEngine};
use crate::response::{normalize_entity_response, normalize_list_response, unwrap_d_envelope, unwrap_list, NormalizeOptions};
use crate::session::Session;
use crate::tools::{project_all_tools, ProjectionPolicy, ToolDescriptor, ToolHandler};

///////////////////////////////////////////////////////////////////////////////

/// Everything the dispatcher needs to build or route a call, owned for the
/// process lifetime (spec §3 "Lifecycle", §5 "Shared state").
pub struct Dispatcher {
    pub metadata: ServiceMetadata,
    pub session: Session,
    pub tools: Vec<ToolDescriptor>,
    pub tools_by_name: HashMap<String, usize>,
    pub legacy_dates: bool,
    pub response_metadata: bool,
    pub max_items: usize,
    pub max_response_size: usize,
    pub pagination_hints: bool,
    pub verbose_errors: bool,
    pub info_tool_name: String,
    pub implementation_hints: Value,
}

impl Dispatcher {
    pub fn new(
        metadata: ServiceMetadata,
        session: Session,
        policy: &ProjectionPolicy,
        info_tool_name: String,
        implementation_hints: Value,
        legacy_dates: bool,
        response_metadata: bool,
        max_items: usize,
        max_response_size: usize,
        pagination_hints: bool,
        verbose_errors: bool,
    ) -> Self {
        let mut tools = project_all_tools(&metadata, policy);

        // Info tool + `readme` alias (spec §4.5, §9 supplemented features).
        tools.push(ToolDescriptor {
            name: info_tool_name.clone(),
            description: "Summary of this service's entity sets, function imports, and tool catalog".to_string(),
            input_schema: serde_json::json!({ "type": "object", "properties": {}, "required": [] }),
            class: crate::tools::OperationClass::Info,
            handler: ToolHandler::Info,
        });
        tools.push(ToolDescriptor {
            name: README_ALIAS.to_string(),
            description: "Alias for the service-info tool".to_string(),
            input_schema: serde_json::json!({ "type": "object", "properties": {}, "required": [] }),
            class: crate::tools::OperationClass::Info,
            handler: ToolHandler::Info,
        });

        if policy.sort_tools {
            tools.sort_by(|a, b| a.name.cmp(&b.name));
        }

        let tools_by_name = tools.iter().enumerate().map(|(i, t)| (t.name.clone(), i)).collect();

        Self {
            metadata,
            session,
            tools,
            tools_by_name,
            legacy_dates,
            response_metadata,
            max_items,
            max_response_size,
            pagination_hints,
            verbose_errors,
            info_tool_name,
            implementation_hints,
        }
    }

    fn normalize_opts(&self) -> NormalizeOptions {
        NormalizeOptions {
            legacy_dates: self.legacy_dates,
            response_metadata: self.response_metadata,
            max_items: self.max_items,
            max_response_size: self.max_response_size,
            pagination_hints: self.pagination_hints,
        }
    }

    fn engine(&self) -> RequestEngine<'_> {
        RequestEngine {
            session: &self.session,
            metadata: &self.metadata,
            legacy_dates: self.legacy_dates,
            verbose_errors: self.verbose_errors,
        }
    }

    /// `tools/list`: deterministically ordered table (spec §4.6).
    pub fn list_tools(&self) -> Value {
        let items: Vec<Value> = self
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect();
        serde_json::json!({ "tools": items })
    }

    /// `tools/call`: validates arguments against the tool's schema, invokes
    /// the handler, wraps the result in a content envelope (spec §4.6).
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, BridgeError> {
        let idx = *self
            .tools_by_name
            .get(name)
            .ok_or_else(|| BridgeError::ArgumentError(format!("unknown tool: {name}")))?;
        let tool = &self.tools[idx];

        let args = validate_arguments(&tool.input_schema, arguments)?;

        let result = self.invoke_handler(tool, args).await?;

        Ok(serde_json::json!({
            "content": [{ "type": "text", "text": serde_json::to_string(&result).unwrap_or_default() }],
        }))
    }

    async fn invoke_handler(&self, tool: &ToolDescriptor, args: Map<String, Value>) -> Result<Value, BridgeError> {
        match &tool.handler {
            ToolHandler::Info => {
                let hints = self.implementation_hints.clone();
                Ok(build_info_response(&self.metadata, &self.tools, hints))
            }
            ToolHandler::Filter(set_name) => {
                let (set, entity_type) = self.lookup(set_name)?;
                let opts = query_options_from_args(&args);
                let skip = opts.skip.unwrap_or(0);
                let raw = self.engine().filter(set, entity_type, &opts).await?;
                let unwrapped_outer = unwrap_d_envelope(raw);
                let unwrapped = unwrap_list(unwrapped_outer)
                    .ok_or_else(|| BridgeError::InternalError("upstream response was not list-shaped".to_string()))?;
                Ok(normalize_list_response(unwrapped, entity_type, set, &tool.name, skip, self.normalize_opts()))
            }
            ToolHandler::Count(set_name) => {
                let (set, _) = self.lookup(set_name)?;
                let filter = args.get("filter").and_then(|v| v.as_str());
                let count = self.engine().count(set, filter).await?;
                Ok(serde_json::json!({ "count": count }))
            }
            ToolHandler::Search(set_name) => {
                let (set, entity_type) = self.lookup(set_name)?;
                if !set.capabilities.searchable {
                    return Err(BridgeError::PolicyError(format!("{set_name} is not searchable")));
                }
                let term = args
                    .get("search_term")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| BridgeError::ArgumentError("search_term is required".to_string()))?;
                let top = args.get("top").and_then(|v| v.as_i64());
                let skip = args.get("skip").and_then(|v| v.as_i64());
                let raw = self.engine().search(set, term, top, skip).await?;
                let unwrapped_outer = unwrap_d_envelope(raw);
                let unwrapped = unwrap_list(unwrapped_outer)
                    .ok_or_else(|| BridgeError::InternalError("upstream response was not list-shaped".to_string()))?;
                Ok(normalize_list_response(unwrapped, entity_type, set, &tool.name, skip.unwrap_or(0), self.normalize_opts()))
            }
            ToolHandler::Get(set_name) => {
                let (set, entity_type) = self.lookup(set_name)?;
                let key_values = key_values_from_args(entity_type, &args)?;
                let select = args.get("select").and_then(|v| v.as_str());
                let expand = args.get("expand").and_then(|v| v.as_str());
                let key_refs: Vec<(&str, &str)> = key_values.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                let raw = self.engine().get(set, entity_type, &key_refs, select, expand).await?;
                Ok(normalize_entity_response(raw, entity_type, self.normalize_opts()))
            }
            ToolHandler::Create(set_name) => {
                let (set, entity_type) = self.lookup(set_name)?;
                if !set.capabilities.creatable {
                    return Err(BridgeError::PolicyError(format!("{set_name} is not creatable")));
                }
                let raw = self.engine().create(set, entity_type, args).await?;
                Ok(normalize_entity_response(raw, entity_type, self.normalize_opts()))
            }
            ToolHandler::Update(set_name) => {
                let (set, entity_type) = self.lookup(set_name)?;
                if !set.capabilities.updatable {
                    return Err(BridgeError::PolicyError(format!("{set_name} is not updatable")));
                }
                let key_values = key_values_from_args(entity_type, &args)?;
                let key_refs: Vec<(&str, &str)> = key_values.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                let mut payload = args;
                for (k, _) in &key_values {
                    payload.remove(k);
                }
                self.engine().update(set, entity_type, &key_refs, payload).await?;
                Ok(serde_json::json!({ "success": true }))
            }
            ToolHandler::Delete(set_name) => {
                let (set, entity_type) = self.lookup(set_name)?;
                if !set.capabilities.deletable {
                    return Err(BridgeError::PolicyError(format!("{set_name} is not deletable")));
                }
                let key_values = key_values_from_args(entity_type, &args)?;
                let key_refs: Vec<(&str, &str)> = key_values.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                self.engine().delete(set, entity_type, &key_refs).await?;
                Ok(serde_json::json!({ "success": true }))
            }
            ToolHandler::Function(func_name) => {
                let func = self
                    .metadata
                    .function_imports
                    .iter()
                    .find(|f| &f.name == func_name)
                    .ok_or_else(|| BridgeError::InternalError(format!("function import {func_name} not found")))?;
                let params: Vec<(&str, String)> = func
                    .params
                    .iter()
                    .filter_map(|p| args.get(&p.name).map(|v| (p.name.as_str(), value_to_query_string(v))))
                    .collect();
                let raw = self.engine().call_function(func, &params).await?;
                // Open question (spec §9) resolved: collection-returning
                // function imports are wrapped in `results` like filter_*.
                if let Value::Array(items) = raw {
                    Ok(serde_json::json!({ "results": items }))
                } else {
                    Ok(raw)
                }
            }
        }
    }

    fn lookup(&self, set_name: &str) -> Result<(&crate::metadata::EntitySet, &crate::metadata::EntityType), BridgeError> {
        let set = self
            .metadata
            .entity_sets
            .get(set_name)
            .ok_or_else(|| BridgeError::InternalError(format!("entity set {set_name} not found")))?;
        let entity_type = self
            .metadata
            .entity_types
            .get(&set.entity_type_name)
            .ok_or_else(|| BridgeError::InternalError(format!("entity type {} not found", set.entity_type_name)))?;
        Ok((set, entity_type))
    }
}

fn value_to_query_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn query_options_from_args(args: &Map<String, Value>) -> QueryOptions {
    QueryOptions {
        filter: args.get("filter").and_then(|v| v.as_str()).map(str::to_string),
        select: args.get("select").and_then(|v| v.as_str()).map(str::to_string),
        expand: args.get("expand").and_then(|v| v.as_str()).map(str::to_string),
        orderby: args.get("orderby").and_then(|v| v.as_str()).map(str::to_string),
        top: args.get("top").and_then(|v| v.as_i64()),
        skip: args.get("skip").and_then(|v| v.as_i64()),
        skiptoken: args.get("skiptoken").and_then(|v| v.as_str()).map(str::to_string),
        search: None,
        count: args.get("count").and_then(|v| v.as_bool()).unwrap_or(false),
    }
}

fn key_values_from_args(
    entity_type: &crate::metadata::EntityType,
    args: &Map<String, Value>,
) -> Result<Vec<(String, String)>, BridgeError> {
    entity_type
        .key_properties()
        .iter()
        .map(|k| {
            let value = args
                .get(&k.name)
                .ok_or_else(|| BridgeError::ArgumentError(format!("missing required key {}", k.name)))?;
            Ok((k.name.clone(), value_to_query_string(value)))
        })
        .collect()
}

/// Validates `arguments` against `schema`: unknown arguments error, missing
/// required error, type mismatch errors (spec §4.6 `tools/call`).
fn validate_arguments(schema: &Value, arguments: Value) -> Result<Map<String, Value>, BridgeError> {
    let args = match arguments {
        Value::Object(m) => m,
        Value::Null => Map::new(),
        _ => return Err(BridgeError::ArgumentError("arguments must be a JSON object".to_string())),
    };

    let properties = schema.get("properties").and_then(|v| v.as_object()).cloned().unwrap_or_default();
    let required: Vec<String> = schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    for key in args.keys() {
        if !properties.contains_key(key) {
            return Err(BridgeError::ArgumentError(format!("unknown argument: {key}")));
        }
    }

    for name in &required {
        if !args.contains_key(name) {
            return Err(BridgeError::ArgumentError(format!("missing required argument: {name}")));
        }
    }

    for (key, value) in &args {
        let Some(expected_type) = properties.get(key).and_then(|p| p.get("type")).and_then(|t| t.as_str()) else {
            continue;
        };
        let matches = match expected_type {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            _ => true,
        };
        if !matches {
            return Err(BridgeError::ArgumentError(format!(
                "argument {key} expected type {expected_type}, got {value}"
            )));
        }
    }

    Ok(args)
}

/// `initialize`: static protocol handshake payload.
pub fn initialize_response() -> Value {
    serde_json::json!({
        "protocolVersion": "2024-11-05",
        "capabilities": { "tools": {} },
        "serverInfo": { "name": "odata-mcp-bridge", "version": env!("CARGO_PKG_VERSION") },
    })
}

/// Loads and merges the hints file (if any) plus an inline `--hint`
/// (spec §6 "Hints file").
pub fn load_implementation_hints(
    hints_file: Option<&std::path::Path>,
    inline_hint: Option<&str>,
    service_url: &str,
) -> Value {
    let Some(path) = hints_file else {
        return match inline_hint {
            Some(h) => merge_matching_hints(&crate::hints::HintsFile { version: None, hints: vec![] }, service_url, Some(h)),
            None => Value::Object(Map::new()),
        };
    };

    match std::fs::read_to_string(path) {
        Ok(contents) => match crate::hints::parse_hints_file(&contents) {
            Ok(file) => merge_matching_hints(&file, service_url, inline_hint),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse hints file");
                Value::Object(Map::new())
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "failed to read hints file");
            Value::Object(Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_unknown_argument() {
        let schema = serde_json::json!({ "type": "object", "properties": {"filter": {"type": "string"}}, "required": [] });
        let err = validate_arguments(&schema, serde_json::json!({"bogus": 1})).unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentError(_)));
    }

    #[test]
    fn validate_rejects_missing_required() {
        let schema = serde_json::json!({ "type": "object", "properties": {"ProductID": {"type": "integer"}}, "required": ["ProductID"] });
        let err = validate_arguments(&schema, serde_json::json!({})).unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentError(_)));
    }

    #[test]
    fn validate_rejects_type_mismatch() {
        let schema = serde_json::json!({ "type": "object", "properties": {"top": {"type": "integer"}}, "required": [] });
        let err = validate_arguments(&schema, serde_json::json!({"top": "not a number"})).unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentError(_)));
    }

    #[test]
    fn validate_accepts_well_formed_arguments() {
        let schema = serde_json::json!({ "type": "object", "properties": {"top": {"type": "integer"}}, "required": [] });
        let args = validate_arguments(&schema, serde_json::json!({"top": 5})).unwrap();
        assert_eq!(args["top"], 5);
    }
}
