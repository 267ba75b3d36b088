//! The informational tool: a single tool returning a structured service
//! summary merged with hint data (spec §4.5 `Info`, §6 "Hints file").

use serde_json::Value;

use crate::metadata::ServiceMetadata;
use crate::tools::ToolDescriptor;

/// Builds the JSON body returned by the info tool and its `readme` alias.
/// `implementation_hints` carries whatever [`crate::hints::merge_matching_hints`]
/// produced, embedded verbatim -- the engine never interprets it.
pub fn build_info_response(
    metadata: &ServiceMetadata,
    tools: &[ToolDescriptor],
    implementation_hints: Value,
) -> Value {
    let entity_sets: Vec<Value> = metadata
        .entity_set_names_sorted()
        .into_iter()
        .map(|name| {
            let set = &metadata.entity_sets[name];
            serde_json::json!({
                "name": name,
                "entity_type": set.entity_type_name,
                "creatable": set.capabilities.creatable,
                "updatable": set.capabilities.updatable,
                "deletable": set.capabilities.deletable,
                "searchable": set.capabilities.searchable,
                "pageable": set.capabilities.pageable,
                "addressable": set.capabilities.addressable,
            })
        })
        .collect();

    let function_imports: Vec<Value> = metadata
        .function_imports
        .iter()
        .map(|f| {
            serde_json::json!({
                "name": f.name,
                "method": match f.method {
                    crate::metadata::FunctionMethod::Get => "GET",
                    crate::metadata::FunctionMethod::Post => "POST",
                },
                "params": f.params.iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
            })
        })
        .collect();

    let tool_names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();

    serde_json::json!({
        "service_url": metadata.base_url,
        "service_id": metadata.service_id,
        "entity_sets": entity_sets,
        "function_imports": function_imports,
        "tool_count": tools.len(),
        "tools": tool_names,
        "implementation_hints": implementation_hints,
    })
}

/// Name of the informational tool before the `readme` alias is registered
/// alongside it in the dispatch table (spec §4.5: "one `Info` ... plus an
/// alias named `readme`").
pub const DEFAULT_INFO_TOOL_NAME: &str = "service_info";
pub const README_ALIAS: &str = "readme";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn info_response_lists_entity_sets_and_hints() {
        let metadata = ServiceMetadata {
            base_url: "https://example.com/odata/".to_string(),
            entity_types: HashMap::new(),
            entity_sets: HashMap::new(),
            function_imports: Vec::new(),
            service_id: "example_com".to_string(),
        };
        let hints = serde_json::json!({"notes": "hello"});
        let response = build_info_response(&metadata, &[], hints);
        assert_eq!(response["service_id"], "example_com");
        assert_eq!(response["implementation_hints"]["notes"], "hello");
    }
}
