//! EDMX `$metadata` document model and parser (spec §4.1 "Metadata Reader").
//!
//! Real SAP gateways emit attribute order and namespace prefixes that vary
//! wildly between versions, so this walks the document with quick-xml's
//! low-level `Reader` rather than leaning on strict `serde::Deserialize`
//! structs -- the same tolerance the teacher crate's writer side assumed in
//! the other direction.
//
// <edmx:Edmx xmlns:edmx="http://schemas.microsoft.com/ado/2007/06/edmx" Version="1.0">
//   <edmx:DataServices xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata" m:DataServiceVersion="1.0" m:MaxDataServiceVersion="3.0">
//     <Schema xmlns="http://schemas.microsoft.com/ado/2008/09/edm" Namespace="NorthwindModel">
//       <EntityType Name="Employee" sap:content-version="1">
//         <Key><PropertyRef Name="EmployeeID"/></Key>
//         <Property Name="LastName" Type="Edm.String" Nullable="false" MaxLength="20"/>
//       </EntityType>
//       <EntityContainer Name="NorthwindEntities" m:IsDefaultEntityContainer="true">
//         <EntitySet Name="Products" EntityType="NorthwindModel.Product" sap:creatable="false"/>
//         <FunctionImport Name="GetDate" m:HttpMethod="GET" ReturnType="Edm.DateTime"/>
//       </EntityContainer>
//     </Schema>
//   </edmx:DataServices>
// </edmx:Edmx>

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::error::BridgeError;

///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub edm_type: String,
    pub nullable: bool,
    pub is_key: bool,
    pub max_length: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EntityType {
    pub name: String,
    pub qualified_name: String,
    pub properties: Vec<Property>,
}

impl EntityType {
    pub fn key_properties(&self) -> Vec<&Property> {
        self.properties.iter().filter(|p| p.is_key).collect()
    }
}

/// Capability flags read from `sap:*` annotations (spec §3 EntitySet,
/// §4.1). Absent annotations default to `true` for a parsed document and to
/// `false` (conservative) for a synthesized fallback shell.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub creatable: bool,
    pub updatable: bool,
    pub deletable: bool,
    pub searchable: bool,
    pub pageable: bool,
    pub addressable: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            creatable: true,
            updatable: true,
            deletable: true,
            searchable: true,
            pageable: true,
            addressable: true,
        }
    }
}

impl Capabilities {
    pub fn read_only() -> Self {
        Self {
            creatable: false,
            updatable: false,
            deletable: false,
            searchable: true,
            pageable: true,
            addressable: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EntitySet {
    pub name: String,
    pub entity_type_name: String,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct FunctionParam {
    pub name: String,
    pub edm_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionImport {
    pub name: String,
    pub method: FunctionMethod,
    pub params: Vec<FunctionParam>,
    pub return_type: Option<String>,
}

/// Immutable, process-lifetime snapshot of the target service (spec §3
/// "ServiceMetadata"). Built once at startup.
#[derive(Debug, Clone)]
pub struct ServiceMetadata {
    pub base_url: String,
    pub entity_types: HashMap<String, EntityType>,
    pub entity_sets: HashMap<String, EntitySet>,
    pub function_imports: Vec<FunctionImport>,
    /// Short stable token derived from `base_url` (spec §4.5 "Name synthesis").
    pub service_id: String,
}

impl ServiceMetadata {
    pub fn entity_set_names_sorted(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entity_sets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

///////////////////////////////////////////////////////////////////////////////
// Parsing

/// Parsed EDMX document, before it's combined with a base URL + service id
/// into a `ServiceMetadata`.
pub struct ParsedSchema {
    pub entity_types: HashMap<String, EntityType>,
    pub entity_sets: HashMap<String, EntitySet>,
    pub function_imports: Vec<FunctionImport>,
}

/// Walks `$metadata` XML, accumulating EntityTypes, EntitySets, and
/// FunctionImports. Per-entity parse failures are logged and skipped
/// (spec §4.1 "Non-fatal per-entity parse failures").
pub fn parse_edmx(xml: &str) -> Result<ParsedSchema, BridgeError> {
    let mut reader = Reader::from_str(xml);
    {
        let config = reader.config_mut();
        config.trim_text_start = true;
        config.trim_text_end = true;
    }

    let mut entity_types = HashMap::new();
    let mut entity_sets = HashMap::new();
    let mut function_imports = Vec::new();

    let mut current_namespace = String::new();
    let mut current_entity: Option<(String, Vec<Property>, Vec<String>)> = None; // (name, props, key names)

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(event @ Event::Start(_)) | Ok(event @ Event::Empty(_)) => {
                let is_empty = matches!(event, Event::Empty(_));
                let e = match &event {
                    Event::Start(e) | Event::Empty(e) => e,
                    _ => unreachable!(),
                };
                let local = local_name(e.name().as_ref());
                match local {
                    "Schema" => {
                        current_namespace = attr(e, "Namespace").unwrap_or_default();
                    }
                    "EntityType" => {
                        let name = match attr(e, "Name") {
                            Some(n) => n,
                            None => {
                                tracing::warn!("EntityType with no Name attribute, skipping");
                                continue;
                            }
                        };
                        current_entity = Some((name, Vec::new(), Vec::new()));
                    }
                    "PropertyRef" => {
                        if let Some((_, _, keys)) = current_entity.as_mut() {
                            if let Some(n) = attr(e, "Name") {
                                keys.push(n);
                            }
                        }
                    }
                    "Property" => {
                        if let Some((_, props, _)) = current_entity.as_mut() {
                            let name = attr(e, "Name");
                            let edm_type = attr(e, "Type");
                            if let (Some(name), Some(edm_type)) = (name, edm_type) {
                                let nullable = attr(e, "Nullable")
                                    .map(|v| v != "false")
                                    .unwrap_or(true);
                                let max_length = attr(e, "MaxLength").and_then(|v| v.parse().ok());
                                props.push(Property {
                                    name,
                                    edm_type,
                                    nullable,
                                    is_key: false,
                                    max_length,
                                });
                            } else {
                                tracing::warn!("Property missing Name/Type, skipping");
                            }
                        }
                    }
                    "EntitySet" => {
                        let name = attr(e, "Name");
                        let entity_type = attr(e, "EntityType");
                        if let (Some(name), Some(entity_type)) = (name, entity_type) {
                            let entity_type_name = entity_type
                                .rsplit('.')
                                .next()
                                .unwrap_or(&entity_type)
                                .to_string();
                            let capabilities = Capabilities {
                                creatable: sap_flag(e, "creatable", true),
                                updatable: sap_flag(e, "updatable", true),
                                deletable: sap_flag(e, "deletable", true),
                                searchable: sap_flag(e, "searchable", true),
                                pageable: sap_flag(e, "pageable", true),
                                addressable: sap_flag(e, "addressable", true),
                            };
                            entity_sets.insert(
                                name.clone(),
                                EntitySet {
                                    name,
                                    entity_type_name,
                                    capabilities,
                                },
                            );
                        } else {
                            tracing::warn!("EntitySet missing Name/EntityType, skipping");
                        }
                    }
                    "FunctionImport" => {
                        if let Some(name) = attr(e, "Name") {
                            let method = match attr(e, "HttpMethod").as_deref() {
                                Some("POST") => FunctionMethod::Post,
                                _ => FunctionMethod::Get,
                            };
                            let return_type = attr(e, "ReturnType");
                            function_imports.push(FunctionImport {
                                name,
                                method,
                                params: Vec::new(),
                                return_type,
                            });
                        } else {
                            tracing::warn!("FunctionImport missing Name, skipping");
                        }
                    }
                    "Parameter" => {
                        if let (Some(name), Some(edm_type)) = (attr(e, "Name"), attr(e, "Type")) {
                            let nullable = attr(e, "Nullable").map(|v| v != "false").unwrap_or(true);
                            if let Some(f) = function_imports.last_mut() {
                                f.params.push(FunctionParam {
                                    name,
                                    edm_type,
                                    nullable,
                                });
                            }
                        }
                    }
                    _ => {}
                }

                // `<EntityType .../>` self-closing with no children: finalize now.
                if is_empty && local == "EntityType" {
                    finalize_entity(&mut current_entity, &current_namespace, &mut entity_types);
                }
            }
            Ok(Event::End(ref e)) => {
                if local_name(e.name().as_ref()) == "EntityType" {
                    finalize_entity(&mut current_entity, &current_namespace, &mut entity_types);
                }
            }
            Err(e) => {
                return Err(BridgeError::MetadataUnavailable(format!(
                    "XML parse error: {e}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(ParsedSchema {
        entity_types,
        entity_sets,
        function_imports,
    })
}

fn finalize_entity(
    current: &mut Option<(String, Vec<Property>, Vec<String>)>,
    namespace: &str,
    out: &mut HashMap<String, EntityType>,
) {
    if let Some((name, mut props, key_names)) = current.take() {
        for p in props.iter_mut() {
            if key_names.iter().any(|k| k == &p.name) {
                p.is_key = true;
            }
        }
        let qualified_name = if namespace.is_empty() {
            name.clone()
        } else {
            format!("{namespace}.{name}")
        };
        out.insert(
            name.clone(),
            EntityType {
                name,
                qualified_name,
                properties: props,
            },
        );
    }
}

fn local_name(qualified: &[u8]) -> &str {
    let s = std::str::from_utf8(qualified).unwrap_or("");
    match s.rsplit_once(':') {
        Some((_, local)) => local,
        None => s,
    }
}

fn attr(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        let key = local_name(a.key.as_ref());
        if key == name {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// `sap:<flag>` annotations default to `true` when absent (spec §4.1).
fn sap_flag(e: &quick_xml::events::BytesStart, flag: &str, default: bool) -> bool {
    e.attributes()
        .flatten()
        .find_map(|a| {
            let key = std::str::from_utf8(a.key.as_ref()).unwrap_or("");
            if key == format!("sap:{flag}") {
                a.unescape_value().ok().map(|v| v.into_owned())
            } else {
                None
            }
        })
        .map(|v| v == "true")
        .unwrap_or(default)
}

///////////////////////////////////////////////////////////////////////////////
// Service identifier (spec §4.5 "Name synthesis")

/// Derives the short stable token appended to tool names, in priority
/// order: `/sap/opu/odata/[sap/]<ID>/`, `<Name>.svc`, `/odata/<Name>/`,
/// else host with `.` replaced by `_`.
pub fn derive_service_id(base_url: &str) -> String {
    if let Ok(url) = url::Url::parse(base_url) {
        let path = url.path();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        if let Some(pos) = segments.iter().position(|s| *s == "odata") {
            if segments.get(pos + 1) == Some(&"sap") {
                if let Some(id) = segments.get(pos + 2) {
                    return (*id).to_string();
                }
            } else if let Some(id) = segments.get(pos + 1) {
                if segments.first() == Some(&"sap") && segments.get(1) == Some(&"opu") {
                    return (*id).to_string();
                }
            }
        }

        if let Some(last) = segments.last() {
            if let Some(stem) = last.strip_suffix(".svc") {
                return format!("{stem}_svc");
            }
        }

        if let Some(pos) = segments.iter().position(|s| *s == "odata") {
            if let Some(name) = segments.get(pos + 1) {
                return (*name).to_string();
            }
        }

        if let Some(host) = url.host_str() {
            return host.replace('.', "_");
        }
    }

    base_url.replace(['.', '/', ':'], "_")
}

///////////////////////////////////////////////////////////////////////////////
// Fallback: service-document probing (spec §4.1)

/// Synthesizes minimal EntityType shells (single string-typed `ID` key)
/// from a service document's listed entity-set names, when `$metadata`
/// cannot be fetched or parsed.
pub fn synthesize_from_service_document(body: &str) -> Result<ParsedSchema, BridgeError> {
    let doc: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| BridgeError::MetadataUnavailable(format!("invalid service document: {e}")))?;

    let entries = doc
        .get("d")
        .and_then(|d| d.get("EntitySets"))
        .or_else(|| doc.get("value"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut entity_types = HashMap::new();
    let mut entity_sets = HashMap::new();

    for entry in entries {
        let name = entry
            .as_str()
            .map(str::to_string)
            .or_else(|| {
                entry
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
            })
            .or_else(|| {
                entry
                    .get("url")
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
            });

        let Some(name) = name else { continue };

        entity_types.insert(
            name.clone(),
            EntityType {
                name: name.clone(),
                qualified_name: name.clone(),
                properties: vec![Property {
                    name: "ID".to_string(),
                    edm_type: "Edm.String".to_string(),
                    nullable: false,
                    is_key: true,
                    max_length: None,
                }],
            },
        );
        entity_sets.insert(
            name.clone(),
            EntitySet {
                name: name.clone(),
                entity_type_name: name,
                capabilities: Capabilities::read_only(),
            },
        );
    }

    if entity_types.is_empty() {
        return Err(BridgeError::MetadataUnavailable(
            "service document listed no entity sets".to_string(),
        ));
    }

    Ok(ParsedSchema {
        entity_types,
        entity_sets,
        function_imports: Vec::new(),
    })
}

///////////////////////////////////////////////////////////////////////////////
// Top-level load (spec §4.1: fetch `$metadata`, fall back to the service
// document, assemble the immutable `ServiceMetadata`)

/// Fetches and parses `$metadata`, falling back to service-document
/// probing if the primary fetch or parse fails (spec §4.1). Fatal
/// (`MetadataUnavailable`) only if both paths fail.
pub async fn load_service_metadata(session: &crate::session::Session, base_url: &str) -> Result<ServiceMetadata, BridgeError> {
    let metadata_url = format!("{base_url}$metadata");
    let primary = fetch_and_parse_edmx(session, &metadata_url).await;

    let parsed = match primary {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, "failed to fetch/parse $metadata, falling back to service document");
            fetch_service_document(session, base_url).await?
        }
    };

    let service_id = derive_service_id(base_url);
    Ok(ServiceMetadata {
        base_url: base_url.to_string(),
        entity_types: parsed.entity_types,
        entity_sets: parsed.entity_sets,
        function_imports: parsed.function_imports,
        service_id,
    })
}

async fn fetch_and_parse_edmx(session: &crate::session::Session, url: &str) -> Result<ParsedSchema, BridgeError> {
    let req = session.apply_auth(session.client.get(url)).header("Accept", "application/xml");
    let resp = req
        .send()
        .await
        .map_err(|e| BridgeError::MetadataUnavailable(format!("$metadata fetch failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(BridgeError::MetadataUnavailable(format!(
            "$metadata returned HTTP {}",
            resp.status()
        )));
    }

    let body = resp
        .text()
        .await
        .map_err(|e| BridgeError::MetadataUnavailable(format!("failed to read $metadata body: {e}")))?;

    parse_edmx(&body)
}

async fn fetch_service_document(session: &crate::session::Session, base_url: &str) -> Result<ParsedSchema, BridgeError> {
    let req = session.apply_auth(session.client.get(base_url)).header("Accept", "application/json");
    let resp = req
        .send()
        .await
        .map_err(|e| BridgeError::MetadataUnavailable(format!("service document fetch failed: {e}")))?;

    if !resp.status().is_success() {
        return Err(BridgeError::MetadataUnavailable(format!(
            "service document returned HTTP {}",
            resp.status()
        )));
    }

    let body = resp
        .text()
        .await
        .map_err(|e| BridgeError::MetadataUnavailable(format!("failed to read service document body: {e}")))?;

    synthesize_from_service_document(&body)
}
