//! End-to-end scenarios from spec §8 against a mocked OData service:
//! metadata load -> tool projection -> dispatch -> normalized response.

use std::time::Duration;

use indoc::indoc;
use odata_mcp_bridge::dispatch::Dispatcher;
use odata_mcp_bridge::metadata::load_service_metadata;
use odata_mcp_bridge::session::{Auth, Session};
use odata_mcp_bridge::tools::ProjectionPolicy;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NORTHWIND_METADATA: &str = indoc! {r#"
    <?xml version="1.0" encoding="utf-8"?>
    <edmx:Edmx Version="1.0" xmlns:edmx="http://schemas.microsoft.com/ado/2007/06/edmx">
      <edmx:DataServices xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata">
        <Schema Namespace="NorthwindModel" xmlns="http://schemas.microsoft.com/ado/2008/09/edm">
          <EntityType Name="Product">
            <Key><PropertyRef Name="ProductID"/></Key>
            <Property Name="ProductID" Type="Edm.Int32" Nullable="false"/>
            <Property Name="ProductName" Type="Edm.String" Nullable="false"/>
            <Property Name="Price" Type="Edm.Decimal" Nullable="true"/>
          </EntityType>
          <EntityContainer Name="NorthwindEntities" m:IsDefaultEntityContainer="true">
            <EntitySet Name="Products" EntityType="NorthwindModel.Product"/>
          </EntityContainer>
        </Schema>
      </edmx:DataServices>
    </edmx:Edmx>
"#};

async fn dispatcher_for(server: &MockServer, policy: ProjectionPolicy) -> Dispatcher {
    let base_url = format!("{}/V2/Northwind/Northwind.svc/", server.uri());
    let session = Session::new(base_url.clone(), Auth::None, Duration::from_secs(5)).unwrap();
    let metadata = load_service_metadata(&session, &base_url).await.unwrap();
    Dispatcher::new(
        metadata,
        session,
        &policy,
        "service_info".to_string(),
        serde_json::json!({}),
        true,
        false,
        100,
        5 * 1024 * 1024,
        false,
        false,
    )
}

#[tokio::test]
async fn northwind_filter_returns_normalized_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/V2/Northwind/Northwind.svc/$metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string(NORTHWIND_METADATA))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/V2/Northwind/Northwind.svc/Products"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"d":{"results":[
                {"__metadata":{"uri":"x"},"ProductID":1,"ProductName":"Chai","Price":"18.0000"},
                {"__metadata":{"uri":"y"},"ProductID":2,"ProductName":"Chang","Price":"19.0000"}
            ]}}"#,
        ))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server, ProjectionPolicy::default()).await;
    let tool_name = dispatcher
        .tools
        .iter()
        .find(|t| t.name.starts_with("filter_Products"))
        .unwrap()
        .name
        .clone();
    assert!(tool_name.ends_with("_for_Northwind_svc"));

    let result = dispatcher
        .call_tool(&tool_name, serde_json::json!({ "filter": "Price gt 17", "orderby": "Price desc", "top": 2 }))
        .await
        .unwrap();

    let text = result["content"][0]["text"].as_str().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(text).unwrap();
    let results = parsed["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].get("__metadata").is_none());
    assert_eq!(results[0]["ProductID"], 1);
}

#[tokio::test]
async fn read_only_mode_excludes_write_tools() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/V2/Northwind/Northwind.svc/$metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string(NORTHWIND_METADATA))
        .mount(&server)
        .await;

    let policy = ProjectionPolicy { mode_read_only: true, ..Default::default() };
    let dispatcher = dispatcher_for(&server, policy).await;

    assert!(!dispatcher.tools.iter().any(|t| {
        t.name.starts_with("create_") || t.name.starts_with("update_") || t.name.starts_with("delete_")
    }));
}

#[tokio::test]
async fn truncation_sets_marker_and_pagination_hint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/V2/Northwind/Northwind.svc/$metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string(NORTHWIND_METADATA))
        .mount(&server)
        .await;

    let items: Vec<String> = (0..10)
        .map(|i| format!(r#"{{"ProductID":{i},"ProductName":"P{i}","Price":"1.0"}}"#))
        .collect();
    let body = format!(r#"{{"d":{{"results":[{}]}}}}"#, items.join(","));

    Mock::given(method("GET"))
        .and(path("/V2/Northwind/Northwind.svc/Products"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let base_url = format!("{}/V2/Northwind/Northwind.svc/", server.uri());
    let session = Session::new(base_url.clone(), Auth::None, Duration::from_secs(5)).unwrap();
    let metadata = load_service_metadata(&session, &base_url).await.unwrap();
    let policy = ProjectionPolicy::default();
    let dispatcher = Dispatcher::new(
        metadata,
        session,
        &policy,
        "service_info".to_string(),
        serde_json::json!({}),
        true,
        false,
        3, // max_items
        5 * 1024 * 1024,
        true, // pagination_hints
        false,
    );

    let tool_name = dispatcher.tools.iter().find(|t| t.name.starts_with("filter_Products")).unwrap().name.clone();
    let result = dispatcher.call_tool(&tool_name, serde_json::json!({})).await.unwrap();
    let text = result["content"][0]["text"].as_str().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(text).unwrap();

    assert_eq!(parsed["results"].as_array().unwrap().len(), 3);
    assert_eq!(parsed["truncated"], serde_json::json!(true));
    assert_eq!(parsed["suggested_next_call"]["skip"], 3);
}

#[tokio::test]
async fn unknown_tool_call_is_an_argument_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/V2/Northwind/Northwind.svc/$metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string(NORTHWIND_METADATA))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&server, ProjectionPolicy::default()).await;
    let err = dispatcher.call_tool("does_not_exist", serde_json::json!({})).await.unwrap_err();
    assert!(matches!(err, odata_mcp_bridge::error::BridgeError::ArgumentError(_)));
}

#[tokio::test]
async fn metadata_fallback_to_service_document_when_metadata_endpoint_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/V2/Broken/Broken.svc/$metadata"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/V2/Broken/Broken.svc/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"d":{"EntitySets":["Widgets"]}}"#))
        .mount(&server)
        .await;

    let base_url = format!("{}/V2/Broken/Broken.svc/", server.uri());
    let session = Session::new(base_url.clone(), Auth::None, Duration::from_secs(5)).unwrap();
    let metadata = load_service_metadata(&session, &base_url).await.unwrap();

    assert!(metadata.entity_sets.contains_key("Widgets"));
    assert!(!metadata.entity_sets["Widgets"].capabilities.creatable);
}

const SAP_PROGRAM_METADATA: &str = indoc! {r#"
    <?xml version="1.0" encoding="utf-8"?>
    <edmx:Edmx Version="1.0" xmlns:edmx="http://schemas.microsoft.com/ado/2007/06/edmx">
      <edmx:DataServices xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata">
        <Schema Namespace="GWSAMPLE" xmlns="http://schemas.microsoft.com/ado/2008/09/edm">
          <EntityType Name="Program">
            <Key><PropertyRef Name="Program"/></Key>
            <Property Name="Program" Type="Edm.String" Nullable="false"/>
            <Property Name="Status" Type="Edm.String" Nullable="true"/>
          </EntityType>
          <EntityContainer Name="Container" m:IsDefaultEntityContainer="true">
            <EntitySet Name="PROGRAMSet" EntityType="GWSAMPLE.Program"/>
          </EntityContainer>
        </Schema>
      </edmx:DataServices>
    </edmx:Edmx>
"#};

/// Spec §8 end-to-end scenario 2: a SAP-style key containing slashes must be
/// percent-encoded on the wire, including `/` itself (`%2F`).
#[tokio::test]
async fn sap_key_with_slashes_is_percent_encoded_on_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sap/opu/odata/sap/ZGW_SRV/$metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string(SAP_PROGRAM_METADATA))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/sap/opu/odata/sap/ZGW_SRV/PROGRAMSet('%2FIWFND%2FSUTIL_GW_CLIENT')"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"d":{"Program":"/IWFND/SUTIL_GW_CLIENT","Status":"Active"}}"#,
        ))
        .mount(&server)
        .await;

    let base_url = format!("{}/sap/opu/odata/sap/ZGW_SRV/", server.uri());
    let session = Session::new(base_url.clone(), Auth::None, Duration::from_secs(5)).unwrap();
    let metadata = load_service_metadata(&session, &base_url).await.unwrap();
    assert_eq!(metadata.service_id, "ZGW_SRV");

    let dispatcher = Dispatcher::new(
        metadata,
        session,
        &ProjectionPolicy::default(),
        "service_info".to_string(),
        serde_json::json!({}),
        true,
        false,
        100,
        5 * 1024 * 1024,
        false,
        false,
    );

    let tool_name = dispatcher.tools.iter().find(|t| t.name.starts_with("get_PROGRAMSet")).unwrap().name.clone();
    let result = dispatcher
        .call_tool(&tool_name, serde_json::json!({ "Program": "/IWFND/SUTIL_GW_CLIENT" }))
        .await
        .unwrap();
    let text = result["content"][0]["text"].as_str().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(text).unwrap();
    assert_eq!(parsed["Program"], "/IWFND/SUTIL_GW_CLIENT");
}

const GUID_ENTITY_METADATA: &str = indoc! {r#"
    <?xml version="1.0" encoding="utf-8"?>
    <edmx:Edmx Version="1.0" xmlns:edmx="http://schemas.microsoft.com/ado/2007/06/edmx">
      <edmx:DataServices xmlns:m="http://schemas.microsoft.com/ado/2007/08/dataservices/metadata">
        <Schema Namespace="NS" xmlns="http://schemas.microsoft.com/ado/2008/09/edm">
          <EntityType Name="Widget">
            <Key><PropertyRef Name="Key"/></Key>
            <Property Name="Key" Type="Edm.Int32" Nullable="false"/>
            <Property Name="Id" Type="Edm.Binary" Nullable="false" MaxLength="16"/>
          </EntityType>
          <EntityContainer Name="Container" m:IsDefaultEntityContainer="true">
            <EntitySet Name="Widgets" EntityType="NS.Widget"/>
          </EntityContainer>
        </Schema>
      </edmx:DataServices>
    </edmx:Edmx>
"#};

/// Spec §8 end-to-end scenario 6: a `Edm.Binary(MaxLength=16)` field whose
/// name matches the GUID-shape predicate is rewritten from base64 to
/// canonical hyphenated form.
#[tokio::test]
async fn guid_shaped_binary_field_normalized_to_canonical_form() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/odata/Widgets/$metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_string(GUID_ENTITY_METADATA))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/odata/Widgets/Widgets"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"d":{"results":[{"Key":1,"Id":"AkkEEAAEH9CL4dDCiWvlwg=="}]}}"#,
        ))
        .mount(&server)
        .await;

    let base_url = format!("{}/odata/Widgets/", server.uri());
    let session = Session::new(base_url.clone(), Auth::None, Duration::from_secs(5)).unwrap();
    let metadata = load_service_metadata(&session, &base_url).await.unwrap();

    let dispatcher = Dispatcher::new(
        metadata,
        session,
        &ProjectionPolicy::default(),
        "service_info".to_string(),
        serde_json::json!({}),
        true,
        false,
        100,
        5 * 1024 * 1024,
        false,
        false,
    );

    let tool_name = dispatcher.tools.iter().find(|t| t.name.starts_with("filter_Widgets")).unwrap().name.clone();
    let result = dispatcher.call_tool(&tool_name, serde_json::json!({})).await.unwrap();
    let text = result["content"][0]["text"].as_str().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(text).unwrap();
    assert_eq!(parsed["results"][0]["Id"], "02490410-0004-1fd0-8be1-d0c2896be5c2");
}
