//! Per-verb request builders, query string assembly, and error extraction
//! (spec §4.3 "request" half).

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;

use crate::error::{BridgeError, UpstreamError};
use crate::metadata::{EntitySet, EntityType, FunctionImport, FunctionMethod, ServiceMetadata};
use crate::response::denormalize_write_payload;
use crate::session::Session;
use crate::types::{coerce_write_payload, format_key};

///////////////////////////////////////////////////////////////////////////////
// Query assembly (spec §4.3 "Query assembly", Invariant 4)

/// Standard OData query options a `filter_*`/`count_*`/`search_*` tool may
/// set. `None` fields are omitted entirely.
#[derive(Debug, Default, Clone)]
pub struct QueryOptions {
    pub filter: Option<String>,
    pub select: Option<String>,
    pub expand: Option<String>,
    pub orderby: Option<String>,
    pub top: Option<i64>,
    pub skip: Option<i64>,
    pub skiptoken: Option<String>,
    pub search: Option<String>,
    pub count: bool,
}

const QUERY_VALUE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Builds the `?$filter=...&...` query string. `$format=json` is always
/// appended. Every `+` produced by percent-encoding is rewritten to `%20`
/// afterward (spec Invariant 4: some servers reject literal `+` for space).
pub fn build_query_string(opts: &QueryOptions, select_default: Option<&str>) -> String {
    let mut parts: Vec<(String, String)> = Vec::new();

    if let Some(f) = &opts.filter {
        parts.push(("$filter".to_string(), f.clone()));
    }
    match &opts.select {
        Some(s) => parts.push(("$select".to_string(), s.clone())),
        None => {
            if let Some(default) = select_default {
                parts.push(("$select".to_string(), default.to_string()));
            }
        }
    }
    if let Some(e) = &opts.expand {
        parts.push(("$expand".to_string(), e.clone()));
    }
    if let Some(o) = &opts.orderby {
        parts.push(("$orderby".to_string(), o.clone()));
    }
    if let Some(t) = opts.top {
        parts.push(("$top".to_string(), t.to_string()));
    }
    if let Some(s) = opts.skip {
        parts.push(("$skip".to_string(), s.to_string()));
    }
    if let Some(st) = &opts.skiptoken {
        parts.push(("$skiptoken".to_string(), st.clone()));
    }
    if let Some(s) = &opts.search {
        parts.push(("$search".to_string(), s.clone()));
    }
    if opts.count {
        parts.push(("$inlinecount".to_string(), "allpages".to_string()));
    }
    parts.push(("$format".to_string(), "json".to_string()));

    // Option names (`$filter`, `$top`, ...) are emitted literally: `$` is an
    // unreserved sub-delim in the query component and percent-encoding it
    // produces `%24filter`, which most OData services don't recognize.
    let encoded = parts
        .iter()
        .map(|(k, v)| format!("{k}={}", percent_encoding::utf8_percent_encode(v, QUERY_VALUE_SET)))
        .collect::<Vec<_>>()
        .join("&");

    // Invariant 4: `+` never appears in the emitted query string.
    encoded.replace('+', "%20")
}

/// Default `$select` value applied when the caller doesn't supply one:
/// every non-binary, non-key-navigation property (spec §4.3 "Filter /
/// List" performance guardrail).
pub fn default_select(entity_type: &EntityType) -> String {
    entity_type
        .properties
        .iter()
        .filter(|p| p.edm_type != "Edm.Binary")
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

///////////////////////////////////////////////////////////////////////////////
// Error extraction (spec §4.3 "Error extraction")

/// Attempts JSON, then XML, then SAP envelopes, to pull a human-readable
/// message and optional code out of a non-2xx response body.
pub fn extract_error_message(status: u16, body: &str) -> UpstreamError {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        if let Some(err) = extract_from_json(&json) {
            return UpstreamError {
                http_status: status,
                ..err
            };
        }
    }

    if let Some(message) = extract_first_xml_text(body, "message") {
        return UpstreamError::new(status, message);
    }

    UpstreamError::new(status, format!("HTTP {status}"))
}

fn extract_from_json(json: &Value) -> Option<UpstreamError> {
    let error = json.get("error")?;

    // OData v2: error.message.value
    let message = error
        .get("message")
        .and_then(|m| m.get("value"))
        .and_then(|v| v.as_str())
        .or_else(|| error.get("message").and_then(|m| m.as_str()))
        .map(str::to_string);

    let code = error.get("code").and_then(|c| c.as_str()).map(str::to_string);

    let mut details = Vec::new();
    if let Some(inner) = error.get("innererror") {
        if let Some(m) = inner.get("message").and_then(|v| v.as_str()) {
            details.push(m.to_string());
        }
        if let Some(arr) = inner.get("errordetails").and_then(|v| v.as_array()) {
            for d in arr {
                if let Some(m) = d.get("message").and_then(|v| v.as_str()) {
                    details.push(m.to_string());
                }
            }
        }
    }
    if let Some(arr) = error.get("details").and_then(|v| v.as_array()) {
        for d in arr {
            if let Some(m) = d.get("message").and_then(|v| v.as_str()) {
                details.push(m.to_string());
            }
        }
    }

    let message = message.or_else(|| details.first().cloned())?;

    Some(UpstreamError {
        http_status: 0,
        code,
        message,
        details,
        request: None,
    })
}

/// Crude first-`<message>...</message>` text extractor for XML error
/// bodies; good enough since we only need the human text, not a full tree.
fn extract_first_xml_text(body: &str, tag: &str) -> Option<String> {
    let open_variants = [format!("<{tag}>"), format!("<{tag} ")];
    let start_tag = open_variants.iter().find_map(|open| body.find(open.as_str()))?;
    let after_open = body[start_tag..].find('>')? + start_tag + 1;
    let close = format!("</{tag}>");
    let end = body[after_open..].find(&close)?;
    Some(quick_xml::escape::unescape(&body[after_open..after_open + end]).ok()?.into_owned())
}

/// Whether a 403 body indicates CSRF validation failure specifically
/// (spec §4.3 CSRF lifecycle (c)).
pub fn is_csrf_failure(body: &str) -> bool {
    body.to_lowercase().contains("csrf")
}

///////////////////////////////////////////////////////////////////////////////
// Per-verb request execution

/// Carries everything a request builder needs without threading five
/// parameters through every call.
pub struct RequestEngine<'a> {
    pub session: &'a Session,
    pub metadata: &'a ServiceMetadata,
    pub legacy_dates: bool,
    pub verbose_errors: bool,
}

impl<'a> RequestEngine<'a> {
    fn entity_url(&self, entity_set: &str) -> String {
        format!("{}{}", self.session.base_url, entity_set)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        csrf: bool,
        body: Option<Value>,
    ) -> Result<(u16, String), BridgeError> {
        self.send_inner(method, url, csrf, body, false).await
    }

    /// Issues the request, retrying exactly once if the CSRF token was
    /// stale (spec §4.3 CSRF lifecycle (c), Invariant 7). A plain loop
    /// rather than recursion since this is an `async fn`.
    async fn send_inner(
        &self,
        method: reqwest::Method,
        url: &str,
        csrf: bool,
        body: Option<Value>,
        is_csrf_retry: bool,
    ) -> Result<(u16, String), BridgeError> {
        let mut is_csrf_retry = is_csrf_retry;
        loop {
            let mut req = self
                .session
                .client
                .request(method.clone(), url)
                .headers(Session::default_headers());
            req = self.session.apply_auth(req);

            if csrf {
                req = self.session.with_csrf_token(req).await?;
            }
            if let Some(b) = &body {
                req = req.json(b);
            }

            let request_ctx = if self.verbose_errors {
                Some(crate::error::RequestContext::new(method.as_str(), url, &Session::default_headers()))
            } else {
                None
            };

            let resp = req.send().await.map_err(|e| {
                let err = UpstreamError::network(format!("{e}"));
                BridgeError::Upstream(if let Some(ctx) = request_ctx.clone() {
                    err.with_request(ctx)
                } else {
                    err
                })
            })?;

            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();

            if (200..300).contains(&status) {
                return Ok((status, text));
            }

            let csrf_failure = csrf && status == 403 && is_csrf_failure(&text);
            if csrf_failure {
                if is_csrf_retry {
                    // Retry already spent (spec §4.3 (c), §7): surface as
                    // `CsrfError` rather than a generic upstream error.
                    return Err(BridgeError::CsrfError);
                }
                self.session.clear_csrf_token();
                is_csrf_retry = true;
                continue;
            }

            let mut err = extract_error_message(status, &text);
            if let Some(ctx) = request_ctx {
                err = err.with_request(ctx);
            }

            // 401/403 outside the CSRF flow are auth failures, not generic
            // upstream errors (spec §7).
            if status == 401 || status == 403 {
                return Err(BridgeError::AuthError(err.message));
            }

            return Err(BridgeError::Upstream(err));
        }
    }

    pub async fn filter(&self, set: &EntitySet, entity_type: &EntityType, opts: &QueryOptions) -> Result<Value, BridgeError> {
        let default = default_select(entity_type);
        let query = build_query_string(opts, Some(&default));
        let url = format!("{}?{}", self.entity_url(&set.name), query);
        let (_, body) = self.send(reqwest::Method::GET, &url, false, None).await?;
        serde_json::from_str(&body).map_err(|e| BridgeError::InternalError(format!("invalid JSON from upstream: {e}")))
    }

    pub async fn count(&self, set: &EntitySet, filter: Option<&str>) -> Result<i64, BridgeError> {
        let mut url = format!("{}/$count", self.entity_url(&set.name));
        if let Some(f) = filter {
            url.push_str("?$filter=");
            url.push_str(&percent_encoding::utf8_percent_encode(f, QUERY_VALUE_SET).to_string().replace('+', "%20"));
        }
        let (_, body) = self.send(reqwest::Method::GET, &url, false, None).await?;
        body.trim()
            .parse()
            .map_err(|_| BridgeError::InternalError(format!("non-numeric $count body: {body}")))
    }

    pub async fn search(&self, set: &EntitySet, term: &str, top: Option<i64>, skip: Option<i64>) -> Result<Value, BridgeError> {
        let opts = QueryOptions {
            search: Some(term.to_string()),
            top,
            skip,
            ..Default::default()
        };
        let query = build_query_string(&opts, None);
        let url = format!("{}?{}", self.entity_url(&set.name), query);
        let (_, body) = self.send(reqwest::Method::GET, &url, false, None).await?;
        serde_json::from_str(&body).map_err(|e| BridgeError::InternalError(format!("invalid JSON from upstream: {e}")))
    }

    pub async fn get(
        &self,
        set: &EntitySet,
        entity_type: &EntityType,
        key_values: &[(&str, &str)],
        select: Option<&str>,
        expand: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let key = format_key(&entity_type.key_properties().into_iter().cloned().collect::<Vec<_>>(), key_values);
        let opts = QueryOptions {
            select: select.map(str::to_string),
            expand: expand.map(str::to_string),
            ..Default::default()
        };
        let query = build_query_string(&opts, None);
        let url = format!("{}{}?{}", self.entity_url(&set.name), key, query);
        let (_, body) = self.send(reqwest::Method::GET, &url, false, None).await?;
        serde_json::from_str(&body).map_err(|e| BridgeError::InternalError(format!("invalid JSON from upstream: {e}")))
    }

    pub async fn create(
        &self,
        set: &EntitySet,
        entity_type: &EntityType,
        payload: serde_json::Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        let payload = coerce_write_payload(&entity_type.properties, payload, self.legacy_dates);
        let payload = denormalize_write_payload(entity_type, payload);
        let url = format!("{}?$format=json", self.entity_url(&set.name));
        let (_, body) = self
            .send(reqwest::Method::POST, &url, true, Some(Value::Object(payload)))
            .await?;
        serde_json::from_str(&body).map_err(|e| BridgeError::InternalError(format!("invalid JSON from upstream: {e}")))
    }

    pub async fn update(
        &self,
        set: &EntitySet,
        entity_type: &EntityType,
        key_values: &[(&str, &str)],
        payload: serde_json::Map<String, Value>,
    ) -> Result<(), BridgeError> {
        let key = format_key(&entity_type.key_properties().into_iter().cloned().collect::<Vec<_>>(), key_values);
        let payload = coerce_write_payload(&entity_type.properties, payload, self.legacy_dates);
        let payload = denormalize_write_payload(entity_type, payload);
        let url = format!("{}{}?$format=json", self.entity_url(&set.name), key);

        let merge = reqwest::Method::from_bytes(b"MERGE").unwrap();
        match self.send(merge, &url, true, Some(Value::Object(payload.clone()))).await {
            Ok(_) => Ok(()),
            Err(BridgeError::Upstream(e)) if e.http_status == 405 => {
                self.send(reqwest::Method::PUT, &url, true, Some(Value::Object(payload))).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, set: &EntitySet, entity_type: &EntityType, key_values: &[(&str, &str)]) -> Result<(), BridgeError> {
        let key = format_key(&entity_type.key_properties().into_iter().cloned().collect::<Vec<_>>(), key_values);
        let url = format!("{}{}", self.entity_url(&set.name), key);
        self.send(reqwest::Method::DELETE, &url, true, None).await?;
        Ok(())
    }

    pub async fn call_function(&self, func: &FunctionImport, params: &[(&str, String)]) -> Result<Value, BridgeError> {
        let query = params
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    percent_encoding::utf8_percent_encode(k, QUERY_VALUE_SET),
                    percent_encoding::utf8_percent_encode(v, QUERY_VALUE_SET)
                )
            })
            .collect::<Vec<_>>()
            .join("&")
            .replace('+', "%20");

        let sep = if query.is_empty() { "" } else { "&" };
        let url = format!("{}{}?{}{}$format=json", self.session.base_url, func.name, query, sep);

        let method = match func.method {
            FunctionMethod::Get => reqwest::Method::GET,
            FunctionMethod::Post => reqwest::Method::POST,
        };
        let csrf = method != reqwest::Method::GET;
        let (_, body) = self.send(method, &url, csrf, None).await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| BridgeError::InternalError(format!("invalid JSON from upstream: {e}")))
    }
}
