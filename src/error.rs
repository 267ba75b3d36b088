//! Error kinds for the bridge (see spec §7) and their JSON-RPC mapping.

use serde_json::Value;

///////////////////////////////////////////////////////////////////////////////

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("invalid argument: {0}")]
    ArgumentError(String),

    #[error("metadata unavailable: {0}")]
    MetadataUnavailable(String),

    #[error("authentication failed: {0}")]
    AuthError(String),

    #[error("CSRF token validation failed after retry")]
    CsrfError,

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("operation disabled by policy: {0}")]
    PolicyError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl BridgeError {
    /// Stable numeric mapping surfaced in JSON-RPC error objects.
    ///
    /// Ranges follow the JSON-RPC reserved-code convention: application
    /// errors live outside `-32768..-32000`.
    pub fn code(&self) -> i64 {
        match self {
            Self::ArgumentError(_) => -32602, // JSON-RPC "Invalid params"
            Self::MetadataUnavailable(_) => -32001,
            Self::AuthError(_) => -32002,
            Self::CsrfError => -32003,
            Self::Upstream(_) => -32004,
            Self::TransportError(_) => -32005,
            Self::PolicyError(_) => -32006,
            Self::InternalError(_) => -32000,
        }
    }

    /// Render as a JSON-RPC `error` object. `verbose` includes the extra
    /// detail an `UpstreamError` carries when `--verbose-errors` is set.
    pub fn to_rpc_error(&self, verbose: bool) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("code".to_string(), Value::from(self.code()));
        obj.insert("message".to_string(), Value::from(self.to_string()));

        if let Self::Upstream(e) = self {
            let mut data = serde_json::Map::new();
            data.insert("http_status".to_string(), Value::from(e.http_status));
            if let Some(code) = &e.code {
                data.insert("code".to_string(), Value::from(code.clone()));
            }
            data.insert("message".to_string(), Value::from(e.message.clone()));
            if !e.details.is_empty() {
                data.insert("details".to_string(), Value::from(e.details.clone()));
            }
            if verbose {
                if let Some(req) = &e.request {
                    data.insert(
                        "request".to_string(),
                        serde_json::json!({
                            "method": req.method,
                            "url": req.url,
                            "headers": req.redacted_headers,
                        }),
                    );
                }
            }
            obj.insert("data".to_string(), Value::Object(data));
        }

        Value::Object(obj)
    }
}

///////////////////////////////////////////////////////////////////////////////

/// A non-2xx response from the upstream OData service, after error
/// extraction (spec §4.3 "Error extraction").
#[derive(thiserror::Error, Debug, Clone)]
#[error("upstream error (status {http_status}): {message}")]
pub struct UpstreamError {
    pub http_status: u16,
    pub code: Option<String>,
    pub message: String,
    pub details: Vec<String>,
    pub request: Option<RequestContext>,
}

impl UpstreamError {
    pub fn new(http_status: u16, message: impl Into<String>) -> Self {
        Self {
            http_status,
            code: None,
            message: message.into(),
            details: Vec::new(),
            request: None,
        }
    }

    /// Synthesized when a request never reaches the server (spec §4.3 (iv)).
    pub fn network(reason: impl Into<String>) -> Self {
        Self {
            http_status: 0,
            code: None,
            message: reason.into(),
            details: Vec::new(),
            request: None,
        }
    }

    pub fn with_request(mut self, ctx: RequestContext) -> Self {
        self.request = Some(ctx);
        self
    }
}

/// Redacted request context attached only in `--verbose-errors` mode.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub url: String,
    pub redacted_headers: Vec<(String, String)>,
}

impl RequestContext {
    const SENSITIVE_HEADERS: &'static [&'static str] =
        &["authorization", "cookie", "x-csrf-token"];

    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        headers: &reqwest::header::HeaderMap,
    ) -> Self {
        let redacted_headers = headers
            .iter()
            .map(|(name, value)| {
                let name = name.as_str().to_string();
                let value = if Self::SENSITIVE_HEADERS.contains(&name.to_lowercase().as_str()) {
                    "<redacted>".to_string()
                } else {
                    value.to_str().unwrap_or("<binary>").to_string()
                };
                (name, value)
            })
            .collect();

        Self {
            method: method.into(),
            url: url.into(),
            redacted_headers,
        }
    }
}
