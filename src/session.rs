//! HTTP session, authentication variants, and the CSRF token slot
//! (spec §4.3 "session" half; §3 `Session`; §5 concurrency model).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::error::{BridgeError, UpstreamError};

///////////////////////////////////////////////////////////////////////////////

/// Duck-typed auth union (spec §9 "Duck-typed auth union"): behavioral
/// divergences live on the variant rather than scattered `if` checks.
#[derive(Debug, Clone)]
pub enum Auth {
    None,
    Basic { user: String, pass: String },
    Cookies { jar: String },
}

impl Auth {
    /// Cookie auth is the "corporate intranet with private CA" path; TLS
    /// verification is forced off there (spec §4.3, §7). Basic auth users
    /// who need a verified chain should use a trusted CA instead.
    pub fn disables_tls_verification(&self) -> bool {
        matches!(self, Auth::Cookies { .. })
    }
}

///////////////////////////////////////////////////////////////////////////////
// CSRF slot (spec §5: single-writer critical section)

#[derive(Debug, Default)]
struct CsrfSlot {
    token: Option<String>,
}

///////////////////////////////////////////////////////////////////////////////

/// One long-lived HTTP session per process (spec §3 `Session`, §4.3).
/// Connection pooling and a bounded request timeout come from the
/// `reqwest::Client` configuration; the CSRF slot is a small mutex-guarded
/// critical section so concurrent modifying requests don't race a refresh.
pub struct Session {
    pub base_url: String,
    pub client: reqwest::Client,
    auth: Auth,
    csrf: Mutex<CsrfSlot>,
}

impl Session {
    pub fn new(base_url: String, auth: Auth, timeout: Duration) -> Result<Self, BridgeError> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .gzip(true);

        if let Auth::Cookies { jar } = &auth {
            let parsed_url = url::Url::parse(&base_url)
                .map_err(|e| BridgeError::ArgumentError(format!("invalid service URL {base_url}: {e}")))?;
            let cookie_jar = reqwest::cookie::Jar::default();
            for cookie in jar.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                cookie_jar.add_cookie_str(cookie, &parsed_url);
            }
            builder = builder.cookie_provider(Arc::new(cookie_jar));
        } else {
            builder = builder.cookie_store(true);
        }

        if auth.disables_tls_verification() {
            tracing::warn!("cookie auth active: TLS certificate verification disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| BridgeError::InternalError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            client,
            auth,
            csrf: Mutex::new(CsrfSlot::default()),
        })
    }

    /// Applies the configured auth variant's static headers/credentials to
    /// an outgoing request builder. Cookie material is handled by the
    /// client's cookie jar at construction time, not per-request.
    pub fn apply_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Auth::Basic { user, pass } = &self.auth {
            req = req.basic_auth(user, Some(pass));
        }
        req
    }

    pub fn current_csrf_token(&self) -> Option<String> {
        self.csrf.lock().unwrap().token.clone()
    }

    pub fn clear_csrf_token(&self) {
        self.csrf.lock().unwrap().token = None;
    }

    /// Fetches a fresh CSRF token via `HEAD <base> X-CSRF-Token: Fetch`
    /// (spec §4.3 CSRF lifecycle (a)). Serializes under the mutex so two
    /// concurrent modifying requests that both observe an empty slot commit
    /// only one winner (spec §5).
    pub async fn fetch_csrf_token(&self) -> Result<String, BridgeError> {
        let mut guard = self.csrf.lock().unwrap();
        // check-then-act inside the lock: another thread may have raced us
        // and already populated the slot while we were waiting on it.
        if let Some(existing) = guard.token.clone() {
            return Ok(existing);
        }
        drop(guard);

        let req = self
            .apply_auth(self.client.head(&self.base_url))
            .header("X-CSRF-Token", "Fetch");
        let resp = req.send().await.map_err(|e| {
            BridgeError::Upstream(UpstreamError::network(format!("CSRF fetch failed: {e}")))
        })?;

        let token = resp
            .headers()
            .get("X-CSRF-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                BridgeError::Upstream(UpstreamError::new(
                    resp.status().as_u16(),
                    "server did not return an X-CSRF-Token header",
                ))
            })?;

        guard = self.csrf.lock().unwrap();
        guard.token = Some(token.clone());
        Ok(token)
    }

    /// Attaches the current CSRF token (fetching one if absent) to a
    /// non-GET/HEAD request builder (spec §4.3 CSRF lifecycle (b)).
    pub async fn with_csrf_token(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, BridgeError> {
        let token = match self.current_csrf_token() {
            Some(t) => t,
            None => self.fetch_csrf_token().await?,
        };
        Ok(req.header("X-CSRF-Token", HeaderValue::from_str(&token).unwrap_or(HeaderValue::from_static(""))))
    }

    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers
    }
}
