use anyhow::{Context, Result};
use dashmap::DashMap;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use reqwest::{Client, Method, Request, Response, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Cookie jar for the configured backend
///
/// The backend keeps the refresh token in an HttpOnly cookie, so the jar is
/// what carries credentials on account calls. Domain and path attributes are
/// ignored since every request goes to the same origin.
#[derive(Default)]
pub struct SessionCookies {
    cookies: DashMap<String, String>,
}

impl SessionCookies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.cookies.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Expire every cookie; returns how many were dropped
    pub fn expire_all(&self) -> usize {
        let count = self.cookies.len();
        self.cookies.clear();
        count
    }
}

impl CookieStore for SessionCookies {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, _url: &Url) {
        for header in cookie_headers {
            let Ok(raw) = header.to_str() else {
                continue;
            };
            let (pair, attributes) = raw.split_once(';').unwrap_or((raw, ""));
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            if name.is_empty() {
                continue;
            }

            let expired = value.is_empty()
                || attributes
                    .split(';')
                    .any(|attr| attr.trim().eq_ignore_ascii_case("max-age=0"));

            if expired {
                self.cookies.remove(name);
            } else {
                self.cookies.insert(name.to_string(), value.to_string());
            }
        }
    }

    fn cookies(&self, _url: &Url) -> Option<HeaderValue> {
        if self.cookies.is_empty() {
            return None;
        }
        let joined = self
            .cookies
            .iter()
            .map(|entry| format!("{}={}", entry.key(), entry.value()))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }
}

/// A backend call, described independently of the transport
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub bearer: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Failures never end the session
    pub exempt: bool,
    /// 5xx responses and dropped connections may be retried
    pub retry: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
            headers: Vec::new(),
            exempt: false,
            retry: method.is_idempotent(),
            method,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn bearer(mut self, token: Option<&str>) -> Self {
        self.bearer = token.map(str::to_string);
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn exempt(mut self) -> Self {
        self.exempt = true;
        self
    }

    /// Override whether a failure after the request went out is retried
    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }
}

/// Why a call produced no successful response
#[derive(Debug)]
pub enum SendError {
    /// The backend answered with a non-success status
    Status { status: u16, body: String },
    /// No response was received
    Network { kind: &'static str, message: String },
}

/// HTTP client for the portal backend with retry logic
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Backend base URL, without trailing slash
    base_url: String,

    /// Cookie jar shared with `client`
    cookies: Arc<SessionCookies>,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ApiClient {
    /// Create a new HTTP client
    pub fn new(
        base_url: &str,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let cookies = Arc::new(SessionCookies::new());

        let client = Client::builder()
            .cookie_provider(cookies.clone())
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cookies,
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn cookies(&self) -> &Arc<SessionCookies> {
        &self.cookies
    }

    fn build(&self, request: &ApiRequest) -> std::result::Result<Request, SendError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.method.clone(), &url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        if let Some(ref token) = request.bearer {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder.build().map_err(|e| SendError::Network {
            kind: "request_error",
            message: e.to_string(),
        })
    }

    /// Execute a request with retry logic
    /// Automatically handles:
    /// - 429: exponential backoff
    /// - 5xx: exponential backoff, only when `request.retry` is set
    /// - connect failures: exponential backoff
    /// - other transport errors: exponential backoff, only when `request.retry` is set
    ///
    /// Every other status is returned to the caller untouched.
    pub async fn send(&self, request: &ApiRequest) -> std::result::Result<Response, SendError> {
        let prepared = self.build(request)?;
        let mut attempt = 0;

        tracing::debug!(
            method = %prepared.method(),
            url = %prepared.url(),
            exempt = request.exempt,
            "Sending HTTP request"
        );

        loop {
            let req = prepared.try_clone().ok_or_else(|| SendError::Network {
                kind: "request_error",
                message: "Request body is not cloneable".to_string(),
            })?;

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        tracing::debug!(status = %status, "Request successful");
                        return Ok(response);
                    }

                    let retryable = match status.as_u16() {
                        429 => true,
                        500..=599 => request.retry,
                        _ => false,
                    };
                    if retryable && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = response.text().await.unwrap_or_default();
                    tracing::debug!(
                        status = status.as_u16(),
                        path = %request.path,
                        response_body = %body,
                        "Received error response"
                    );
                    return Err(SendError::Status {
                        status: status.as_u16(),
                        body,
                    });
                }

                Err(e) => {
                    // Categorize the error for better debugging
                    let kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else if e.is_body() {
                        "body_error"
                    } else if e.is_decode() {
                        "decode_error"
                    } else {
                        "unknown"
                    };

                    // A failed connect never reached the backend
                    if (e.is_connect() || request.retry) && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = kind,
                            "Request failed: {}, retrying after {}ms (attempt {}/{})",
                            e,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = kind,
                        error = %e,
                        path = %request.path,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );
                    return Err(SendError::Network {
                        kind,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // Exponential backoff: base_delay * 2^attempt
        // With jitter to avoid thundering herd
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let jitter = (delay as f64 * 0.1 * rand::random::<f64>()) as u64;
        delay + jitter
    }
}
