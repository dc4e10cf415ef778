// Request interceptor
// Wraps the HTTP client and decides what a failed backend call does to the session

use reqwest::Response;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::error::{extract_error_message, ClientError, Result};
use crate::http_client::{ApiClient, ApiRequest, SendError};
use crate::storage::{self, LocalStorage};

/// Path of the refresh endpoint
pub const REFRESH_PATH: &str = "/accounts/refresh-token";

/// Path prefix whose failures never end the session by default
pub const DEFAULT_EXEMPT_PREFIX: &str = "/chatbot";

/// What the interceptor needs from the session it protects
pub trait SessionHooks: Send + Sync {
    fn has_identity(&self) -> bool;

    /// Fire-and-forget logout
    fn logout(&self);
}

/// A session that is never signed in; used for calls made outside one
pub struct NoSession;

impl SessionHooks for NoSession {
    fn has_identity(&self) -> bool {
        false
    }

    fn logout(&self) {}
}

/// Facts about a failed call that classification looks at
#[derive(Debug, Clone, Copy)]
pub struct FailedCall<'a> {
    pub path: &'a str,
    pub status: u16,
    pub flagged_exempt: bool,
    pub has_identity: bool,
}

/// Classification rules, evaluated in `Rule::ORDER`; first match wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// 400/401 from the refresh endpoint: clear credentials quietly
    RefreshRejected,
    /// 401/403 on a protected call while signed in: log out
    ProtectedUnauthorized,
    /// Exempt call: never log out
    Exempt,
    /// Anything else: surface the message
    Passthrough,
}

impl Rule {
    pub const ORDER: [Rule; 4] = [
        Rule::RefreshRejected,
        Rule::ProtectedUnauthorized,
        Rule::Exempt,
        Rule::Passthrough,
    ];
}

/// Which paths are the refresh endpoint and which are exempt
#[derive(Debug, Clone)]
pub struct InterceptorPolicy {
    refresh_path: String,
    exempt_prefixes: Vec<String>,
}

impl Default for InterceptorPolicy {
    fn default() -> Self {
        Self::new(REFRESH_PATH, vec![DEFAULT_EXEMPT_PREFIX.to_string()])
    }
}

impl InterceptorPolicy {
    pub fn new(refresh_path: &str, exempt_prefixes: Vec<String>) -> Self {
        Self {
            refresh_path: refresh_path.to_string(),
            exempt_prefixes,
        }
    }

    pub fn is_refresh(&self, path: &str) -> bool {
        path.starts_with(&self.refresh_path)
    }

    pub fn is_exempt(&self, path: &str, flagged: bool) -> bool {
        flagged || self.exempt_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    fn matches(&self, rule: Rule, call: &FailedCall<'_>) -> bool {
        let refresh = self.is_refresh(call.path);
        let exempt = self.is_exempt(call.path, call.flagged_exempt);

        match rule {
            Rule::RefreshRejected => refresh && matches!(call.status, 400 | 401),
            Rule::ProtectedUnauthorized => {
                matches!(call.status, 401 | 403) && call.has_identity && !refresh && !exempt
            }
            Rule::Exempt => exempt,
            Rule::Passthrough => true,
        }
    }

    /// Pick the rule governing a failed call
    pub fn classify(&self, call: &FailedCall<'_>) -> Rule {
        Rule::ORDER
            .into_iter()
            .find(|rule| self.matches(*rule, call))
            .unwrap_or(Rule::Passthrough)
    }
}

/// HTTP client decorated with the session failure policy
pub struct InterceptedClient {
    api: Arc<ApiClient>,
    policy: InterceptorPolicy,
    storage: Arc<dyn LocalStorage>,
}

impl InterceptedClient {
    pub fn new(api: Arc<ApiClient>, policy: InterceptorPolicy, storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            api,
            policy,
            storage,
        }
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn policy(&self) -> &InterceptorPolicy {
        &self.policy
    }

    /// Send a request; failures are classified and acted on before returning
    pub async fn send(&self, request: ApiRequest, session: &dyn SessionHooks) -> Result<Response> {
        match self.api.send(&request).await {
            Ok(response) => Ok(response),
            Err(SendError::Network { kind, message }) => {
                Err(ClientError::Network(format!("{} (kind: {})", message, kind)))
            }
            Err(SendError::Status { status, body }) => {
                Err(self.intercept(&request, status, &body, session))
            }
        }
    }

    /// Send a request and decode the JSON response body
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        session: &dyn SessionHooks,
    ) -> Result<T> {
        let path = request.path.clone();
        let response = self.send(request, session).await?;
        response.json::<T>().await.map_err(|e| {
            ClientError::Internal(anyhow::anyhow!("Failed to parse response from {}: {}", path, e))
        })
    }

    /// Send a request whose response body is not needed
    pub async fn send_empty(&self, request: ApiRequest, session: &dyn SessionHooks) -> Result<()> {
        self.send(request, session).await.map(|_| ())
    }

    fn intercept(
        &self,
        request: &ApiRequest,
        status: u16,
        body: &str,
        session: &dyn SessionHooks,
    ) -> ClientError {
        let call = FailedCall {
            path: &request.path,
            status,
            flagged_exempt: request.exempt,
            has_identity: session.has_identity(),
        };
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let message = extract_error_message(status, body);

        match self.policy.classify(&call) {
            Rule::RefreshRejected => {
                storage::clear_credentials(self.storage.as_ref());
                let expired = self.api.cookies().expire_all();
                tracing::debug!(
                    request_id = %request_id,
                    status = status,
                    cookies_expired = expired,
                    "Refresh rejected, cleared local credentials"
                );
                ClientError::RefreshFailure
            }
            Rule::ProtectedUnauthorized => {
                tracing::warn!(
                    request_id = %request_id,
                    status = status,
                    path = %request.path,
                    "Unauthorized - logging out"
                );
                session.logout();
                ClientError::AuthFailure { status, message }
            }
            Rule::Exempt => {
                tracing::warn!(
                    request_id = %request_id,
                    status = status,
                    path = %request.path,
                    "Exempt request failed (not logging out): {}",
                    message
                );
                ClientError::Request { status, message }
            }
            Rule::Passthrough => {
                if self.policy.is_refresh(&request.path) {
                    tracing::debug!(request_id = %request_id, status = status, "Refresh request failed");
                } else {
                    tracing::error!(
                        request_id = %request_id,
                        status = status,
                        path = %request.path,
                        "API error: {}",
                        message
                    );
                }
                ClientError::Request { status, message }
            }
        }
    }
}
