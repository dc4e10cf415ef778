use futures::future::BoxFuture;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::refresh::{RefreshScheduler, SchedulerState};
use super::types::{Account, AuthenticateRequest, SessionEvent, LOGIN_ROUTE};
use crate::error::{ClientError, Result};
use crate::http_client::ApiRequest;
use crate::interceptor::{InterceptedClient, NoSession, SessionHooks, REFRESH_PATH};
use crate::storage::{self, LocalStorage};

pub const AUTHENTICATE_PATH: &str = "/accounts/authenticate";
pub const REVOKE_PATH: &str = "/accounts/revoke-token";

/// Session manager
/// Owns the signed-in account and keeps its credential fresh
pub struct SessionManager {
    /// Intercepted backend client
    http: Arc<InterceptedClient>,

    /// Persisted `token`/`user` entries
    storage: Arc<dyn LocalStorage>,

    /// Current account; `None` when signed out
    account: watch::Sender<Option<Account>>,

    /// Lifecycle notifications
    events: broadcast::Sender<SessionEvent>,

    /// Pending proactive refresh
    scheduler: RefreshScheduler,

    /// Bumped by every logout; a refresh that started before one is discarded
    epoch: AtomicU64,

    /// Handed to the refresh timer so it never keeps the manager alive
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    /// Create a session manager, restoring any account found in `storage`
    pub fn new(
        http: Arc<InterceptedClient>,
        storage: Arc<dyn LocalStorage>,
        refresh_lead_secs: i64,
    ) -> Arc<Self> {
        let restored = storage::load_account(storage.as_ref());
        if let Some(ref account) = restored {
            tracing::info!(account_id = %account.id, "Restored session from local storage");
        }

        let (account, _) = watch::channel(restored);
        let (events, _) = broadcast::channel(16);

        Arc::new_cyclic(|weak_self| Self {
            http,
            storage,
            account,
            events,
            scheduler: RefreshScheduler::new(refresh_lead_secs),
            epoch: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    pub fn http(&self) -> &Arc<InterceptedClient> {
        &self.http
    }

    /// Latest account value
    pub fn current_identity(&self) -> Option<Account> {
        self.account.borrow().clone()
    }

    /// Watch the account for changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Account>> {
        self.account.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn scheduled_refresh(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Sign in and start the refresh timer
    pub async fn login(&self, email: &str, password: &str) -> Result<Account> {
        tracing::debug!(email = email, "Authenticating");

        let body = serde_json::to_value(AuthenticateRequest { email, password })
            .map_err(|e| ClientError::Internal(e.into()))?;
        let account: Account = self
            .http
            .send_json(ApiRequest::post(AUTHENTICATE_PATH).json(body), self)
            .await?;

        tracing::info!(account_id = %account.id, "Logged in");
        self.establish(account.clone());
        self.emit(SessionEvent::LoggedIn {
            account_id: account.id.clone(),
        });
        Ok(account)
    }

    /// Revoke in the background, stop the timer and forget the account
    pub fn logout(&self) {
        self.end_session();
    }

    /// Log out, then wait up to `timeout` for the revoke call to finish
    ///
    /// For short-lived callers that would otherwise exit before the revoke
    /// request goes out.
    pub async fn logout_and_wait(&self, timeout: Duration) {
        let Some(revoke) = self.end_session() else {
            return;
        };
        if tokio::time::timeout(timeout, revoke).await.is_err() {
            tracing::warn!("Token revocation still pending after {:?}", timeout);
        }
    }

    fn end_session(&self) -> Option<JoinHandle<()>> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let revoke = self.revoke_in_background();
        self.scheduler.cancel();
        self.account.send_replace(None);
        storage::clear_credentials(self.storage.as_ref());
        tracing::info!("Logged out");
        self.emit(SessionEvent::LoggedOut {
            redirect_to: LOGIN_ROUTE,
        });
        revoke
    }

    /// Exchange the current session for a fresh credential
    ///
    /// Fails with `NoActiveSession` without touching the network when signed
    /// out. Any failure ends the session before the error is returned. A
    /// logout while the call is in flight wins; its result is then dropped
    /// and `NoActiveSession` returned.
    pub async fn refresh_token(&self) -> Result<Account> {
        if !self.has_identity() {
            tracing::debug!("No account to refresh, skipping");
            return Err(ClientError::NoActiveSession);
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let request = ApiRequest::post(REFRESH_PATH).json(json!({}));
        let result = self.http.send_json::<Account>(request, self).await;

        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("Logged out during token refresh, discarding result");
            return Err(ClientError::NoActiveSession);
        }

        match result {
            Ok(account) => {
                tracing::debug!(account_id = %account.id, "Token refreshed");
                self.establish(account.clone());
                self.emit(SessionEvent::Refreshed {
                    account_id: account.id.clone(),
                });
                Ok(account)
            }
            Err(e) => {
                tracing::info!("Token refresh failed, clearing session: {}", e);
                self.scheduler.cancel();
                self.account.send_replace(None);
                storage::clear_credentials(self.storage.as_ref());
                self.emit(SessionEvent::Expired);
                Err(e)
            }
        }
    }

    /// Publish an updated copy of the current account without touching the timer
    pub(crate) fn replace_identity(&self, account: Account) {
        if let Err(e) = storage::save_account(self.storage.as_ref(), &account) {
            tracing::warn!("Failed to persist account: {}", e);
        }
        self.account.send_replace(Some(account));
    }

    fn establish(&self, account: Account) {
        if let Err(e) = storage::save_account(self.storage.as_ref(), &account) {
            tracing::warn!("Failed to persist account: {}", e);
        }
        self.account.send_replace(Some(account));
        self.start_refresh_timer();
    }

    fn start_refresh_timer(&self) {
        let token = self
            .account
            .borrow()
            .as_ref()
            .and_then(|account| account.credential().map(str::to_string));

        let Some(token) = token else {
            tracing::info!("No valid account or token to refresh");
            self.scheduler.cancel();
            return;
        };

        let session = self.weak_self.clone();
        self.scheduler.schedule(&token, move || refresh_on_timer(session));
    }

    fn revoke_in_background(&self) -> Option<JoinHandle<()>> {
        let http = self.http.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(async move {
                let request = ApiRequest::post(REVOKE_PATH).json(json!({}));
                if let Err(e) = http.send_empty(request, &NoSession).await {
                    tracing::debug!("Token revocation failed: {}", e);
                }
            })),
            Err(_) => {
                tracing::warn!("No async runtime, skipping token revocation");
                None
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl SessionHooks for SessionManager {
    fn has_identity(&self) -> bool {
        self.account.borrow().is_some()
    }

    fn logout(&self) {
        SessionManager::logout(self);
    }
}

/// Timer callback; a failed automatic refresh is logged, never escalated
fn refresh_on_timer(session: Weak<SessionManager>) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let Some(session) = session.upgrade() else {
            return;
        };
        if let Err(e) = session.refresh_token().await {
            tracing::warn!("Auto refresh token failed: {}", e);
        }
    })
}
