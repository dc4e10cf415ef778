// Account directory
// Registration, password recovery and account CRUD against /accounts

use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::{Account, RegisterRequest, SessionManager};
use crate::error::{ClientError, Result};
use crate::http_client::ApiRequest;

const BASE_PATH: &str = "/accounts";

/// Account endpoints that are not part of the session lifecycle
pub struct AccountDirectory {
    session: Arc<SessionManager>,
}

impl AccountDirectory {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    async fn post_empty(&self, path: &str, body: Value) -> Result<()> {
        self.session
            .http()
            .send_empty(ApiRequest::post(path).json(body), self.session.as_ref())
            .await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<()> {
        let body = serde_json::to_value(request).map_err(|e| ClientError::Internal(e.into()))?;
        self.post_empty("/accounts/register", body).await
    }

    pub async fn verify_email(&self, token: &str) -> Result<()> {
        self.post_empty("/accounts/verify-email", json!({ "token": token }))
            .await
    }

    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        self.post_empty("/accounts/forgot-password", json!({ "email": email }))
            .await
    }

    pub async fn validate_reset_token(&self, token: &str) -> Result<()> {
        self.post_empty("/accounts/validate-reset-token", json!({ "token": token }))
            .await
    }

    pub async fn reset_password(
        &self,
        token: &str,
        password: &str,
        confirm_password: &str,
    ) -> Result<()> {
        self.post_empty(
            "/accounts/reset-password",
            json!({
                "token": token,
                "password": password,
                "confirmPassword": confirm_password,
            }),
        )
        .await
    }

    pub async fn get_all(&self) -> Result<Vec<Account>> {
        self.session
            .http()
            .send_json(ApiRequest::get(BASE_PATH), self.session.as_ref())
            .await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Account> {
        self.session
            .http()
            .send_json(
                ApiRequest::get(format!("{}/{}", BASE_PATH, id)),
                self.session.as_ref(),
            )
            .await
    }

    pub async fn create(&self, params: Value) -> Result<()> {
        self.session
            .http()
            .send_empty(ApiRequest::post(BASE_PATH).json(params), self.session.as_ref())
            .await
    }

    /// Update an account; updating the signed-in account republishes it
    pub async fn update(&self, id: &str, params: Value) -> Result<Value> {
        let updated: Value = self
            .session
            .http()
            .send_json(
                ApiRequest::put(format!("{}/{}", BASE_PATH, id)).json(params),
                self.session.as_ref(),
            )
            .await?;

        if let Some(current) = self.session.current_identity().filter(|a| a.id == id) {
            match current.merged_with(&updated) {
                Ok(merged) => {
                    tracing::debug!(account_id = %id, "Publishing updated current account");
                    self.session.replace_identity(merged);
                }
                Err(e) => tracing::warn!("Failed to merge updated account: {}", e),
            }
        }

        Ok(updated)
    }

    /// Delete an account; deleting the signed-in account logs out either way
    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = self
            .session
            .http()
            .send_empty(
                ApiRequest::delete(format!("{}/{}", BASE_PATH, id)),
                self.session.as_ref(),
            )
            .await;

        let deleted_self = self
            .session
            .current_identity()
            .is_some_and(|account| account.id == id);
        if deleted_self {
            tracing::info!(account_id = %id, "Current account deleted, logging out");
            self.session.logout();
        }

        result
    }
}
