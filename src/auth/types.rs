// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Where front ends send the user after a logout
pub const LOGIN_ROUTE: &str = "/account/login";

/// The signed-in account as returned by the backend
///
/// Profile fields the client does not model are kept in `extra` so that a
/// merge after `update` never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(rename = "AccountId", alias = "id", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Account {
    /// The credential, if present and non-empty
    pub fn credential(&self) -> Option<&str> {
        self.jwt_token.as_deref().filter(|t| !t.is_empty())
    }

    /// Overlay the fields of a partial update onto this account
    pub fn merged_with(&self, update: &Value) -> serde_json::Result<Account> {
        let mut base = serde_json::to_value(self)?;
        if let (Some(base), Some(update)) = (base.as_object_mut(), update.as_object()) {
            for (key, value) in update {
                base.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(base)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number for account id, got {}",
            other
        ))),
    }
}

/// Decoded claims segment of a credential
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenClaims {
    /// Expiry, epoch seconds
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub sub: Option<String>,
}

impl TokenClaims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Login request body
#[derive(Serialize)]
pub struct AuthenticateRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Registration request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub title: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub accept_terms: bool,
}

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LoggedIn { account_id: String },
    Refreshed { account_id: String },
    /// Front ends should navigate to `redirect_to`
    LoggedOut { redirect_to: &'static str },
    /// The session was dropped after a failed refresh
    Expired,
}
