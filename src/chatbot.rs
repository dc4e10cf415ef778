// Chatbot client
// Assistant conversation endpoints; failures here never end the session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::auth::SessionManager;
use crate::error::{ClientError, Result};
use crate::http_client::ApiRequest;

pub const MESSAGE_PATH: &str = "/chatbot/message";
pub const HISTORY_PATH: &str = "/chatbot/history";

/// History entries fetched when none is specified
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Longest message accepted from the user, in characters
pub const MAX_MESSAGE_CHARS: usize = 2000;

pub const WELCOME_MESSAGE: &str = "Hello! How can I assist you today?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// Reply to a sent message
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub conversation_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Stored history entry
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub chat_message_id: Option<i64>,
    #[serde(rename = "AccountId", default)]
    pub account_id: Option<i64>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub role: ChatRole,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A message as displayed in a conversation
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayMessage {
    pub role: ChatRole,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<ChatMessage> for DisplayMessage {
    fn from(msg: ChatMessage) -> Self {
        Self {
            role: msg.role,
            message: msg.message,
            timestamp: msg.timestamp,
        }
    }
}

/// Client for the chatbot endpoints
///
/// Every request is flagged exempt, so a 401 from the assistant surfaces as
/// an error instead of logging the user out.
pub struct ChatbotClient {
    session: Arc<SessionManager>,
}

impl ChatbotClient {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    fn request(&self, request: ApiRequest) -> ApiRequest {
        let token = self
            .session
            .current_identity()
            .and_then(|account| account.credential().map(str::to_string));
        request.bearer(token.as_deref()).exempt()
    }

    pub async fn send_message(
        &self,
        message: &str,
        conversation_id: Option<&str>,
    ) -> Result<ChatResponse> {
        let body = json!({
            "message": message,
            "conversationId": conversation_id,
        });
        self.session
            .http()
            .send_json(
                self.request(ApiRequest::post(MESSAGE_PATH).json(body)),
                self.session.as_ref(),
            )
            .await
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<ChatMessage>> {
        self.session
            .http()
            .send_json(
                self.request(ApiRequest::get(HISTORY_PATH).query("limit", limit)),
                self.session.as_ref(),
            )
            .await
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.session
            .http()
            .send_empty(
                self.request(ApiRequest::delete(HISTORY_PATH)),
                self.session.as_ref(),
            )
            .await
    }
}

/// Check a message before it is sent; returns the trimmed text
pub fn validate_message(input: &str) -> Result<&str> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ClientError::Validation("Message is required".to_string()));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ClientError::Validation(format!(
            "Message must be at most {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(trimmed)
}

/// Conversation state shown by a chat front end
pub struct Conversation {
    client: ChatbotClient,
    messages: Vec<DisplayMessage>,
    conversation_id: Option<String>,
}

impl Conversation {
    pub fn new(client: ChatbotClient) -> Self {
        Self {
            client,
            messages: Vec::new(),
            conversation_id: None,
        }
    }

    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Greet when there is nothing to show yet
    pub fn open(&mut self) {
        if self.messages.is_empty() {
            self.push_welcome();
        }
    }

    /// Replace the displayed messages with the stored history
    pub async fn load_history(&mut self) -> Result<usize> {
        let history = self.client.history(DEFAULT_HISTORY_LIMIT).await?;
        if let Some(last) = history.iter().rev().find_map(|m| m.conversation_id.clone()) {
            self.conversation_id = Some(last);
        }
        self.messages = history.into_iter().map(DisplayMessage::from).collect();
        Ok(self.messages.len())
    }

    /// Send a message and append the assistant's reply
    ///
    /// The user's message stays displayed even if sending fails.
    pub async fn send(&mut self, input: &str) -> Result<&DisplayMessage> {
        let text = validate_message(input)?.to_string();

        self.messages.push(DisplayMessage {
            role: ChatRole::User,
            message: text.clone(),
            timestamp: Utc::now(),
        });

        let reply = self
            .client
            .send_message(&text, self.conversation_id.as_deref())
            .await?;

        self.conversation_id = Some(reply.conversation_id);
        self.messages.push(DisplayMessage {
            role: ChatRole::Assistant,
            message: reply.message,
            timestamp: reply.timestamp,
        });

        self.messages
            .last()
            .ok_or_else(|| ClientError::Internal(anyhow::anyhow!("conversation is empty")))
    }

    /// Clear the stored history and start over
    pub async fn clear(&mut self) -> Result<()> {
        self.client.clear_history().await?;
        self.messages.clear();
        self.conversation_id = None;
        self.push_welcome();
        Ok(())
    }

    fn push_welcome(&mut self) {
        self.messages.push(DisplayMessage {
            role: ChatRole::Assistant,
            message: WELCOME_MESSAGE.to_string(),
            timestamp: Utc::now(),
        });
    }
}
