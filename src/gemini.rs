// Instructor chat
// Direct generateContent client with a fixed system instruction; independent of the portal session

use serde::{Deserialize, Serialize};

use crate::error::{extract_error_message, ClientError, Result};
use crate::http_client::{ApiClient, ApiRequest, SendError};

pub const DEFAULT_GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-preview-09-2025";

pub const SYSTEM_INSTRUCTION: &str = "You are a helpful and knowledgeable instructor. \
Provide clear, concise, and structured answers. Use markdown formatting extensively.";

pub const GREETING: &str = "Hello! I am ready to assist you. \
Ask a complex question to see me use my grounding ability.";

/// Shown when a reply carries no text
pub const NO_RESPONSE: &str = "No response.";

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// One turn of the conversation, in the API's wire shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ContentRole>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(role: ContentRole, text: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            parts: vec![Part {
                text: Some(text.into()),
            }],
        }
    }

    /// Text of the first part, if any
    pub fn first_text(&self) -> Option<&str> {
        self.parts.first().and_then(|p| p.text.as_deref())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    system_instruction: Content,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

impl GenerateContentResponse {
    fn reply_text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .and_then(Content::first_text)
            .filter(|text| !text.is_empty())
            .unwrap_or(NO_RESPONSE)
            .to_string()
    }
}

/// Client for the `generateContent` endpoint
pub struct GeminiClient {
    api: ApiClient,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api: ApiClient, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api,
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send the whole conversation and return the reply text
    pub async fn generate(&self, history: &[Content]) -> Result<String> {
        let body = serde_json::to_value(GenerateContentRequest {
            contents: history,
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: Some(SYSTEM_INSTRUCTION.to_string()),
                }],
            },
        })
        .map_err(|e| ClientError::Internal(e.into()))?;

        let request = ApiRequest::post(format!("/models/{}:generateContent", self.model))
            .header(API_KEY_HEADER, self.api_key.as_str())
            .json(body);

        tracing::debug!(model = %self.model, turns = history.len(), "Generating content");

        let response = self.api.send(&request).await.map_err(|e| match e {
            SendError::Status { status, body } => {
                let message = extract_error_message(status, &body);
                tracing::warn!(status = status, "Instructor request failed: {}", message);
                ClientError::Request { status, message }
            }
            SendError::Network { kind, message } => {
                ClientError::Network(format!("{} (kind: {})", message, kind))
            }
        })?;

        let parsed: GenerateContentResponse = response.json().await.map_err(|e| {
            ClientError::Internal(anyhow::anyhow!("Failed to parse generateContent response: {}", e))
        })?;

        Ok(parsed.reply_text())
    }
}

/// Running instructor conversation, opened with a greeting
pub struct InstructorChat {
    client: GeminiClient,
    history: Vec<Content>,
}

impl InstructorChat {
    pub fn new(client: GeminiClient) -> Self {
        Self {
            client,
            history: vec![Content::text(ContentRole::Model, GREETING)],
        }
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    /// Append the user's message, send the conversation and append the reply
    ///
    /// A failed call leaves the user's message in the history.
    pub async fn send(&mut self, input: &str) -> Result<String> {
        let text = input.trim();
        if text.is_empty() {
            return Err(ClientError::Validation("Message is required".to_string()));
        }

        self.history.push(Content::text(ContentRole::User, text));
        let reply = self.client.generate(&self.history).await?;
        self.history
            .push(Content::text(ContentRole::Model, reply.as_str()));
        Ok(reply)
    }
}
