use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;
use crate::models::{Message, Provider};
use crate::routing::ErrorKind;

/// Studio a generation belongs to; each has its own monthly quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationCategory {
    Image,
    Video,
    Song,
    Tts,
    Chat,
}

impl GenerationCategory {
    pub const ALL: [GenerationCategory; 5] = [
        GenerationCategory::Image,
        GenerationCategory::Video,
        GenerationCategory::Song,
        GenerationCategory::Tts,
        GenerationCategory::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationCategory::Image => "image",
            GenerationCategory::Video => "video",
            GenerationCategory::Song => "song",
            GenerationCategory::Tts => "tts",
            GenerationCategory::Chat => "chat",
        }
    }
}

impl fmt::Display for GenerationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GenerationCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::validation(format!("Unknown generation category: {}", s)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationInput {
    Conversation(Vec<Message>),
    Prompt(String),
}

impl GenerationInput {
    pub fn to_conversation(&self) -> Vec<Message> {
        match self {
            GenerationInput::Conversation(messages) => messages.clone(),
            GenerationInput::Prompt(prompt) => vec![Message::user(prompt.clone())],
        }
    }
}

/// One user action. Consumed once by the service; callers persist results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: String,
    pub user_id: String,
    pub category: GenerationCategory,
    pub model_id: String,
    pub input: GenerationInput,
}

impl GenerationRequest {
    pub fn new(
        user_id: impl Into<String>,
        category: GenerationCategory,
        model_id: impl Into<String>,
        input: GenerationInput,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            category,
            model_id: model_id.into(),
            input,
        }
    }

    pub fn chat(
        user_id: impl Into<String>,
        model_id: impl Into<String>,
        conversation: Vec<Message>,
    ) -> Self {
        Self::new(
            user_id,
            GenerationCategory::Chat,
            model_id,
            GenerationInput::Conversation(conversation),
        )
    }

    pub fn prompt(
        user_id: impl Into<String>,
        category: GenerationCategory,
        model_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self::new(user_id, category, model_id, GenerationInput::Prompt(prompt.into()))
    }
}

/// Which fallback answered and which provider it replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FallbackNotice {
    pub served_by: Provider,
    pub served_by_name: String,
    pub original_provider: Provider,
}

impl FallbackNotice {
    pub fn text(&self) -> String {
        format!(
            "Note: {} was unavailable, so this response was generated by {} ({}).",
            self.original_provider, self.served_by_name, self.served_by
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationPayload {
    pub content: String,
    pub provider: Provider,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackNotice>,
    /// Distinct providers called, in order.
    pub attempted: Vec<Provider>,
}

/// One adapter call that did not produce a payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedAttempt {
    pub provider: Provider,
    pub model: String,
    pub kind: ErrorKind,
    /// Truncated adapter error.
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationFailure {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub attempted: Vec<Provider>,
    /// Per-call diagnostics, in call order. Empty when no provider was called.
    #[serde(default)]
    pub attempts: Vec<FailedAttempt>,
}

impl GenerationFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            attempted: Vec::new(),
            attempts: Vec::new(),
        }
    }
}

/// Terminal value of a generation: exactly one of payload or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Success(GenerationPayload),
    Failure(GenerationFailure),
}

impl GenerationOutcome {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        GenerationOutcome::Failure(GenerationFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GenerationOutcome::Success(_))
    }

    pub fn payload(&self) -> Option<&GenerationPayload> {
        match self {
            GenerationOutcome::Success(payload) => Some(payload),
            GenerationOutcome::Failure(_) => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            GenerationOutcome::Success(_) => None,
            GenerationOutcome::Failure(failure) => Some(failure.kind),
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            GenerationOutcome::Success(_) => None,
            GenerationOutcome::Failure(failure) => Some(&failure.message),
        }
    }

    /// Failed adapter calls behind a failure; empty for successes.
    pub fn attempts(&self) -> &[FailedAttempt] {
        match self {
            GenerationOutcome::Success(_) => &[],
            GenerationOutcome::Failure(failure) => &failure.attempts,
        }
    }

    pub fn limit_reached(&self) -> bool {
        self.error_kind() == Some(ErrorKind::LimitReached)
    }

    pub fn insufficient_tokens(&self) -> bool {
        self.error_kind() == Some(ErrorKind::InsufficientTokens)
    }

    /// Flat shape handed to UI callers.
    pub fn view(&self) -> OutcomeView<'_> {
        OutcomeView {
            success: self.is_success(),
            payload: self.payload(),
            error_kind: self.error_kind(),
            error_message: self.error_message(),
            limit_reached: self.limit_reached(),
            insufficient_tokens: self.insufficient_tokens(),
            attempts: self.attempts(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeView<'a> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<&'a GenerationPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<&'a str>,
    pub limit_reached: bool,
    pub insufficient_tokens: bool,
    #[serde(skip_serializing_if = "no_attempts")]
    pub attempts: &'a [FailedAttempt],
}

fn no_attempts(attempts: &&[FailedAttempt]) -> bool {
    attempts.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parsing() {
        assert_eq!("image".parse::<GenerationCategory>().unwrap(), GenerationCategory::Image);
        assert_eq!("TTS".parse::<GenerationCategory>().unwrap(), GenerationCategory::Tts);
        assert!("podcast".parse::<GenerationCategory>().is_err());
    }

    #[test]
    fn test_prompt_becomes_single_user_turn() {
        let request =
            GenerationRequest::prompt("u1", GenerationCategory::Image, "gemini-flash", "a red fox");
        let conversation = request.input.to_conversation();
        assert_eq!(conversation, vec![Message::user("a red fox")]);
        assert!(!request.id.is_empty());
    }

    #[test]
    fn test_outcome_is_success_xor_failure() {
        let success = GenerationOutcome::Success(GenerationPayload {
            content: "hi".to_string(),
            provider: Provider::Gemini,
            model: "gemini-1.5-flash".to_string(),
            fallback: None,
            attempted: vec![Provider::Gemini],
        });
        assert!(success.payload().is_some());
        assert!(success.error_kind().is_none());

        let failure = GenerationOutcome::failure(ErrorKind::LimitReached, "limit");
        assert!(failure.payload().is_none());
        assert!(failure.limit_reached());
        assert!(!failure.insufficient_tokens());
    }

    #[test]
    fn test_view_serializes_flat_shape() {
        let outcome = GenerationOutcome::failure(ErrorKind::InsufficientTokens, "need 500 tokens");
        let json = serde_json::to_value(outcome.view()).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["insufficientTokens"], true);
        assert_eq!(json["errorKind"], "insufficient_tokens");
        assert!(json.get("payload").is_none());
        assert!(json.get("attempts").is_none());
    }

    #[test]
    fn test_view_includes_attempt_diagnostics() {
        let mut failure = GenerationFailure::new(ErrorKind::Network, "unreachable");
        failure.attempted = vec![Provider::Groq];
        failure.attempts.push(FailedAttempt {
            provider: Provider::Groq,
            model: "llama-3.1-8b-instant".to_string(),
            kind: ErrorKind::Network,
            error: "connection refused".to_string(),
        });
        let outcome = GenerationOutcome::Failure(failure);

        let json = serde_json::to_value(outcome.view()).unwrap();
        assert_eq!(json["attempts"][0]["provider"], "groq");
        assert_eq!(json["attempts"][0]["kind"], "network");
        assert_eq!(json["attempts"][0]["error"], "connection refused");
    }
}
