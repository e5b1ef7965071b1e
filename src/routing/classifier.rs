use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::models::ProviderError;

/// User-facing failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Monthly category quota used up (admission).
    LimitReached,
    /// Token balance below the model's cost (admission).
    InsufficientTokens,
    /// Upstream provider quota or rate limit.
    RateLimit,
    Network,
    AuthConfig,
    Unknown,
}

impl ErrorKind {
    pub fn headline(&self) -> &'static str {
        match self {
            ErrorKind::LimitReached => "Monthly generation limit reached.",
            ErrorKind::InsufficientTokens => "Not enough tokens for this model.",
            ErrorKind::RateLimit => "All AI providers are rate limited or out of quota right now.",
            ErrorKind::Network => "The AI providers could not be reached.",
            ErrorKind::AuthConfig => "An AI provider rejected its credentials.",
            ErrorKind::Unknown => "The generation failed.",
        }
    }

    pub fn remediation(&self) -> &'static str {
        match self {
            ErrorKind::LimitReached => {
                "Wait for your monthly allowance to reset or upgrade to premium for unlimited generations."
            }
            ErrorKind::InsufficientTokens => "Purchase more tokens or pick a cheaper model.",
            ErrorKind::RateLimit => "Wait a minute and try again, or choose a different model.",
            ErrorKind::Network => {
                "Check your internet connection and try again. If it keeps happening the providers may be down."
            }
            ErrorKind::AuthConfig => {
                "A provider API key is missing or invalid. Ask an administrator to check the provider configuration."
            }
            ErrorKind::Unknown => "Try again in a moment or choose another model.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::LimitReached => "limit_reached",
            ErrorKind::InsufficientTokens => "insufficient_tokens",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::AuthConfig => "auth_config",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Buckets upstream failures into `RateLimit`, `Network`, `AuthConfig` or
/// `Unknown`. Holds only compiled patterns; classification is pure.
pub struct ErrorClassifier {
    patterns: Vec<(ErrorKind, Regex)>,
}

const DEFAULT_PATTERNS: &[(ErrorKind, &str)] = &[
    (
        ErrorKind::RateLimit,
        r"(?i)quota|rate[ _-]?limit|exceeded|too many requests|resource[ _]exhausted",
    ),
    (
        ErrorKind::Network,
        r"(?i)fetch failed|failed to fetch|network|cors|connection (refused|reset|closed)|timed out|dns",
    ),
    (
        ErrorKind::AuthConfig,
        r"(?i)api[ _-]?key|unauthori[sz]ed|authentication|permission denied|forbidden",
    ),
];

impl ErrorClassifier {
    pub fn new() -> Result<Self> {
        let mut patterns = Vec::with_capacity(DEFAULT_PATTERNS.len());

        for (kind, pattern) in DEFAULT_PATTERNS {
            let regex = Regex::new(pattern).map_err(|e| {
                Error::validation(format!("Invalid classifier pattern '{}': {}", pattern, e))
            })?;
            patterns.push((*kind, regex));
        }

        Ok(Self { patterns })
    }

    /// Classify a free-text upstream error message.
    pub fn classify(&self, raw_message: &str) -> ErrorKind {
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(raw_message))
            .map(|(kind, _)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    /// Classify a structured adapter error, falling back to the message text
    /// only when the variant does not decide it.
    pub fn classify_provider_error(&self, error: &ProviderError) -> ErrorKind {
        match error {
            ProviderError::RateLimited(_) => ErrorKind::RateLimit,
            ProviderError::Unauthorized(_) => ErrorKind::AuthConfig,
            ProviderError::Transport(_) | ProviderError::Timeout(_) => ErrorKind::Network,
            ProviderError::Status { status: 429, .. } => ErrorKind::RateLimit,
            ProviderError::Status {
                status: 401 | 403, ..
            } => ErrorKind::AuthConfig,
            ProviderError::Status { message, .. }
            | ProviderError::Malformed(message)
            | ProviderError::Other(message) => self.classify(message),
        }
    }
}
