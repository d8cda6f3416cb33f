//! Error taxonomy shared by every context.
//!
//! Each module keeps its own `thiserror` enum; this module only names the kind of
//! failure and how loudly it is presented to the user.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classified failure, carried across context boundaries in replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidInput,
    TextTooShort,
    ApiKeyMissing,
    ApiKeyMalformed,
    AuthError,
    BadRequest,
    RateLimited,
    ProviderUnavailable,
    ProviderError,
    EmptyResult,
    Timeout,
    NetworkError,
    TtsUnsupported,
    UnknownError,
}

/// How a failure is presented: hard failures need the user to change something,
/// recoverable ones can simply be retried or fixed by selecting more text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Hard,
    Recoverable,
}

impl Severity {
    pub fn glyph(self) -> &'static str {
        match self {
            Severity::Hard => "❌",
            Severity::Recoverable => "⚠️",
        }
    }
}

impl ErrorKind {
    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::InvalidInput
            | ErrorKind::TextTooShort
            | ErrorKind::RateLimited
            | ErrorKind::EmptyResult => Severity::Recoverable,
            _ => Severity::Hard,
        }
    }

    /// Prefix `message` with this kind's severity glyph.
    pub fn decorate(self, message: &str) -> String {
        format!("{} {}", self.severity().glyph(), message)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::TextTooShort => "text too short",
            ErrorKind::ApiKeyMissing => "api key missing",
            ErrorKind::ApiKeyMalformed => "api key malformed",
            ErrorKind::AuthError => "authentication failed",
            ErrorKind::BadRequest => "bad request",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::ProviderUnavailable => "provider unavailable",
            ErrorKind::ProviderError => "provider error",
            ErrorKind::EmptyResult => "empty result",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkError => "network error",
            ErrorKind::TtsUnsupported => "text-to-speech unsupported",
            ErrorKind::UnknownError => "unknown error",
        };
        f.write_str(name)
    }
}

/// Message used whenever a handler fails without a more specific explanation.
pub const FALLBACK_MESSAGE: &str = "An unexpected error occurred. Please try again.";

/// The generic fallback, already decorated.
pub fn fallback_message() -> String {
    ErrorKind::UnknownError.decorate(FALLBACK_MESSAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_problems_are_recoverable() {
        assert_eq!(ErrorKind::TextTooShort.severity(), Severity::Recoverable);
        assert_eq!(ErrorKind::AuthError.severity(), Severity::Hard);
        assert_eq!(
            ErrorKind::TextTooShort.decorate("select more"),
            "⚠️ select more"
        );
    }

    #[test]
    fn kinds_serialize_camel_case() {
        let json = serde_json::to_string(&ErrorKind::ProviderUnavailable).unwrap();
        assert_eq!(json, "\"providerUnavailable\"");
    }
}
