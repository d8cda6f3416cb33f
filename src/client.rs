//! Summarization client for the generative-language API.
//!
//! Validates and truncates input, builds the prompt for the requested summary type,
//! and posts it with a bounded retry on 503 responses. Every failure is classified
//! into an [`ErrorKind`] so the router can present it without string matching.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ErrorKind;
use crate::retry::{self, Attempt, RetryPolicy, Sleeper, TokioSleeper};
use crate::settings::ApiKey;
use crate::summary::SummaryType;

/// Fewest trimmed characters worth summarizing
pub const MIN_TEXT_LENGTH: usize = 10;

/// Provider output shorter than this is a degenerate summary
pub const MIN_SUMMARY_LENGTH: usize = 15;

pub const TRUNCATION_MARKER: &str = "... [truncated]";

#[derive(Error, Debug)]
pub enum SummarizeError {
    #[error("Invalid input provided. Please try again.")]
    InvalidInput,
    #[error("Please select more text to summarize (at least 10 characters).")]
    TextTooShort,
    #[error("API key missing. Add one with `smartdigest key set`.")]
    ApiKeyMissing,
    #[error("API key format looks wrong. Gemini keys start with \"AIza\".")]
    ApiKeyMalformed,
    #[error("API key is invalid or has insufficient permissions.")]
    Auth { status: u16 },
    #[error("Invalid API key or request format.")]
    BadRequest,
    #[error("{}", rate_limit_message(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("Gemini API service is temporarily unavailable. Please try again in a few minutes or try with less text.")]
    ProviderUnavailable { attempts: u32 },
    #[error("API request failed ({status}). Please try again.")]
    Provider { status: u16 },
    #[error("Summary couldn't be generated. Try selecting more meaningful content.")]
    EmptyResult,
    #[error("Request timed out. Please try again.")]
    Timeout,
    #[error("Network error occurred. Please check your internet connection.")]
    Network(#[source] reqwest::Error),
    #[error("An unexpected error occurred. Please try again.")]
    Unexpected(String),
}

fn rate_limit_message(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(
            "Rate limit exceeded. Please try again in {} seconds.",
            wait.as_secs().max(1)
        ),
        None => "Rate limit exceeded. Please try again later.".to_string(),
    }
}

impl SummarizeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SummarizeError::InvalidInput => ErrorKind::InvalidInput,
            SummarizeError::TextTooShort => ErrorKind::TextTooShort,
            SummarizeError::ApiKeyMissing => ErrorKind::ApiKeyMissing,
            SummarizeError::ApiKeyMalformed => ErrorKind::ApiKeyMalformed,
            SummarizeError::Auth { .. } => ErrorKind::AuthError,
            SummarizeError::BadRequest => ErrorKind::BadRequest,
            SummarizeError::RateLimited { .. } => ErrorKind::RateLimited,
            SummarizeError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            SummarizeError::Provider { .. } => ErrorKind::ProviderError,
            SummarizeError::EmptyResult => ErrorKind::EmptyResult,
            SummarizeError::Timeout => ErrorKind::Timeout,
            SummarizeError::Network(_) => ErrorKind::NetworkError,
            SummarizeError::Unexpected(_) => ErrorKind::UnknownError,
        }
    }

    /// The message as shown to the user, behind its severity glyph.
    pub fn user_message(&self) -> String {
        self.kind().decorate(&self.to_string())
    }

    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SummarizeError::Timeout
        } else {
            SummarizeError::Network(err)
        }
    }
}

/// Anything that can turn text into a summary. The background context only sees this.
#[async_trait]
pub trait Summarize: Send + Sync {
    async fn summarize(
        &self,
        text: &str,
        summary_type: SummaryType,
        api_key: &ApiKey,
    ) -> Result<String, SummarizeError>;
}

/// Check the text on its own, before any key or network is involved.
pub fn validate_text(text: &str) -> Result<(), SummarizeError> {
    if text.is_empty() {
        return Err(SummarizeError::InvalidInput);
    }
    if text.trim().chars().count() < MIN_TEXT_LENGTH {
        return Err(SummarizeError::TextTooShort);
    }
    Ok(())
}

/// Cheap advisory check; the provider has the final word on the key.
pub fn validate_key(api_key: &ApiKey) -> Result<(), SummarizeError> {
    if api_key.is_empty() {
        return Err(SummarizeError::ApiKeyMissing);
    }
    if !api_key.looks_valid() {
        return Err(SummarizeError::ApiKeyMalformed);
    }
    Ok(())
}

/// Cut `text` to at most `max_chars` characters, appending the truncation marker.
pub fn truncate(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        None => Cow::Borrowed(text),
        Some((cut, _)) => Cow::Owned(format!("{}{}", &text[..cut], TRUNCATION_MARKER)),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_k: u32,
    top_p: f32,
    max_output_tokens: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [RequestContent<'a>; 1],
    generation_config: &'a GenerationConfig,
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: [RequestPart<'a>; 1],
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: ProviderErrorDetail,
}

#[derive(Deserialize)]
struct ProviderErrorDetail {
    message: String,
}

impl GenerateResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .find_map(|part| part.text)
    }
}

/// HTTP client for the Gemini `generateContent` endpoint
pub struct GeminiClient {
    http: Client,
    endpoint: String,
    model: String,
    generation: GenerationConfig,
    max_text_length: usize,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl GeminiClient {
    pub fn new(config: &Config) -> Result<Self, SummarizeError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SummarizeError::Unexpected(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: config.provider.endpoint.trim_end_matches('/').to_string(),
            model: config.provider.model.clone(),
            generation: GenerationConfig {
                temperature: config.provider.temperature,
                top_k: config.provider.top_k,
                top_p: config.provider.top_p,
                max_output_tokens: config.provider.max_output_tokens,
            },
            max_text_length: config.provider.max_text_length,
            policy: config.retry_policy(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Replace the sleeper used between retries.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        )
    }

    /// Verify a key with a minimal request. Any non-success status is reported as-is.
    pub async fn check_key(&self, api_key: &ApiKey) -> Result<(), SummarizeError> {
        validate_key(api_key)?;
        info!(key = %api_key.redacted(), "checking api key");

        let generation = GenerationConfig {
            max_output_tokens: 10,
            ..self.generation.clone()
        };
        match self.post_once("Hello", api_key, &generation).await {
            Attempt::Done(_) | Attempt::Fail(SummarizeError::EmptyResult) => Ok(()),
            Attempt::Retry(err) | Attempt::Fail(err) => Err(err),
        }
    }

    async fn post_once(
        &self,
        prompt: &str,
        api_key: &ApiKey,
        generation: &GenerationConfig,
    ) -> Attempt<String, SummarizeError> {
        let body = GenerateRequest {
            contents: [RequestContent {
                parts: [RequestPart { text: prompt }],
            }],
            generation_config: generation,
        };

        let response = match self
            .http
            .post(self.url())
            .header("x-goog-api-key", api_key.expose())
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Attempt::Fail(SummarizeError::from_transport(err)),
        };

        let status = response.status();
        debug!(status = status.as_u16(), "provider responded");

        if !status.is_success() {
            let retry_after = retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            if let Ok(parsed) = serde_json::from_str::<ProviderErrorBody>(&body) {
                warn!(status = status.as_u16(), message = %parsed.error.message, "provider error");
            } else {
                warn!(status = status.as_u16(), "provider error without details");
            }
            return classify_status(status, retry_after);
        }

        let parsed: GenerateResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(err) if err.is_timeout() => return Attempt::Fail(SummarizeError::Timeout),
            Err(err) => {
                warn!(error = %err, "provider returned an unreadable body");
                GenerateResponse::default()
            }
        };

        match parsed.first_text().map(|t| t.trim().to_string()) {
            Some(text) if text.chars().count() >= MIN_SUMMARY_LENGTH => Attempt::Done(text),
            _ => Attempt::Fail(SummarizeError::EmptyResult),
        }
    }
}

#[async_trait]
impl Summarize for GeminiClient {
    async fn summarize(
        &self,
        text: &str,
        summary_type: SummaryType,
        api_key: &ApiKey,
    ) -> Result<String, SummarizeError> {
        validate_text(text)?;
        validate_key(api_key)?;

        let input = truncate(text, self.max_text_length);
        if matches!(input, Cow::Owned(_)) {
            info!(
                original = text.chars().count(),
                limit = self.max_text_length,
                "text too long, truncating"
            );
        }

        let prompt = summary_type.prompt(&input);
        info!(
            text_len = input.chars().count(),
            %summary_type,
            key = %api_key.redacted(),
            "starting summarization"
        );

        let prompt = prompt.as_str();
        let generation = &self.generation;
        let outcome = retry::run(&self.policy, self.sleeper.as_ref(), move |_| {
            self.post_once(prompt, api_key, generation)
        })
        .await;

        match outcome.result {
            Ok(summary) => {
                info!(
                    attempts = outcome.attempts,
                    len = summary.len(),
                    "summary generated"
                );
                Ok(summary)
            }
            Err(SummarizeError::ProviderUnavailable { .. }) => {
                Err(SummarizeError::ProviderUnavailable {
                    attempts: outcome.attempts,
                })
            }
            Err(err) => Err(err),
        }
    }
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
) -> Attempt<String, SummarizeError> {
    match status.as_u16() {
        503 => Attempt::Retry(SummarizeError::ProviderUnavailable { attempts: 0 }),
        400 => Attempt::Fail(SummarizeError::BadRequest),
        401 | 403 => Attempt::Fail(SummarizeError::Auth {
            status: status.as_u16(),
        }),
        429 => Attempt::Fail(SummarizeError::RateLimited { retry_after }),
        other => Attempt::Fail(SummarizeError::Provider { status: other }),
    }
}

/// Parse a `Retry-After` header given in seconds.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nine_characters_is_too_short_ten_passes() {
        assert!(matches!(
            validate_text("  123456789  "),
            Err(SummarizeError::TextTooShort)
        ));
        assert!(validate_text("1234567890").is_ok());
        assert!(matches!(validate_text(""), Err(SummarizeError::InvalidInput)));
        assert!(matches!(
            validate_text("     "),
            Err(SummarizeError::TextTooShort)
        ));
    }

    #[test]
    fn key_heuristic() {
        assert!(matches!(
            validate_key(&ApiKey::new("")),
            Err(SummarizeError::ApiKeyMissing)
        ));
        assert!(matches!(
            validate_key(&ApiKey::new("sk-notgemini-123456")),
            Err(SummarizeError::ApiKeyMalformed)
        ));
        assert!(validate_key(&ApiKey::new("AIzaSyExample123456")).is_ok());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let cut = truncate("ééééé", 3);
        assert_eq!(cut, format!("ééé{TRUNCATION_MARKER}"));
    }

    #[test]
    fn statuses_are_classified() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, None),
            Attempt::Retry(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None),
            Attempt::Fail(SummarizeError::Auth { status: 403 })
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None),
            Attempt::Fail(SummarizeError::Auth { status: 401 })
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None),
            Attempt::Fail(SummarizeError::RateLimited { .. })
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None),
            Attempt::Fail(SummarizeError::BadRequest)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, None),
            Attempt::Fail(SummarizeError::Provider { status: 500 })
        ));
    }

    #[test]
    fn user_messages_carry_severity() {
        assert_eq!(
            SummarizeError::Auth { status: 403 }.user_message(),
            "❌ API key is invalid or has insufficient permissions."
        );
        assert!(SummarizeError::TextTooShort.user_message().starts_with("⚠️"));
        assert_eq!(
            SummarizeError::RateLimited {
                retry_after: Some(Duration::from_secs(30))
            }
            .to_string(),
            "Rate limit exceeded. Please try again in 30 seconds."
        );
    }
}
