//! Popup surface: pulls the page text from a tab and asks for its summary.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorKind;
use crate::message::{Message, Reply, SummarizeCommand, TabId};
use crate::router::{Address, Router, RouterError, SurfaceId};
use crate::summary::{SummaryResult, SummaryType};

/// How long the popup waits for the background context
pub const SUMMARY_TIMEOUT: Duration = Duration::from_secs(25);

/// How long the popup waits for a tab to hand over its text
pub const EXTRACT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("Could not extract text from this page.")]
    NoText,
    #[error("Request timed out. Please try again.")]
    TimedOut,
    #[error("Could not reach {0}.")]
    Unreachable(String),
    #[error("Invalid response from background context.")]
    UnexpectedReply,
    #[error("{0}")]
    Failed(String),
}

impl SurfaceError {
    /// What the popup shows in place of a result.
    pub fn user_message(&self) -> String {
        match self {
            // Already decorated by whoever produced it
            SurfaceError::Failed(message) => message.clone(),
            other => ErrorKind::UnknownError.decorate(&other.to_string()),
        }
    }
}

impl From<RouterError> for SurfaceError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Timeout { .. } => SurfaceError::TimedOut,
            RouterError::NoReceiver(address) | RouterError::Dropped(address) => {
                SurfaceError::Unreachable(address.to_string())
            }
        }
    }
}

/// The popup UI surface.
pub struct Popup {
    router: Router,
    summary_timeout: Duration,
}

impl Popup {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            summary_timeout: SUMMARY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.summary_timeout = timeout;
        self
    }

    /// Extract the tab's main text, then summarize it.
    pub async fn summarize_page(
        &self,
        tab: TabId,
        summary_type: SummaryType,
    ) -> Result<String, SurfaceError> {
        let text = self.article_text(tab).await?;
        info!(tab, len = text.len(), "page text extracted");
        self.summarize_text(&text, summary_type).await
    }

    pub async fn article_text(&self, tab: TabId) -> Result<String, SurfaceError> {
        let reply = self
            .router
            .request_timeout(
                Address::Tab(tab),
                &Message::GetArticleText,
                SurfaceId::Popup,
                EXTRACT_TIMEOUT,
            )
            .await?;
        match reply {
            Reply::Article { text } if !text.trim().is_empty() => Ok(text),
            Reply::Article { .. } => Err(SurfaceError::NoText),
            Reply::Error { error } => Err(SurfaceError::Failed(error)),
            _ => Err(SurfaceError::UnexpectedReply),
        }
    }

    /// Summarize text the popup already has. The result is delivered only to the popup.
    pub async fn summarize_text(
        &self,
        text: &str,
        summary_type: SummaryType,
    ) -> Result<String, SurfaceError> {
        let message = Message::SummarizeText(SummarizeCommand::new(text, summary_type));
        let reply = self
            .router
            .request_timeout(
                Address::Background,
                &message,
                SurfaceId::Popup,
                self.summary_timeout,
            )
            .await?;
        debug!(error = reply.is_error(), "summary reply");

        match reply {
            Reply::Summary(SummaryResult::Text { text }) => Ok(text),
            Reply::Summary(failure @ SummaryResult::Failure { .. }) => {
                Err(SurfaceError::Failed(failure.display()))
            }
            Reply::Error { error } => Err(SurfaceError::Failed(error)),
            _ => Err(SurfaceError::UnexpectedReply),
        }
    }
}
