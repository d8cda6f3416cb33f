//! Background context: owns the API key lookup, the request budget and the
//! summarization client, and answers summarize commands from any surface.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::{self, Summarize, SummarizeError};
use crate::error::ErrorKind;
use crate::extractor::sanitize_input;
use crate::message::{Message, Reply, SummarizeCommand, TabId, TooltipCommand};
use crate::ratelimit::RateLimiter;
use crate::router::{Address, Correlation, Envelope, Router, SurfaceId};
use crate::settings::{ApiKey, Settings};
use crate::summary::SummaryResult;

/// The background execution context.
pub struct BackgroundContext {
    router: Router,
    settings: Settings,
    summarizer: Arc<dyn Summarize>,
    limiter: Mutex<RateLimiter>,
    /// Used when the settings store holds no key (config file or environment)
    fallback_key: Option<ApiKey>,
}

impl BackgroundContext {
    pub fn new(
        router: Router,
        settings: Settings,
        summarizer: Arc<dyn Summarize>,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            router,
            settings,
            summarizer,
            limiter: Mutex::new(limiter),
            fallback_key: None,
        }
    }

    pub fn with_fallback_key(mut self, key: Option<ApiKey>) -> Self {
        self.fallback_key = key.filter(|k| !k.is_empty());
        self
    }

    /// Serve envelopes until every sender is gone. Each request runs on its own task so
    /// slow provider calls don't hold up other surfaces.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Envelope>) {
        info!("background context started");
        while let Some(envelope) = inbox.recv().await {
            let context = Arc::clone(&self);
            tokio::spawn(async move { context.handle(envelope).await });
        }
        info!("background context stopped");
    }

    /// Handle one envelope. Whatever happens in here, a waiting caller gets one reply.
    pub async fn handle(&self, mut envelope: Envelope) {
        let message = match Message::from_value(envelope.payload.take()) {
            Ok(message) => message,
            Err(err) => {
                warn!(id = envelope.correlation.id, error = %err, "rejecting message");
                envelope.reply(Reply::error(
                    ErrorKind::InvalidInput,
                    &SummarizeError::InvalidInput.to_string(),
                ));
                return;
            }
        };

        match message {
            Message::SummarizeText(command) => {
                let result = self.summarize(&command, &envelope.correlation).await;
                envelope.reply(Reply::Summary(result));
            }
            other => {
                debug!(kind = other.kind(), "not a background message");
                envelope.reply(Reply::Ack { ok: false });
            }
        }
    }

    async fn summarize(&self, command: &SummarizeCommand, correlation: &Correlation) -> SummaryResult {
        info!(
            id = correlation.id,
            source = ?correlation.source,
            text_len = command.text.len(),
            inline = command.deliver_inline,
            "summarize request"
        );

        let result = match self.try_summarize(command).await {
            Ok(summary) => SummaryResult::text(summary),
            Err(err) => {
                warn!(id = correlation.id, kind = %err.kind(), error = %err, "summarize failed");
                SummaryResult::failure(err.kind(), err.to_string())
            }
        };

        if command.deliver_inline {
            let tab = command.tab_id.or(correlation.origin_tab);
            match tab {
                Some(tab) => self.deliver_tooltip(tab, &result, correlation).await,
                None => warn!(id = correlation.id, "inline delivery requested without a tab"),
            }
        }
        result
    }

    async fn try_summarize(&self, command: &SummarizeCommand) -> Result<String, SummarizeError> {
        client::validate_text(&command.text)?;

        let text = sanitize_input(&command.text);
        client::validate_text(&text)?;

        let api_key = self.resolve_api_key().await?;
        let summary_type = command.summary_type_or(self.settings.general().await.default_summary_type);

        // Only requests that will reach the provider spend budget
        self.check_budget()?;
        self.summarizer.summarize(&text, summary_type, &api_key).await
    }

    fn check_budget(&self) -> Result<(), SummarizeError> {
        let mut limiter = self
            .limiter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        limiter
            .try_acquire(Instant::now())
            .map_err(|wait| SummarizeError::RateLimited {
                retry_after: Some(wait),
            })
    }

    async fn resolve_api_key(&self) -> Result<ApiKey, SummarizeError> {
        let stored = match self.settings.api_key().await {
            Ok(stored) => stored,
            Err(err) => {
                error!(error = %err, "failed to read api key from settings");
                None
            }
        };
        stored
            .or_else(|| self.fallback_key.clone())
            .ok_or(SummarizeError::ApiKeyMissing)
    }

    async fn deliver_tooltip(&self, tab: TabId, result: &SummaryResult, correlation: &Correlation) {
        let message = Message::ShowSummaryTooltip(TooltipCommand {
            summary: result.display(),
            timestamp: Utc::now().timestamp_millis(),
            seq: Some(correlation.id),
        });
        let push = Correlation {
            source: SurfaceId::Background,
            origin_tab: Some(tab),
            requested_at: Utc::now(),
            ..correlation.clone()
        };
        if let Err(err) = self
            .router
            .notify_correlated(Address::Tab(tab), &message, push)
            .await
        {
            warn!(tab, error = %err, "could not deliver tooltip");
        }
    }

    /// Context-menu entry: ask the tab to summarize its selection inline.
    pub async fn on_context_menu(&self, tab: TabId, selection: &str) {
        let default_type = self.settings.general().await.default_summary_type;
        let message = Message::SummarizeText(
            SummarizeCommand::new(selection, default_type).inline(Some(tab)),
        );
        info!(tab, len = selection.len(), "context menu summarize");
        if let Err(err) = self
            .router
            .notify(Address::Tab(tab), &message, SurfaceId::ContextMenu)
            .await
        {
            warn!(tab, error = %err, "could not reach tab for context menu");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::summary::SummaryType;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarize for Echo {
        async fn summarize(
            &self,
            text: &str,
            summary_type: SummaryType,
            _api_key: &ApiKey,
        ) -> Result<String, SummarizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{summary_type} summary of: {text}"))
        }
    }

    async fn context(key: Option<&str>, budget: usize) -> (Arc<BackgroundContext>, Router, Arc<Echo>) {
        let (router, inbox) = Router::new();
        let settings = Settings::in_memory();
        if let Some(key) = key {
            settings.set_api_key(&ApiKey::new(key)).await.unwrap();
        }
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let context = Arc::new(BackgroundContext::new(
            router.clone(),
            settings,
            echo.clone(),
            RateLimiter::new(budget, Duration::from_secs(60)),
        ));
        tokio::spawn(Arc::clone(&context).run(inbox));
        (context, router, echo)
    }

    #[tokio::test]
    async fn replies_with_summary() {
        let (_ctx, router, _) = context(Some("AIzaSyExample123456"), 10).await;
        let reply = router
            .request(
                Address::Background,
                &Message::SummarizeText(SummarizeCommand::new(
                    "A <b>long</b> enough text",
                    SummaryType::Detailed,
                )),
                SurfaceId::Popup,
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            Reply::Summary(SummaryResult::text("detailed summary of: A blong/b enough text"))
        );
    }

    #[tokio::test]
    async fn short_text_never_reaches_the_client() {
        let (_ctx, router, echo) = context(None, 10).await;
        let reply = router
            .request(
                Address::Background,
                &Message::SummarizeText(SummarizeCommand::new("too short", SummaryType::Brief)),
                SurfaceId::Popup,
            )
            .await
            .unwrap();
        assert!(matches!(
            reply,
            Reply::Summary(SummaryResult::Failure {
                error_kind: ErrorKind::TextTooShort,
                ..
            })
        ));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let (_ctx, router, _) = context(None, 10).await;
        let reply = router
            .request(
                Address::Background,
                &Message::SummarizeText(SummarizeCommand::new(
                    "plenty of text to summarize",
                    SummaryType::Brief,
                )),
                SurfaceId::Popup,
            )
            .await
            .unwrap();
        assert_eq!(
            reply.display(),
            "❌ API key missing. Add one with `smartdigest key set`."
        );
    }

    #[tokio::test]
    async fn malformed_payload_gets_exactly_one_error_reply() {
        let (_ctx, router, _) = context(None, 10).await;
        for payload in [
            json!(null),
            json!({"type": "summarize-selection"}),
            json!({"type": "summarize-selection", "text": ["not", "a", "string"]}),
            json!({"action": "launch"}),
        ] {
            let reply = router
                .request_raw(Address::Background, payload, SurfaceId::Popup, None)
                .await
                .unwrap();
            assert!(reply.is_error(), "expected error reply, got {reply:?}");
        }
    }

    #[tokio::test]
    async fn budget_exhaustion_is_rate_limited() {
        let (_ctx, router, echo) = context(Some("AIzaSyExample123456"), 1).await;
        let message = Message::SummarizeText(SummarizeCommand::new(
            "plenty of text to summarize",
            SummaryType::Brief,
        ));
        let first = router
            .request(Address::Background, &message, SurfaceId::Popup)
            .await
            .unwrap();
        let second = router
            .request(Address::Background, &message, SurfaceId::Popup)
            .await
            .unwrap();

        assert!(!first.is_error());
        assert!(matches!(
            second,
            Reply::Summary(SummaryResult::Failure {
                error_kind: ErrorKind::RateLimited,
                ..
            })
        ));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_requests_do_not_spend_budget() {
        let (_ctx, router, echo) = context(Some("AIzaSyExample123456"), 1).await;
        let rejected = router
            .request(
                Address::Background,
                &Message::SummarizeText(SummarizeCommand::new(
                    "<<<<<<<<<<ab>>>>>>>>>>",
                    SummaryType::Brief,
                )),
                SurfaceId::Popup,
            )
            .await
            .unwrap();
        assert!(matches!(
            rejected,
            Reply::Summary(SummaryResult::Failure {
                error_kind: ErrorKind::TextTooShort,
                ..
            })
        ));

        let accepted = router
            .request(
                Address::Background,
                &Message::SummarizeText(SummarizeCommand::new(
                    "plenty of text to summarize",
                    SummaryType::Brief,
                )),
                SurfaceId::Popup,
            )
            .await
            .unwrap();
        assert!(!accepted.is_error(), "budget was spent: {accepted:?}");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_key_does_not_spend_budget() {
        let (ctx, router, _) = context(None, 1).await;
        let message = Message::SummarizeText(SummarizeCommand::new(
            "plenty of text to summarize",
            SummaryType::Brief,
        ));
        for _ in 0..3 {
            let reply = router
                .request(Address::Background, &message, SurfaceId::Popup)
                .await
                .unwrap();
            assert!(matches!(
                reply,
                Reply::Summary(SummaryResult::Failure {
                    error_kind: ErrorKind::ApiKeyMissing,
                    ..
                })
            ));
        }
        let limiter = ctx.limiter.lock().unwrap();
        assert_eq!(limiter.remaining(Instant::now()), 1);
    }

    #[tokio::test]
    async fn inline_delivery_pushes_to_the_tab() {
        let (_ctx, router, _) = context(Some("AIzaSyExample123456"), 10).await;
        let mut tab = router.attach_tab(4);

        let reply = router
            .request(
                Address::Background,
                &Message::SummarizeText(
                    SummarizeCommand::new("selected text on the page", SummaryType::Brief)
                        .inline(None),
                ),
                SurfaceId::Tab(4),
            )
            .await
            .unwrap();

        let pushed = tab.recv().await.unwrap();
        assert!(pushed.responder.is_none());
        let Message::ShowSummaryTooltip(tooltip) = Message::from_value(pushed.payload).unwrap()
        else {
            panic!("expected a tooltip command");
        };
        assert_eq!(tooltip.summary, reply.display());
        assert_eq!(tooltip.seq, Some(pushed.correlation.id));
    }
}
