//! Page context: the script living inside one tab.
//!
//! It answers text-extraction requests from its document snapshot, turns selections
//! into summarize requests, and shows results through a [`Presenter`]. Display commands
//! may arrive more than once for the same result (reply and push), so they pass through
//! a [`TooltipGate`] first.

use chrono::Utc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::MIN_TEXT_LENGTH;
use crate::error::ErrorKind;
use crate::extractor::extract_main_text_from_html;
use crate::message::{Message, Reply, SummarizeCommand, TabId, TooltipCommand};
use crate::router::{Address, Envelope, Router, SurfaceId};
use crate::settings::Settings;
use crate::summary::SummaryType;

/// Identical display commands closer together than this are duplicates
pub const DUPLICATE_WINDOW: Duration = Duration::from_secs(1);

/// Renders the in-page button and tooltip.
pub trait Presenter: Send + Sync {
    fn show_button(&self, selection: &str);
    fn hide_button(&self);
    fn show_loading(&self);
    fn show_summary(&self, text: &str);
    fn dismiss(&self);
}

#[derive(Debug, Clone)]
struct Shown {
    summary: String,
    timestamp: i64,
    seq: Option<u64>,
}

/// Decides whether a display command should actually produce a tooltip.
#[derive(Debug)]
pub struct TooltipGate {
    showing: bool,
    last: Option<Shown>,
    window: Duration,
}

impl Default for TooltipGate {
    fn default() -> Self {
        Self::new(DUPLICATE_WINDOW)
    }
}

impl TooltipGate {
    pub fn new(window: Duration) -> Self {
        Self {
            showing: false,
            last: None,
            window,
        }
    }

    /// Admit a display command, or reject it as a duplicate.
    ///
    /// Rejected: anything while a result tooltip is up, a sequence number that was
    /// already shown, or the same summary within the window of the last one.
    pub fn admit(&mut self, summary: &str, timestamp: i64, seq: Option<u64>) -> bool {
        if self.showing {
            return false;
        }
        if let Some(last) = &self.last {
            if seq.is_some() && last.seq == seq {
                return false;
            }
            let window = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);
            if last.summary == summary && timestamp.abs_diff(last.timestamp) < window {
                return false;
            }
        }
        self.showing = true;
        self.last = Some(Shown {
            summary: summary.to_string(),
            timestamp,
            seq,
        });
        true
    }

    /// A new request started in this page; its result may replace whatever is shown.
    pub fn rearm(&mut self) {
        self.showing = false;
    }

    pub fn dismissed(&mut self) {
        self.showing = false;
    }

    pub fn is_showing(&self) -> bool {
        self.showing
    }
}

/// One tab's execution context.
pub struct PageContext {
    tab: TabId,
    router: Router,
    settings: Settings,
    presenter: Arc<dyn Presenter>,
    html: RwLock<String>,
    gate: Mutex<TooltipGate>,
}

impl PageContext {
    pub fn new(
        tab: TabId,
        router: Router,
        settings: Settings,
        presenter: Arc<dyn Presenter>,
        html: impl Into<String>,
    ) -> Self {
        Self {
            tab,
            router,
            settings,
            presenter,
            html: RwLock::new(html.into()),
            gate: Mutex::new(TooltipGate::default()),
        }
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }

    /// Swap in a new document snapshot (navigation).
    pub fn load(&self, html: impl Into<String>) {
        *self.html.write().unwrap_or_else(|p| p.into_inner()) = html.into();
    }

    pub fn article_text(&self) -> String {
        let html = self.html.read().unwrap_or_else(|p| p.into_inner());
        extract_main_text_from_html(&html)
    }

    fn gate(&self) -> std::sync::MutexGuard<'_, TooltipGate> {
        self.gate.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Serve envelopes for this tab until the router forgets it.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Envelope>) {
        debug!(tab = self.tab, "page context started");
        while let Some(envelope) = inbox.recv().await {
            let context = Arc::clone(&self);
            tokio::spawn(async move { context.handle(envelope).await });
        }
        debug!(tab = self.tab, "page context stopped");
    }

    pub async fn handle(&self, mut envelope: Envelope) {
        let message = match Message::from_value(envelope.payload.take()) {
            Ok(message) => message,
            Err(err) => {
                warn!(tab = self.tab, error = %err, "rejecting message");
                envelope.reply(Reply::error(ErrorKind::InvalidInput, &err.to_string()));
                return;
            }
        };

        match message {
            Message::GetArticleText => {
                let text = self.article_text();
                debug!(tab = self.tab, len = text.len(), "article text extracted");
                envelope.reply(Reply::Article { text });
            }
            Message::ShowSummaryTooltip(command) => {
                let shown = self.display(&command);
                envelope.reply(Reply::Ack { ok: shown });
            }
            Message::SummarizeText(command) => {
                // Context-menu flow: the reply would go nowhere, so acknowledge now
                envelope.reply(Reply::Ack { ok: true });
                let summary_type = command.summary_type.as_deref().map(SummaryType::parse_lenient);
                self.summarize_selection(&command.text, summary_type).await;
            }
        }
    }

    /// Show a display command unless it duplicates what is already up.
    pub fn display(&self, command: &TooltipCommand) -> bool {
        let admitted = self
            .gate()
            .admit(&command.summary, command.timestamp, command.seq);
        if admitted {
            self.presenter.show_summary(&command.summary);
        } else {
            debug!(tab = self.tab, seq = ?command.seq, "duplicate tooltip suppressed");
        }
        admitted
    }

    /// Mouse-up handler: offer the summarize button for a meaningful selection.
    pub async fn on_selection(&self, selection: &str) -> bool {
        let selection = selection.trim();
        let enabled = self.settings.general().await.enable_tooltip;
        if enabled && selection.chars().count() >= MIN_TEXT_LENGTH {
            self.presenter.show_button(selection);
            true
        } else {
            self.presenter.hide_button();
            false
        }
    }

    /// Summarize button flow: loading tooltip, then the result once the background
    /// context answers. The background also pushes the result; the gate drops the copy.
    /// Without a `summary_type` the background uses the saved default.
    pub async fn summarize_selection(
        &self,
        selection: &str,
        summary_type: Option<SummaryType>,
    ) -> String {
        self.presenter.hide_button();
        self.gate().rearm();
        self.presenter.show_loading();

        let message = Message::SummarizeText(
            SummarizeCommand {
                summary_type: summary_type.map(|t| t.to_string()),
                ..SummarizeCommand::new(selection, Default::default())
            }
            .inline(Some(self.tab)),
        );
        let shown = match self
            .router
            .request(Address::Background, &message, SurfaceId::Tab(self.tab))
            .await
        {
            Ok(reply) => reply.display(),
            Err(err) => {
                warn!(tab = self.tab, error = %err, "summarize request failed");
                ErrorKind::UnknownError.decorate(&format!("Error: {err}"))
            }
        };

        info!(tab = self.tab, "summary ready");
        self.display(&TooltipCommand {
            summary: shown.clone(),
            timestamp: Utc::now().timestamp_millis(),
            seq: None,
        });
        shown
    }

    /// User closed the tooltip.
    pub fn dismiss(&self) {
        self.gate().dismissed();
        self.presenter.dismiss();
    }
}
