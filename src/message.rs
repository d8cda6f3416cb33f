//! Wire format shared by every execution context.
//!
//! Messages are JSON objects tagged by `type` (older senders use `action`). Replies are
//! the only thing that travels back, and every request gets exactly one.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{fallback_message, ErrorKind};
use crate::summary::{SummaryResult, SummaryType};

pub type TabId = u32;

pub const GET_ARTICLE_TEXT: &str = "GET_ARTICLE_TEXT";
pub const SUMMARIZE_SELECTION: &str = "summarize-selection";
pub const SUMMARIZE_TEXT: &str = "summarize_text";
pub const SHOW_SUMMARY_TOOLTIP: &str = "show-summary-tooltip";

const KNOWN_TYPES: &[&str] = &[
    GET_ARTICLE_TEXT,
    SUMMARIZE_SELECTION,
    SUMMARIZE_TEXT,
    SHOW_SUMMARY_TOOLTIP,
];

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("message is not an object")]
    NotAnObject,
    #[error("message has no type")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "GET_ARTICLE_TEXT")]
    GetArticleText,
    #[serde(rename = "summarize-selection", alias = "summarize_text")]
    SummarizeText(SummarizeCommand),
    #[serde(rename = "show-summary-tooltip")]
    ShowSummaryTooltip(TooltipCommand),
}

/// Ask the background context for a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeCommand {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_type: Option<String>,
    /// Also push the result to the originating tab as a tooltip
    #[serde(default, rename = "showTooltip", alias = "deliverInline")]
    pub deliver_inline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
}

impl SummarizeCommand {
    pub fn new(text: impl Into<String>, summary_type: SummaryType) -> Self {
        Self {
            text: text.into(),
            summary_type: Some(summary_type.to_string()),
            deliver_inline: false,
            tab_id: None,
        }
    }

    pub fn inline(mut self, tab_id: Option<TabId>) -> Self {
        self.deliver_inline = true;
        self.tab_id = tab_id;
        self
    }

    /// Requested type, or `default` when none was given. Unknown names mean brief.
    pub fn summary_type_or(&self, default: SummaryType) -> SummaryType {
        self.summary_type
            .as_deref()
            .map(SummaryType::parse_lenient)
            .unwrap_or(default)
    }
}

/// Show a finished summary (or error) in the page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TooltipCommand {
    pub summary: String,
    /// Milliseconds since the epoch when the command was issued
    pub timestamp: i64,
    /// Correlation id of the request that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl Message {
    /// Decode a wire payload.
    pub fn from_value(mut value: Value) -> Result<Self, MessageError> {
        let object = value.as_object_mut().ok_or(MessageError::NotAnObject)?;
        let kind = match (object.get("type"), object.get("action")) {
            (Some(Value::String(kind)), _) => kind.clone(),
            (None, Some(Value::String(action))) => action.clone(),
            _ => return Err(MessageError::MissingType),
        };
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(MessageError::UnknownType(kind));
        }
        object.insert("type".to_string(), Value::String(kind.clone()));
        object.remove("action");

        serde_json::from_value(value).map_err(|source| MessageError::Malformed { kind, source })
    }

    /// Encode for the wire.
    pub fn to_value(&self) -> Value {
        // Plain data with string keys; serialization cannot fail
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::GetArticleText => GET_ARTICLE_TEXT,
            Message::SummarizeText(_) => SUMMARIZE_SELECTION,
            Message::ShowSummaryTooltip(_) => SHOW_SUMMARY_TOOLTIP,
        }
    }
}

/// Answer to a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Article { text: String },
    Summary(SummaryResult),
    Ack { ok: bool },
    Error { error: String },
}

impl Reply {
    /// Generic answer for a handler that failed or never answered.
    pub fn fallback() -> Self {
        Reply::Error {
            error: fallback_message(),
        }
    }

    pub fn error(kind: ErrorKind, message: &str) -> Self {
        Reply::Error {
            error: kind.decorate(message),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Reply::Error { .. } | Reply::Summary(SummaryResult::Failure { .. })
        )
    }

    /// Text a surface would put in its result area.
    pub fn display(&self) -> String {
        match self {
            Reply::Article { text } => text.clone(),
            Reply::Summary(result) => result.display(),
            Reply::Ack { ok } => if *ok { "ok" } else { "not handled" }.to_string(),
            Reply::Error { error } => error.clone(),
        }
    }
}
