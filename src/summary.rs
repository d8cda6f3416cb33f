//! Summary types - what is asked of the provider and what comes back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ErrorKind;

/// Shape of the summary the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryType {
    #[default]
    Brief,
    Detailed,
    Bullets,
}

impl SummaryType {
    /// Parse a type name, falling back to brief for anything unrecognised.
    pub fn parse_lenient(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }

    /// Build the provider prompt for `text`.
    pub fn prompt(self, text: &str) -> String {
        let base = format!(
            "Please provide a comprehensive overview of the following content: \"{text}\""
        );
        let instructions = match self {
            SummaryType::Brief => {
                "Provide a clear and concise overview covering the main topic, key points, \
                 and purpose of this content in 3-5 sentences."
            }
            SummaryType::Detailed => {
                "Provide a comprehensive analysis in several paragraphs covering the main \
                 points, key insights, important details, and overall significance."
            }
            SummaryType::Bullets => {
                "Provide a structured summary with clear headings and bullet points. \
                 Use **Heading:** format for main sections and * **Label:** Description \
                 format for bullet points. Format it like this:\n\n\
                 **Main Topic:**\n\
                 * **Key Point:** Description of the key point\n\
                 * **Another Point:** Description of another point\n\n\
                 **Important Details:**\n\
                 * **Detail 1:** Description of detail 1\n\
                 * **Detail 2:** Description of detail 2"
            }
        };
        format!("{base}\n\n{instructions}")
    }
}

impl FromStr for SummaryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "brief" => Ok(SummaryType::Brief),
            "detailed" => Ok(SummaryType::Detailed),
            "bullets" => Ok(SummaryType::Bullets),
            other => Err(format!("unknown summary type: {other}")),
        }
    }
}

impl fmt::Display for SummaryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SummaryType::Brief => "brief",
            SummaryType::Detailed => "detailed",
            SummaryType::Bullets => "bullets",
        })
    }
}

/// Outcome of one summarize request: a summary or a classified failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SummaryResult {
    Text {
        text: String,
    },
    Failure {
        #[serde(rename = "errorKind")]
        error_kind: ErrorKind,
        message: String,
    },
}

impl SummaryResult {
    pub fn text(text: impl Into<String>) -> Self {
        SummaryResult::Text { text: text.into() }
    }

    pub fn failure(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        SummaryResult::Failure {
            error_kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SummaryResult::Text { .. })
    }

    /// What a surface shows: the summary itself, or the message behind its severity glyph.
    pub fn display(&self) -> String {
        match self {
            SummaryResult::Text { text } => text.clone(),
            SummaryResult::Failure {
                error_kind,
                message,
            } => error_kind.decorate(message),
        }
    }
}
