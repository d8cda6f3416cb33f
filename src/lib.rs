//! # SmartDigest
//!
//! Summarize web pages and text selections with Gemini.
//!
//! ## Layout
//!
//! - **Contexts**: a background context owns the API key, request budget and the
//!   provider client; each tab runs a page context; the popup asks both for work.
//!   They only talk through the [`router::Router`], exchanging JSON messages.
//! - **Client**: validation, truncation, prompt building and a retrying Gemini call
//!   with a closed error taxonomy ([`error::ErrorKind`]).
//! - **Speech**: a single-session text-to-speech state machine over a pluggable
//!   [`speech::SpeechPlatform`].

pub mod background;
pub mod client;
pub mod config;
pub mod error;
pub mod extractor;
pub mod message;
pub mod page;
pub mod ratelimit;
pub mod retry;
pub mod router;
pub mod settings;
pub mod speech;
pub mod summary;
pub mod surface;
pub mod synth;

pub use client::{GeminiClient, Summarize, SummarizeError};
pub use config::Config;
pub use error::ErrorKind;
pub use settings::{ApiKey, Settings};
pub use summary::{SummaryResult, SummaryType};

use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber. `RUST_LOG` wins over `verbose`.
pub fn setup_logging(verbose: u8) {
    let default = match verbose {
        0 => "smartdigest=warn",
        1 => "smartdigest=info",
        _ => "smartdigest=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // A second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
