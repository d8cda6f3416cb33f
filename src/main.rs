//! SmartDigest CLI - summarise webpages and selections
//!
//! The application logic is contained in lib.rs, and this file is responsible
//! for parsing arguments, wiring the contexts together and handling top-level errors.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use smartdigest::background::BackgroundContext;
use smartdigest::extractor::{self, extract_main_text_from_html};
use smartdigest::message::TabId;
use smartdigest::page::{PageContext, Presenter};
use smartdigest::ratelimit::RateLimiter;
use smartdigest::router::Router;
use smartdigest::settings::{SledStore, Theme};
use smartdigest::speech::{SpeechManager, SpeechNotice};
use smartdigest::surface::{Popup, SUMMARY_TIMEOUT};
use smartdigest::synth::ProcessSynth;
use smartdigest::{setup_logging, ApiKey, Config, GeminiClient, Settings, SummaryType};
use std::sync::Arc;
use tokio::sync::Notify;

/// The CLI drives a single tab
const TAB: TabId = 1;

#[derive(Parser)]
#[command(name = "smartdigest")]
#[command(author, version, about = "Summarise webpages and text selections with Gemini", long_about = None)]
struct Cli {
    /// Increase log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarise a webpage by URL
    Summarise {
        /// URL to summarise
        url: String,
        /// brief, detailed or bullets (defaults to the saved preference)
        #[arg(short = 't', long = "type")]
        summary_type: Option<SummaryType>,
        /// Read the summary aloud
        #[arg(long)]
        speak: bool,
        /// Show raw extracted text instead of summary
        #[arg(long)]
        raw: bool,
    },
    /// Summarise a selection from a page, as the context menu would
    Select {
        /// Page the selection comes from
        url: String,
        /// The selected text
        text: String,
    },
    /// Manage the Gemini API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// View or change preferences
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Save a key (prompted for when omitted)
    Set { key: Option<String> },
    /// Show the saved key, redacted
    Show,
    /// Remove the saved key
    Clear,
    /// Send a minimal request to verify the key
    Check,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print all preferences
    Show,
    /// Speech preferences
    Tts {
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        speed: Option<f32>,
    },
    /// General preferences
    General {
        /// Offer the summarise button on selections
        #[arg(long)]
        tooltip: Option<bool>,
        #[arg(long = "default-type")]
        default_type: Option<SummaryType>,
        #[arg(long, value_enum)]
        theme: Option<ThemeArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ThemeArg {
    Light,
    Dark,
    Auto,
}

impl From<ThemeArg> for Theme {
    fn from(theme: ThemeArg) -> Self {
        match theme {
            ThemeArg::Light => Theme::Light,
            ThemeArg::Dark => Theme::Dark,
            ThemeArg::Auto => Theme::Auto,
        }
    }
}

/// Renders the page's button and tooltip on the terminal.
#[derive(Default)]
struct TerminalPresenter {
    shown: Notify,
}

impl Presenter for TerminalPresenter {
    fn show_button(&self, selection: &str) {
        println!(
            "{} {}",
            "✨ Summarize".cyan().bold(),
            format!("({} characters selected)", selection.chars().count()).dimmed()
        );
    }

    fn hide_button(&self) {}

    fn show_loading(&self) {
        eprintln!("{}", "Summarizing...".dimmed());
    }

    fn show_summary(&self, text: &str) {
        println!("\n{}\n\n{}\n", "=== Summary ===".bold(), text);
        self.shown.notify_one();
    }

    fn dismiss(&self) {}
}

struct Contexts {
    background: Arc<BackgroundContext>,
    page: Arc<PageContext>,
    popup: Popup,
    presenter: Arc<TerminalPresenter>,
}

/// Start the background context and one page context holding `html`.
fn spawn_contexts(config: &Config, settings: Settings, html: String) -> anyhow::Result<Contexts> {
    let (router, inbox) = Router::new();

    let client = GeminiClient::new(config)?;
    let limiter = RateLimiter::new(config.limits.max_requests, config.rate_window());
    let background = Arc::new(
        BackgroundContext::new(router.clone(), settings.clone(), Arc::new(client), limiter)
            .with_fallback_key(config.api.gemini_key.clone().map(ApiKey::new)),
    );
    tokio::spawn(Arc::clone(&background).run(inbox));

    let presenter = Arc::new(TerminalPresenter::default());
    let page = Arc::new(PageContext::new(
        TAB,
        router.clone(),
        settings,
        presenter.clone(),
        html,
    ));
    tokio::spawn(Arc::clone(&page).run(router.attach_tab(TAB)));

    Ok(Contexts {
        background,
        page,
        popup: Popup::new(router),
        presenter,
    })
}

fn open_settings(config: &Config) -> anyhow::Result<Settings> {
    let store = SledStore::open(&config.storage.path).with_context(|| {
        format!(
            "failed to open settings at {}",
            config.storage.path.display()
        )
    })?;
    Ok(Settings::new(Arc::new(store)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load()?;

    match cli.command {
        Commands::Summarise {
            url,
            summary_type,
            speak,
            raw,
        } => {
            println!("Fetching: {}", url);
            let page = extractor::fetch_page(&url).await?;

            if raw {
                let title = page.title.as_deref().unwrap_or("No title");
                let text = extract_main_text_from_html(&page.html);
                println!("\n=== {} ===\n", title);
                println!("{}", text);
                println!("\n--- Extracted {} characters ---", text.chars().count());
                return Ok(());
            }

            let settings = open_settings(&config)?;
            let summary_type = match summary_type {
                Some(summary_type) => summary_type,
                None => settings.general().await.default_summary_type,
            };
            let contexts = spawn_contexts(&config, settings.clone(), page.html)?;

            if let Some(title) = &page.title {
                println!("\n=== {} ===", title.bold());
            }
            let summary = match contexts.popup.summarize_page(TAB, summary_type).await {
                Ok(summary) => summary,
                Err(err) => bail!(err.user_message()),
            };
            println!("\n{}\n", summary);

            if speak {
                read_aloud(&config, &settings, &summary).await?;
            }
        }
        Commands::Select { url, text } => {
            let page = extractor::fetch_page(&url).await?;
            let settings = open_settings(&config)?;
            let contexts = spawn_contexts(&config, settings, page.html)?;

            contexts.page.on_selection(&text).await;
            contexts.background.on_context_menu(TAB, &text).await;

            if tokio::time::timeout(SUMMARY_TIMEOUT, contexts.presenter.shown.notified())
                .await
                .is_err()
            {
                bail!("Request timed out. Please try again.");
            }
            contexts.page.dismiss();
        }
        Commands::Key { action } => {
            let settings = open_settings(&config)?;
            manage_key(&config, &settings, action).await?;
        }
        Commands::Settings { action } => {
            let settings = open_settings(&config)?;
            manage_settings(&settings, action).await?;
        }
    }

    Ok(())
}

async fn manage_key(config: &Config, settings: &Settings, action: KeyAction) -> anyhow::Result<()> {
    match action {
        KeyAction::Set { key } => {
            let key = match key {
                Some(key) => key,
                None => dialoguer::Password::new()
                    .with_prompt("Gemini API key")
                    .interact()?,
            };
            let key = ApiKey::new(key);
            if key.is_empty() {
                bail!("No key entered.");
            }
            if !key.looks_valid() {
                println!(
                    "{}",
                    "⚠️ This does not look like a Gemini key (they start with \"AIza\"). Saving anyway."
                        .yellow()
                );
            }
            settings.set_api_key(&key).await?;
            println!("{} {}", "Saved".green(), key.redacted());
        }
        KeyAction::Show => match settings.api_key().await? {
            Some(key) => println!("{}", key.redacted()),
            None => println!("No API key saved."),
        },
        KeyAction::Clear => {
            if settings.clear_api_key().await? {
                println!("{}", "API key removed.".green());
            } else {
                println!("No API key saved.");
            }
        }
        KeyAction::Check => {
            let key = settings
                .api_key()
                .await?
                .or_else(|| config.api.gemini_key.clone().map(ApiKey::new))
                .filter(|key| !key.is_empty());
            let Some(key) = key else {
                bail!("No API key saved. Add one with `smartdigest key set`.");
            };
            let client = GeminiClient::new(config)?;
            match client.check_key(&key).await {
                Ok(()) => println!("{} {}", "✓ API key works:".green(), key.redacted()),
                Err(err) => bail!(err.user_message()),
            }
        }
    }
    Ok(())
}

async fn manage_settings(settings: &Settings, action: SettingsAction) -> anyhow::Result<()> {
    match action {
        SettingsAction::Show => {
            println!("{}", "Speech".bold());
            println!("{}", serde_json::to_string_pretty(&settings.tts().await)?);
            println!("{}", "General".bold());
            println!("{}", serde_json::to_string_pretty(&settings.general().await)?);
        }
        SettingsAction::Tts { voice, speed } => {
            let mut tts = settings.tts().await;
            if let Some(voice) = voice {
                tts.voice = voice;
            }
            if let Some(speed) = speed {
                if !(0.1..=10.0).contains(&speed) {
                    bail!("Speed must be between 0.1 and 10.");
                }
                tts.speed = speed;
            }
            settings.set_tts(&tts).await?;
            println!("{}", "Speech settings saved.".green());
        }
        SettingsAction::General {
            tooltip,
            default_type,
            theme,
        } => {
            let mut general = settings.general().await;
            if let Some(tooltip) = tooltip {
                general.enable_tooltip = tooltip;
            }
            if let Some(default_type) = default_type {
                general.default_summary_type = default_type;
            }
            if let Some(theme) = theme {
                general.theme = theme.into();
            }
            settings.set_general(&general).await?;
            println!("{}", "General settings saved.".green());
        }
    }
    Ok(())
}

/// Speak `summary` until it ends or the user presses Ctrl-C.
async fn read_aloud(config: &Config, settings: &Settings, summary: &str) -> anyhow::Result<()> {
    let mut speech = SpeechManager::new(ProcessSynth::new(&config.speech));
    if let Err(err) = speech.start(summary, &settings.tts().await) {
        eprintln!("{}", err.user_message());
        return Ok(());
    }
    println!("{}", "🔊 Reading aloud (Ctrl-C to stop)".dimmed());

    tokio::select! {
        notice = speech.next_notice() => {
            if let Some(SpeechNotice::Failed(message)) = notice {
                eprintln!("{}", message);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            speech.stop();
            println!("{}", "Stopped.".dimmed());
        }
    }
    Ok(())
}
