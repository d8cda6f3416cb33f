//! Speech session manager.
//!
//! Wraps a platform synthesizer in a small state machine:
//! `Idle -> Speaking -> (Paused <-> Speaking) -> Idle`. Only one session exists at a
//! time; starting a new one cancels whatever the platform was saying.
//!
//! Platforms report completion asynchronously, and a cancelled utterance still reports
//! (usually as an "interrupted" error). Those reports must not move the state a second
//! time or surface an error, so events are matched against the current utterance id and
//! swallowed for a short settle period after an intentional stop.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::settings::TtsSettings;

/// How long after `stop` late platform events are treated as part of the stop
pub const STOP_SETTLE: Duration = Duration::from_millis(100);

const PITCH: f32 = 1.1;

pub type UtteranceId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub name: String,
    pub lang: String,
}

/// What the platform is asked to say.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: UtteranceId,
    pub text: String,
    pub voice: Option<Voice>,
    pub rate: f32,
    pub pitch: f32,
}

/// Callbacks from the platform, tagged with the utterance they belong to.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    Ended(UtteranceId),
    Paused(UtteranceId),
    Resumed(UtteranceId),
    Failed(UtteranceId, String),
}

impl SpeechEvent {
    pub fn utterance(&self) -> UtteranceId {
        match self {
            SpeechEvent::Ended(id)
            | SpeechEvent::Paused(id)
            | SpeechEvent::Resumed(id)
            | SpeechEvent::Failed(id, _) => *id,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeechError {
    #[error("Text-to-Speech is not supported on this system.")]
    Unsupported,
    #[error("Nothing to read aloud.")]
    EmptyText,
    #[error("Text-to-Speech failed: {0}")]
    Platform(String),
}

impl SpeechError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpeechError::Unsupported => ErrorKind::TtsUnsupported,
            SpeechError::EmptyText => ErrorKind::InvalidInput,
            SpeechError::Platform(_) => ErrorKind::UnknownError,
        }
    }

    pub fn user_message(&self) -> String {
        self.kind().decorate(&self.to_string())
    }
}

/// A speech synthesis capability.
pub trait SpeechPlatform: Send + Sync {
    fn is_supported(&self) -> bool;
    fn supports_pause(&self) -> bool;
    fn voices(&self) -> Vec<Voice>;
    /// Begin speaking; completion is reported on `events`.
    fn speak(
        &self,
        utterance: Utterance,
        events: mpsc::UnboundedSender<SpeechEvent>,
    ) -> Result<(), SpeechError>;
    fn pause(&self);
    fn resume(&self);
    /// Stop and discard anything queued.
    fn cancel(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechState {
    Idle,
    Speaking,
    Paused,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechSession {
    pub utterance: UtteranceId,
    pub text: String,
    pub voice_id: Option<String>,
    pub rate: f32,
}

/// Something the UI should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechNotice {
    Finished,
    Failed(String),
}

/// Pick the voice named in settings: exact name, then a case-insensitive partial
/// match, then the first voice available.
pub fn select_voice(voices: &[Voice], wanted: &str) -> Option<Voice> {
    let wanted_lower = wanted.to_lowercase();
    voices
        .iter()
        .find(|v| v.name == wanted)
        .or_else(|| {
            voices
                .iter()
                .find(|v| v.name.to_lowercase().contains(&wanted_lower))
        })
        .or_else(|| voices.first())
        .cloned()
}

pub struct SpeechManager<P> {
    platform: P,
    state: SpeechState,
    session: Option<SpeechSession>,
    stopping_until: Option<Instant>,
    next_id: UtteranceId,
    events_tx: mpsc::UnboundedSender<SpeechEvent>,
    events_rx: mpsc::UnboundedReceiver<SpeechEvent>,
}

impl<P: SpeechPlatform> SpeechManager<P> {
    pub fn new(platform: P) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            platform,
            state: SpeechState::Idle,
            session: None,
            stopping_until: None,
            next_id: 1,
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> SpeechState {
        self.state
    }

    pub fn session(&self) -> Option<&SpeechSession> {
        self.session.as_ref()
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Whether the UI should offer pause/resume at all.
    pub fn pause_supported(&self) -> bool {
        self.platform.is_supported() && self.platform.supports_pause()
    }

    pub fn is_intentional_stop(&self) -> bool {
        self.stopping_until
            .is_some_and(|until| Instant::now() < until)
    }

    /// Start reading `text` aloud, replacing any current session.
    pub fn start(&mut self, text: &str, settings: &TtsSettings) -> Result<UtteranceId, SpeechError> {
        if !self.platform.is_supported() {
            return Err(SpeechError::Unsupported);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(SpeechError::EmptyText);
        }

        if let Some(previous) = self.session.take() {
            debug!(utterance = previous.utterance, "replacing active speech session");
        }
        self.platform.cancel();
        self.stopping_until = None;
        self.state = SpeechState::Idle;

        let voice = select_voice(&self.platform.voices(), &settings.voice);
        let id = self.next_id;
        self.next_id += 1;
        let utterance = Utterance {
            id,
            text: text.to_string(),
            voice: voice.clone(),
            rate: settings.speed.clamp(0.1, 10.0),
            pitch: PITCH,
        };
        let rate = utterance.rate;

        self.platform.speak(utterance, self.events_tx.clone())?;

        info!(utterance = id, voice = ?voice.as_ref().map(|v| &v.name), rate, "speaking");
        self.session = Some(SpeechSession {
            utterance: id,
            text: text.to_string(),
            voice_id: voice.map(|v| v.name),
            rate,
        });
        self.state = SpeechState::Speaking;
        Ok(id)
    }

    /// Pause if speaking and the platform can; returns whether anything changed.
    pub fn pause(&mut self) -> bool {
        if self.state != SpeechState::Speaking || !self.platform.supports_pause() {
            return false;
        }
        self.platform.pause();
        self.state = SpeechState::Paused;
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != SpeechState::Paused || !self.platform.supports_pause() {
            return false;
        }
        self.platform.resume();
        self.state = SpeechState::Speaking;
        true
    }

    /// Stop speaking. Late end/error reports for the stopped utterance are swallowed.
    pub fn stop(&mut self) -> bool {
        if self.state == SpeechState::Idle {
            return false;
        }
        // Flag first: cancel may report synchronously
        self.stopping_until = Some(Instant::now() + STOP_SETTLE);
        self.platform.cancel();
        self.state = SpeechState::Idle;
        if let Some(session) = self.session.take() {
            info!(utterance = session.utterance, "speech stopped");
        }
        true
    }

    /// Apply a platform event; returns a notice when the UI should react.
    pub fn handle_event(&mut self, event: SpeechEvent) -> Option<SpeechNotice> {
        if self.is_intentional_stop() {
            debug!(?event, "ignoring event during stop");
            return None;
        }
        let current = self.session.as_ref().map(|s| s.utterance);
        if current != Some(event.utterance()) {
            debug!(?event, "ignoring event for inactive utterance");
            return None;
        }

        match event {
            SpeechEvent::Ended(_) => {
                self.finish();
                Some(SpeechNotice::Finished)
            }
            SpeechEvent::Failed(_, reason) => {
                warn!(%reason, "speech failed");
                self.finish();
                Some(SpeechNotice::Failed(
                    SpeechError::Platform(reason).user_message(),
                ))
            }
            SpeechEvent::Paused(_) => {
                self.state = SpeechState::Paused;
                None
            }
            SpeechEvent::Resumed(_) => {
                self.state = SpeechState::Speaking;
                None
            }
        }
    }

    /// Wait for the next event that matters to the UI.
    pub async fn next_notice(&mut self) -> Option<SpeechNotice> {
        loop {
            let event = self.events_rx.recv().await?;
            if let Some(notice) = self.handle_event(event) {
                return Some(notice);
            }
        }
    }

    fn finish(&mut self) {
        self.state = SpeechState::Idle;
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Speak(UtteranceId),
        Pause,
        Resume,
        Cancel,
    }

    #[derive(Default)]
    struct Recorded {
        calls: Vec<Call>,
        active: Vec<UtteranceId>,
        events: Option<mpsc::UnboundedSender<SpeechEvent>>,
    }

    #[derive(Clone)]
    struct FakePlatform {
        supported: bool,
        pausable: bool,
        inner: Arc<Mutex<Recorded>>,
    }

    impl FakePlatform {
        fn new(supported: bool, pausable: bool) -> Self {
            Self {
                supported,
                pausable,
                inner: Arc::new(Mutex::new(Recorded::default())),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.inner.lock().unwrap().calls.clone()
        }

        fn active(&self) -> Vec<UtteranceId> {
            self.inner.lock().unwrap().active.clone()
        }

        /// Fire an event the way the platform would.
        fn emit(&self, event: SpeechEvent) {
            let inner = self.inner.lock().unwrap();
            inner.events.as_ref().unwrap().send(event).unwrap();
        }
    }

    impl SpeechPlatform for FakePlatform {
        fn is_supported(&self) -> bool {
            self.supported
        }

        fn supports_pause(&self) -> bool {
            self.pausable
        }

        fn voices(&self) -> Vec<Voice> {
            vec![
                Voice {
                    name: "Alex".into(),
                    lang: "en-US".into(),
                },
                Voice {
                    name: "Google US English".into(),
                    lang: "en-US".into(),
                },
            ]
        }

        fn speak(
            &self,
            utterance: Utterance,
            events: mpsc::UnboundedSender<SpeechEvent>,
        ) -> Result<(), SpeechError> {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call::Speak(utterance.id));
            inner.active.push(utterance.id);
            inner.events = Some(events);
            Ok(())
        }

        fn pause(&self) {
            self.inner.lock().unwrap().calls.push(Call::Pause);
        }

        fn resume(&self) {
            self.inner.lock().unwrap().calls.push(Call::Resume);
        }

        fn cancel(&self) {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.push(Call::Cancel);
            inner.active.clear();
        }
    }

    fn settings() -> TtsSettings {
        TtsSettings {
            voice: "google us".into(),
            speed: 1.25,
        }
    }

    #[test]
    fn voice_selection_falls_back() {
        let platform = FakePlatform::new(true, true);
        let voices = platform.voices();
        assert_eq!(select_voice(&voices, "Alex").unwrap().name, "Alex");
        assert_eq!(
            select_voice(&voices, "google us").unwrap().name,
            "Google US English"
        );
        assert_eq!(select_voice(&voices, "Missing").unwrap().name, "Alex");
        assert!(select_voice(&[], "Alex").is_none());
    }

    #[tokio::test]
    async fn unsupported_platform_fails_without_touching_state() {
        let platform = FakePlatform::new(false, false);
        let mut manager = SpeechManager::new(platform.clone());

        assert_eq!(
            manager.start("Read this", &settings()),
            Err(SpeechError::Unsupported)
        );
        assert_eq!(manager.state(), SpeechState::Idle);
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn second_start_replaces_the_first() {
        let platform = FakePlatform::new(true, true);
        let mut manager = SpeechManager::new(platform.clone());

        let first = manager.start("First summary", &settings()).unwrap();
        let second = manager.start("Second summary", &settings()).unwrap();

        assert_eq!(platform.active(), vec![second]);
        assert_eq!(
            platform.calls(),
            vec![
                Call::Cancel,
                Call::Speak(first),
                Call::Cancel,
                Call::Speak(second)
            ]
        );
        let session = manager.session().unwrap();
        assert_eq!(session.text, "Second summary");
        assert_eq!(session.voice_id.as_deref(), Some("Google US English"));
        assert_eq!(session.rate, 1.25);

        // The replaced utterance's late end report is ignored
        assert_eq!(manager.handle_event(SpeechEvent::Ended(first)), None);
        assert_eq!(manager.state(), SpeechState::Speaking);
    }

    #[tokio::test]
    async fn stop_then_natural_end_is_silent() {
        let platform = FakePlatform::new(true, true);
        let mut manager = SpeechManager::new(platform.clone());
        let id = manager.start("Some summary", &settings()).unwrap();

        assert!(manager.stop());
        assert!(manager.is_intentional_stop());
        assert_eq!(manager.state(), SpeechState::Idle);

        assert_eq!(manager.handle_event(SpeechEvent::Ended(id)), None);
        assert_eq!(
            manager.handle_event(SpeechEvent::Failed(id, "interrupted".into())),
            None
        );
        assert_eq!(manager.state(), SpeechState::Idle);
        assert!(!manager.stop(), "second stop is a no-op");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_clears_after_settle_period() {
        let platform = FakePlatform::new(true, true);
        let mut manager = SpeechManager::new(platform);
        manager.start("Some summary", &settings()).unwrap();
        manager.stop();

        tokio::time::advance(STOP_SETTLE).await;
        assert!(!manager.is_intentional_stop());
    }

    #[tokio::test]
    async fn restart_right_after_stop_reports_normally() {
        let platform = FakePlatform::new(true, true);
        let mut manager = SpeechManager::new(platform.clone());
        manager.start("First", &settings()).unwrap();
        manager.stop();

        let id = manager.start("Second", &settings()).unwrap();
        assert!(!manager.is_intentional_stop());

        platform.emit(SpeechEvent::Ended(id));
        assert_eq!(manager.next_notice().await, Some(SpeechNotice::Finished));
        assert_eq!(manager.state(), SpeechState::Idle);
    }

    #[tokio::test]
    async fn pause_and_resume_follow_platform_support() {
        let platform = FakePlatform::new(true, false);
        let mut manager = SpeechManager::new(platform.clone());
        assert!(!manager.pause(), "idle");
        manager.start("Some summary", &settings()).unwrap();
        assert!(!manager.pause_supported());
        assert!(!manager.pause());
        assert_eq!(manager.state(), SpeechState::Speaking);

        let platform = FakePlatform::new(true, true);
        let mut manager = SpeechManager::new(platform.clone());
        manager.start("Some summary", &settings()).unwrap();
        assert!(manager.pause());
        assert_eq!(manager.state(), SpeechState::Paused);
        assert!(!manager.pause());
        assert!(manager.resume());
        assert_eq!(manager.state(), SpeechState::Speaking);
        assert!(platform.calls().ends_with(&[Call::Pause, Call::Resume]));
    }

    #[tokio::test]
    async fn platform_error_surfaces_once() {
        let platform = FakePlatform::new(true, true);
        let mut manager = SpeechManager::new(platform.clone());
        let id = manager.start("Some summary", &settings()).unwrap();

        platform.emit(SpeechEvent::Failed(id, "audio device busy".into()));
        platform.emit(SpeechEvent::Ended(id));
        let notice = manager.next_notice().await.unwrap();
        assert!(matches!(notice, SpeechNotice::Failed(ref m) if m.contains("audio device busy")));
        assert_eq!(manager.state(), SpeechState::Idle);
        assert_eq!(manager.handle_event(SpeechEvent::Ended(id)), None);
    }

    #[test]
    fn empty_text_is_rejected() {
        let mut manager = SpeechManager::new(FakePlatform::new(true, true));
        assert_eq!(manager.start("   ", &settings()), Err(SpeechError::EmptyText));
    }
}
