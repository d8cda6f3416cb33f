//! Speech platform backed by an external `espeak-ng` compatible program.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::SpeechConfig;
use crate::speech::{SpeechError, SpeechEvent, SpeechPlatform, Utterance, Voice};

/// espeak's default speaking rate in words per minute
const BASE_WORDS_PER_MINUTE: f32 = 175.0;

pub struct ProcessSynth {
    program: Option<PathBuf>,
    voices: Vec<Voice>,
    current: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessSynth {
    /// Look the program up on `PATH`. A missing program makes the platform unsupported.
    pub fn new(config: &SpeechConfig) -> Self {
        let program = match which::which(&config.program) {
            Ok(path) => Some(path),
            Err(err) => {
                debug!(program = %config.program, error = %err, "speech program not found");
                None
            }
        };
        let voices = config
            .voices
            .iter()
            .map(|name| Voice {
                name: name.clone(),
                lang: name.clone(),
            })
            .collect();
        Self {
            program,
            voices,
            current: Mutex::new(None),
        }
    }

    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }

    fn take_current(&self) -> Option<oneshot::Sender<()>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

fn words_per_minute(rate: f32) -> u32 {
    (BASE_WORDS_PER_MINUTE * rate).round().clamp(80.0, 450.0) as u32
}

impl SpeechPlatform for ProcessSynth {
    fn is_supported(&self) -> bool {
        self.program.is_some()
    }

    fn supports_pause(&self) -> bool {
        false
    }

    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }

    fn speak(
        &self,
        utterance: Utterance,
        events: mpsc::UnboundedSender<SpeechEvent>,
    ) -> Result<(), SpeechError> {
        let program = self.program.clone().ok_or(SpeechError::Unsupported)?;

        let mut command = Command::new(&program);
        command
            .arg("-s")
            .arg(words_per_minute(utterance.rate).to_string())
            .arg("--stdin")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(voice) = &utterance.voice {
            command.arg("-v").arg(&voice.name);
        }

        let mut child = command
            .spawn()
            .map_err(|err| SpeechError::Platform(err.to_string()))?;

        let (stop_tx, stop_rx) = oneshot::channel();
        // Replacing the handle drops the old sender, which stops the old child
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stop_tx);

        let id = utterance.id;
        let text = utterance.text;
        tokio::spawn(async move {
            let stdin = child.stdin.take();
            let event = tokio::select! {
                status = async {
                    if let Some(mut stdin) = stdin {
                        if let Err(err) = stdin.write_all(text.as_bytes()).await {
                            debug!(utterance = id, error = %err, "could not write to speech program");
                        }
                        // Dropping stdin closes the pipe so the program sees end of input
                    }
                    child.wait().await
                } => match status {
                    Ok(status) if status.success() => SpeechEvent::Ended(id),
                    Ok(status) => SpeechEvent::Failed(id, format!("speech program exited with {status}")),
                    Err(err) => SpeechEvent::Failed(id, err.to_string()),
                },
                _ = stop_rx => {
                    if let Err(err) = child.kill().await {
                        warn!(utterance = id, error = %err, "could not stop speech program");
                    }
                    SpeechEvent::Failed(id, "interrupted".to_string())
                }
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    fn pause(&self) {}

    fn resume(&self) {}

    fn cancel(&self) {
        if let Some(stop) = self.take_current() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(program: &str) -> SpeechConfig {
        SpeechConfig {
            program: program.to_string(),
            voices: vec!["en-us".to_string()],
        }
    }

    fn utterance(id: u64) -> Utterance {
        Utterance {
            id,
            text: "hello".to_string(),
            voice: None,
            rate: 1.0,
            pitch: 1.0,
        }
    }

    #[test]
    fn rate_maps_to_words_per_minute() {
        assert_eq!(words_per_minute(1.0), 175);
        assert_eq!(words_per_minute(2.0), 350);
        assert_eq!(words_per_minute(0.1), 80);
        assert_eq!(words_per_minute(10.0), 450);
    }

    #[tokio::test]
    async fn missing_program_is_unsupported() {
        let synth = ProcessSynth::new(&config("definitely-not-a-speech-program-xyz"));
        assert!(!synth.is_supported());
        assert!(!synth.supports_pause());
        assert_eq!(synth.voices()[0].name, "en-us");

        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(synth.speak(utterance(1), tx), Err(SpeechError::Unsupported));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn finished_program_reports_end() {
        let synth = ProcessSynth::new(&config("true"));
        assert!(synth.is_supported());

        let (tx, mut rx) = mpsc::unbounded_channel();
        synth.speak(utterance(7), tx).unwrap();
        assert_eq!(rx.recv().await, Some(SpeechEvent::Ended(7)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_interrupts_a_blocked_write() {
        use std::os::unix::fs::PermissionsExt;

        // A program that never reads its input, so a large write fills the pipe
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("mute-synth");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let synth = ProcessSynth::new(&config(script.to_str().unwrap()));
        assert!(synth.is_supported());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let long = Utterance {
            text: "word ".repeat(200_000),
            ..utterance(9)
        };
        synth.speak(long, tx).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        synth.cancel();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("cancel did not stop the program");
        assert_eq!(event, Some(SpeechEvent::Failed(9, "interrupted".to_string())));
    }
}
