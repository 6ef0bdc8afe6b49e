//! Spoken confirmation
//!
//! The prompt is synthesized and played through the shared playback slot,
//! then the microphone stays open for a short window while the user answers.
//! Confirmations do not use the PTT key: a press while confirming preempts
//! the turn like any other interrupt.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioCoordinator, PlaybackEnd, PlaybackKind};
use crate::gate::{ConfirmationReply, Confirmer};
use crate::speech::{Synthesizer, Transcriber, TranscriptionError};

/// How long the microphone stays open for the answer
pub const DEFAULT_LISTEN_WINDOW: Duration = Duration::from_secs(4);

/// Captures shorter than this are treated as silence
const MIN_REPLY: Duration = Duration::from_millis(150);

/// [`Confirmer`] that asks out loud and transcribes the reply
pub struct VoiceConfirmer {
    audio: Arc<AudioCoordinator>,
    synthesizer: Arc<dyn Synthesizer>,
    transcriber: Arc<dyn Transcriber>,
    listen_window: Duration,
    language: Option<String>,
    voice: String,
    speed: f32,
}

impl VoiceConfirmer {
    pub fn new(
        audio: Arc<AudioCoordinator>,
        synthesizer: Arc<dyn Synthesizer>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        Self {
            audio,
            synthesizer,
            transcriber,
            listen_window: DEFAULT_LISTEN_WINDOW,
            language: Some("es".to_string()),
            voice: "alloy".to_string(),
            speed: 1.0,
        }
    }

    pub fn with_listen_window(mut self, window: Duration) -> Self {
        self.listen_window = window;
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn with_voice(mut self, voice: impl Into<String>, speed: f32) -> Self {
        self.voice = voice.into();
        self.speed = speed;
        self
    }

    /// Play the prompt. Returns false if interrupted.
    async fn speak(&self, prompt: &str, cancel: &CancellationToken) -> bool {
        let synthesized = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            r = self.synthesizer.synthesize(prompt, &self.voice, self.speed, cancel.clone()) => r,
        };
        let audio = match synthesized {
            Ok(audio) => audio,
            Err(e) => {
                // Still listen: the prompt was also logged and emitted as an event.
                tracing::warn!(error = %e, "confirmation prompt could not be synthesized");
                return true;
            }
        };

        let playback = self.audio.play(audio, PlaybackKind::Speech);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.audio.cancel_playback();
                false
            }
            end = playback.wait() => {
                if let PlaybackEnd::Failed(e) = end {
                    tracing::warn!(error = %e, "confirmation prompt playback failed");
                }
                true
            }
        }
    }
}

#[async_trait]
impl Confirmer for VoiceConfirmer {
    async fn ask(&self, prompt: &str, cancel: CancellationToken) -> ConfirmationReply {
        self.audio.stop_thinking();
        if !self.speak(prompt, &cancel).await {
            return ConfirmationReply::Interrupted;
        }

        let session = match self.audio.start_capture() {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "could not open the microphone for confirmation");
                return ConfirmationReply::NoResponse;
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return ConfirmationReply::Interrupted,
            _ = tokio::time::sleep(self.listen_window) => {}
        }
        let audio = match session.finish() {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!(error = %e, "confirmation capture failed");
                return ConfirmationReply::NoResponse;
            }
        };
        if audio.duration() < MIN_REPLY {
            return ConfirmationReply::NoResponse;
        }

        let transcribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ConfirmationReply::Interrupted,
            r = self.transcriber.transcribe(&audio, self.language.as_deref(), cancel.clone()) => r,
        };
        match transcribed {
            Ok(text) if !text.trim().is_empty() => ConfirmationReply::Transcript(text.trim().to_string()),
            Ok(_) | Err(TranscriptionError::NoSpeech) => ConfirmationReply::NoResponse,
            Err(TranscriptionError::Provider(e)) => {
                tracing::warn!(error = %e, "confirmation transcription failed");
                ConfirmationReply::NoResponse
            }
        }
    }
}
