//! Audio coordination
//!
//! [`AudioCoordinator`] owns the single capture session and the single
//! playback slot. Speech, the thinking loop and the error tone all share
//! that slot; starting a capture always silences it first.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Sample rate used for generated tones
pub const TONE_SAMPLE_RATE: u32 = 24_000;

const THINKING_GAP: Duration = Duration::from_millis(700);

/// Mono PCM samples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sine tone with short fades so it does not click.
    pub fn tone(frequency: f32, duration: Duration, amplitude: f32, sample_rate: u32) -> Self {
        let n = (duration.as_secs_f32() * sample_rate as f32) as usize;
        let fade = (sample_rate as usize / 100).min(n / 2).max(1);
        let samples = (0..n)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                let envelope = (i.min(n - 1 - i) as f32 / fade as f32).min(1.0);
                (2.0 * PI * frequency * t).sin() * amplitude * envelope
            })
            .collect();
        Self::new(samples, sample_rate)
    }

    /// Append `other`, which must share this buffer's sample rate.
    pub fn then(mut self, other: AudioBuffer) -> Self {
        debug_assert_eq!(self.sample_rate, other.sample_rate);
        self.samples.extend(other.samples);
        self
    }

    /// Soft two-note chime looped while the agent works
    pub fn thinking_chime() -> Self {
        let note = Duration::from_millis(120);
        Self::tone(440.0, note, 0.12, TONE_SAMPLE_RATE)
            .then(Self::tone(660.0, note, 0.12, TONE_SAMPLE_RATE))
    }

    /// Descending two-note tone played when a turn fails
    pub fn error_tone() -> Self {
        let note = Duration::from_millis(180);
        Self::tone(520.0, note, 0.3, TONE_SAMPLE_RATE)
            .then(Self::tone(330.0, note * 2, 0.3, TONE_SAMPLE_RATE))
    }
}

/// Microphone
pub trait AudioInput: Send + Sync {
    /// Start buffering samples.
    fn start(&self) -> Result<()>;
    /// Stop and return everything buffered since `start`.
    fn stop(&self) -> Result<AudioBuffer>;
}

/// Speaker
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play `audio` to the end, or until `cancel` fires.
    async fn play(&self, audio: AudioBuffer, cancel: CancellationToken) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackKind {
    Speech,
    Thinking,
    Notice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEnd {
    Completed,
    Cancelled,
    Failed(String),
}

/// A playback in the slot
pub struct PlaybackHandle {
    id: u64,
    cancel: CancellationToken,
    done: oneshot::Receiver<PlaybackEnd>,
}

impl PlaybackHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until playback ends.
    pub async fn wait(self) -> PlaybackEnd {
        self.done.await.unwrap_or(PlaybackEnd::Cancelled)
    }
}

struct ActivePlayback {
    id: u64,
    kind: PlaybackKind,
    cancel: CancellationToken,
}

/// One capture and one playback at a time
pub struct AudioCoordinator {
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    playback: Mutex<Option<ActivePlayback>>,
    capturing: AtomicBool,
    next_id: AtomicU64,
    thinking: AudioBuffer,
    error: AudioBuffer,
}

impl AudioCoordinator {
    pub fn new(input: Arc<dyn AudioInput>, output: Arc<dyn AudioOutput>) -> Arc<Self> {
        Self::with_tones(input, output, AudioBuffer::thinking_chime(), AudioBuffer::error_tone())
    }

    pub fn with_tones(
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
        thinking: AudioBuffer,
        error: AudioBuffer,
    ) -> Arc<Self> {
        Arc::new(Self {
            input,
            output,
            playback: Mutex::new(None),
            capturing: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            thinking,
            error,
        })
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::Acquire)
    }

    /// Kind of the playback currently in the slot.
    pub fn playing(&self) -> Option<PlaybackKind> {
        self.playback.lock().as_ref().map(|p| p.kind)
    }

    /// Silence any playback and start buffering the microphone.
    pub fn start_capture(self: &Arc<Self>) -> Result<CaptureSession> {
        self.cancel_playback();
        if self.capturing.swap(true, Ordering::AcqRel) {
            return Err(Error::Audio("a capture session is already active".into()));
        }
        if let Err(e) = self.input.start() {
            self.capturing.store(false, Ordering::Release);
            return Err(e);
        }
        tracing::debug!("capture started");
        Ok(CaptureSession {
            coordinator: Arc::clone(self),
            open: true,
        })
    }

    fn end_capture(&self) -> Result<AudioBuffer> {
        let result = self.input.stop();
        self.capturing.store(false, Ordering::Release);
        result
    }

    /// Put `audio` in the playback slot, replacing whatever was there.
    pub fn play(self: &Arc<Self>, audio: AudioBuffer, kind: PlaybackKind) -> PlaybackHandle {
        let token = CancellationToken::new();
        let id = self.install(kind, token.clone());
        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        let task_token = token.clone();

        tokio::spawn(async move {
            let end = tokio::select! {
                biased;
                _ = task_token.cancelled() => PlaybackEnd::Cancelled,
                r = this.output.play(audio, task_token.clone()) => match r {
                    Ok(()) if task_token.is_cancelled() => PlaybackEnd::Cancelled,
                    Ok(()) => PlaybackEnd::Completed,
                    Err(e) => {
                        tracing::warn!(error = %e, "playback failed");
                        PlaybackEnd::Failed(e.to_string())
                    }
                },
            };
            this.vacate(id);
            let _ = tx.send(end);
        });

        PlaybackHandle {
            id,
            cancel: token,
            done: rx,
        }
    }

    /// Cancel the playback identified by `handle`, if it is still active.
    pub fn cancel(&self, handle: &PlaybackHandle) {
        handle.cancel();
        self.vacate(handle.id);
    }

    /// Cancel whatever is playing.
    pub fn cancel_playback(&self) {
        if let Some(active) = self.playback.lock().take() {
            tracing::debug!(kind = ?active.kind, "playback cancelled");
            active.cancel.cancel();
        }
    }

    /// Start looping the thinking chime unless it is already running.
    pub fn start_thinking(self: &Arc<Self>) {
        if self.playing() == Some(PlaybackKind::Thinking) {
            return;
        }
        let token = CancellationToken::new();
        let id = self.install(PlaybackKind::Thinking, token.clone());
        let this = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let played = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    r = this.output.play(this.thinking.clone(), token.clone()) => r,
                };
                if let Err(e) = played {
                    tracing::warn!(error = %e, "thinking loop stopped");
                    break;
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(THINKING_GAP) => {}
                }
            }
            this.vacate(id);
        });
    }

    pub fn stop_thinking(&self) {
        let mut slot = self.playback.lock();
        if slot.as_ref().map(|p| p.kind) == Some(PlaybackKind::Thinking) {
            if let Some(active) = slot.take() {
                active.cancel.cancel();
            }
        }
    }

    pub fn play_error_tone(self: &Arc<Self>) -> PlaybackHandle {
        self.play(self.error.clone(), PlaybackKind::Notice)
    }

    /// Silence all playback. Called on every terminal turn transition;
    /// capture sessions release themselves when dropped.
    pub fn release(&self) {
        self.cancel_playback();
    }

    fn install(&self, kind: PlaybackKind, cancel: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .playback
            .lock()
            .replace(ActivePlayback { id, kind, cancel });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        id
    }

    fn vacate(&self, id: u64) {
        let mut slot = self.playback.lock();
        if slot.as_ref().map(|p| p.id) == Some(id) {
            if let Some(active) = slot.take() {
                active.cancel.cancel();
            }
        }
    }
}

/// An open microphone capture. Dropping it discards the audio.
pub struct CaptureSession {
    coordinator: Arc<AudioCoordinator>,
    open: bool,
}

impl CaptureSession {
    /// Stop capturing and return the buffered audio.
    pub fn finish(mut self) -> Result<AudioBuffer> {
        self.open = false;
        let audio = self.coordinator.end_capture()?;
        tracing::debug!(duration_ms = audio.duration().as_millis() as u64, "capture finished");
        Ok(audio)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.open {
            let _ = self.coordinator.end_capture();
            tracing::debug!("capture discarded");
        }
    }
}
