//! Microphone and speaker through cpal
//!
//! cpal streams are not `Send`, so each capture and each playback owns a
//! dedicated thread that builds the stream, keeps it alive and drops it.
//! Captures are mixed to mono and resampled to 16 kHz for transcription;
//! playback is resampled to the output device's native rate.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SizedSample, StreamConfig};
use hark_agent::error::{Error, Result};
use hark_agent::{AudioBuffer, AudioInput, AudioOutput};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Rate captures are delivered at
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(3);
const PLAYBACK_POLL: Duration = Duration::from_millis(10);
/// Lets the device drain its last buffer before the stream is dropped
const PLAYBACK_TAIL: Duration = Duration::from_millis(80);

fn find_device(name: Option<&str>, input: bool) -> Result<Device> {
    let host = cpal::default_host();
    let kind = if input { "input" } else { "output" };
    let Some(name) = name else {
        let device = if input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.ok_or_else(|| Error::Audio(format!("no default {kind} device")));
    };

    let matches = |d: &Device| d.name().map(|n| n == name).unwrap_or(false);
    let found = if input {
        host.input_devices().map(|mut all| all.find(matches))
    } else {
        host.output_devices().map(|mut all| all.find(matches))
    };
    found
        .map_err(|e| Error::Audio(format!("cannot enumerate {kind} devices: {e}")))?
        .ok_or_else(|| Error::Audio(format!("{kind} device '{name}' not found")))
}

struct Recording {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
    samples: Arc<Mutex<Vec<f32>>>,
    native_rate: u32,
}

/// Microphone capture
pub struct CpalInput {
    device: Option<String>,
    recording: Mutex<Option<Recording>>,
}

impl CpalInput {
    pub fn new(device: Option<String>) -> Self {
        Self {
            device,
            recording: Mutex::new(None),
        }
    }

    /// Fail early if no usable input device exists.
    pub fn probe(&self) -> Result<String> {
        let device = find_device(self.device.as_deref(), true)?;
        device
            .default_input_config()
            .map_err(|e| Error::Audio(format!("no default input config: {e}")))?;
        Ok(device.name().unwrap_or_else(|_| "<unknown>".into()))
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    samples: Arc<Mutex<Vec<f32>>>,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let mut buf = samples.lock();
            for frame in data.chunks(channels.max(1)) {
                let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                buf.push(sum / frame.len() as f32);
            }
        },
        |err| tracing::error!(error = %err, "audio input stream error"),
        None,
    )
}

fn open_capture(
    device_name: Option<&str>,
    samples: Arc<Mutex<Vec<f32>>>,
) -> Result<(cpal::Stream, u32)> {
    let device = find_device(device_name, true)?;
    let supported = device
        .default_input_config()
        .map_err(|e| Error::Audio(format!("no default input config: {e}")))?;
    let config = supported.config();
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, samples),
        cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, samples),
        cpal::SampleFormat::U16 => build_input::<u16>(&device, &config, samples),
        other => {
            return Err(Error::Audio(format!("unsupported input sample format {other:?}")));
        }
    }
    .map_err(|e| Error::Audio(format!("failed to build input stream: {e}")))?;
    stream
        .play()
        .map_err(|e| Error::Audio(format!("failed to start input stream: {e}")))?;
    Ok((stream, config.sample_rate.0))
}

fn run_capture(
    device_name: Option<String>,
    samples: Arc<Mutex<Vec<f32>>>,
    ready: mpsc::SyncSender<Result<u32>>,
    stop: mpsc::Receiver<()>,
) {
    match open_capture(device_name.as_deref(), samples) {
        Ok((stream, rate)) => {
            let _ = ready.send(Ok(rate));
            // Returns on stop() or when the sender is dropped.
            let _ = stop.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

impl AudioInput for CpalInput {
    fn start(&self) -> Result<()> {
        let mut guard = self.recording.lock();
        if guard.is_some() {
            return Err(Error::Audio("capture already running".into()));
        }

        let samples = Arc::new(Mutex::new(Vec::new()));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = mpsc::channel();
        let device = self.device.clone();
        let thread_samples = samples.clone();
        let thread = std::thread::Builder::new()
            .name("hark-capture".into())
            .spawn(move || run_capture(device, thread_samples, ready_tx, stop_rx))
            .map_err(|e| Error::Audio(format!("failed to spawn capture thread: {e}")))?;

        let native_rate = match ready_rx.recv_timeout(STREAM_READY_TIMEOUT) {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                drop(stop_tx);
                return Err(Error::Audio("input stream did not start".into()));
            }
        };
        tracing::debug!(native_rate, "capture stream running");
        *guard = Some(Recording {
            stop: stop_tx,
            thread,
            samples,
            native_rate,
        });
        Ok(())
    }

    fn stop(&self) -> Result<AudioBuffer> {
        let recording = self
            .recording
            .lock()
            .take()
            .ok_or_else(|| Error::Audio("no capture running".into()))?;
        let _ = recording.stop.send(());
        if recording.thread.join().is_err() {
            tracing::warn!("capture thread panicked");
        }
        let samples = std::mem::take(&mut *recording.samples.lock());
        let resampled = resample_linear(&samples, recording.native_rate, CAPTURE_SAMPLE_RATE);
        Ok(AudioBuffer::new(resampled, CAPTURE_SAMPLE_RATE))
    }
}

/// Speaker playback
pub struct CpalOutput {
    device: Option<String>,
}

impl CpalOutput {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }

    pub fn probe(&self) -> Result<String> {
        let device = find_device(self.device.as_deref(), false)?;
        device
            .default_output_config()
            .map_err(|e| Error::Audio(format!("no default output config: {e}")))?;
        Ok(device.name().unwrap_or_else(|_| "<unknown>".into()))
    }
}

fn build_output<T>(
    device: &Device,
    config: &StreamConfig,
    samples: Arc<Vec<f32>>,
    position: Arc<AtomicUsize>,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut pos = position.load(Ordering::Relaxed);
            for frame in data.chunks_mut(channels.max(1)) {
                let value = samples.get(pos).copied().unwrap_or(0.0);
                for out in frame.iter_mut() {
                    *out = T::from_sample(value);
                }
                if pos < samples.len() {
                    pos += 1;
                }
            }
            position.store(pos, Ordering::Relaxed);
        },
        |err| tracing::error!(error = %err, "audio output stream error"),
        None,
    )
}

fn play_blocking(device_name: Option<String>, audio: AudioBuffer, cancel: CancellationToken) -> Result<()> {
    let device = find_device(device_name.as_deref(), false)?;
    let supported = device
        .default_output_config()
        .map_err(|e| Error::Audio(format!("no default output config: {e}")))?;
    let config = supported.config();
    let rate = config.sample_rate.0;

    let samples = Arc::new(resample_linear(&audio.samples, audio.sample_rate, rate));
    let total = samples.len();
    let position = Arc::new(AtomicUsize::new(0));

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, samples, position.clone()),
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, samples, position.clone()),
        cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, samples, position.clone()),
        other => return Err(Error::Audio(format!("unsupported output sample format {other:?}"))),
    }
    .map_err(|e| Error::Audio(format!("failed to build output stream: {e}")))?;
    stream
        .play()
        .map_err(|e| Error::Audio(format!("failed to start output stream: {e}")))?;

    let deadline = Instant::now() + audio.duration() + Duration::from_secs(1);
    loop {
        if cancel.is_cancelled() {
            tracing::debug!("playback stopped early");
            break;
        }
        if position.load(Ordering::Relaxed) >= total {
            std::thread::sleep(PLAYBACK_TAIL);
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!("playback did not drain before its deadline");
            break;
        }
        std::thread::sleep(PLAYBACK_POLL);
    }
    drop(stream);
    Ok(())
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn play(&self, audio: AudioBuffer, cancel: CancellationToken) -> Result<()> {
        if audio.is_empty() {
            return Ok(());
        }
        let device = self.device.clone();
        // The blocking loop watches `cancel` itself, so an abandoned await
        // still stops the stream promptly.
        tokio::task::spawn_blocking(move || play_blocking(device, audio, cancel))
            .await
            .map_err(|e| Error::Audio(format!("playback thread failed: {e}")))?
    }
}

/// Linear-interpolation resampler for mono audio.
pub fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from as f64 / to as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let idx = (src.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (src - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_identity() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn test_downsample_length_and_values() {
        let samples: Vec<f32> = (0..480).map(|i| i as f32).collect();
        let out = resample_linear(&samples, 48_000, 16_000);
        assert_eq!(out.len(), 160);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 3.0);
        assert_eq!(out[159], 477.0);
    }

    #[test]
    fn test_upsample_interpolates() {
        let out = resample_linear(&[0.0, 1.0], 12_000, 24_000);
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.0]);
    }
}
