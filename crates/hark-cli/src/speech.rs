//! OpenAI-compatible speech services
//!
//! Transcription uploads the capture as a 16-bit WAV through the
//! `/audio/transcriptions` multipart endpoint. Synthesis asks
//! `/audio/speech` for raw PCM (24 kHz, 16-bit little-endian mono) so the
//! reply can go straight to the speaker without a decoder.

use async_trait::async_trait;
use hark_agent::AudioBuffer;
use hark_agent::speech::{SynthesisError, Synthesizer, TranscriptionError, Transcriber};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;

/// Sample rate of `response_format = "pcm"` speech
pub const SPEECH_SAMPLE_RATE: u32 = 24_000;

#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(serde::Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'a str,
}

/// Whisper transcription and TTS over one HTTP client
pub struct OpenAiSpeech {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    transcription_model: String,
    synthesis_model: String,
}

impl OpenAiSpeech {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transcription_model: "whisper-1".to_string(),
            synthesis_model: "tts-1".to_string(),
        }
    }

    pub fn with_models(
        mut self,
        transcription: impl Into<String>,
        synthesis: impl Into<String>,
    ) -> Self {
        self.transcription_model = transcription.into();
        self.synthesis_model = synthesis.into();
        self
    }

    async fn post_transcription(
        &self,
        audio: &AudioBuffer,
        language: Option<&str>,
    ) -> Result<String, TranscriptionError> {
        let wav = encode_wav(audio).map_err(TranscriptionError::Provider)?;
        tracing::debug!(
            audio_bytes = wav.len(),
            duration_ms = audio.duration().as_millis() as u64,
            "starting transcription"
        );

        let file = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Provider(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.transcription_model.clone())
            .text("response_format", "json");
        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::Provider(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "transcription request failed");
            return Err(TranscriptionError::Provider(format!("{}: {}", status, body)));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::Provider(e.to_string()))?;
        let text = parsed.text.trim().to_string();
        if text.is_empty() {
            return Err(TranscriptionError::NoSpeech);
        }
        tracing::debug!(chars = text.len(), "transcription complete");
        Ok(text)
    }

    async fn post_speech(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
    ) -> Result<AudioBuffer, SynthesisError> {
        let request = SpeechRequest {
            model: &self.synthesis_model,
            input: text,
            voice,
            speed,
            response_format: "pcm",
        };
        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| SynthesisError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, "speech request failed");
            return Err(SynthesisError(format!("{}: {}", status, body)));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SynthesisError(e.to_string()))?;
        Ok(decode_pcm16(&bytes, SPEECH_SAMPLE_RATE))
    }
}

#[async_trait]
impl Transcriber for OpenAiSpeech {
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        language: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<String, TranscriptionError> {
        if audio.is_empty() {
            return Err(TranscriptionError::NoSpeech);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TranscriptionError::Provider("cancelled".into())),
            r = self.post_transcription(audio, language) => r,
        }
    }
}

#[async_trait]
impl Synthesizer for OpenAiSpeech {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
        cancel: CancellationToken,
    ) -> Result<AudioBuffer, SynthesisError> {
        if text.trim().is_empty() {
            return Ok(AudioBuffer::new(Vec::new(), SPEECH_SAMPLE_RATE));
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SynthesisError("cancelled".into())),
            r = self.post_speech(text, voice, speed) => r,
        }
    }
}

/// Mono 16-bit PCM WAV bytes for `audio`.
pub fn encode_wav(audio: &AudioBuffer) -> Result<Vec<u8>, String> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| format!("failed to create wav writer: {e}"))?;
        for &s in &audio.samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            writer
                .write_sample(v)
                .map_err(|e| format!("failed to write wav sample: {e}"))?;
        }
        writer
            .finalize()
            .map_err(|e| format!("failed to finalize wav: {e}"))?;
    }
    Ok(cursor.into_inner())
}

/// Samples from 16-bit little-endian mono PCM. A trailing odd byte is dropped.
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32) -> AudioBuffer {
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect();
    AudioBuffer::new(samples, sample_rate)
}
