//! Speech recognition and synthesis contracts

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioBuffer;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptionError {
    #[error("no speech detected")]
    NoSpeech,
    #[error("transcription failed: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("speech synthesis failed: {0}")]
pub struct SynthesisError(pub String);

/// Speech to text
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &AudioBuffer,
        language: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<String, TranscriptionError>;
}

/// Text to speech
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        speed: f32,
        cancel: CancellationToken,
    ) -> Result<AudioBuffer, SynthesisError>;
}

const MAX_JSON_ITEMS: usize = 10;

static FENCED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```json\s*(.*?)\s*```").unwrap());
static CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static INLINE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());
static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static LINK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*link:\s*.*$").unwrap());
static LINK_FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(link|url|href)\s*:\s*\S+").unwrap());
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(https?://|www\.)\S+").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*#+\s*").unwrap());
static BULLET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*([-*+]|\d+\.)\s+").unwrap());
static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[*_~>#|{}\[\]<>]+").unwrap());
static UNSPEAKABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}\s.,¿?¡!;:\-()]").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Rewrite model output into something a synthesizer can read aloud.
///
/// JSON payloads become `key: value` lists; code, markdown and links are
/// dropped.
pub fn simplify_for_speech(text: &str) -> String {
    let mut t = match extract_json(text) {
        Some(value) => summarize_json(&value),
        None => text.to_string(),
    };

    for (re, rep) in [
        (&*CODE_BLOCK, " "),
        (&*INLINE_CODE, "$1"),
        (&*MD_LINK, "$1"),
        (&*LINK_LINE, " "),
        (&*LINK_FIELD, " "),
        (&*URL, " "),
        (&*HEADING, ""),
        (&*BULLET, ""),
        (&*MARKUP, " "),
        (&*UNSPEAKABLE, " "),
        (&*WHITESPACE, " "),
    ] {
        t = re.replace_all(&t, rep).into_owned();
    }
    t.trim().to_string()
}

fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Some(caps) = FENCED_JSON.captures(text) {
        if let Ok(v) = serde_json::from_str(&caps[1]) {
            return Some(v);
        }
    }
    let t = text.trim();
    let looks_like_json =
        (t.starts_with('{') && t.ends_with('}')) || (t.starts_with('[') && t.ends_with(']'));
    if looks_like_json {
        serde_json::from_str(t).ok()
    } else {
        None
    }
}

fn summarize_json(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}: {}", k, summarize_json(v)))
            .collect::<Vec<_>>()
            .join("; "),
        Value::Array(items) => {
            let mut parts: Vec<String> = items
                .iter()
                .take(MAX_JSON_ITEMS)
                .enumerate()
                .map(|(i, item)| format!("elemento {}: {}", i + 1, summarize_json(item)))
                .collect();
            if items.len() > MAX_JSON_ITEMS {
                parts.push(format!("y {} más", items.len() - MAX_JSON_ITEMS));
            }
            parts.join("; ")
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
