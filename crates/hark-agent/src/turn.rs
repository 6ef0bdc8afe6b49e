//! Turn states, statuses and failures

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::Phrases;

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Listening,
    Transcribing,
    Deciding,
    Confirming,
    Executing,
    Responding,
    Speaking,
    Interrupted,
    Failed,
}

impl TurnState {
    /// States in which a PTT press preempts the turn.
    pub fn is_interruptible(self) -> bool {
        matches!(
            self,
            TurnState::Transcribing
                | TurnState::Deciding
                | TurnState::Confirming
                | TurnState::Executing
                | TurnState::Responding
                | TurnState::Speaking
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Active,
    Interrupted,
    Completed,
    Failed,
}

/// Step of a turn that can time out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transcription,
    Decision,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Transcription => "transcription",
            Stage::Decision => "decision",
            Stage::Synthesis => "synthesis",
        })
    }
}

/// Why a turn ended in `Failed`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TurnFailure {
    #[error("no speech detected")]
    NoSpeech,
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("decision failed: {0}")]
    Decision(String),
    #[error("model returned neither text nor tool calls")]
    EmptyDecision,
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
    #[error("{0}")]
    Context(String),
    #[error("audio error: {0}")]
    Audio(String),
}

impl TurnFailure {
    /// Spoken explanation, when one can be spoken at all.
    pub fn notice<'a>(&self, phrases: &'a Phrases) -> Option<&'a str> {
        match self {
            TurnFailure::NoSpeech => Some(&phrases.no_speech),
            TurnFailure::Transcription(_) => Some(&phrases.transcription_failed),
            TurnFailure::Decision(_) | TurnFailure::EmptyDecision | TurnFailure::Context(_) => {
                Some(&phrases.decision_failed)
            }
            TurnFailure::Timeout {
                stage: Stage::Synthesis,
                ..
            } => None,
            TurnFailure::Timeout { .. } => Some(&phrases.timeout),
            TurnFailure::Synthesis(_) | TurnFailure::Audio(_) => None,
        }
    }
}

/// Bookkeeping for the turn in progress
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: Uuid,
    pub status: TurnStatus,
    pub started_at: Instant,
    /// Context ids of the messages this turn appended, in order
    pub message_ids: Vec<Uuid>,
    /// Decide→execute iterations so far
    pub iterations: u32,
}

impl Turn {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TurnStatus::Active,
            started_at: Instant::now(),
            message_ids: Vec::new(),
            iterations: 0,
        }
    }
}

impl Default for Turn {
    fn default() -> Self {
        Self::new()
    }
}
