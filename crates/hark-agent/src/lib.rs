//! hark-agent: push-to-talk voice agent runtime
//!
//! This crate provides the turn controller that listens while the PTT key is
//! held, transcribes, lets a model decide, asks for spoken confirmation
//! before any tool runs, and speaks the answer. Everything outside the
//! process (microphone, speaker, speech services, model, skill bridge) sits
//! behind a trait so the controller can be driven in tests.

pub mod audio;
pub mod config;
pub mod confirm;
pub mod context;
pub mod controller;
pub mod error;
pub mod events;
pub mod gate;
pub mod handle;
pub mod mcp;
pub mod ptt;
pub mod registry;
pub mod speech;
pub mod tool;
pub mod transport;
pub mod turn;

#[cfg(test)]
pub(crate) mod test_support;

pub use audio::{AudioBuffer, AudioCoordinator, AudioInput, AudioOutput};
pub use config::{AgentConfig, Phrases};
pub use confirm::VoiceConfirmer;
pub use context::{ContextConfig, ContextWindow, Summarizer, TransportSummarizer};
pub use controller::{Collaborators, TurnController};
pub use error::Error;
pub use events::TurnEvent;
pub use gate::{ConfirmationGate, Confirmer};
pub use handle::TurnHandle;
pub use mcp::{SkillBridgeClient, StdioTransport};
pub use ptt::{PttHandle, PttState};
pub use registry::ToolRegistry;
pub use speech::{Synthesizer, Transcriber};
pub use tool::{Tool, ToolResult};
pub use transport::{ProviderTransport, Transport};
pub use turn::{TurnState, TurnStatus};
