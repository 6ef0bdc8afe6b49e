//! hark-ai: chat completions client and conversation types
//!
//! This crate holds the message model shared by the agent runtime and a
//! non-streaming client for OpenAI-compatible chat completion APIs
//! (OpenRouter, OpenAI, or any compatible endpoint).

pub mod error;
pub mod providers;
pub mod types;

pub use error::{Error, Result};
pub use providers::LlmProvider;
pub use types::*;
