//! Error types for hark-agent

use thiserror::Error;

/// Errors that can occur in the agent runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the model client
    #[error(transparent)]
    Ai(#[from] hark_ai::Error),

    /// The preserved tail alone does not fit the context budget
    #[error(
        "context budget misconfigured: the {tail_messages} preserved messages need {tail_tokens} tokens but the budget is {budget}"
    )]
    ContextBudget {
        tail_messages: usize,
        tail_tokens: usize,
        budget: usize,
    },

    /// Skill bridge failure
    #[error(transparent)]
    Bridge(#[from] crate::mcp::BridgeError),

    /// Invalid runtime configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Audio device or session error
    #[error("Audio error: {0}")]
    Audio(String),

    /// The surrounding operation was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, Error>;
