//! MCP skill bridge
//!
//! Remote skills are reached through an external bridge process speaking a
//! newline-delimited JSON request/response protocol. The client turns the
//! bridge's skill list into tool descriptors for the registry.

mod client;
pub mod protocol;
mod stdio;

pub use client::{McpTarget, McpTool, SkillBridgeClient, HELP_TOOL_NAME, REFRESH_TOOL_NAME};
pub use protocol::{RunOutput, SkillSummary};
pub use stdio::StdioTransport;

use async_trait::async_trait;
use std::time::Duration;

use protocol::BridgeRequest;

/// Failure of a bridge call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Transport failure; the bridge process is gone or unreachable
    #[error("skill bridge unavailable: {0}")]
    Unavailable(String),
    #[error("skill bridge did not answer within {0:?}")]
    Timeout(Duration),
    /// The skill or the bridge reported an error, or sent garbage
    #[error("skill error: {0}")]
    Skill(String),
}

impl BridgeError {
    /// Whether this failure means the bridge itself is down.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, BridgeError::Unavailable(_) | BridgeError::Timeout(_))
    }
}

/// Request/response channel to the bridge
///
/// Implementations carry one outstanding request at a time.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    /// Send `request` and return the raw response line with the same id.
    async fn exchange(&self, request: &BridgeRequest) -> std::io::Result<String>;

    /// Drop any connection state after a failure; the next exchange reconnects.
    async fn reset(&self) {}
}
