//! Tool trait, descriptors and tool call lifecycle

use async_trait::async_trait;
use hark_ai::Content;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default execution timeout for local tools
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Content to return to the LLM
    pub content: Vec<Content>,
    /// Whether the execution resulted in an error
    pub is_error: bool,
    /// Set when the tool gave up on its own deadline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timed_out: Option<Duration>,
}

impl ToolResult {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
            timed_out: None,
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: true,
            timed_out: None,
        }
    }

    /// The tool stopped itself after `after`. Reported as a timeout, not a failure.
    pub fn timed_out(after: Duration, message: impl Into<String>) -> Self {
        Self {
            timed_out: Some(after),
            ..Self::error(message)
        }
    }

    /// Get the text content as a single string
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Trait for locally executed tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Longest the tool may run before the call is abandoned
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    /// Short spoken description of what a call with `arguments` would do.
    fn describe_action(&self, arguments: &serde_json::Value) -> String {
        format!("{} con {}", self.name(), arguments)
    }

    /// Execute the tool with the given arguments
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult;
}

/// Type alias for a boxed tool
pub type BoxedTool = Arc<dyn Tool>;

/// Where a tool runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolKind {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "mcp-skill")]
    McpSkill,
}

/// Model-facing description of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub kind: ToolKind,
    /// JSON Schema for the arguments
    pub schema: serde_json::Value,
    /// Human-readable help text, also sent to the model as the description
    pub help: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl ToolDescriptor {
    pub fn for_local(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            kind: ToolKind::Local,
            schema: tool.parameters_schema(),
            help: tool.description().to_string(),
            timeout: tool.timeout(),
        }
    }

    /// Convert to a hark_ai::Tool for API calls
    pub fn to_api_tool(&self) -> hark_ai::Tool {
        hark_ai::Tool::new(self.name.clone(), self.help.clone(), self.schema.clone())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle of a proposed tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Proposed,
    AwaitingConfirmation,
    Confirmed,
    Cancelled,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolCallState::Cancelled
                | ToolCallState::Succeeded
                | ToolCallState::Failed
                | ToolCallState::TimedOut
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ToolCallState) -> bool {
        use ToolCallState::*;
        match self {
            Proposed => matches!(next, AwaitingConfirmation | Failed | Cancelled),
            AwaitingConfirmation => matches!(next, Confirmed | Cancelled | Failed),
            Confirmed => matches!(next, Executing | Cancelled | Failed),
            Executing => matches!(next, Succeeded | Failed | TimedOut | Cancelled),
            Cancelled | Succeeded | Failed | TimedOut => false,
        }
    }
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal tool call transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: ToolCallState,
    pub to: ToolCallState,
}

/// A tool call emitted by the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    /// Context id of the assistant message that carried the call
    pub origin_message_id: Uuid,
    state: ToolCallState,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
        origin_message_id: Uuid,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            origin_message_id,
            state: ToolCallState::Proposed,
        }
    }

    pub fn state(&self) -> ToolCallState {
        self.state
    }

    pub fn transition(&mut self, next: ToolCallState) -> Result<(), IllegalTransition> {
        if !self.state.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(tool = %self.name, id = %self.id, from = ?self.state, to = ?next, "tool call transition");
        self.state = next;
        Ok(())
    }
}

/// Why a tool call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnknownTool,
    InvalidArguments,
    ExecutionError,
    BridgeUnavailable,
    SkillError,
}

/// Why a tool call was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The user said the negative phrase
    Denied,
    /// The reply matched neither phrase
    Unrecognized,
    /// No reply before the confirmation timeout
    ConfirmationTimeout,
    /// A PTT press preempted the turn
    Interrupted,
}

/// Terminal outcome of a proposed tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Succeeded { output: String },
    Failed { reason: FailureReason, message: String },
    Cancelled { reason: CancelReason },
    TimedOut { after: Duration },
}

impl ToolOutcome {
    pub fn failed(reason: FailureReason, message: impl Into<String>) -> Self {
        ToolOutcome::Failed {
            reason,
            message: message.into(),
        }
    }

    /// The terminal tool call state this outcome corresponds to.
    pub fn state(&self) -> ToolCallState {
        match self {
            ToolOutcome::Succeeded { .. } => ToolCallState::Succeeded,
            ToolOutcome::Failed { .. } => ToolCallState::Failed,
            ToolOutcome::Cancelled { .. } => ToolCallState::Cancelled,
            ToolOutcome::TimedOut { .. } => ToolCallState::TimedOut,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            ToolOutcome::Cancelled {
                reason: CancelReason::Interrupted
            }
        )
    }

    /// Whether the tool message for this outcome should be flagged as an error.
    pub fn is_error(&self) -> bool {
        !matches!(self, ToolOutcome::Succeeded { .. })
    }
}
