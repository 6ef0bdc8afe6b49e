//! Turn lifecycle events

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::ToolCallState;
use crate::turn::{TurnState, TurnStatus};

/// Events emitted by the turn controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The controller moved between states
    StateChanged { from: TurnState, to: TurnState },
    /// A capture passed the minimum duration and a turn was created
    TurnStart { turn_id: Uuid },
    /// Transcript of the user's utterance
    Transcript { turn_id: Uuid, text: String },
    /// The model proposed a tool call
    ToolProposed {
        turn_id: Uuid,
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },
    /// A spoken confirmation prompt is being presented
    ConfirmationRequested {
        tool_call_id: String,
        tool_name: String,
        prompt: String,
    },
    /// A confirmed tool call was dispatched
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
    },
    /// A tool call reached a terminal state
    ToolResolved {
        tool_call_id: String,
        tool_name: String,
        state: ToolCallState,
        summary: String,
    },
    /// Final text of the turn, before synthesis
    Response { turn_id: Uuid, text: String },
    /// Context compaction finished
    CompactionEnd {
        tokens_before: usize,
        tokens_after: usize,
        messages_summarized: usize,
    },
    /// A configuration problem detected at runtime
    ConfigurationError { message: String },
    /// The skill bridge stopped answering; MCP tools are hidden
    BridgeUnavailable { reason: String },
    /// The skill bridge descriptor set was refreshed
    SkillsRefreshed { count: usize },
    /// Turn reached a terminal status
    TurnEnd {
        turn_id: Uuid,
        status: TurnStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<String>,
    },
}

impl TurnEvent {
    /// Whether this event ends a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::TurnEnd { .. })
    }
}
