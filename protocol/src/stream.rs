use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::message::UsageStats;

/// One normalized unit of an in-flight streamed response.
///
/// Chunks arrive strictly in order; several chunks may belong to one
/// logical turn (a tool call's arguments are streamed in fragments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    ReasoningDelta { text: String },
    ToolCallDelta {
        call_id: String,
        tool: String,
        args_fragment: String,
    },
    ToolReturn {
        call_id: String,
        tool: String,
        output: Value,
    },
    AssistantDelta { text: String },
    Usage { usage: UsageStats },
    Status { text: String },
    /// Synthetic marker: the response is about to be replayed from the
    /// start after a reconnect. Consumers discard whatever partial
    /// accumulation the interrupted attempt produced.
    Reset,
    /// Explicit terminal marker from the service.
    Done,
}

/// Presentation-facing phase of the active streamed turn. Transitions are
/// driven solely by which chunk kind arrived last.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamPhase {
    #[default]
    Idle,
    Reasoning,
    Generating,
    InvokingTool,
}
