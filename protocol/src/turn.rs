use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::message::CanonicalMessage;

/// Incremental update emitted by the stream assembler while one response
/// is in flight. Each carries the cumulative content so far, so the
/// presentation layer can repaint without tracking deltas itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "update", rename_all = "kebab-case")]
pub enum TurnUpdate {
    Reasoning { text: String },
    /// Live view of a tool call whose arguments are still accumulating.
    /// `raw_args` may not yet parse as JSON; that is expected mid-stream.
    ToolCallInProgress {
        call_id: String,
        tool: String,
        raw_args: String,
    },
    /// A parsed call paired with its return payload.
    ToolInteraction { message: CanonicalMessage },
    AssistantDelta { text: String },
    /// Terminal update. Carries the folded assistant message, or `None`
    /// when the turn produced only tool interactions.
    Completed { message: Option<CanonicalMessage> },
}

impl TurnUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnUpdate::Completed { .. })
    }
}

/// Convenience used by live tool-call rendering: best-effort parse of the
/// accumulated argument string, falling back to the raw text.
pub fn parse_args_lenient(raw: &str) -> Value {
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => Value::String(raw.to_string()),
    }
}
