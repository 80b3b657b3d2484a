use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::agent_id::AgentId;

/// Token accounting reported by the service for one response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// Kind-specific payload of a [`CanonicalMessage`].
///
/// This is the closed union every raw message shape is normalized into.
/// `Debug` is the downgrade target for records whose shape could not be
/// recognized at all; it is kept so a batch never fails on one bad entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MessagePayload {
    UserText { text: String },
    AssistantText { text: String },
    Reasoning { text: String },
    ToolCall { tool: String, arguments: Value },
    ToolResult {
        tool: String,
        arguments: Value,
        output: Value,
    },
    System { text: String },
    UsageStats { usage: UsageStats },
    Status { text: String },
    Debug { raw: Value },
}

/// One atomic unit of conversation history.
///
/// `id` is service-assigned and doubles as the sync cursor; `created_at`
/// is unix milliseconds, normalized at ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    pub id: String,
    pub agent_id: AgentId,
    pub created_at: i64,
    #[serde(flatten)]
    pub payload: MessagePayload,
    /// Reasoning text that preceded this turn, when any was streamed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Set when the turn was cut short by user cancellation or a watchdog.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageStats>,
}

impl CanonicalMessage {
    pub fn new(
        id: impl Into<String>,
        agent_id: AgentId,
        created_at: i64,
        payload: MessagePayload,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id,
            created_at,
            payload,
            reasoning: None,
            interrupted: false,
            usage: None,
        }
    }

    /// Sort key honoring the cache ordering invariant.
    pub fn sort_key(&self) -> (i64, &str) {
        (self.created_at, self.id.as_str())
    }

    pub fn is_displayable(&self) -> bool {
        !matches!(
            self.payload,
            MessagePayload::UsageStats { .. }
                | MessagePayload::Status { .. }
                | MessagePayload::Debug { .. }
        )
    }
}
