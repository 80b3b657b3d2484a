//! Boundary normalizer: raw wire shapes → canonical tagged unions.
//!
//! The remote service (and older versions of it) uses several field names
//! for the same logical concept. Everything downstream operates only on
//! [`CanonicalMessage`] / [`StreamChunk`], so the duck typing is confined
//! to this module and never leaks. Normalization must not panic for any
//! input; records that cannot be recognized at all are downgraded to a
//! debug payload rather than failing a whole batch.

use serde_json::Value;
use skein_protocol::AgentId;
use skein_protocol::CanonicalMessage;
use skein_protocol::MessagePayload;
use skein_protocol::StreamChunk;
use skein_protocol::UsageStats;
use tracing::trace;
use uuid::Uuid;

/// Record types that are service-internal chatter: never rendered, never
/// cached as displayable turns.
const INTERNAL_KINDS: &[&str] = &[
    "heartbeat",
    "ping",
    "handshake",
    "login",
    "system-alert",
    "system_alert",
];

fn first_str<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| raw.get(*k).and_then(Value::as_str))
}

fn first_value<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| raw.get(*k))
}

/// Body text may be a bare string or a `{ "text": ... }` wrapper.
fn extract_text(raw: &Value) -> Option<String> {
    let v = first_value(raw, &["content", "text", "message", "body"])?;
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => v
            .get("text")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        _ => None,
    }
}

/// Timestamps arrive in seconds or milliseconds; normalize to ms. Any
/// value below 10^12 is far in the past as milliseconds, so treat it as
/// seconds.
fn extract_created_at(raw: &Value) -> i64 {
    let v = first_value(raw, &["createdAt", "created_at", "ts", "timestamp"]);
    let n = match v {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    match n {
        Some(n) if n > 0 && n < 1_000_000_000_000 => n * 1_000,
        Some(n) => n,
        None => 0,
    }
}

fn extract_usage(raw: &Value) -> Option<UsageStats> {
    let usage = raw.get("usage").or(Some(raw))?;
    let input = first_value(usage, &["inputTokens", "input_tokens", "promptTokens"])?
        .as_u64()?;
    let output = first_value(usage, &["outputTokens", "output_tokens", "completionTokens"])
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = first_value(usage, &["totalTokens", "total_tokens"]).and_then(Value::as_u64);
    Some(UsageStats {
        input_tokens: input,
        output_tokens: output,
        total_tokens: total,
    })
}

fn tool_call_payload(raw: &Value) -> Option<MessagePayload> {
    let call = first_value(raw, &["tool_call", "toolCall", "call"])?;
    let tool = first_str(call, &["tool", "name"])?.to_string();
    let arguments = first_value(call, &["arguments", "args", "input"])
        .cloned()
        .unwrap_or(Value::Null);
    Some(MessagePayload::ToolCall { tool, arguments })
}

fn tool_result_payload(raw: &Value) -> Option<MessagePayload> {
    let result = first_value(raw, &["tool_result", "toolResult", "result"])?;
    let tool = first_str(result, &["tool", "name"])?.to_string();
    let arguments = first_value(result, &["arguments", "args", "input"])
        .cloned()
        .unwrap_or(Value::Null);
    let output = first_value(result, &["output", "value", "return"])
        .cloned()
        .unwrap_or(Value::Null);
    Some(MessagePayload::ToolResult {
        tool,
        arguments,
        output,
    })
}

/// Convert one raw history record into a canonical message.
///
/// Returns `None` for records identified as internal chatter — callers
/// silently drop those. Records with an unrecognizable shape come back as
/// a `Debug` payload so a bad entry never sinks its batch.
pub fn normalize_message(agent_id: &AgentId, raw: &Value) -> Option<CanonicalMessage> {
    if !raw.is_object() {
        trace!("dropping non-object history record");
        return None;
    }

    if raw.get("internal").and_then(Value::as_bool) == Some(true) {
        trace!("dropping record flagged internal");
        return None;
    }

    let kind = first_str(raw, &["kind", "type", "role"]).unwrap_or("");
    if INTERNAL_KINDS.contains(&kind) {
        trace!(kind, "dropping internal record");
        return None;
    }

    let id = first_str(raw, &["id", "messageId", "message_id"])
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let created_at = extract_created_at(raw);

    let payload = match kind {
        "user" | "user-text" | "user_message" => extract_text(raw)
            .map(|text| MessagePayload::UserText { text }),
        "assistant" | "assistant-text" | "agent" => extract_text(raw)
            .map(|text| MessagePayload::AssistantText { text }),
        "reasoning" | "thinking" => extract_text(raw)
            .map(|text| MessagePayload::Reasoning { text }),
        "tool-call" | "tool_call" => tool_call_payload(raw),
        "tool-result" | "tool_result" => tool_result_payload(raw),
        "system" => extract_text(raw).map(|text| MessagePayload::System { text }),
        "usage" | "usage-stats" => extract_usage(raw)
            .map(|usage| MessagePayload::UsageStats { usage }),
        "status" => extract_text(raw).map(|text| MessagePayload::Status { text }),
        // No recognizable discriminant: try the structural fallbacks
        // before giving up.
        _ => tool_call_payload(raw)
            .or_else(|| tool_result_payload(raw))
            .or_else(|| {
                extract_text(raw).map(|text| match first_str(raw, &["role"]) {
                    Some("user") => MessagePayload::UserText { text },
                    _ => MessagePayload::AssistantText { text },
                })
            }),
    };

    let payload = payload.unwrap_or_else(|| {
        trace!(kind, "downgrading unrecognized record to debug payload");
        MessagePayload::Debug { raw: raw.clone() }
    });

    Some(CanonicalMessage::new(id, agent_id.clone(), created_at, payload))
}

/// Convert one raw streamed event into a normalized chunk. Returns `None`
/// for heartbeats and unknown event kinds.
pub fn normalize_chunk(raw: &Value) -> Option<StreamChunk> {
    let kind = first_str(raw, &["type", "kind", "event"])?;
    match kind {
        "reasoning-delta" | "reasoning.delta" | "thinking" => {
            let text = first_str(raw, &["delta", "text", "content"])?.to_string();
            Some(StreamChunk::ReasoningDelta { text })
        }
        "tool-call-delta" | "tool_call.delta" | "tool_call_delta" => {
            let call_id = first_str(raw, &["call_id", "callId", "id"])?.to_string();
            let tool = first_str(raw, &["tool", "name"]).unwrap_or("").to_string();
            let args_fragment = first_str(raw, &["delta", "arguments", "args"])
                .unwrap_or("")
                .to_string();
            Some(StreamChunk::ToolCallDelta {
                call_id,
                tool,
                args_fragment,
            })
        }
        "tool-return" | "tool_return" | "tool-result" | "tool_result" => {
            let call_id = first_str(raw, &["call_id", "callId", "id"])?.to_string();
            let tool = first_str(raw, &["tool", "name"]).unwrap_or("").to_string();
            let output = first_value(raw, &["output", "result", "value"])
                .cloned()
                .unwrap_or(Value::Null);
            Some(StreamChunk::ToolReturn {
                call_id,
                tool,
                output,
            })
        }
        "assistant-delta" | "text.delta" | "output_text.delta" => {
            let text = first_str(raw, &["delta", "text", "content"])?.to_string();
            Some(StreamChunk::AssistantDelta { text })
        }
        "usage" => extract_usage(raw).map(|usage| StreamChunk::Usage { usage }),
        "status" => {
            let text = first_str(raw, &["text", "message", "status"])?.to_string();
            Some(StreamChunk::Status { text })
        }
        "done" | "completed" => Some(StreamChunk::Done),
        other => {
            trace!(kind = other, "dropping unknown stream event");
            None
        }
    }
}
