//! Stream assembler: ordered chunks in, coherent turns out.
//!
//! One assembler exists per in-flight response. It is an explicit state
//! machine over [`StreamPhase`], driven synchronously by each incoming
//! chunk; it never reorders, and it never drops accumulated content —
//! supersession and cancellation finalize with whatever is there.
//!
//! `consume` returns the updates produced by one chunk. Usually that is
//! zero or one, but a chunk that supersedes an open tool call, or the
//! terminal chunk, can emit several.

use serde_json::Value;
use skein_protocol::AgentId;
use skein_protocol::CanonicalMessage;
use skein_protocol::MessagePayload;
use skein_protocol::StreamChunk;
use skein_protocol::StreamPhase;
use skein_protocol::TurnUpdate;
use skein_protocol::UsageStats;
use skein_protocol::turn::parse_args_lenient;
use tracing::debug;
use uuid::Uuid;

/// A tool call whose argument fragments are still (or were) accumulating.
#[derive(Debug, Clone)]
struct OpenToolCall {
    call_id: String,
    tool: String,
    args: String,
}

#[derive(Debug)]
pub struct StreamAssembler {
    agent_id: AgentId,
    phase: StreamPhase,
    /// Correlation id of the call currently receiving fragments.
    active_tool_call_id: Option<String>,
    /// All calls opened this turn that have not yet seen their return.
    /// A new call id parks the previous call here rather than dropping
    /// it; its own fragments stay intact until the return arrives.
    open_calls: Vec<OpenToolCall>,
    reasoning: String,
    assistant: String,
    usage: Option<UsageStats>,
    finalized: bool,
}

impl StreamAssembler {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            phase: StreamPhase::Idle,
            active_tool_call_id: None,
            open_calls: Vec::new(),
            reasoning: String::new(),
            assistant: String::new(),
            usage: None,
            finalized: false,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// True once the terminal update has been emitted; further chunks
    /// are ignored.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Feed one chunk, in arrival order. Chunks after finalization are
    /// ignored — a cancelled or superseded stream must not mutate state.
    pub fn consume(&mut self, chunk: StreamChunk) -> Vec<TurnUpdate> {
        if self.finalized {
            debug!("dropping chunk after finalization");
            return Vec::new();
        }
        match chunk {
            StreamChunk::ReasoningDelta { text } => {
                self.phase = StreamPhase::Reasoning;
                self.reasoning.push_str(&text);
                vec![TurnUpdate::Reasoning {
                    text: self.reasoning.clone(),
                }]
            }
            StreamChunk::ToolCallDelta {
                call_id,
                tool,
                args_fragment,
            } => self.on_tool_call_delta(call_id, tool, args_fragment),
            StreamChunk::ToolReturn {
                call_id,
                tool,
                output,
            } => self.on_tool_return(call_id, tool, output),
            StreamChunk::AssistantDelta { text } => {
                self.phase = StreamPhase::Generating;
                self.assistant.push_str(&text);
                vec![TurnUpdate::AssistantDelta {
                    text: self.assistant.clone(),
                }]
            }
            StreamChunk::Usage { usage } => {
                // Metadata only; attaches to the finalized assistant turn.
                self.usage = Some(usage);
                Vec::new()
            }
            StreamChunk::Status { .. } => Vec::new(),
            StreamChunk::Reset => {
                // A replay of the response follows; drop the partial
                // accumulation so it is not concatenated with the replay.
                self.reasoning.clear();
                self.assistant.clear();
                self.open_calls.clear();
                self.active_tool_call_id = None;
                self.phase = StreamPhase::Idle;
                Vec::new()
            }
            StreamChunk::Done => self.finalize(false),
        }
    }

    fn on_tool_call_delta(
        &mut self,
        call_id: String,
        tool: String,
        args_fragment: String,
    ) -> Vec<TurnUpdate> {
        self.phase = StreamPhase::InvokingTool;
        if self.active_tool_call_id.as_deref() != Some(call_id.as_str()) {
            // A different correlation id starts (or resumes) another
            // call. The previous call stays parked in `open_calls` with
            // its own buffer; fragments are never mixed across ids.
            self.active_tool_call_id = Some(call_id.clone());
        }
        let idx = match self.open_calls.iter().position(|c| c.call_id == call_id) {
            Some(idx) => idx,
            None => {
                self.open_calls.push(OpenToolCall {
                    call_id: call_id.clone(),
                    tool: tool.clone(),
                    args: String::new(),
                });
                self.open_calls.len() - 1
            }
        };
        let call = &mut self.open_calls[idx];
        if call.tool.is_empty() && !tool.is_empty() {
            call.tool = tool;
        }
        call.args.push_str(&args_fragment);
        vec![TurnUpdate::ToolCallInProgress {
            call_id: call.call_id.clone(),
            tool: call.tool.clone(),
            raw_args: call.args.clone(),
        }]
    }

    fn on_tool_return(&mut self, call_id: String, tool: String, output: Value) -> Vec<TurnUpdate> {
        let (tool, arguments) = match self
            .open_calls
            .iter()
            .position(|c| c.call_id == call_id)
        {
            Some(idx) => {
                let call = self.open_calls.remove(idx);
                let tool = if call.tool.is_empty() { tool } else { call.tool };
                // Mid-stream parse failures were expected; at return time
                // an unparseable buffer degrades to a display-only string.
                (tool, parse_args_lenient(&call.args))
            }
            None => {
                debug!(call_id, "tool return without a matching open call");
                (tool, Value::Null)
            }
        };

        if self.active_tool_call_id.as_deref() == Some(call_id.as_str()) {
            self.active_tool_call_id = None;
        }
        if self.open_calls.is_empty() {
            self.phase = StreamPhase::Idle;
        }

        let mut message = CanonicalMessage::new(
            local_id(),
            self.agent_id.clone(),
            now_ms(),
            MessagePayload::ToolResult {
                tool,
                arguments,
                output,
            },
        );
        // Reasoning attaches to the turn it preceded.
        if !self.reasoning.is_empty() {
            message.reasoning = Some(std::mem::take(&mut self.reasoning));
        }
        vec![TurnUpdate::ToolInteraction { message }]
    }

    /// Fold all remaining state into durable messages and emit the
    /// terminal update. Idempotent: a second call returns nothing.
    pub fn finalize(&mut self, interrupted: bool) -> Vec<TurnUpdate> {
        if self.finalized {
            return Vec::new();
        }
        self.finalized = true;
        self.phase = StreamPhase::Idle;
        self.active_tool_call_id = None;

        let mut updates = Vec::new();

        // Calls that never saw a return are emitted with what they have
        // rather than silently discarded.
        for call in std::mem::take(&mut self.open_calls) {
            let mut message = CanonicalMessage::new(
                local_id(),
                self.agent_id.clone(),
                now_ms(),
                MessagePayload::ToolResult {
                    tool: call.tool,
                    arguments: parse_args_lenient(&call.args),
                    output: Value::Null,
                },
            );
            message.interrupted = true;
            updates.push(TurnUpdate::ToolInteraction { message });
        }

        let reasoning = std::mem::take(&mut self.reasoning);
        let assistant = std::mem::take(&mut self.assistant);
        let message = if assistant.is_empty() && reasoning.is_empty() {
            None
        } else {
            let mut message = CanonicalMessage::new(
                local_id(),
                self.agent_id.clone(),
                now_ms(),
                MessagePayload::AssistantText { text: assistant },
            );
            if !reasoning.is_empty() {
                message.reasoning = Some(reasoning);
            }
            message.interrupted = interrupted;
            message.usage = self.usage.take();
            Some(message)
        };

        updates.push(TurnUpdate::Completed { message });
        updates
    }
}

fn local_id() -> String {
    format!("local-{}", Uuid::new_v4())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
