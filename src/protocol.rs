use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 服务器下发的事件，`type` 字段区分类型
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Partial transcript, may be revised.
    SttChunk { transcript: String, ts: f64 },
    /// Final transcript for one user turn.
    SttOutput { transcript: String, ts: f64 },
    /// Fragment of the agent's text reply.
    AgentChunk { text: String, ts: f64 },
    ToolCall { name: String, args: Value, ts: f64 },
    ToolResult { name: String, result: String, ts: f64 },
    /// Base64 PCM, 24 kHz mono s16le.
    TtsChunk { audio: String, ts: f64 },
}

impl ServerEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SttChunk { .. } => "stt_chunk",
            ServerEvent::SttOutput { .. } => "stt_output",
            ServerEvent::AgentChunk { .. } => "agent_chunk",
            ServerEvent::ToolCall { .. } => "tool_call",
            ServerEvent::ToolResult { .. } => "tool_result",
            ServerEvent::TtsChunk { .. } => "tts_chunk",
        }
    }

    pub fn ts(&self) -> f64 {
        match self {
            ServerEvent::SttChunk { ts, .. }
            | ServerEvent::SttOutput { ts, .. }
            | ServerEvent::AgentChunk { ts, .. }
            | ServerEvent::ToolCall { ts, .. }
            | ServerEvent::ToolResult { ts, .. }
            | ServerEvent::TtsChunk { ts, .. } => *ts,
        }
    }

    /// Encoded audio payload carried by this event, if any.
    pub fn audio(&self) -> Option<&str> {
        match self {
            ServerEvent::TtsChunk { audio, .. } => Some(audio),
            _ => None,
        }
    }
}
