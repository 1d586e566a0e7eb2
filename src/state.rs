//! Session state as seen by observers, plus the views derived from the
//! event log.

use crate::protocol::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingStatus {
    #[default]
    Idle,
    Capturing,
}

/// Recording is only ever `Capturing` while `Connected`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub connection: ConnectionStatus,
    pub recording: RecordingStatus,
    pub events: Vec<ServerEvent>,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionStatus::Connected
    }

    pub fn is_recording(&self) -> bool {
        self.recording == RecordingStatus::Capturing
    }

    pub fn current_transcript(&self) -> &str {
        current_transcript(&self.events)
    }

    pub fn agent_response(&self) -> String {
        agent_response(&self.events)
    }
}

/// Text of the most recent final transcript, or "" if there is none.
pub fn current_transcript(events: &[ServerEvent]) -> &str {
    events
        .iter()
        .rev()
        .find_map(|e| match e {
            ServerEvent::SttOutput { transcript, .. } => Some(transcript.as_str()),
            _ => None,
        })
        .unwrap_or("")
}

/// Agent text fragments received since the most recent final transcript,
/// joined in arrival order. Empty until a final transcript exists.
pub fn agent_response(events: &[ServerEvent]) -> String {
    let Some(last_stt) = events
        .iter()
        .rposition(|e| matches!(e, ServerEvent::SttOutput { .. }))
    else {
        return String::new();
    };

    events[last_stt + 1..]
        .iter()
        .filter_map(|e| match e {
            ServerEvent::AgentChunk { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
