//! Error types surfaced at the crate's public seams.
//!
//! Transport failures never appear here: `NetLink` absorbs them and turns them
//! into `NetEvent::Disconnected` plus a scheduled reconnect.

use thiserror::Error;

/// Audio device could not be acquired or driven.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("audio device '{device}' unavailable: {reason}")]
    Unavailable { device: String, reason: String },

    #[error("audio device worker failed to start: {0}")]
    Worker(#[from] std::io::Error),

    #[error("playback unit {0} is not scheduled")]
    NotScheduled(u64),

    #[error("audio device closed")]
    Closed,
}

impl DeviceError {
    pub fn unavailable(device: &str, reason: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failures returned by `SessionHandle` operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket not connected")]
    NotConnected,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("session has been torn down")]
    Closed,
}

/// A single playback payload could not be turned into audio.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("pcm payload has odd length {0}")]
    OddLength(usize),

    #[error("pcm payload is empty")]
    Empty,
}
