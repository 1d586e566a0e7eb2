//! Duplex voice-agent client.
//!
//! Streams microphone audio to a remote agent over a websocket and plays back
//! the synthesized speech it sends, gaplessly and in order.

pub mod audio;
pub mod config;
pub mod error;
pub mod net_link;
pub mod protocol;
pub mod session;
pub mod state;

pub use config::Config;
pub use error::{DeviceError, PlaybackError, SessionError};
pub use protocol::ServerEvent;
pub use session::{Session, SessionHandle};
pub use state::{ConnectionStatus, RecordingStatus, SessionState};
