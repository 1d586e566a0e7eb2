//! audio - Microphone capture and gapless playback
//!
//! Capture decimates native-rate microphone input to 16 kHz PCM chunks.
//! Playback schedules 24 kHz PCM units back-to-back on an output clock.
//! Uses ALSA for audio I/O; both pipelines sit behind the traits in `device`.

pub mod alsa_device;
mod capture;
pub mod device;
mod playback;

pub use alsa_device::{AlsaInput, AlsaPlayback};
pub use capture::{AudioChunk, Capture, CaptureConfig, CaptureFailed, ChunkEncoder, to_pcm16};
pub use device::{InputDevice, OutputBackend, OutputDevice, SampleSource, UnitId};
pub use playback::{PlaybackConfig, PlaybackScheduler, PlaybackUnit, decode_payload, pcm16_to_f32};
