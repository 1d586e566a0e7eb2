//! Device seams for the capture and playback pipelines.
//!
//! The ALSA implementations live in `alsa_device`; tests drive the pipelines
//! through in-memory implementations of the same traits.

use anyhow::Result;
use tokio::sync::mpsc;

use super::playback::PlaybackUnit;
use crate::error::DeviceError;

/// Identifies one scheduled playback unit on an output device.
pub type UnitId = u64;

/// An opened microphone stream delivering mono samples at its native rate.
pub trait SampleSource: Send {
    /// Native sample rate negotiated with the hardware.
    fn sample_rate(&self) -> u32;

    /// Block until the next block of normalized `[-1, 1]` samples is ready.
    ///
    /// An empty block is allowed and simply means nothing arrived yet.
    fn read(&mut self) -> Result<Vec<f32>>;
}

/// Something that can hand out microphone streams.
pub trait InputDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn SampleSource>, DeviceError>;
}

/// An opened output stream with its own monotonically advancing clock.
pub trait OutputDevice: Send {
    /// Seconds of audio rendered since the device was opened.
    fn current_time(&self) -> f64;

    /// Start `unit` at absolute output-clock time `when`.
    fn start_at(&mut self, id: UnitId, unit: PlaybackUnit, when: f64) -> Result<(), DeviceError>;

    /// Halt a scheduled unit immediately. Fails if it already finished.
    fn halt(&mut self, id: UnitId) -> Result<(), DeviceError>;
}

/// Opens output devices. Finished units are reported on `ended`.
pub trait OutputBackend: Send {
    fn open(
        &self,
        ended: mpsc::UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputDevice>, DeviceError>;
}
