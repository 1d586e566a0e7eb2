//! Gapless playback of base64 PCM payloads.
//!
//! Payloads are queued and drained strictly in arrival order. Each decoded
//! unit starts exactly where the previous one ends on the output clock; if
//! the clock has already passed that point the cursor snaps forward to "now".

use std::collections::{BTreeSet, VecDeque};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::device::{OutputBackend, OutputDevice, UnitId};
use crate::error::{DeviceError, PlaybackError};

/// Playback configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackConfig {
    /// ALSA playback device name
    pub device: String,
    /// Rate of incoming PCM and of the output clock
    pub sample_rate: u32,
    /// Hardware channel count; mono units are copied to every channel
    pub channels: u32,
    /// Desired ALSA period size in frames (0 = let ALSA decide)
    pub period_size: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            sample_rate: 24000,
            channels: 2,
            period_size: 480,
        }
    }
}

/// A decoded mono buffer of normalized samples.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackUnit {
    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Decode one base64 s16le payload into a unit at `sample_rate`.
pub fn decode_payload(payload: &str, sample_rate: u32) -> Result<PlaybackUnit, PlaybackError> {
    let bytes = B64.decode(payload)?;
    if bytes.is_empty() {
        return Err(PlaybackError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(PlaybackError::OddLength(bytes.len()));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|pair| pcm16_to_f32(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();
    Ok(PlaybackUnit {
        samples,
        sample_rate,
    })
}

pub struct PlaybackScheduler {
    sample_rate: u32,
    backend: Box<dyn OutputBackend>,
    device: Option<Box<dyn OutputDevice>>,
    ended_tx: mpsc::UnboundedSender<UnitId>,
    queue: VecDeque<String>,
    in_flight: BTreeSet<UnitId>,
    cursor: f64,
    next_id: UnitId,
    draining: bool,
}

impl PlaybackScheduler {
    /// `ended_tx` receives the id of every unit that plays to completion;
    /// feed those back through `on_unit_ended`.
    pub fn new(
        sample_rate: u32,
        backend: Box<dyn OutputBackend>,
        ended_tx: mpsc::UnboundedSender<UnitId>,
    ) -> Self {
        Self {
            sample_rate,
            backend,
            device: None,
            ended_tx,
            queue: VecDeque::new(),
            in_flight: BTreeSet::new(),
            cursor: 0.0,
            next_id: 0,
            draining: false,
        }
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn push(&mut self, payload: String) {
        self.queue.push_back(payload);
        self.drain();
    }

    fn drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;

        while let Some(payload) = self.queue.pop_front() {
            let unit = match decode_payload(&payload, self.sample_rate) {
                Ok(unit) => unit,
                Err(e) => {
                    log::warn!("Skipping undecodable playback payload: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.ensure_device() {
                log::error!("Playback device unavailable, dropping unit: {}", e);
                continue;
            }
            let Some(device) = self.device.as_mut() else {
                continue;
            };

            // Catch up if scheduling fell behind
            let now = device.current_time();
            if self.cursor < now {
                self.cursor = now;
            }

            let id = self.next_id;
            self.next_id += 1;
            let duration = unit.duration();
            match device.start_at(id, unit, self.cursor) {
                Ok(()) => {
                    self.in_flight.insert(id);
                    self.cursor += duration;
                }
                Err(e) => log::error!("Failed to schedule playback unit {}: {}", id, e),
            }
        }

        self.draining = false;
    }

    fn ensure_device(&mut self) -> Result<(), DeviceError> {
        if self.device.is_none() {
            self.device = Some(self.backend.open(self.ended_tx.clone())?);
        }
        Ok(())
    }

    pub fn on_unit_ended(&mut self, id: UnitId) {
        self.in_flight.remove(&id);
    }

    /// Halt everything now: queued payloads are discarded, in-flight units
    /// are cut off and the cursor returns to zero.
    pub fn stop(&mut self) {
        self.queue.clear();
        if let Some(device) = self.device.as_mut() {
            for id in &self.in_flight {
                if let Err(e) = device.halt(*id) {
                    log::debug!("Halt of unit {} ignored: {}", id, e);
                }
            }
        }
        self.in_flight.clear();
        self.cursor = 0.0;
    }

    /// Reset only the cursor; queued payloads are kept.
    pub fn reset_scheduling(&mut self) {
        self.cursor = 0.0;
    }

    /// Stop and close the output device. It is reopened on the next push.
    pub fn release(&mut self) {
        self.stop();
        self.device = None;
    }
}
