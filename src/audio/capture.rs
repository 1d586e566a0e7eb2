//! Microphone capture: decimate native-rate samples to 16 kHz and cut them
//! into fixed-size little-endian PCM chunks.
//!
//! Sample conversion runs on a dedicated OS thread (`audio-record`) so the
//! async runtime never stalls the device; the thread only ever posts whole
//! `AudioChunk`s back through a channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::device::{InputDevice, SampleSource};
use crate::error::DeviceError;

/// Capture configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub device: String,
    /// Rate requested from the hardware; the negotiated rate is what counts
    pub preferred_rate: u32,
    /// Rate of the emitted chunks
    pub target_rate: u32,
    /// Samples per emitted chunk
    pub chunk_samples: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            preferred_rate: 48000,
            target_rate: 16000,
            chunk_samples: 1600,
        }
    }
}

/// One block of 16-bit little-endian mono PCM, ready to go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk(Bytes);

impl AudioChunk {
    pub fn from_samples(samples: &[i16]) -> Self {
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for &s in samples {
            buf.put_i16_le(s);
        }
        Self(buf.freeze())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.0.len() / 2
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.0
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

/// Clamp to `[-1, 1]` and scale asymmetrically onto the i16 range.
pub fn to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Decimating chunker. No anti-alias filter: content above the target
/// Nyquist frequency folds back.
#[derive(Debug)]
pub struct ChunkEncoder {
    ratio: f64,
    phase: f64,
    chunk_samples: usize,
    pending: VecDeque<i16>,
}

impl ChunkEncoder {
    pub fn new(native_rate: u32, target_rate: u32, chunk_samples: usize) -> Self {
        Self {
            ratio: native_rate as f64 / target_rate as f64,
            phase: 0.0,
            chunk_samples,
            pending: VecDeque::with_capacity(chunk_samples * 2),
        }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Converted samples not yet emitted.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed native-rate samples, returning every chunk that became complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioChunk> {
        for &sample in samples {
            self.phase += 1.0;
            if self.phase >= self.ratio {
                self.phase -= self.ratio;
                self.pending.push_back(to_pcm16(sample));
            }
        }

        let mut chunks = Vec::new();
        while self.pending.len() >= self.chunk_samples {
            let frame = self.take_first(self.chunk_samples);
            chunks.push(AudioChunk::from_samples(&frame));
        }
        chunks
    }

    /// Remove and return the oldest `n` converted samples.
    fn take_first(&mut self, n: usize) -> Vec<i16> {
        self.pending.drain(..n).collect()
    }
}

/// Posted by a worker that exited because its device stopped delivering.
#[derive(Debug)]
pub struct CaptureFailed {
    pub generation: u64,
    pub reason: String,
}

struct CaptureWorker {
    generation: u64,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the microphone while recording. The device is opened on `start` and
/// released when the worker thread exits.
pub struct Capture {
    config: CaptureConfig,
    device: Arc<dyn InputDevice>,
    failed_tx: mpsc::UnboundedSender<CaptureFailed>,
    generation: u64,
    worker: Option<CaptureWorker>,
}

impl Capture {
    /// A worker whose device fails reports it on `failed_tx` before exiting.
    pub fn new(
        config: CaptureConfig,
        device: Arc<dyn InputDevice>,
        failed_tx: mpsc::UnboundedSender<CaptureFailed>,
    ) -> Self {
        Self {
            config,
            device,
            failed_tx,
            generation: 0,
            worker: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.worker
            .as_ref()
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Whether `generation` names the worker currently held.
    pub fn is_current(&self, generation: u64) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.generation == generation)
    }

    /// Open the device and start posting chunks to `chunk_tx`.
    ///
    /// A no-op while a live worker exists. Nothing is left behind when the
    /// device cannot be opened.
    pub async fn start(
        &mut self,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    ) -> Result<(), DeviceError> {
        if self.is_active() {
            log::debug!("Capture already running");
            return Ok(());
        }
        // Worker died on its own (device error); reap it before reopening.
        self.stop().await;

        // Opening an ALSA PCM blocks; keep it off the runtime threads.
        let device = self.device.clone();
        let source = tokio::task::spawn_blocking(move || device.open())
            .await
            .map_err(|e| DeviceError::Worker(std::io::Error::other(e)))??;
        let native_rate = source.sample_rate();
        let encoder = ChunkEncoder::new(native_rate, self.config.target_rate, self.config.chunk_samples);

        log::info!(
            "Capture starting: device=\"{}\", native={}Hz, target={}Hz, ratio={:.4}, chunk={}",
            self.config.device,
            native_rate,
            self.config.target_rate,
            encoder.ratio(),
            self.config.chunk_samples,
        );

        self.generation += 1;
        let generation = self.generation;
        let running = Arc::new(AtomicBool::new(true));
        let handle = {
            let running = running.clone();
            let failed_tx = self.failed_tx.clone();
            thread::Builder::new()
                .name("audio-record".into())
                .spawn(move || {
                    if let Err(e) = record_thread(source, encoder, chunk_tx, &running) {
                        log::error!("Capture read error: {:#}", e);
                        let _ = failed_tx.send(CaptureFailed {
                            generation,
                            reason: format!("{:#}", e),
                        });
                    }
                })?
        };

        self.worker = Some(CaptureWorker {
            generation,
            running,
            handle,
        });
        Ok(())
    }

    /// Signal the worker to stop and wait for it to release the device.
    pub async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::SeqCst);
            // The worker may be parked in a blocking read for up to a period.
            match tokio::task::spawn_blocking(move || worker.handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => log::error!("Recording thread panicked"),
                Err(e) => log::error!("Failed to join recording thread: {}", e),
            }
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        // The thread notices the flag and exits on its own.
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::SeqCst);
        }
    }
}

fn record_thread(
    mut source: Box<dyn SampleSource>,
    mut encoder: ChunkEncoder,
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    while running.load(Ordering::Relaxed) {
        let samples = source.read()?;
        for chunk in encoder.push(&samples) {
            if chunk_tx.send(chunk).is_err() {
                log::warn!("Failed to post audio chunk, receiver dropped");
                return Ok(());
            }
        }
    }
    log::info!("Recording stopped");
    Ok(())
}
