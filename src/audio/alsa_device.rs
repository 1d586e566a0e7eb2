//! ALSA PCM device wrappers for audio capture and playback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};
use tokio::sync::mpsc;

use super::capture::CaptureConfig;
use super::device::{InputDevice, OutputBackend, OutputDevice, SampleSource, UnitId};
use super::playback::{PlaybackConfig, PlaybackUnit};
use crate::error::DeviceError;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample_width)
    pub period_size: usize,
}

/// Open a PCM device for capture (recording).
pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, None, "Capture")
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(
        device,
        Direction::Playback,
        sample_rate,
        channels,
        period_size,
        "Playback",
    )
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let (actual_rate, actual_channels, period_size) = {
        let hwp = pcm.hw_params_current()?;
        let rate = hwp.get_rate()?;
        let ch = hwp.get_channels()?;
        let ps = hwp.get_period_size()? as usize;
        (rate, ch, ps)
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        actual_rate,
        actual_channels,
        period_size,
    );

    Ok((
        pcm,
        AlsaParams {
            sample_rate: actual_rate,
            channels: actual_channels,
            period_size,
        },
    ))
}

// ======================== Capture ========================

/// Microphone backed by an ALSA capture PCM.
pub struct AlsaInput {
    config: CaptureConfig,
}

impl AlsaInput {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl InputDevice for AlsaInput {
    fn open(&self) -> Result<Box<dyn SampleSource>, DeviceError> {
        let (pcm, params) = open_capture(&self.config.device, self.config.preferred_rate, 1)
            .map_err(|e| DeviceError::unavailable(&self.config.device, format!("{:#}", e)))?;
        let buf = vec![0i16; params.period_size * params.channels as usize];
        Ok(Box::new(AlsaSource { pcm, params, buf }))
    }
}

struct AlsaSource {
    pcm: PCM,
    params: AlsaParams,
    buf: Vec<i16>,
}

impl SampleSource for AlsaSource {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn read(&mut self) -> Result<Vec<f32>> {
        let io = self.pcm.io_i16()?;
        match io.readi(&mut self.buf) {
            Ok(frames) => {
                // Only the first channel is used.
                let channels = self.params.channels as usize;
                Ok(self.buf[..frames * channels]
                    .chunks_exact(channels)
                    .map(|frame| frame[0] as f32 / 32768.0)
                    .collect())
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                self.pcm
                    .prepare()
                    .context("Failed to recover PCM capture")?;
                Ok(Vec::new())
            }
        }
    }
}

// ======================== Playback ========================

/// Opens the ALSA render thread on demand.
pub struct AlsaPlayback {
    config: PlaybackConfig,
}

impl AlsaPlayback {
    pub fn new(config: PlaybackConfig) -> Self {
        Self { config }
    }
}

enum RenderCommand {
    Schedule {
        id: UnitId,
        start_frame: u64,
        samples: Vec<f32>,
    },
    Halt(UnitId),
}

struct ScheduledUnit {
    id: UnitId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl ScheduledUnit {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled units into consecutive periods.
///
/// `position` is the first frame not yet mixed. It is what the output clock
/// reports, so a unit scheduled "now" always lands in the next period whole.
struct Mixer {
    units: Vec<ScheduledUnit>,
    position: u64,
}

impl Mixer {
    fn new() -> Self {
        Self {
            units: Vec::new(),
            position: 0,
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn apply(&mut self, cmd: RenderCommand) {
        match cmd {
            RenderCommand::Schedule {
                id,
                start_frame,
                samples,
            } => {
                if start_frame < self.position {
                    log::warn!(
                        "Unit {} scheduled {} frames in the past",
                        id,
                        self.position - start_frame
                    );
                }
                self.units.push(ScheduledUnit {
                    id,
                    start_frame,
                    samples,
                });
            }
            RenderCommand::Halt(id) => self.units.retain(|u| u.id != id),
        }
    }

    /// Mix the next `mono.len()` frames and return the units that finished
    /// inside them.
    fn mix_next(&mut self, mono: &mut [f32]) -> Vec<UnitId> {
        let base = self.position;
        let period_end = base + mono.len() as u64;
        mono.fill(0.0);
        for unit in &self.units {
            let from = unit.start_frame.max(base);
            let to = unit.end_frame().min(period_end);
            for frame in from..to {
                mono[(frame - base) as usize] += unit.samples[(frame - unit.start_frame) as usize];
            }
        }
        self.position = period_end;

        let mut finished = Vec::new();
        self.units.retain(|u| {
            if u.end_frame() <= period_end {
                finished.push(u.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Output stream whose clock is the number of frames the render thread has
/// mixed so far.
pub struct AlsaOutput {
    sample_rate: u32,
    mixed_frames: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    cmd_tx: std_mpsc::Sender<RenderCommand>,
    handle: Option<JoinHandle<()>>,
}

impl OutputBackend for AlsaPlayback {
    fn open(
        &self,
        ended: mpsc::UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputDevice>, DeviceError> {
        let running = Arc::new(AtomicBool::new(true));
        let mixed_frames = Arc::new(AtomicU64::new(0));
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<AlsaParams, String>>(1);

        let handle = {
            let config = self.config.clone();
            let running = running.clone();
            let mixed_frames = mixed_frames.clone();
            thread::Builder::new()
                .name("audio-play".into())
                .spawn(move || {
                    let period = (config.period_size > 0).then_some(config.period_size);
                    let (pcm, params) = match open_playback(
                        &config.device,
                        config.sample_rate,
                        config.channels,
                        period,
                    ) {
                        Ok(opened) => opened,
                        Err(e) => {
                            let _ = ready_tx.send(Err(format!("{:#}", e)));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(params.clone()));
                    if let Err(e) =
                        render_thread(&pcm, &params, cmd_rx, ended, &mixed_frames, &running)
                    {
                        log::error!("Playback thread error: {}", e);
                    }
                })?
        };

        let params = match ready_rx.recv() {
            Ok(Ok(params)) => params,
            Ok(Err(reason)) => {
                let _ = handle.join();
                return Err(DeviceError::unavailable(&self.config.device, reason));
            }
            Err(_) => return Err(DeviceError::Closed),
        };

        if params.sample_rate != self.config.sample_rate {
            log::warn!(
                "Playback negotiated {}Hz instead of {}Hz, audio will be off-pitch",
                params.sample_rate,
                self.config.sample_rate
            );
        }

        Ok(Box::new(AlsaOutput {
            sample_rate: params.sample_rate,
            mixed_frames,
            running,
            cmd_tx,
            handle: Some(handle),
        }))
    }
}

impl OutputDevice for AlsaOutput {
    fn current_time(&self) -> f64 {
        self.mixed_frames.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn start_at(&mut self, id: UnitId, unit: PlaybackUnit, when: f64) -> Result<(), DeviceError> {
        let start_frame = (when * self.sample_rate as f64).round() as u64;
        self.cmd_tx
            .send(RenderCommand::Schedule {
                id,
                start_frame,
                samples: unit.samples,
            })
            .map_err(|_| DeviceError::Closed)
    }

    fn halt(&mut self, id: UnitId) -> Result<(), DeviceError> {
        self.cmd_tx
            .send(RenderCommand::Halt(id))
            .map_err(|_| DeviceError::Closed)
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn render_thread(
    pcm: &PCM,
    params: &AlsaParams,
    cmd_rx: std_mpsc::Receiver<RenderCommand>,
    ended: mpsc::UnboundedSender<UnitId>,
    mixed_frames: &AtomicU64,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let channels = params.channels as usize;
    let period = params.period_size.max(1);
    let mut mixer = Mixer::new();
    let mut mono = vec![0f32; period];
    let mut out = vec![0i16; period * channels];

    log::info!(
        "Playback started: rate={}, ch={}, period={}",
        params.sample_rate,
        channels,
        period,
    );

    while running.load(Ordering::Relaxed) {
        loop {
            match cmd_rx.try_recv() {
                Ok(cmd) => mixer.apply(cmd),
                Err(std_mpsc::TryRecvError::Empty) => break,
                Err(std_mpsc::TryRecvError::Disconnected) => {
                    log::info!("Playback channel closed");
                    return Ok(());
                }
            }
        }

        let finished = mixer.mix_next(&mut mono);
        // Publish before the blocking write so the clock never lags the mix.
        mixed_frames.store(mixer.position(), Ordering::Release);

        for (i, s) in mono.iter().enumerate() {
            let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
            out[i * channels..(i + 1) * channels].fill(v);
        }

        // Write with retry to handle short writes and XRUN recovery.
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&out[frames_written * channels..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare().context("Failed to recover PCM playback")?;
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }

        for id in finished {
            let _ = ended.send(id);
        }
    }

    log::info!("Playback stopped");
    Ok(())
}
