// Shared fakes for the session integration tests: an in-memory websocket
// connector plus scripted input and output devices.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Role;

use voice_link::audio::{
    InputDevice, OutputBackend, OutputDevice, PlaybackUnit, SampleSource, UnitId,
};
use voice_link::net_link::Connector;
use voice_link::{Config, DeviceError};

pub type ServerSocket = WebSocketStream<DuplexStream>;

/// Hands the server half of every successful connection to the test.
pub struct DuplexConnector {
    servers: mpsc::UnboundedSender<ServerSocket>,
    attempts: Arc<Mutex<Vec<Instant>>>,
    refuse: bool,
}

impl DuplexConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerSocket>, Arc<Mutex<Vec<Instant>>>) {
        let (servers, rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                servers,
                attempts: attempts.clone(),
                refuse: false,
            },
            rx,
            attempts,
        )
    }

    pub fn refusing() -> (Self, Arc<Mutex<Vec<Instant>>>) {
        let (mut connector, _rx, attempts) = Self::new();
        connector.refuse = true;
        (connector, attempts)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    type Io = DuplexStream;

    async fn connect(&self) -> Result<WebSocketStream<DuplexStream>> {
        self.attempts.lock().unwrap().push(Instant::now());
        if self.refuse {
            anyhow::bail!("connection refused");
        }
        let (client, server) = tokio::io::duplex(1 << 16);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        self.servers
            .send(server)
            .map_err(|_| anyhow::anyhow!("test harness dropped"))?;
        Ok(client)
    }
}

/// Microphone that plays back whatever blocks the test feeds it.
#[derive(Clone)]
pub struct ScriptedInput {
    rate: u32,
    fail: bool,
    unplugged: bool,
    feed: Arc<Mutex<VecDeque<Vec<f32>>>>,
    opens: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl ScriptedInput {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            fail: false,
            unplugged: false,
            feed: Arc::default(),
            opens: Arc::default(),
            releases: Arc::default(),
        }
    }

    pub fn denied() -> Self {
        Self {
            fail: true,
            ..Self::new(48000)
        }
    }

    /// Opens fine, then every read fails.
    pub fn unplugged() -> Self {
        Self {
            unplugged: true,
            ..Self::new(16000)
        }
    }

    /// Blocks fed but not yet read by a capture worker.
    pub fn queued(&self) -> usize {
        self.feed.lock().unwrap().len()
    }

    pub fn feed(&self, samples: Vec<f32>) {
        self.feed.lock().unwrap().push_back(samples);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl InputDevice for ScriptedInput {
    fn open(&self) -> Result<Box<dyn SampleSource>, DeviceError> {
        if self.fail {
            return Err(DeviceError::unavailable("scripted", "permission denied"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        // A freshly opened stream starts with no backlog.
        self.feed.lock().unwrap().clear();
        Ok(Box::new(ScriptedSource {
            input: self.clone(),
        }))
    }
}

struct ScriptedSource {
    input: ScriptedInput,
}

impl SampleSource for ScriptedSource {
    fn sample_rate(&self) -> u32 {
        self.input.rate
    }

    fn read(&mut self) -> Result<Vec<f32>> {
        if self.input.unplugged {
            anyhow::bail!("device unplugged");
        }
        let next = self.input.feed.lock().unwrap().pop_front();
        match next {
            Some(block) => Ok(block),
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(Vec::new())
            }
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.input.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Output device with a frozen clock that records what gets scheduled.
#[derive(Clone, Default)]
pub struct RecordingOutput {
    scheduled: Arc<Mutex<Vec<(UnitId, f64, f64)>>>,
    halted: Arc<Mutex<Vec<UnitId>>>,
}

impl RecordingOutput {
    pub fn scheduled(&self) -> Vec<(UnitId, f64, f64)> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn halted(&self) -> Vec<UnitId> {
        self.halted.lock().unwrap().clone()
    }
}

impl OutputDevice for RecordingOutput {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn start_at(&mut self, id: UnitId, unit: PlaybackUnit, when: f64) -> Result<(), DeviceError> {
        self.scheduled
            .lock()
            .unwrap()
            .push((id, when, unit.duration()));
        Ok(())
    }

    fn halt(&mut self, id: UnitId) -> Result<(), DeviceError> {
        self.halted.lock().unwrap().push(id);
        Ok(())
    }
}

impl OutputBackend for RecordingOutput {
    fn open(
        &self,
        _ended: mpsc::UnboundedSender<UnitId>,
    ) -> Result<Box<dyn OutputDevice>, DeviceError> {
        Ok(Box::new(self.clone()))
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.capture.preferred_rate = 16000;
    config
}
