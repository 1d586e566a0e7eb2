//! Connection session manager.
//!
//! One task owns the capture pipeline, the playback scheduler and the
//! observable `SessionState`. Transport events, capture chunks, capture
//! failures, finished playback units and control requests all reach it over
//! channels, so every mutation happens in a single place and in arrival order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::audio::{
    AudioChunk, Capture, CaptureFailed, InputDevice, OutputBackend, PlaybackScheduler, UnitId,
};
use crate::config::Config;
use crate::error::SessionError;
use crate::net_link::{Connector, NetCommand, NetEvent, NetLink};
use crate::protocol::ServerEvent;
use crate::state::{ConnectionStatus, RecordingStatus, SessionState};

enum Control {
    StartRecording(oneshot::Sender<Result<(), SessionError>>),
    StopRecording,
    ClearEvents,
    Shutdown(oneshot::Sender<()>),
}

/// Cheap handle to a running session. Dropping the last handle tears the
/// session down.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Control>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Start sending microphone audio. Rejected unless connected.
    pub async fn start_recording(&self) -> Result<(), SessionError> {
        if !self.state.borrow().is_connected() {
            return Err(SessionError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Control::StartRecording(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn stop_recording(&self) {
        let _ = self.tx.send(Control::StopRecording).await;
    }

    pub async fn clear_events(&self) {
        let _ = self.tx.send(Control::ClearEvents).await;
    }

    /// Cancel any pending reconnect, close the socket and release both audio
    /// pipelines. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Control::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }
}

pub struct Session;

impl Session {
    /// Spawn the transport and the session task. The first connection
    /// attempt starts immediately.
    pub fn spawn<C: Connector>(
        config: &Config,
        connector: C,
        input: Arc<dyn InputDevice>,
        output: Box<dyn OutputBackend>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (tx_net_event, rx_net_event) = mpsc::channel::<NetEvent>(100);
        let (tx_net_cmd, rx_net_cmd) = mpsc::unbounded_channel::<NetCommand>();
        let (tx_chunk, rx_chunk) = mpsc::unbounded_channel::<AudioChunk>();
        let (tx_ended, rx_ended) = mpsc::unbounded_channel::<UnitId>();
        let (tx_failed, rx_failed) = mpsc::unbounded_channel::<CaptureFailed>();
        let (tx_ctl, rx_ctl) = mpsc::channel::<Control>(16);
        let (state_tx, state_rx) = watch::channel(SessionState::default());

        let net_link = NetLink::new(connector, config.reconnect_delay(), tx_net_event, rx_net_cmd);
        let net_task = tokio::spawn(net_link.run());

        let actor = SessionActor {
            state: state_tx,
            net_tx: tx_net_cmd,
            chunk_tx: tx_chunk,
            rx_chunk,
            capture: Capture::new(config.capture.clone(), input, tx_failed),
            playback: PlaybackScheduler::new(config.playback.sample_rate, output, tx_ended),
            net_task,
        };
        let task = tokio::spawn(actor.run(rx_net_event, rx_failed, rx_ended, rx_ctl));

        (
            SessionHandle {
                tx: tx_ctl,
                state: state_rx,
            },
            task,
        )
    }
}

struct SessionActor {
    state: watch::Sender<SessionState>,
    net_tx: mpsc::UnboundedSender<NetCommand>,
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    rx_chunk: mpsc::UnboundedReceiver<AudioChunk>,
    capture: Capture,
    playback: PlaybackScheduler,
    net_task: JoinHandle<()>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut rx_net: mpsc::Receiver<NetEvent>,
        mut rx_failed: mpsc::UnboundedReceiver<CaptureFailed>,
        mut rx_ended: mpsc::UnboundedReceiver<UnitId>,
        mut rx_ctl: mpsc::Receiver<Control>,
    ) {
        loop {
            tokio::select! {
                // Control first so a shutdown is never starved by a busy stream.
                biased;

                ctl = rx_ctl.recv() => match ctl {
                    Some(Control::StartRecording(reply)) => {
                        let _ = reply.send(self.start_recording().await);
                    }
                    Some(Control::StopRecording) => self.stop_recording().await,
                    Some(Control::ClearEvents) => {
                        self.state.send_modify(|s| s.events.clear());
                    }
                    Some(Control::Shutdown(reply)) => {
                        self.teardown(&mut rx_net).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.teardown(&mut rx_net).await;
                        break;
                    }
                },

                Some(event) = rx_net.recv() => self.handle_net_event(event).await,

                Some(failed) = rx_failed.recv() => self.capture_failed(failed).await,

                Some(chunk) = self.rx_chunk.recv() => self.forward_chunk(chunk),

                Some(id) = rx_ended.recv() => self.playback.on_unit_ended(id),
            }
        }
        log::info!("Session closed");
    }

    async fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connecting => {
                self.state
                    .send_modify(|s| s.connection = ConnectionStatus::Connecting);
            }
            NetEvent::Connected => {
                log::info!("WebSocket Connected");
                self.state
                    .send_modify(|s| s.connection = ConnectionStatus::Connected);
            }
            NetEvent::Text(text) => self.process_server_text(&text),
            NetEvent::Disconnected => {
                log::info!("WebSocket Disconnected");
                self.halt_capture().await;
                self.playback.stop();
                self.state.send_modify(|s| {
                    s.connection = ConnectionStatus::Disconnected;
                    s.recording = RecordingStatus::Idle;
                });
            }
        }
    }

    fn process_server_text(&mut self, text: &str) {
        let event = match ServerEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Dropping malformed server event: {}", e);
                return;
            }
        };
        log::debug!("Server event: {} @ {}", event.kind(), event.ts());

        if let Some(audio) = event.audio() {
            self.playback.push(audio.to_string());
        }
        self.state.send_modify(|s| s.events.push(event));
    }

    fn forward_chunk(&mut self, chunk: AudioChunk) {
        if chunk.is_empty() {
            return;
        }
        let open = {
            let s = self.state.borrow();
            s.is_connected() && s.is_recording()
        };
        if !open {
            log::debug!("Dropping {} byte chunk, not streaming", chunk.len());
            return;
        }
        if let Err(e) = self.net_tx.send(NetCommand::SendBinary(chunk.into_bytes())) {
            log::warn!("Failed to send audio to NetLink: {}", e);
        }
    }

    async fn start_recording(&mut self) -> Result<(), SessionError> {
        if !self.state.borrow().is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.capture.start(self.chunk_tx.clone()).await?;
        self.state
            .send_modify(|s| s.recording = RecordingStatus::Capturing);
        Ok(())
    }

    async fn stop_recording(&mut self) {
        self.halt_capture().await;
        self.state.send_modify(|s| s.recording = RecordingStatus::Idle);
    }

    async fn capture_failed(&mut self, failed: CaptureFailed) {
        if !self.capture.is_current(failed.generation) {
            return;
        }
        log::error!("Microphone stopped delivering audio: {}", failed.reason);
        self.stop_recording().await;
    }

    /// Stop the worker and discard whatever it produced but was not sent yet.
    async fn halt_capture(&mut self) {
        self.capture.stop().await;
        let mut dropped = 0;
        while self.rx_chunk.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("Discarded {} unsent chunks", dropped);
        }
    }

    async fn teardown(&mut self, rx_net: &mut mpsc::Receiver<NetEvent>) {
        log::info!("Tearing down session");
        // NetLink must never block on a full event channel while we wait for it.
        rx_net.close();
        let _ = self.net_tx.send(NetCommand::Shutdown);
        if let Err(e) = (&mut self.net_task).await {
            log::error!("NetLink task failed: {}", e);
        }
        self.halt_capture().await;
        self.playback.release();
        self.state.send_modify(|s| {
            s.connection = ConnectionStatus::Disconnected;
            s.recording = RecordingStatus::Idle;
        });
    }
}
