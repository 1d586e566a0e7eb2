// Integration tests for the connection session manager.
//
// Each test runs a real session against an in-memory websocket pair, so the
// transport, the session task and both audio pipelines are exercised together.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;

use common::{DuplexConnector, RecordingOutput, ScriptedInput, ServerSocket, test_config};
use voice_link::{
    ConnectionStatus, RecordingStatus, ServerEvent, Session, SessionError, SessionHandle,
    SessionState,
};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_until(session: &SessionHandle, pred: impl FnMut(&SessionState) -> bool) {
    let mut rx = session.subscribe();
    timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for session state")
        .expect("session state channel closed");
}

async fn send_text(server: &mut ServerSocket, text: &str) -> Result<()> {
    server.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn next_binary(server: &mut ServerSocket) -> Vec<u8> {
    loop {
        let msg = timeout(WAIT, server.next())
            .await
            .expect("timed out waiting for audio")
            .expect("socket ended")
            .expect("socket error");
        if let Message::Binary(data) = msg {
            return data.to_vec();
        }
    }
}

#[tokio::test]
async fn recording_is_rejected_while_disconnected() -> Result<()> {
    let (connector, _attempts) = DuplexConnector::refusing();
    let input = ScriptedInput::new(16000);
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(input.clone()),
        Box::new(RecordingOutput::default()),
    );

    let err = session.start_recording().await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
    assert_eq!(input.opens(), 0);
    assert_eq!(session.snapshot().recording, RecordingStatus::Idle);

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn matching_rate_audio_goes_out_as_two_ordered_chunks() -> Result<()> {
    let (connector, mut servers, _attempts) = DuplexConnector::new();
    let input = ScriptedInput::new(16000);
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(input.clone()),
        Box::new(RecordingOutput::default()),
    );

    let mut server = servers.recv().await.expect("no connection");
    wait_until(&session, |s| s.connection == ConnectionStatus::Connected).await;

    session.start_recording().await?;
    assert_eq!(session.snapshot().recording, RecordingStatus::Capturing);

    // First chunk is all -0.5, second all +0.5.
    let mut samples = vec![-0.5f32; 1600];
    samples.extend(vec![0.5f32; 1600]);
    input.feed(samples);

    let first = next_binary(&mut server).await;
    let second = next_binary(&mut server).await;
    assert_eq!(first.len(), 3200);
    assert_eq!(second.len(), 3200);
    assert_eq!(i16::from_le_bytes([first[0], first[1]]), -16384);
    assert_eq!(i16::from_le_bytes([second[0], second[1]]), 16383);

    session.stop_recording().await;
    wait_until(&session, |s| s.recording == RecordingStatus::Idle).await;
    assert_eq!(input.releases(), 1);

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn starting_twice_reuses_the_open_device() -> Result<()> {
    let (connector, mut servers, _attempts) = DuplexConnector::new();
    let input = ScriptedInput::new(48000);
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(input.clone()),
        Box::new(RecordingOutput::default()),
    );

    let _server = servers.recv().await.expect("no connection");
    wait_until(&session, |s| s.is_connected()).await;

    session.start_recording().await?;
    session.start_recording().await?;
    assert_eq!(input.opens(), 1);

    session.stop_recording().await;
    session.stop_recording().await;
    wait_until(&session, |s| !s.is_recording()).await;
    assert_eq!(input.releases(), 1);

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn denied_microphone_surfaces_to_caller() -> Result<()> {
    let (connector, mut servers, _attempts) = DuplexConnector::new();
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(ScriptedInput::denied()),
        Box::new(RecordingOutput::default()),
    );

    let _server = servers.recv().await.expect("no connection");
    wait_until(&session, |s| s.is_connected()).await;

    let err = session.start_recording().await.unwrap_err();
    assert!(matches!(err, SessionError::Device(_)));
    assert_eq!(session.snapshot().recording, RecordingStatus::Idle);

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn microphone_failure_mid_recording_returns_to_idle() -> Result<()> {
    let (connector, mut servers, _attempts) = DuplexConnector::new();
    let input = ScriptedInput::unplugged();
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(input.clone()),
        Box::new(RecordingOutput::default()),
    );

    let _server = servers.recv().await.expect("no connection");
    wait_until(&session, |s| s.is_connected()).await;

    session.start_recording().await?;
    wait_until(&session, |s| s.recording == RecordingStatus::Idle).await;
    assert!(session.snapshot().is_connected());
    assert_eq!(input.releases(), 1);

    // The microphone can be tried again.
    session.start_recording().await?;
    assert_eq!(input.opens(), 2);

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn audio_captured_around_a_drop_never_reaches_the_next_connection() -> Result<()> {
    let (connector, mut servers, _attempts) = DuplexConnector::new();
    let input = ScriptedInput::new(16000);
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(input.clone()),
        Box::new(RecordingOutput::default()),
    );

    let mut server = servers.recv().await.expect("no connection");
    wait_until(&session, |s| s.is_connected()).await;
    session.start_recording().await?;

    server.close(None).await?;
    drop(server);
    input.feed(vec![0.75; 3200]);

    wait_until(&session, |s| !s.is_connected()).await;
    let mut server = timeout(WAIT, servers.recv())
        .await?
        .expect("no reconnect");
    wait_until(&session, |s| s.is_connected()).await;

    let stale = timeout(Duration::from_millis(300), server.next()).await;
    assert!(stale.is_err(), "unexpected frame {:?}", stale);

    session.start_recording().await?;
    input.feed(vec![-0.25; 1600]);
    let first = next_binary(&mut server).await;
    assert_eq!(i16::from_le_bytes([first[0], first[1]]), -8192);

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn chunks_left_over_from_a_stopped_take_are_discarded() -> Result<()> {
    let (connector, mut servers, _attempts) = DuplexConnector::new();
    let input = ScriptedInput::new(16000);
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(input.clone()),
        Box::new(RecordingOutput::default()),
    );

    let mut server = servers.recv().await.expect("no connection");
    wait_until(&session, |s| s.is_connected()).await;
    session.start_recording().await?;

    // Block the runtime so the worker posts a chunk the session task has not
    // seen yet when the stop arrives.
    input.feed(vec![0.75; 1600]);
    while input.queued() > 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(20));

    session.stop_recording().await;
    session.start_recording().await?;
    input.feed(vec![-0.25; 1600]);

    let first = next_binary(&mut server).await;
    assert_eq!(i16::from_le_bytes([first[0], first[1]]), -8192);

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn malformed_frame_between_valid_events_is_dropped() -> Result<()> {
    let (connector, mut servers, _attempts) = DuplexConnector::new();
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(ScriptedInput::new(16000)),
        Box::new(RecordingOutput::default()),
    );

    let mut server = servers.recv().await.expect("no connection");
    send_text(&mut server, r#"{"type":"stt_chunk","transcript":"he","ts":1}"#).await?;
    send_text(&mut server, r#"{"type":"stt_chunk","transcript":oops"#).await?;
    send_text(&mut server, r#"{"type":"stt_output","transcript":"hello","ts":2}"#).await?;

    wait_until(&session, |s| s.events.len() == 2).await;
    let events = session.snapshot().events;
    assert_eq!(events[0].kind(), "stt_chunk");
    assert_eq!(events[1].kind(), "stt_output");
    assert!(session.snapshot().is_connected());

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn facade_views_follow_the_event_stream() -> Result<()> {
    let (connector, mut servers, _attempts) = DuplexConnector::new();
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(ScriptedInput::new(16000)),
        Box::new(RecordingOutput::default()),
    );

    let mut server = servers.recv().await.expect("no connection");
    send_text(&mut server, r#"{"type":"stt_output","transcript":"hello","ts":1}"#).await?;
    send_text(&mut server, r#"{"type":"agent_chunk","text":"Hi","ts":2}"#).await?;
    send_text(&mut server, r#"{"type":"agent_chunk","text":" there","ts":3}"#).await?;

    wait_until(&session, |s| s.events.len() == 3).await;
    assert_eq!(session.snapshot().agent_response(), "Hi there");
    assert_eq!(session.snapshot().current_transcript(), "hello");

    send_text(&mut server, r#"{"type":"stt_output","transcript":"bye","ts":4}"#).await?;
    wait_until(&session, |s| s.events.len() == 4).await;
    assert_eq!(session.snapshot().agent_response(), "");
    assert_eq!(session.snapshot().current_transcript(), "bye");

    session.clear_events().await;
    wait_until(&session, |s| s.events.is_empty()).await;
    assert_eq!(session.snapshot().current_transcript(), "");

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test]
async fn tts_chunks_are_scheduled_back_to_back() -> Result<()> {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;

    let (connector, mut servers, _attempts) = DuplexConnector::new();
    let output = RecordingOutput::default();
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(ScriptedInput::new(16000)),
        Box::new(output.clone()),
    );

    let mut server = servers.recv().await.expect("no connection");
    // 100 ms and 50 ms of silence at 24 kHz.
    for samples in [2400usize, 1200] {
        let event = ServerEvent::TtsChunk {
            audio: B64.encode(vec![0u8; samples * 2]),
            ts: 0.0,
        };
        send_text(&mut server, &serde_json::to_string(&event)?).await?;
    }

    wait_until(&session, |s| s.events.len() == 2).await;
    let scheduled = output.scheduled();
    assert_eq!(scheduled.len(), 2);
    assert_eq!(scheduled[0].1, 0.0);
    assert!((scheduled[1].1 - 0.1).abs() < 1e-9);
    assert!((scheduled[1].2 - 0.05).abs() < 1e-9);

    session.shutdown().await;
    task.await?;
    assert_eq!(output.halted(), vec![0, 1]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_forces_idle_and_reconnects_after_two_seconds() -> Result<()> {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;

    let (connector, mut servers, attempts) = DuplexConnector::new();
    let input = ScriptedInput::new(16000);
    let output = RecordingOutput::default();
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(input.clone()),
        Box::new(output.clone()),
    );

    let mut server = servers.recv().await.expect("no connection");
    wait_until(&session, |s| s.is_connected()).await;
    session.start_recording().await?;

    let event = ServerEvent::TtsChunk {
        audio: B64.encode(vec![0u8; 480]),
        ts: 0.0,
    };
    send_text(&mut server, &serde_json::to_string(&event)?).await?;
    wait_until(&session, |s| s.events.len() == 1).await;

    server.close(None).await?;
    drop(server);
    let closed_at = Instant::now();

    wait_until(&session, |s| s.connection != ConnectionStatus::Connected).await;
    let state = session.snapshot();
    assert_eq!(state.recording, RecordingStatus::Idle);
    assert_eq!(input.releases(), 1);
    assert_eq!(output.halted(), vec![0]);
    // The log survives a reconnect.
    assert_eq!(state.events.len(), 1);

    let _server = servers.recv().await.expect("no reconnect");
    let retry_at = attempts.lock().unwrap()[1];
    let waited = retry_at - closed_at;
    assert!(waited >= Duration::from_millis(2000), "retried after {:?}", waited);
    assert!(waited < Duration::from_millis(2100), "retried after {:?}", waited);

    wait_until(&session, |s| s.is_connected()).await;
    assert!(!session.snapshot().is_recording());

    session.shutdown().await;
    task.await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_pending_reconnect_and_is_repeatable() -> Result<()> {
    let (connector, attempts) = DuplexConnector::refusing();
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(ScriptedInput::new(16000)),
        Box::new(RecordingOutput::default()),
    );

    // First attempt fails immediately; a retry is now pending.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(attempts.lock().unwrap().len(), 1);

    session.shutdown().await;
    session.shutdown().await;
    task.await?;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(attempts.lock().unwrap().len(), 1);
    assert_eq!(session.snapshot().connection, ConnectionStatus::Disconnected);
    assert!(matches!(
        session.start_recording().await,
        Err(SessionError::NotConnected)
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn refused_connections_retry_on_a_fixed_interval() -> Result<()> {
    let (connector, attempts) = DuplexConnector::refusing();
    let (session, task) = Session::spawn(
        &test_config(),
        connector,
        Arc::new(ScriptedInput::new(16000)),
        Box::new(RecordingOutput::default()),
    );

    tokio::time::sleep(Duration::from_millis(6500)).await;
    let times = attempts.lock().unwrap().clone();
    assert_eq!(times.len(), 4);
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_millis(2000), "gap {:?}", gap);
        assert!(gap < Duration::from_millis(2010), "gap {:?}", gap);
    }

    session.shutdown().await;
    task.await?;
    Ok(())
}
