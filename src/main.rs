use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;

use voice_link::audio::{AlsaInput, AlsaPlayback};
use voice_link::net_link::WsConnector;
use voice_link::{Config, ServerEvent, Session, SessionState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置，命令行第一个参数可覆盖服务器地址
    let mut config = Config::new().unwrap_or_default();
    if let Some(url) = std::env::args().nth(1) {
        config.ws_url = url;
    }

    let url = config.session_url();
    log::info!(
        "{} v{} starting, server: {}",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        url
    );

    let (session, task) = Session::spawn(
        &config,
        WsConnector::new(url),
        Arc::new(AlsaInput::new(config.capture.clone())),
        Box::new(AlsaPlayback::new(config.playback.clone())),
    );

    tokio::spawn(print_state(session.subscribe()));

    println!("Commands: r = toggle recording, c = clear events, q = quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                break;
            }

            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "r" => {
                        if session.snapshot().is_recording() {
                            session.stop_recording().await;
                        } else if let Err(e) = session.start_recording().await {
                            eprintln!("Cannot start recording: {}", e);
                        }
                    }
                    "c" => session.clear_events().await,
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command: {}", other),
                }
            }
        }
    }

    session.shutdown().await;
    task.await?;
    Ok(())
}

/// Print connection changes and every new event with the derived views.
async fn print_state(mut rx: watch::Receiver<SessionState>) {
    let mut printed = 0;
    let mut last_status = None;

    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update();

        let status = (state.connection, state.recording);
        if last_status != Some(status) {
            println!("== {:?} / {:?}", state.connection, state.recording);
            last_status = Some(status);
        }

        if state.events.len() < printed {
            println!("== events cleared");
            printed = 0;
        }
        if state.events.len() == printed {
            continue;
        }
        for event in &state.events[printed..] {
            println!("{}", describe(event));
        }
        printed = state.events.len();

        println!("   you:   \"{}\"", state.current_transcript());
        println!("   agent: \"{}\"", state.agent_response());
    }
}

fn describe(event: &ServerEvent) -> String {
    match event {
        ServerEvent::SttChunk { transcript, .. } => format!("[stt_chunk] \"{}\"", transcript),
        ServerEvent::SttOutput { transcript, .. } => format!("[stt_output] \"{}\"", transcript),
        ServerEvent::AgentChunk { text, .. } => format!("[agent_chunk] {}", text),
        ServerEvent::ToolCall { name, args, .. } => format!("[tool_call] {}({})", name, args),
        ServerEvent::ToolResult { name, result, .. } => {
            format!("[tool_result] {} -> {}", name, result)
        }
        ServerEvent::TtsChunk { audio, .. } => format!("[tts_chunk] {} base64 chars", audio.len()),
    }
}
