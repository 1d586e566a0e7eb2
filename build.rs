use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    capture: Capture,
    playback: Playback,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    ws_url: String,
    reconnect_delay_ms: u64,
}

#[derive(Deserialize)]
struct Capture {
    device: String,
    preferred_rate: u32,
    target_rate: u32,
    chunk_samples: usize,
}

#[derive(Deserialize)]
struct Playback {
    device: String,
    sample_rate: u32,
    channels: u32,
    period_size: usize,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!(
        "cargo:rustc-env=RECONNECT_DELAY_MS={}",
        config.network.reconnect_delay_ms
    );

    // 采集配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.capture.device);
    println!(
        "cargo:rustc-env=CAPTURE_PREFERRED_RATE={}",
        config.capture.preferred_rate
    );
    println!("cargo:rustc-env=CAPTURE_TARGET_RATE={}", config.capture.target_rate);
    println!(
        "cargo:rustc-env=CAPTURE_CHUNK_SAMPLES={}",
        config.capture.chunk_samples
    );

    // 播放配置
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.playback.device);
    println!(
        "cargo:rustc-env=PLAYBACK_SAMPLE_RATE={}",
        config.playback.sample_rate
    );
    println!("cargo:rustc-env=PLAYBACK_CHANNELS={}", config.playback.channels);
    println!(
        "cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}",
        config.playback.period_size
    );
}
