use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::{CaptureConfig, PlaybackConfig};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    // 网络配置
    pub ws_url: String,
    pub reconnect_delay_ms: u64,

    // 音频配置
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            ws_url: env!("WS_URL").to_string(),
            reconnect_delay_ms: env!("RECONNECT_DELAY_MS")
                .parse()
                .map_err(|_| "Failed to parse RECONNECT_DELAY_MS")?,

            capture: CaptureConfig {
                device: env!("CAPTURE_DEVICE").to_string(),
                preferred_rate: env!("CAPTURE_PREFERRED_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse CAPTURE_PREFERRED_RATE")?,
                target_rate: env!("CAPTURE_TARGET_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse CAPTURE_TARGET_RATE")?,
                chunk_samples: env!("CAPTURE_CHUNK_SAMPLES")
                    .parse()
                    .map_err(|_| "Failed to parse CAPTURE_CHUNK_SAMPLES")?,
            },

            playback: PlaybackConfig {
                device: env!("PLAYBACK_DEVICE").to_string(),
                sample_rate: env!("PLAYBACK_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse PLAYBACK_SAMPLE_RATE")?,
                channels: env!("PLAYBACK_CHANNELS")
                    .parse()
                    .map_err(|_| "Failed to parse PLAYBACK_CHANNELS")?,
                period_size: env!("PLAYBACK_PERIOD_SIZE")
                    .parse()
                    .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
            },
        })
    }

    /// Endpoint the session connects to: `<ws_url>/ws`.
    pub fn session_url(&self) -> String {
        let base = self.ws_url.trim_end_matches('/');
        if base.ends_with("/ws") {
            base.to_string()
        } else {
            format!("{}/ws", base)
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8000".to_string(),
            reconnect_delay_ms: 2000,
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }
}
