use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RelayError, RelayResult};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_X264_PRESET: &str = "veryfast";
pub const DEFAULT_AUDIO_BITRATE: &str = "128k";
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_PROGRESS_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_STOP_GRACE_MS: u64 = 2_000;

/// Encoder knobs that do not come from the client.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub ffmpeg_bin: String,
    pub x264_preset: String,
    pub audio_bitrate: String,
    pub audio_sample_rate: u32,
    /// Wait between each escalation step when stopping the encoder
    /// (stdin closed -> SIGTERM -> SIGKILL).
    pub stop_grace: Duration,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        EncoderSettings {
            ffmpeg_bin: DEFAULT_FFMPEG_BIN.to_string(),
            x264_preset: DEFAULT_X264_PRESET.to_string(),
            audio_bitrate: DEFAULT_AUDIO_BITRATE.to_string(),
            audio_sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub bind_addr: SocketAddr,
    /// How long a freshly started stream may go without a progress line
    /// before the client is told it looks degraded.
    pub progress_timeout: Duration,
    pub encoder: EncoderSettings,
}

impl RelaySettings {
    /// Reads settings from the process environment. Call `dotenv()` first
    /// if a `.env` file should be honoured.
    pub fn from_env() -> RelayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> RelayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr: SocketAddr =
            parse_or(&lookup, "RELAY_BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?;
        let progress_secs = parse_or(
            &lookup,
            "RELAY_PROGRESS_TIMEOUT_SECS",
            Some(DEFAULT_PROGRESS_TIMEOUT_SECS),
        )?;
        let stop_grace_ms = parse_or(&lookup, "RELAY_STOP_GRACE_MS", Some(DEFAULT_STOP_GRACE_MS))?;
        let audio_sample_rate = parse_or(
            &lookup,
            "RELAY_AUDIO_SAMPLE_RATE",
            Some(DEFAULT_AUDIO_SAMPLE_RATE),
        )?;

        let encoder = EncoderSettings {
            ffmpeg_bin: non_empty_or(&lookup, "RELAY_FFMPEG_BIN", DEFAULT_FFMPEG_BIN),
            x264_preset: non_empty_or(&lookup, "RELAY_X264_PRESET", DEFAULT_X264_PRESET),
            audio_bitrate: non_empty_or(&lookup, "RELAY_AUDIO_BITRATE", DEFAULT_AUDIO_BITRATE),
            audio_sample_rate,
            stop_grace: Duration::from_millis(stop_grace_ms),
        };

        if progress_secs == 0 {
            return Err(RelayError::Settings(
                "RELAY_PROGRESS_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        Ok(RelaySettings {
            bind_addr,
            progress_timeout: Duration::from_secs(progress_secs),
            encoder,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: Option<T>) -> RelayResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| RelayError::Settings(format!("{} has an invalid value: {:?}", key, raw))),
        None => default.ok_or_else(|| RelayError::Settings(format!("{} is required", key))),
    }
}

fn non_empty_or<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}
