use std::fmt;

use serde::Deserialize;
use serde_json::Number;

use crate::error::{RelayError, RelayResult};

/// Supported ingest platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Youtube,
    Twitch,
    Facebook,
    Custom,
}

impl Platform {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "youtube" => Some(Platform::Youtube),
            "twitch" => Some(Platform::Twitch),
            "facebook" => Some(Platform::Facebook),
            "custom" => Some(Platform::Custom),
            _ => None,
        }
    }

    /// Vendor ingest base, `None` for custom destinations.
    pub fn default_rtmp_base(&self) -> Option<&'static str> {
        match self {
            Platform::Youtube => Some("rtmp://a.rtmp.youtube.com/live2"),
            Platform::Twitch => Some("rtmp://live.twitch.tv/app"),
            Platform::Facebook => Some("rtmps://live-api-s.facebook.com:443/rtmp"),
            Platform::Custom => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Youtube => "youtube",
            Platform::Twitch => "twitch",
            Platform::Facebook => "facebook",
            Platform::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Stream key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamKey(***)")
    }
}

/// A validated configuration, immutable once accepted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub platform: Platform,
    pub rtmp_base_url: String,
    pub stream_key: StreamKey,
    pub target_fps: u32,
    pub target_bitrate_kbps: u32,
}

impl StreamConfig {
    /// Base and key joined by exactly one `/`.
    pub fn destination_url(&self) -> String {
        format!(
            "{}/{}",
            self.rtmp_base_url.trim_end_matches('/'),
            self.stream_key.expose().trim_start_matches('/')
        )
    }

    /// Destination with the key masked, safe for logs.
    pub fn redacted_destination(&self) -> String {
        format!("{}/***", self.rtmp_base_url.trim_end_matches('/'))
    }
}

/// The `config` control message as it arrives on the wire. Every field is
/// optional here so that missing fields turn into validation errors rather
/// than opaque deserialization failures.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    pub platform: Option<String>,
    pub rtmp_url: Option<String>,
    pub stream_key: Option<String>,
    pub fps: Option<Number>,
    pub bitrate: Option<Number>,
}

impl ConfigRequest {
    pub fn validate(self) -> RelayResult<StreamConfig> {
        let platform_raw = required_string(self.platform, "platform")?;
        let platform = Platform::parse(&platform_raw).ok_or_else(|| {
            RelayError::InvalidConfig(format!("unsupported platform {:?}", platform_raw))
        })?;

        let rtmp_base_url = match self.rtmp_url.map(|u| u.trim().to_string()) {
            Some(url) if !url.is_empty() => url,
            _ => platform
                .default_rtmp_base()
                .map(str::to_string)
                .ok_or_else(|| {
                    RelayError::InvalidConfig("rtmpUrl is required for custom platform".to_string())
                })?,
        };
        if !(rtmp_base_url.starts_with("rtmp://") || rtmp_base_url.starts_with("rtmps://")) {
            return Err(RelayError::InvalidConfig(
                "rtmpUrl must start with rtmp:// or rtmps://".to_string(),
            ));
        }

        let stream_key = required_string(self.stream_key, "streamKey")?;
        let target_fps = positive_integer(self.fps, "fps")?;
        let target_bitrate_kbps = positive_integer(self.bitrate, "bitrate")?;

        Ok(StreamConfig {
            platform,
            rtmp_base_url,
            stream_key: StreamKey(stream_key),
            target_fps,
            target_bitrate_kbps,
        })
    }
}

fn required_string(value: Option<String>, field: &str) -> RelayResult<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RelayError::InvalidConfig(format!("{} is required", field))),
    }
}

fn positive_integer(value: Option<Number>, field: &str) -> RelayResult<u32> {
    let number = value.ok_or_else(|| RelayError::InvalidConfig(format!("{} is required", field)))?;
    number
        .as_u64()
        .filter(|n| *n > 0)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            RelayError::InvalidConfig(format!(
                "{} must be a positive integer, got {}",
                field, number
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> ConfigRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_youtube_destination() {
        let config = request(serde_json::json!({
            "platform": "youtube",
            "rtmpUrl": "rtmp://a.rtmp.youtube.com/live2",
            "streamKey": "abc123",
            "fps": 30,
            "bitrate": 2500
        }))
        .validate()
        .unwrap();

        assert_eq!(config.destination_url(), "rtmp://a.rtmp.youtube.com/live2/abc123");
        assert_eq!(config.target_fps, 30);
        assert_eq!(config.target_bitrate_kbps, 2500);
    }

    #[test]
    fn test_default_base_per_platform() {
        let config = request(serde_json::json!({
            "platform": "twitch",
            "streamKey": "live_42",
            "fps": 60,
            "bitrate": 6000
        }))
        .validate()
        .unwrap();
        assert_eq!(config.destination_url(), "rtmp://live.twitch.tv/app/live_42");

        let config = request(serde_json::json!({
            "platform": "facebook",
            "rtmpUrl": "",
            "streamKey": "FB-1",
            "fps": 30,
            "bitrate": 4000
        }))
        .validate()
        .unwrap();
        assert_eq!(
            config.destination_url(),
            "rtmps://live-api-s.facebook.com:443/rtmp/FB-1"
        );
    }

    #[test]
    fn test_trailing_slash_is_not_doubled() {
        let config = request(serde_json::json!({
            "platform": "custom",
            "rtmpUrl": "rtmp://ingest.example.net/live/",
            "streamKey": "k",
            "fps": 25,
            "bitrate": 1000
        }))
        .validate()
        .unwrap();
        assert_eq!(config.destination_url(), "rtmp://ingest.example.net/live/k");
    }

    #[test]
    fn test_custom_requires_url() {
        let err = request(serde_json::json!({
            "platform": "custom",
            "streamKey": "k",
            "fps": 30,
            "bitrate": 2500
        }))
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("rtmpUrl"));
    }

    #[test]
    fn test_missing_and_invalid_fields() {
        let err = request(serde_json::json!({"platform": "youtube", "fps": 30, "bitrate": 2500}))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("streamKey"));

        let err = request(serde_json::json!({
            "platform": "youtube", "streamKey": "abc", "fps": 0, "bitrate": 2500
        }))
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("fps"));

        let err = request(serde_json::json!({
            "platform": "youtube", "streamKey": "abc", "fps": 30, "bitrate": -5
        }))
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("bitrate"));

        let err = request(serde_json::json!({
            "platform": "myspace", "streamKey": "abc", "fps": 30, "bitrate": 2500
        }))
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("platform"));
    }

    #[test]
    fn test_stream_key_is_redacted() {
        let config = request(serde_json::json!({
            "platform": "youtube", "streamKey": "super-secret", "fps": 30, "bitrate": 2500
        }))
        .validate()
        .unwrap();
        assert!(!format!("{:?}", config).contains("super-secret"));
        assert!(!config.redacted_destination().contains("super-secret"));
    }
}
