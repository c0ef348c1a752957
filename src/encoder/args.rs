use crate::config::EncoderSettings;
use crate::stream_config::StreamConfig;

/// Builds the ffmpeg argument list for relaying a stdin container stream
/// to an RTMP ingest.
#[derive(Debug, Clone)]
pub struct FfmpegArgs {
    video_codec: String,
    preset: String,
    tune: String,
    pixel_format: String,
    bitrate_kbps: u32,
    framerate: u32,
    audio_codec: String,
    audio_bitrate: String,
    audio_sample_rate: u32,
    destination: String,
    redacted_destination: String,
}

impl FfmpegArgs {
    pub fn new(config: &StreamConfig, settings: &EncoderSettings) -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: settings.x264_preset.clone(),
            tune: "zerolatency".to_string(),
            pixel_format: "yuv420p".to_string(),
            bitrate_kbps: config.target_bitrate_kbps,
            framerate: config.target_fps,
            audio_codec: "aac".to_string(),
            audio_bitrate: settings.audio_bitrate.clone(),
            audio_sample_rate: settings.audio_sample_rate,
            destination: config.destination_url(),
            redacted_destination: config.redacted_destination(),
        }
    }

    /// Frames between keyframes: two seconds of video.
    pub fn keyframe_interval(&self) -> u32 {
        self.framerate.saturating_mul(2)
    }

    pub fn build(&self) -> Vec<String> {
        self.build_with_destination(&self.destination)
    }

    /// Same arguments with the stream key masked, for logging.
    pub fn redacted(&self) -> Vec<String> {
        self.build_with_destination(&self.redacted_destination)
    }

    #[rustfmt::skip]
    fn build_with_destination(&self, destination: &str) -> Vec<String> {
        let bitrate = format!("{}k", self.bitrate_kbps);
        let bufsize = format!("{}k", self.bitrate_kbps.saturating_mul(2));
        let gop = self.keyframe_interval().to_string();

        vec![
            "-hide_banner".to_string(),
            "-i".to_string(), "-".to_string(),
            "-c:v".to_string(), self.video_codec.clone(),
            "-preset".to_string(), self.preset.clone(),
            "-tune".to_string(), self.tune.clone(),
            "-b:v".to_string(), bitrate.clone(),
            "-maxrate".to_string(), bitrate,
            "-bufsize".to_string(), bufsize,
            "-pix_fmt".to_string(), self.pixel_format.clone(),
            "-r".to_string(), self.framerate.to_string(),
            "-g".to_string(), gop.clone(),
            "-keyint_min".to_string(), gop,
            "-c:a".to_string(), self.audio_codec.clone(),
            "-b:a".to_string(), self.audio_bitrate.clone(),
            "-ar".to_string(), self.audio_sample_rate.to_string(),
            "-f".to_string(), "flv".to_string(),
            destination.to_string(),
        ]
    }
}
