use std::sync::Arc;
use std::time::Duration;

use log::{info, trace, warn};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::encoder::{Encoder, EncoderEvent, EncoderLauncher, EventReceiver, EventSender};
use crate::error::{RelayError, RelayResult};
use crate::protocol::{ControlMessage, ServerMessage, StreamHealth};
use crate::stream_config::{ConfigRequest, StreamConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingConfig,
    ConfigReceived,
    Streaming,
    Stopped,
    Failed,
}

/// State for one connection's streaming attempt. Every handler returns the
/// reply to send back, if any.
pub struct Session {
    id: usize,
    state: SessionState,
    config: Option<StreamConfig>,
    encoder: Option<Box<dyn Encoder>>,
    generation: u64,
    launcher: Arc<dyn EncoderLauncher>,
    events_tx: EventSender,
    progress_timeout: Duration,
    progress_deadline: Option<Instant>,
    chunks_forwarded: u64,
    bytes_forwarded: u64,
}

impl Session {
    pub fn new(
        id: usize,
        launcher: Arc<dyn EncoderLauncher>,
        progress_timeout: Duration,
    ) -> (Self, EventReceiver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Session {
            id,
            state: SessionState::AwaitingConfig,
            config: None,
            encoder: None,
            generation: 0,
            launcher,
            events_tx,
            progress_timeout,
            progress_deadline: None,
            chunks_forwarded: 0,
            bytes_forwarded: 0,
        };
        (session, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn get_ffmpeg_pid(&self) -> Option<u32> {
        self.encoder.as_ref().and_then(|e| e.pid())
    }

    /// When the current stream should be flagged as degraded if no progress
    /// has shown up yet.
    pub fn progress_deadline(&self) -> Option<Instant> {
        self.progress_deadline
    }

    pub async fn on_control(&mut self, text: &str) -> ServerMessage {
        let result = match ControlMessage::parse(text) {
            Ok(ControlMessage::Config(request)) => self.accept_config(request),
            Ok(ControlMessage::StartStream) => self.start_stream().await,
            Ok(ControlMessage::StopStream) => {
                self.teardown(SessionState::Stopped).await;
                Ok(ServerMessage::stream_stopped())
            }
            Err(e) => Err(e),
        };

        result.unwrap_or_else(|e| {
            warn!("Session {}: {}", self.id, e);
            ServerMessage::error(&e)
        })
    }

    /// Frames outside `Streaming` are dropped without a reply.
    pub async fn on_binary(&mut self, chunk: &[u8]) -> Option<ServerMessage> {
        let encoder = match (self.state, self.encoder.as_mut()) {
            (SessionState::Streaming, Some(encoder)) => encoder,
            _ => {
                trace!(
                    "Session {}: dropping {} byte chunk in state {:?}",
                    self.id,
                    chunk.len(),
                    self.state
                );
                return None;
            }
        };

        match encoder.write(chunk).await {
            Ok(()) => {
                self.chunks_forwarded += 1;
                self.bytes_forwarded += chunk.len() as u64;
                None
            }
            Err(e) => {
                warn!("Session {}: {}", self.id, e);
                self.teardown(SessionState::Failed).await;
                Some(ServerMessage::error(&e))
            }
        }
    }

    pub async fn on_encoder_event(&mut self, event: EncoderEvent) -> Option<ServerMessage> {
        let current = event.generation() == self.generation;
        match event {
            EncoderEvent::Progress { message, .. } => {
                if !current || self.state != SessionState::Streaming {
                    return None;
                }
                self.progress_deadline = None;
                Some(ServerMessage::stream_status(StreamHealth::Streaming, message))
            }
            EncoderEvent::Exited { code, .. } => {
                if current && self.state == SessionState::Streaming {
                    let next = if code == 0 {
                        SessionState::Stopped
                    } else {
                        SessionState::Failed
                    };
                    warn!("Session {}: encoder exited unexpectedly (code {})", self.id, code);
                    self.teardown(next).await;
                }
                Some(ServerMessage::stream_ended(code))
            }
        }
    }

    /// Fires at most once per started stream.
    pub fn on_progress_timeout(&mut self) -> Option<ServerMessage> {
        self.progress_deadline.take()?;
        if self.state != SessionState::Streaming {
            return None;
        }
        warn!(
            "Session {}: no encoder progress within {:?}",
            self.id, self.progress_timeout
        );
        Some(ServerMessage::stream_status(
            StreamHealth::Degraded,
            format!(
                "No progress from encoder after {} seconds",
                self.progress_timeout.as_secs()
            ),
        ))
    }

    pub async fn on_close(&mut self) {
        self.teardown(SessionState::Stopped).await;
        info!(
            "Session {} closed: {} chunks / {} bytes forwarded",
            self.id, self.chunks_forwarded, self.bytes_forwarded
        );
    }

    fn accept_config(&mut self, request: ConfigRequest) -> RelayResult<ServerMessage> {
        if self.state != SessionState::AwaitingConfig {
            return Err(RelayError::InvalidState(format!(
                "config already received (state {:?})",
                self.state
            )));
        }

        let config = request.validate()?;
        info!(
            "Session {}: config accepted for {} -> {} ({} fps, {} kbps)",
            self.id,
            config.platform,
            config.redacted_destination(),
            config.target_fps,
            config.target_bitrate_kbps
        );
        self.config = Some(config);
        self.transition(SessionState::ConfigReceived);
        Ok(ServerMessage::config_received())
    }

    async fn start_stream(&mut self) -> RelayResult<ServerMessage> {
        if self.state != SessionState::ConfigReceived {
            return Err(RelayError::InvalidState(match self.state {
                SessionState::AwaitingConfig => "start_stream before config".to_string(),
                SessionState::Streaming => "stream already running".to_string(),
                _ => "session has ended, reconnect to stream again".to_string(),
            }));
        }
        let config = self
            .config
            .clone()
            .ok_or_else(|| RelayError::InvalidState("no config stored".to_string()))?;

        // Spawn errors leave the session in ConfigReceived so the client can retry.
        self.spawn_encoder(&config).await?;
        self.transition(SessionState::Streaming);
        self.progress_deadline = Some(Instant::now() + self.progress_timeout);

        Ok(ServerMessage::stream_started(format!(
            "Streaming to {} at {} kbps",
            config.platform, config.target_bitrate_kbps
        )))
    }

    /// Never leaves two encoders alive: the previous one is fully stopped
    /// before the next is launched.
    async fn spawn_encoder(&mut self, config: &StreamConfig) -> RelayResult<()> {
        if let Some(mut previous) = self.encoder.take() {
            info!("Session {}: stopping previous encoder before respawn", self.id);
            previous.stop().await;
        }

        self.generation += 1;
        let encoder = self
            .launcher
            .launch(config, self.generation, self.events_tx.clone())?;
        info!(
            "Session {}: encoder started (generation {}, pid {:?})",
            self.id,
            self.generation,
            encoder.pid()
        );
        self.encoder = Some(encoder);
        Ok(())
    }

    async fn teardown(&mut self, next: SessionState) {
        if let Some(mut encoder) = self.encoder.take() {
            info!("Session {}: stopping encoder (pid {:?})", self.id, encoder.pid());
            encoder.stop().await;
        }
        self.progress_deadline = None;
        self.transition(next);
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!("Session {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }
}
