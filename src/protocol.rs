//! JSON control messages exchanged over the socket.

use serde::Serialize;
use serde_json::Value;

use crate::error::{RelayError, RelayResult};
use crate::stream_config::ConfigRequest;

/// Client -> server.
#[derive(Debug)]
pub enum ControlMessage {
    Config(ConfigRequest),
    StartStream,
    StopStream,
}

impl ControlMessage {
    /// Malformed JSON and unknown types are both errors; neither may touch
    /// session state.
    pub fn parse(text: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| RelayError::Protocol("message has no \"type\" field".to_string()))?;

        match kind.as_str() {
            "config" => Ok(ControlMessage::Config(serde_json::from_value(value)?)),
            "start_stream" => Ok(ControlMessage::StartStream),
            "stop_stream" => Ok(ControlMessage::StopStream),
            other => Err(RelayError::Protocol(format!(
                "unknown message type {:?}",
                other
            ))),
        }
    }
}

/// Status attached to `stream_status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamHealth {
    Streaming,
    Degraded,
}

/// Server -> client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { message: String },
    ConfigReceived { status: &'static str },
    StreamStarted { status: &'static str, message: String },
    StreamStatus { status: StreamHealth, message: String },
    StreamStopped { status: &'static str },
    StreamEnded { code: i32 },
    Error { message: String },
}

impl ServerMessage {
    pub fn connected(message: impl Into<String>) -> Self {
        ServerMessage::Connected {
            message: message.into(),
        }
    }

    pub fn config_received() -> Self {
        ServerMessage::ConfigReceived { status: "ok" }
    }

    pub fn stream_started(message: impl Into<String>) -> Self {
        ServerMessage::StreamStarted {
            status: "ok",
            message: message.into(),
        }
    }

    pub fn stream_status(status: StreamHealth, message: impl Into<String>) -> Self {
        ServerMessage::StreamStatus {
            status,
            message: message.into(),
        }
    }

    pub fn stream_stopped() -> Self {
        ServerMessage::StreamStopped { status: "ok" }
    }

    pub fn stream_ended(code: i32) -> Self {
        ServerMessage::StreamEnded { code }
    }

    pub fn error(err: &RelayError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is a flat struct of strings and integers.
        serde_json::to_string(self).unwrap_or_else(|_| {
            String::from(r#"{"type":"error","message":"failed to encode reply"}"#)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"start_stream"}"#),
            Ok(ControlMessage::StartStream)
        ));
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"stop_stream","extra":1}"#),
            Ok(ControlMessage::StopStream)
        ));

        let msg = ControlMessage::parse(
            r#"{"type":"config","platform":"youtube","rtmpUrl":"rtmp://a.rtmp.youtube.com/live2","streamKey":"abc123","fps":30,"bitrate":2500}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::Config(req) => {
                assert_eq!(req.platform.as_deref(), Some("youtube"));
                assert_eq!(req.stream_key.as_deref(), Some("abc123"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ControlMessage::parse("{not json"),
            Err(RelayError::Json(_))
        ));
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"dance"}"#),
            Err(RelayError::Protocol(_))
        ));
        assert!(matches!(
            ControlMessage::parse(r#"{"platform":"youtube"}"#),
            Err(RelayError::Protocol(_))
        ));
        assert!(matches!(
            ControlMessage::parse(r#"{"type":"config","fps":"thirty"}"#),
            Err(RelayError::Json(_))
        ));
    }

    #[test]
    fn test_server_message_shapes() {
        assert_eq!(
            ServerMessage::config_received().to_json(),
            r#"{"type":"config_received","status":"ok"}"#
        );
        assert_eq!(
            ServerMessage::stream_stopped().to_json(),
            r#"{"type":"stream_stopped","status":"ok"}"#
        );
        assert_eq!(
            ServerMessage::stream_ended(255).to_json(),
            r#"{"type":"stream_ended","code":255}"#
        );

        let status: Value = serde_json::from_str(
            &ServerMessage::stream_status(StreamHealth::Streaming, "Time: 00:00:01.00").to_json(),
        )
        .unwrap();
        assert_eq!(status["type"], "stream_status");
        assert_eq!(status["status"], "streaming");
        assert_eq!(status["message"], "Time: 00:00:01.00");

        let err: Value = serde_json::from_str(
            &ServerMessage::error(&RelayError::Protocol("nope".to_string())).to_json(),
        )
        .unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["message"], "Protocol error: nope");
    }
}
