use std::borrow::Cow;

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::encoder::{EncoderEvent, EventSender};

/// Longer lines are truncated; ffmpeg never prints anything close to this.
const MAX_LINE_BYTES: usize = 4096;

/// One parsed diagnostics line.
#[derive(Debug, PartialEq, Eq)]
pub enum DiagnosticLine {
    Progress(String),
    Other(String),
}

/// Reads ffmpeg diagnostics until the pipe closes. Progress lines are
/// forwarded as [`EncoderEvent::Progress`]; everything else goes to the
/// debug log with `secret` masked.
///
/// ffmpeg rewrites its progress line in place with `\r`, so both `\r` and
/// `\n` end a line here, as soon as they arrive.
pub async fn watch_diagnostics<R>(
    reader: R,
    generation: u64,
    label: String,
    secret: Option<String>,
    events: EventSender,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let emit = |raw: &[u8]| match classify_line(raw, secret.as_deref()) {
        Some(DiagnosticLine::Progress(message)) => {
            // Receiver gone means the session is tearing down.
            let _ = events.send(EncoderEvent::Progress {
                generation,
                message,
            });
        }
        Some(DiagnosticLine::Other(text)) => debug!("FFmpeg ({}): {}", label, text),
        None => {}
    };

    loop {
        let available = match reader.fill_buf().await {
            Ok(available) => available,
            Err(e) => {
                debug!("FFmpeg ({}): diagnostics pipe error: {}", label, e);
                break;
            }
        };
        if available.is_empty() {
            break;
        }

        for &byte in available {
            if byte == b'\r' || byte == b'\n' {
                emit(&line);
                line.clear();
            } else if line.len() < MAX_LINE_BYTES {
                line.push(byte);
            }
        }
        let consumed = available.len();
        reader.consume(consumed);
    }
    emit(&line);
}

/// `None` for blank lines.
pub fn classify_line(raw: &[u8], secret: Option<&str>) -> Option<DiagnosticLine> {
    let text = String::from_utf8_lossy(raw);
    let line = text.trim();
    if line.is_empty() {
        return None;
    }
    Some(match summarize_progress(line) {
        Some(message) => DiagnosticLine::Progress(message),
        None => DiagnosticLine::Other(redact(line, secret).into_owned()),
    })
}

/// ffmpeg echoes the output URL, key included, in its banner and in
/// connection errors.
pub fn redact<'a>(line: &'a str, secret: Option<&str>) -> Cow<'a, str> {
    match secret {
        Some(secret) if !secret.is_empty() && line.contains(secret) => {
            Cow::Owned(line.replace(secret, "***"))
        }
        _ => Cow::Borrowed(line),
    }
}

/// Video has "frame=", audio-only output has "size=" but no "frame=".
/// Both carry "time=" and "bitrate=".
pub fn is_progress_line(line: &str) -> bool {
    line.contains("time=") && line.contains("bitrate=")
}

pub fn summarize_progress(line: &str) -> Option<String> {
    if !is_progress_line(line) {
        return None;
    }

    let time = extract_value(line, "time=");
    let bitrate = extract_value(line, "bitrate=");
    let speed = extract_value(line, "speed=");

    let mut msg = format!(
        "Time: {} | Bitrate: {} | Speed: {}",
        time.unwrap_or_else(|| "??".to_string()),
        bitrate.unwrap_or_else(|| "N/A".to_string()),
        speed.unwrap_or_else(|| "??".to_string())
    );
    if let Some(fps) = extract_value(line, "fps=") {
        msg.push_str(&format!(" | FPS: {}", fps));
    }
    if let Some(drop) = extract_value(line, "drop=") {
        msg.push_str(&format!(" | Drop: {}", drop));
    }
    Some(msg)
}

fn extract_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)?;
    let after_key = &line[start + key.len()..];
    // Values are sometimes space-padded: "frame=  123".
    let value_part = after_key.trim_start();
    let end = value_part
        .find(char::is_whitespace)
        .unwrap_or(value_part.len());
    if end == 0 {
        None
    } else {
        Some(value_part[..end].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    const VIDEO_LINE: &str = "frame=  123 fps= 30.0 q=23.0 size=    1024kB \
                              time=00:00:04.10 bitrate=2046.3kbits/s speed=1.01x";

    #[test]
    fn test_extract_value() {
        assert_eq!(extract_value(VIDEO_LINE, "frame="), Some("123".to_string()));
        assert_eq!(extract_value(VIDEO_LINE, "fps="), Some("30.0".to_string()));
        assert_eq!(extract_value(VIDEO_LINE, "time="), Some("00:00:04.10".to_string()));
        assert_eq!(extract_value(VIDEO_LINE, "speed="), Some("1.01x".to_string()));
        assert_eq!(extract_value(VIDEO_LINE, "missing="), None);
        assert_eq!(extract_value("speed=", "speed="), None);
    }

    #[test]
    fn test_summarize_progress() {
        assert_eq!(
            summarize_progress(VIDEO_LINE).unwrap(),
            "Time: 00:00:04.10 | Bitrate: 2046.3kbits/s | Speed: 1.01x | FPS: 30.0"
        );

        let audio_line = "size=     512kB time=00:00:30.00 bitrate= 128.0kbits/s speed=1.0x";
        assert_eq!(
            summarize_progress(audio_line).unwrap(),
            "Time: 00:00:30.00 | Bitrate: 128.0kbits/s | Speed: 1.0x"
        );

        assert!(summarize_progress("Input #0, matroska,webm, from 'pipe:':").is_none());
    }

    #[tokio::test]
    async fn test_watch_splits_carriage_returns() {
        let stderr = format!(
            "Input #0, matroska,webm, from 'pipe:':\n{}\r{}\rStream mapping:\n",
            VIDEO_LINE,
            VIDEO_LINE.replace("frame=  123", "frame=  150")
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        watch_diagnostics(stderr.as_bytes(), 7, "test".to_string(), None, tx).await;

        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            progress.push(event);
        }
        assert_eq!(progress.len(), 2);
        assert!(progress.iter().all(|e| e.generation() == 7));
    }

    #[tokio::test]
    async fn test_newline_lines_are_handled_before_eof() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let watcher = tokio::spawn(watch_diagnostics(reader, 1, "test".to_string(), None, tx));

        // No trailing \r and the pipe stays open.
        writer
            .write_all(format!("{}\n", VIDEO_LINE).as_bytes())
            .await
            .unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("line terminated by \\n was not handled")
            .unwrap();
        assert!(matches!(event, EncoderEvent::Progress { generation: 1, .. }));

        drop(writer);
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_overlong_line_is_truncated() {
        let stderr = format!("{}\n{}\r", "x".repeat(MAX_LINE_BYTES * 4), VIDEO_LINE);
        let (tx, mut rx) = mpsc::unbounded_channel();

        watch_diagnostics(stderr.as_bytes(), 2, "test".to_string(), None, tx).await;

        assert!(matches!(rx.try_recv(), Ok(EncoderEvent::Progress { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stream_key_is_masked_in_diagnostics() {
        let line = b"Output #0, flv, to 'rtmp://a.rtmp.youtube.com/live2/SECRETKEY':";
        assert_eq!(
            classify_line(line, Some("SECRETKEY")),
            Some(DiagnosticLine::Other(
                "Output #0, flv, to 'rtmp://a.rtmp.youtube.com/live2/***':".to_string()
            ))
        );

        let error = b"[rtmp @ 0x55d] Server error: rtmp://live.twitch.tv/app/SECRETKEY not found";
        match classify_line(error, Some("SECRETKEY")) {
            Some(DiagnosticLine::Other(text)) => assert!(!text.contains("SECRETKEY")),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(redact("no key here", Some("SECRETKEY")), "no key here");
        assert_eq!(classify_line(b"   ", Some("SECRETKEY")), None);
    }
}
