//! FFmpeg subprocess supervision.
//!
//! Each spawned process gets three background tasks:
//! 1. a supervisor that owns the [`Child`], waits for it to exit (or for a
//!    stop request) and then sends the single `Exited` event;
//! 2. a writer that feeds queued media chunks into stdin, so a stalled
//!    encoder never blocks the session;
//! 3. a diagnostics reader draining stderr via [`monitor::watch_diagnostics`].
//!
//! Stopping escalates: close stdin, wait, SIGTERM, wait, SIGKILL.

use std::ffi::OsStr;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::EncoderSettings;
use crate::encoder::args::FfmpegArgs;
use crate::encoder::{monitor, Encoder, EncoderEvent, EncoderLauncher, EventSender};
use crate::error::{RelayError, RelayResult};
use crate::stream_config::StreamConfig;

/// Chunks queued for stdin before the encoder counts as stalled.
const INPUT_QUEUE_CHUNKS: usize = 256;

pub struct FfmpegLauncher {
    settings: EncoderSettings,
}

impl FfmpegLauncher {
    pub fn new(settings: EncoderSettings) -> Self {
        FfmpegLauncher { settings }
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn launch(
        &self,
        config: &StreamConfig,
        generation: u64,
        events: EventSender,
    ) -> RelayResult<Box<dyn Encoder>> {
        let args = FfmpegArgs::new(config, &self.settings);
        info!(
            "Spawning {} for {} -> {} with args: {:?}",
            self.settings.ffmpeg_bin,
            config.platform,
            config.redacted_destination(),
            args.redacted()
        );

        let process = FfmpegProcess::spawn(
            &self.settings.ffmpeg_bin,
            args.build(),
            generation,
            Some(config.stream_key.expose().to_string()),
            events,
            self.settings.stop_grace,
        )?;
        Ok(Box::new(process))
    }
}

pub struct FfmpegProcess {
    pid: Option<u32>,
    label: String,
    grace: Duration,
    input: Option<mpsc::Sender<Vec<u8>>>,
    writer: Option<JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl FfmpegProcess {
    /// `secret` is masked in every diagnostics line that gets logged.
    pub fn spawn<I, S>(
        program: &str,
        args: I,
        generation: u64,
        secret: Option<String>,
        events: EventSender,
        grace: Duration,
    ) -> RelayResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Spawn(format!("{}: {}", program, e)))?;

        let pid = child.id();
        let label = match pid {
            Some(pid) => format!("pid {}", pid),
            None => format!("gen {}", generation),
        };
        info!("FFmpeg ({}) started", label);

        let (input, writer) = match child.stdin.take() {
            Some(stdin) => {
                let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CHUNKS);
                let writer = tokio::spawn(feed_input(stdin, input_rx, label.clone()));
                (Some(input_tx), Some(writer))
            }
            None => (None, None),
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(monitor::watch_diagnostics(
                stderr,
                generation,
                label.clone(),
                secret,
                events.clone(),
            ));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(
            child,
            stop_rx,
            grace,
            generation,
            label.clone(),
            events,
        ));

        Ok(FfmpegProcess {
            pid,
            label,
            grace,
            input,
            writer,
            stop_tx: Some(stop_tx),
            supervisor: Some(supervisor),
        })
    }
}

#[async_trait]
impl Encoder for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&mut self, chunk: &[u8]) -> RelayResult<()> {
        let input = self.input.as_ref().ok_or_else(|| {
            input_error(io::ErrorKind::BrokenPipe, "encoder input already closed")
        })?;
        input.try_send(chunk.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => {
                input_error(io::ErrorKind::WouldBlock, "encoder is not reading its input")
            }
            // The writer quits on its first failed write.
            TrySendError::Closed(_) => {
                input_error(io::ErrorKind::BrokenPipe, "encoder input closed")
            }
        })
    }

    async fn stop(&mut self) {
        // Closing the queue lets the writer drain it and then drop stdin,
        // which is the end-of-stream signal.
        self.input.take();
        if let Some(mut writer) = self.writer.take() {
            if timeout(self.grace, &mut writer).await.is_err() {
                warn!("FFmpeg ({}) is not draining its input, closing it", self.label);
                writer.abort();
            }
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            // Err means the process already exited on its own.
            let _ = stop_tx.send(());
        }
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                error!("FFmpeg supervisor task failed: {}", e);
            }
        }
    }
}

fn input_error(kind: io::ErrorKind, message: &str) -> RelayError {
    RelayError::EncoderWrite(io::Error::new(kind, message))
}

async fn feed_input(mut stdin: ChildStdin, mut chunks: mpsc::Receiver<Vec<u8>>, label: String) {
    while let Some(chunk) = chunks.recv().await {
        if let Err(e) = stdin.write_all(&chunk).await {
            warn!("FFmpeg ({}): input write failed: {}", label, e);
            return;
        }
    }
}

async fn supervise(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    generation: u64,
    label: String,
    events: EventSender,
) {
    // A dropped sender counts as a stop request.
    let exited_on_its_own = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop_rx => None,
    };
    let status = match exited_on_its_own {
        Some(status) => status,
        None => terminate(&mut child, grace, &label).await,
    };

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            error!("FFmpeg ({}): failed to collect exit status: {}", label, e);
            -1
        }
    };
    if code == 0 {
        info!("FFmpeg ({}) exited cleanly", label);
    } else {
        warn!("FFmpeg ({}) exited with code {}", label, code);
    }

    let _ = events.send(EncoderEvent::Exited { generation, code });
}

/// Expects stdin to be closed already.
async fn terminate(child: &mut Child, grace: Duration, label: &str) -> io::Result<ExitStatus> {
    if let Ok(status) = timeout(grace, child.wait()).await {
        return status;
    }

    // id() is None once the child has been reaped, so the pid cannot be stale.
    if let Some(pid) = child.id() {
        info!("FFmpeg ({}) still running after end of input, sending SIGTERM", label);
        // SAFETY: plain syscall on our own child's pid.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if let Ok(status) = timeout(grace, child.wait()).await {
        return status;
    }

    warn!("FFmpeg ({}) ignored SIGTERM, killing", label);
    child.kill().await?;
    child.wait().await
}

/// Signal deaths map to the shell convention `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
