//! Encoder subprocess management.
//!
//! A session talks to its encoder through two seams:
//!
//! 1. [`EncoderLauncher`] turns a [`StreamConfig`] into a running [`Encoder`].
//! 2. The running encoder reports back through an [`EventSender`]: progress
//!    summaries while it runs, and exactly one [`EncoderEvent::Exited`] when
//!    the process is gone.
//!
//! [`process::FfmpegLauncher`] is the production launcher.

pub mod args;
pub mod monitor;
pub mod process;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RelayResult;
use crate::stream_config::StreamConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    Progress { generation: u64, message: String },
    Exited { generation: u64, code: i32 },
}

impl EncoderEvent {
    pub fn generation(&self) -> u64 {
        match self {
            EncoderEvent::Progress { generation, .. } | EncoderEvent::Exited { generation, .. } => {
                *generation
            }
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<EncoderEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EncoderEvent>;

/// One running encoder instance.
#[async_trait]
pub trait Encoder: Send {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Hands one media chunk to the encoder input without waiting for the
    /// encoder to read it. Chunks must reach the encoder in call order.
    async fn write(&mut self, chunk: &[u8]) -> RelayResult<()>;

    /// Closes the input and terminates the process. Returns once the process
    /// is gone. Calling it again is a no-op.
    async fn stop(&mut self);
}

pub trait EncoderLauncher: Send + Sync {
    /// Spawns an encoder for `config`. Every event it emits carries
    /// `generation`.
    fn launch(
        &self,
        config: &StreamConfig,
        generation: u64,
        events: EventSender,
    ) -> RelayResult<Box<dyn Encoder>>;
}
