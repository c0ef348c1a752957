use std::net::SocketAddr;
use std::sync::Arc;

use dotenv::dotenv;
use log::info;
use server_inner::ServerInner;

use crate::config::RelaySettings;
use crate::encoder::process::FfmpegLauncher;

mod config;
mod encoder;
mod error;
mod protocol;
mod server_inner;
mod session;
mod stream_config;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    env_logger::init();

    let settings = RelaySettings::from_env()?;
    let launcher = Arc::new(FfmpegLauncher::new(settings.encoder.clone()));
    let server = ServerInner::new(launcher, settings.progress_timeout);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    info!(
        "Stream relay listening on {} (encoder: {})",
        settings.bind_addr, settings.encoder.ffmpeg_bin
    );

    axum::serve(
        listener,
        server
            .router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
