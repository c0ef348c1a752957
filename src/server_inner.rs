//! WebSocket transport and liveness endpoint.
//!
//! `GET /` (also `/ws`) upgrades to a WebSocket session when asked to and
//! otherwise answers with a plain-text liveness body. Each WebSocket gets
//! its own [`Session`]; text frames are control messages, binary frames
//! are media.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use slab::Slab;
use tokio::sync::RwLock;

use crate::encoder::{EncoderLauncher, EventReceiver};
use crate::protocol::ServerMessage;
use crate::session::Session;

struct ConnectionInfo {
    peer: SocketAddr,
    connected_at: Instant,
}

#[derive(Clone)]
pub struct ServerInner {
    sessions: Arc<RwLock<Slab<ConnectionInfo>>>,
    launcher: Arc<dyn EncoderLauncher>,
    progress_timeout: Duration,
}

impl ServerInner {
    pub fn new(launcher: Arc<dyn EncoderLauncher>, progress_timeout: Duration) -> Self {
        ServerInner {
            sessions: Arc::new(RwLock::new(Slab::new())),
            launcher,
            progress_timeout,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(handle_root))
            .route("/ws", get(handle_root))
            .with_state(self)
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn register(&self, peer: SocketAddr) -> usize {
        let mut sessions = self.sessions.write().await;
        sessions.insert(ConnectionInfo {
            peer,
            connected_at: Instant::now(),
        })
    }

    async fn unregister(&self, id: usize) {
        let mut sessions = self.sessions.write().await;
        if let Some(info) = sessions.try_remove(id) {
            info!(
                "Session {} ({}) disconnected after {:?}",
                id,
                info.peer,
                info.connected_at.elapsed()
            );
        }
    }

    /// Runs one connection to completion. The encoder is always torn down
    /// before this returns, whatever ended the connection.
    pub async fn serve_connection<S, K>(&self, peer: SocketAddr, inbound: S, outbound: K)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
        K: Sink<Message> + Unpin,
    {
        let id = self.register(peer).await;
        info!("Session {} connected from {}", id, peer);

        let (mut session, events) = Session::new(id, self.launcher.clone(), self.progress_timeout);
        drive(&mut session, events, inbound, outbound).await;
        debug!(
            "Session {} ending in state {:?} (encoder pid {:?})",
            id,
            session.state(),
            session.get_ffmpeg_pid()
        );
        session.on_close().await;

        self.unregister(id).await;
    }
}

async fn handle_root(
    ws: Option<WebSocketUpgrade>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(server): State<ServerInner>,
) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_socket(socket, server, peer)),
        None => {
            let active = server.active_sessions().await;
            format!("Stream relay server is running ({} active sessions)\n", active).into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, server: ServerInner, peer: SocketAddr) {
    let (sink, stream) = socket.split();
    server.serve_connection(peer, stream, sink).await;
}

enum Inbound {
    Control(String),
    Binary(Vec<u8>),
    Ignore,
    Closed,
}

fn classify(message: Option<Result<Message, axum::Error>>) -> Inbound {
    match message {
        Some(Ok(Message::Text(text))) => Inbound::Control(text),
        Some(Ok(Message::Binary(bytes))) => Inbound::Binary(bytes),
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Inbound::Ignore,
        Some(Ok(Message::Close(_))) | None => Inbound::Closed,
        Some(Err(e)) => {
            debug!("WebSocket receive error: {}", e);
            Inbound::Closed
        }
    }
}

async fn drive<S, K>(
    session: &mut Session,
    mut events: EventReceiver,
    mut inbound: S,
    mut outbound: K,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    K: Sink<Message> + Unpin,
{
    let greeting = ServerMessage::connected("Connected to stream relay server");
    if outbound.send(Message::Text(greeting.to_json())).await.is_err() {
        return;
    }

    loop {
        let deadline = session.progress_deadline();
        let reply = tokio::select! {
            message = inbound.next() => match classify(message) {
                Inbound::Control(text) => Some(session.on_control(&text).await),
                Inbound::Binary(bytes) => session.on_binary(&bytes).await,
                Inbound::Ignore => None,
                Inbound::Closed => break,
            },
            Some(event) = events.recv() => session.on_encoder_event(event).await,
            _ = wait_for(deadline) => session.on_progress_timeout(),
        };

        if let Some(reply) = reply {
            if outbound.send(Message::Text(reply.to_json())).await.is_err() {
                warn!("Failed to send reply, client is gone");
                break;
            }
        }
    }
}

async fn wait_for(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
