//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐  handshake: Authorization: Bearer <token>  (or ?token=)
//!            ├── SyncProtocol ── DocumentSession ── DocumentStorage
//! Client B ──┘        │                │
//!                     │                └── write-back worker
//!                   rooms ──► forwarders ──► per-connection inbox ──► socket
//! ```
//!
//! A maintenance task runs the retry pass on a fixed interval and, when
//! configured, evicts idle documents.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::identity::{IdentityVerifier, JwtVerifier};
use crate::protocol::{ClientEvent, Framing, ServerEvent};
use crate::service::DocumentService;
use crate::session::{DocumentSession, SessionConfig};
use crate::storage::{DocumentStorage, MemoryStore, RocksStore, StoreConfig, StoreError};
use crate::sync::{Connection, SyncProtocol};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per document room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// RocksDB path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// HS256 secret for bearer tokens
    pub jwt_secret: Option<String>,
    /// How often pending operations get another merge pass
    pub retry_interval: Duration,
    /// Evict documents untouched for this long (None = keep loaded)
    pub idle_ttl: Option<Duration>,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            storage_path: None,
            jwt_secret: None,
            retry_interval: Duration::from_millis(500),
            idle_ttl: None,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

impl ServerConfig {
    /// Read `SCRIBE_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = var("SCRIBE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        config.storage_path = var("SCRIBE_STORAGE_PATH").filter(|p| !p.is_empty()).map(PathBuf::from);
        config.jwt_secret = var("SCRIBE_JWT_SECRET").filter(|s| !s.is_empty());
        if let Some(capacity) = parse_var(&var, "SCRIBE_BROADCAST_CAPACITY")? {
            config.broadcast_capacity = capacity;
        }
        if let Some(peers) = parse_var(&var, "SCRIBE_MAX_PEERS_PER_ROOM")? {
            config.max_peers_per_room = peers;
        }
        if let Some(ms) = parse_var(&var, "SCRIBE_RETRY_INTERVAL_MS")? {
            config.retry_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&var, "SCRIBE_IDLE_TTL_SECS")? {
            config.idle_ttl = Some(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    sync: Arc<SyncProtocol>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig, storage: Arc<dyn DocumentStorage>, identity: Arc<dyn IdentityVerifier>) -> Self {
        let session = DocumentSession::new(storage, config.session.clone());
        let sync = Arc::new(SyncProtocol::new(
            session,
            identity,
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            sync,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Build storage and identity from the configuration.
    pub fn from_config(config: ServerConfig) -> Result<Self, ServerError> {
        let secret = config
            .jwt_secret
            .clone()
            .ok_or(ConfigError::Missing("SCRIBE_JWT_SECRET"))?;
        let storage: Arc<dyn DocumentStorage> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => {
                log::warn!("No storage path configured; documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::new(config, storage, Arc::new(JwtVerifier::new(secret.as_bytes()))))
    }

    /// Accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        let maintenance = tokio::spawn(maintenance(
            Arc::downgrade(&self.sync),
            self.config.retry_interval,
            self.config.idle_ttl,
        ));

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let sync = self.sync.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, sync, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };
        maintenance.abort();
        result
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        sync: Arc<SyncProtocol>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let mut token = None;
        let verifier = sync.identity().clone();
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            match extract_token(request) {
                Some(found) if verifier.verify_token(&found).is_ok() => {
                    token = Some(found);
                    Ok(response)
                }
                _ => Err(unauthorized()),
            }
        })
        .await;

        let (ws_stream, token) = match (handshake, token) {
            (Ok(ws_stream), Some(token)) => (ws_stream, token),
            (result, _) => {
                stats.write().await.rejected_connections += 1;
                log::info!("Rejected handshake from {addr}");
                return result.map(|_| ()).map_err(Into::into);
            }
        };

        let (connection, inbox) = sync.connect(&token).await?;
        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(&sync, &connection, ws_stream, inbox, &stats).await;

        sync.disconnect(connection.id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Move events between the socket and the connection's inbox.
    async fn pump(
        sync: &SyncProtocol,
        connection: &Connection,
        ws_stream: WebSocketStream<TcpStream>,
        mut inbox: mpsc::UnboundedReceiver<ServerEvent>,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut framing = Framing::Binary;

        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    let decoded = match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            framing = Framing::Binary;
                            record_message(stats, data.len()).await;
                            ClientEvent::decode(&data)
                        }
                        Some(Ok(Message::Text(text))) => {
                            framing = Framing::Text;
                            record_message(stats, text.len()).await;
                            ClientEvent::from_json(text.as_str())
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            ws_sender.send(Message::Pong(payload)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::warn!("Connection {} read error: {e}", connection.id);
                            break;
                        }
                    };

                    let outcome = match decoded {
                        Ok(event) => sync.handle_event(connection, event).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = outcome {
                        log::debug!("Request from {} failed: {e}", connection.id);
                        send_event(&mut ws_sender, &ServerEvent::error(e.to_string()), framing).await?;
                    }
                }

                outgoing = inbox.recv() => {
                    match outgoing {
                        Some(event) => send_event(&mut ws_sender, &event, framing).await?,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Request-style operations backed by this server's state.
    pub fn service(&self) -> DocumentService {
        DocumentService::new(self.sync.clone())
    }

    pub fn sync(&self) -> &Arc<SyncProtocol> {
        &self.sync
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.sync.rooms().room_count();
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn record_message(stats: &RwLock<ServerStats>, bytes: usize) {
    let mut s = stats.write().await;
    s.total_messages += 1;
    s.total_bytes += bytes as u64;
}

async fn send_event(
    sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
    event: &ServerEvent,
    framing: Framing,
) -> Result<(), BoxError> {
    let message = match framing {
        Framing::Binary => Message::Binary(event.encode()?.into()),
        Framing::Text => Message::Text(event.to_json()?.into()),
    };
    sender.send(message).await?;
    Ok(())
}

/// Bearer token from the `Authorization` header, or the `token` query parameter.
fn extract_token(request: &Request) -> Option<String> {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    header.filter(|t| !t.is_empty()).or_else(|| {
        request
            .uri()
            .query()?
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

async fn maintenance(sync: Weak<SyncProtocol>, retry_interval: Duration, idle_ttl: Option<Duration>) {
    let mut ticker = tokio::time::interval(retry_interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(sync) = sync.upgrade() else {
            break;
        };
        let retried = sync.retry_pending().await;
        if retried > 0 {
            log::debug!("Retry pass touched {retried} documents");
        }
        if let Some(ttl) = idle_ttl {
            let evicted = sync.evict_idle(ttl).await;
            if !evicted.is_empty() {
                log::info!("Evicted {} idle documents", evicted.len());
            }
        }
    }
}
