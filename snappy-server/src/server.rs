//! Server state and listeners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomMembership;
use crate::store::{MessageStore, SqliteStore};

/// Shared state accessible by all connection handlers and HTTP routes.
///
/// Lock order, when more than one is needed: `presence` before the store
/// and before `rooms`, and either of `presence`/`rooms` before
/// `connections`. Nothing takes `presence` while holding `rooms` or
/// `connections`.
pub struct SharedState {
    pub server_name: String,
    pub started_at: Instant,
    /// session_id -> sender for writing encoded events to that client
    pub connections: Mutex<HashMap<String, mpsc::Sender<String>>>,
    /// user_id <-> session_id, last connection wins
    pub presence: Mutex<PresenceRegistry>,
    /// group_id -> subscribed sessions
    pub rooms: Mutex<RoomMembership>,
    pub store: Arc<dyn MessageStore>,
    pub config: ServerConfig,
}

impl SharedState {
    pub fn new(config: ServerConfig, store: Arc<dyn MessageStore>) -> Arc<Self> {
        Arc::new(Self {
            server_name: config.server_name.clone(),
            started_at: Instant::now(),
            connections: Mutex::new(HashMap::new()),
            presence: Mutex::new(PresenceRegistry::new()),
            rooms: Mutex::new(RoomMembership::new()),
            store,
            config,
        })
    }
}

pub struct Server {
    config: ServerConfig,
    store: Option<Arc<dyn MessageStore>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config, store: None }
    }

    /// Create a server over a caller-provided store (for testing).
    pub fn with_store(config: ServerConfig, store: Arc<dyn MessageStore>) -> Self {
        Self { config, store: Some(store) }
    }

    /// Build SharedState, opening the database unless a store was injected.
    pub fn build_state(&self) -> Result<Arc<SharedState>> {
        let store: Arc<dyn MessageStore> = match (&self.store, &self.config.db_path) {
            (Some(store), _) => Arc::clone(store),
            (None, Some(path)) => {
                tracing::info!("Opening database: {path}");
                Arc::new(SqliteStore::open(path).with_context(|| format!("Failed to open database {path}"))?)
            }
            (None, None) => Arc::new(SqliteStore::open_memory().context("Failed to open in-memory database")?),
        };
        Ok(SharedState::new(self.config.clone(), store))
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);

        if let Some(ref addr) = self.config.web_addr {
            let router = crate::web::router(Arc::clone(&state));
            let web_listener = TcpListener::bind(addr).await?;
            tracing::info!("HTTP/WebSocket listener on {addr}");
            tokio::spawn(async move {
                if let Err(e) = axum::serve(web_listener, router).await {
                    tracing::error!("HTTP server error: {e}");
                }
            });
        }

        accept_loop(listener, state).await
    }

    /// Start both the plain and the HTTP listener for testing.
    /// Returns (plain_addr, web_addr, handle).
    pub async fn start_with_web(self) -> Result<(SocketAddr, SocketAddr, JoinHandle<Result<()>>)> {
        let plain_listener = TcpListener::bind(&self.config.listen_addr).await?;
        let plain_addr = plain_listener.local_addr()?;

        let web_bind = self.config.web_addr.as_deref().unwrap_or("127.0.0.1:0");
        let web_listener = TcpListener::bind(web_bind).await?;
        let web_addr = web_listener.local_addr()?;

        tracing::info!("Plain on {plain_addr}, HTTP on {web_addr}");

        let state = self.build_state()?;
        let router = crate::web::router(Arc::clone(&state));

        let handle = tokio::spawn(async move {
            tokio::spawn(async move {
                if let Err(e) = axum::serve(web_listener, router).await {
                    tracing::error!("HTTP server error: {e}");
                }
            });
            accept_loop(plain_listener, state).await
        });

        Ok((plain_addr, web_addr, handle))
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    loop {
        let (stream, _addr) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = connection::handle(stream, state).await {
                tracing::error!("Connection error: {e}");
            }
        });
    }
}
