//! Server configuration (CLI flags with environment fallbacks).

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "snappy-server", about = "Real-time chat server")]
pub struct ServerConfig {
    /// Name reported by the health endpoint and in logs.
    #[arg(long, env = "SNAPPY_SERVER_NAME", default_value = "snappy")]
    pub server_name: String,

    /// Address for the plain newline-delimited JSON listener.
    #[arg(long, env = "SNAPPY_LISTEN_ADDR", default_value = "127.0.0.1:5001")]
    pub listen_addr: String,

    /// Address for the HTTP API and `/ws` WebSocket endpoint.
    #[arg(long, env = "SNAPPY_WEB_ADDR", default_value = "127.0.0.1:5000")]
    pub web_addr: Option<String>,

    /// SQLite database path. Without it everything lives in memory.
    #[arg(long, env = "SNAPPY_DB_PATH")]
    pub db_path: Option<String>,

    /// Outbound events queued per connection before it is considered stuck.
    #[arg(long, env = "SNAPPY_SEND_BUFFER", default_value_t = 1024)]
    pub send_buffer: usize,

    /// Longest inbound frame accepted, in bytes.
    #[arg(long, env = "SNAPPY_MAX_LINE_LEN", default_value_t = 16 * 1024)]
    pub max_line_len: usize,

    /// How often an idle connection wakes up to check whether it was evicted,
    /// in milliseconds.
    #[arg(long, env = "SNAPPY_IDLE_CHECK_MS", default_value_t = 30_000)]
    pub idle_check_ms: u64,

    /// Sustained events per second a registered session may emit.
    #[arg(long, env = "SNAPPY_RATE_LIMIT", default_value_t = 20.0)]
    pub rate_limit: f64,

    /// Default and maximum page size for history queries.
    #[arg(long, env = "SNAPPY_HISTORY_LIMIT", default_value_t = 50)]
    pub history_limit: usize,

    /// Allowed browser origins for the HTTP API. Empty allows any origin.
    #[arg(long = "cors-origin", env = "SNAPPY_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

/// Embedded defaults: in-memory store, no HTTP listener, ephemeral port.
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "snappy".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            web_addr: None,
            db_path: None,
            send_buffer: 1024,
            max_line_len: 16 * 1024,
            idle_check_ms: 30_000,
            rate_limit: 20.0,
            history_limit: 50,
            cors_origins: Vec::new(),
        }
    }
}
