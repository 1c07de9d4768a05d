use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(8);
const DEFAULT_GROUP_POLL_PROBABILITY: f64 = 0.25;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Database file; `None` runs on the in-memory backend.
    pub db_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".parse().unwrap(),
            db_path: Some("notewire.redb".to_string()),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(bind) = std::env::var("NOTEWIRE_BIND") {
            if let Ok(addr) = bind.parse() {
                cfg.bind = addr;
            }
        }
        if let Ok(path) = std::env::var("NOTEWIRE_DB") {
            cfg.db_path = if path.is_empty() { None } else { Some(path) };
        }
        cfg
    }
}

/// Client sync agent tuning.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// HTTP base, e.g. `http://127.0.0.1:3000`.
    pub base_url: String,
    /// Realtime channel endpoint, e.g. `ws://127.0.0.1:3000/ws`.
    pub ws_url: String,
    /// Fallback poll period while the realtime channel is down.
    pub poll_interval: Duration,
    /// Chance that a fallback tick also refreshes groups; groups change far
    /// less often than notes, so staleness is traded for load.
    pub group_poll_probability: f64,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// `None` retries forever. With `Some(n)` the realtime channel gives up
    /// after n failures and the agent lives on polling alone.
    pub max_reconnect_attempts: Option<u32>,
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let ws_url = format!(
            "{}/ws",
            base_url
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1)
        );
        Self {
            base_url,
            ws_url,
            poll_interval: DEFAULT_POLL_INTERVAL,
            group_poll_probability: DEFAULT_GROUP_POLL_PROBABILITY,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: None,
        }
    }
}
