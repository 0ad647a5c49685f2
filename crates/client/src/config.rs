//! Client configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use billsync_shared::ProjectId;
use url::Url;

use crate::error::{Result, SyncError};
use crate::sync::ReconnectConfig;

/// Which transports a session uses to reach the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// WebSocket first, SSE once socket retries are exhausted, with
    /// snapshot polling running underneath the whole time.
    #[default]
    Auto,
    WebSocket,
    Sse,
    /// Snapshot polling only.
    Polling,
}

impl TransportMode {
    /// Whether the fixed-interval snapshot poller runs for this mode.
    pub fn polls(self) -> bool {
        matches!(self, TransportMode::Auto | TransportMode::Polling)
    }
}

impl FromStr for TransportMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(TransportMode::Auto),
            "websocket" | "ws" => Ok(TransportMode::WebSocket),
            "sse" => Ok(TransportMode::Sse),
            "polling" | "poll" => Ok(TransportMode::Polling),
            other => Err(SyncError::Config(format!("unknown transport mode `{other}`"))),
        }
    }
}

/// Everything a [`ProjectSyncProvider`](crate::sync::ProjectSyncProvider) needs
/// to reach the billing backend.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend root, e.g. `http://localhost:8080`.
    pub base_url: String,
    /// Bearer credential attached to every request.
    pub auth_token: Option<String>,
    pub transport: TransportMode,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Budget for a single channel-open attempt.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            transport: TransportMode::Auto,
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Read configuration from the process environment.
    ///
    /// Environment variables:
    /// - `BILLSYNC_BASE_URL`: backend root (default: "http://localhost:8080")
    /// - `BILLSYNC_TOKEN`: bearer credential (default: none)
    /// - `BILLSYNC_TRANSPORT`: "auto" | "websocket" | "sse" | "polling" (default: "auto")
    /// - `BILLSYNC_POLL_INTERVAL_MS`, `BILLSYNC_HEARTBEAT_MS`,
    ///   `BILLSYNC_CONNECT_TIMEOUT_MS`, `BILLSYNC_MAX_RECONNECT_ATTEMPTS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(base_url) = lookup("BILLSYNC_BASE_URL") {
            config.base_url = base_url;
        }
        config.auth_token = lookup("BILLSYNC_TOKEN").filter(|t| !t.is_empty());
        if let Some(mode) = lookup("BILLSYNC_TRANSPORT") {
            config.transport = mode.parse()?;
        }
        if let Some(ms) = parse_var(&lookup, "BILLSYNC_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "BILLSYNC_HEARTBEAT_MS")? {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "BILLSYNC_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var(&lookup, "BILLSYNC_MAX_RECONNECT_ATTEMPTS")? {
            config.reconnect.max_attempts = u32::try_from(attempts).map_err(|_| {
                SyncError::Config("BILLSYNC_MAX_RECONNECT_ATTEMPTS is out of range".to_string())
            })?;
        }

        // Fail fast on a base URL we could never connect to.
        Url::parse(&config.base_url)?;
        Ok(config)
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_transport(mut self, transport: TransportMode) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    fn project_path(&self, project_id: &ProjectId, leaf: &str) -> String {
        format!(
            "{}/api/projects/{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(project_id.as_str()),
            leaf
        )
    }

    /// REST endpoint returning the full project view.
    pub fn snapshot_url(&self, project_id: &ProjectId) -> String {
        self.project_path(project_id, "snapshot")
    }

    /// Server-sent event stream for one project.
    pub fn events_url(&self, project_id: &ProjectId) -> String {
        self.project_path(project_id, "events")
    }

    /// Live socket endpoint, with the scheme switched to `ws`/`wss`.
    pub fn ws_url(&self, project_id: &ProjectId) -> Result<Url> {
        let mut url = Url::parse(&self.project_path(project_id, "ws"))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::Config(format!("cannot use {scheme} for {url}")))?;
        Ok(url)
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| SyncError::Config(format!("{key}: {e}")))
        })
        .transpose()
}
