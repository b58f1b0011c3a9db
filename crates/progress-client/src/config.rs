// crates/progress-client/src/config.rs
//! Client configuration.
//!
//! Defaults come from the environment so the CLI and tests can point the
//! client at another deployment without code changes:
//! - `TODO_API_BASE_URL`: REST base, default `http://localhost:5000/api`
//! - `TODO_HUB_URL`: push hub, derived from the API base when unset

use std::time::Duration;

use reqwest::Url;

use crate::error::ConfigError;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";
/// Hub path relative to the service root.
pub const HUB_PATH: &str = "/hubs/todo-progress";

/// Configuration for the push channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Time allowed for the socket connect plus protocol handshake.
    pub handshake_timeout: Duration,
    /// How often the client pings the hub.
    pub keep_alive_interval: Duration,
    /// Silence from the hub longer than this counts as a dropped connection.
    pub server_timeout: Duration,
    /// A group join or leave with no completion after this long fails.
    pub invocation_timeout: Duration,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            invocation_timeout: Duration::from_secs(15),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: None,
        }
    }
}

/// Configuration for job trackers.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Delay between a terminal state and leaving the job's group, so a
    /// trailing duplicate event lands on a still-registered handler.
    pub dispose_grace: Duration,
    /// Raise the stall flag when no event arrived this long after joining.
    /// `None` disables the flag.
    pub stall_warning_after: Option<Duration>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            dispose_grace: Duration::from_secs(2),
            stall_warning_after: Some(Duration::from_secs(30)),
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub hub_url: String,
    pub channel: ChannelConfig,
    pub tracker: TrackerConfig,
}

impl ClientConfig {
    /// Build a config for the given API base, deriving the hub URL.
    pub fn new(api_base_url: impl Into<String>) -> Result<Self, ConfigError> {
        let api_base_url = normalize_base(api_base_url.into());
        let hub_url = derive_hub_url(&api_base_url)?;
        Ok(Self {
            api_base_url,
            hub_url,
            channel: ChannelConfig::default(),
            tracker: TrackerConfig::default(),
        })
    }

    /// Read `TODO_API_BASE_URL` / `TODO_HUB_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base = std::env::var("TODO_API_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let mut config = Self::new(api_base)?;
        if let Some(hub) = std::env::var("TODO_HUB_URL").ok().filter(|v| !v.trim().is_empty()) {
            config = config.with_hub_url(hub)?;
        }
        Ok(config)
    }

    /// Override the hub URL. `http(s)` schemes are mapped to `ws(s)`.
    pub fn with_hub_url(mut self, hub_url: impl Into<String>) -> Result<Self, ConfigError> {
        let hub_url = hub_url.into();
        let mut url = Url::parse(&hub_url).map_err(|e| ConfigError::InvalidUrl {
            url: hub_url.clone(),
            reason: e.to_string(),
        })?;
        to_ws_scheme(&mut url)?;
        self.hub_url = url.to_string();
        Ok(self)
    }
}

fn normalize_base(base: String) -> String {
    base.trim_end_matches('/').to_string()
}

/// `http://host:5000/api` → `ws://host:5000/hubs/todo-progress`.
pub fn derive_hub_url(api_base_url: &str) -> Result<String, ConfigError> {
    let mut url = Url::parse(api_base_url).map_err(|e| ConfigError::InvalidUrl {
        url: api_base_url.to_string(),
        reason: e.to_string(),
    })?;
    let root = url.path().trim_end_matches('/');
    let root = root.strip_suffix("/api").unwrap_or(root).to_string();
    url.set_path(&format!("{root}{HUB_PATH}"));
    url.set_query(None);
    to_ws_scheme(&mut url)?;
    Ok(url.to_string())
}

fn to_ws_scheme(url: &mut Url) -> Result<(), ConfigError> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConfigError::UnsupportedScheme {
                url: url.to_string(),
                scheme: other.to_string(),
            })
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ConfigError::UnsupportedScheme {
            url: url.to_string(),
            scheme: scheme.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_hub_url_strips_api_suffix() {
        assert_eq!(
            derive_hub_url("http://localhost:5000/api").unwrap(),
            "ws://localhost:5000/hubs/todo-progress"
        );
        assert_eq!(
            derive_hub_url("https://todo.example.com/backend/api/").unwrap(),
            "wss://todo.example.com/backend/hubs/todo-progress"
        );
        assert_eq!(
            derive_hub_url("http://127.0.0.1:8080").unwrap(),
            "ws://127.0.0.1:8080/hubs/todo-progress"
        );
    }

    #[test]
    fn test_derive_hub_url_rejects_bad_input() {
        assert!(matches!(
            derive_hub_url("not a url"),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            derive_hub_url("ftp://files.example.com/api"),
            Err(ConfigError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn test_client_config_new() {
        let config = ClientConfig::new("http://localhost:5000/api/").unwrap();
        assert_eq!(config.api_base_url, "http://localhost:5000/api");
        assert_eq!(config.hub_url, "ws://localhost:5000/hubs/todo-progress");
        assert_eq!(config.channel.max_reconnect_delay, Duration::from_secs(30));
        assert!(config.channel.max_reconnect_attempts.is_none());
    }

    #[test]
    fn test_hub_url_override_maps_scheme() {
        let config = ClientConfig::new("http://localhost:5000/api")
            .unwrap()
            .with_hub_url("https://push.example.com/hubs/todo-progress")
            .unwrap();
        assert_eq!(config.hub_url, "wss://push.example.com/hubs/todo-progress");
    }
}
