//! Client configuration from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use connectsuite_shared::ClientError;
use url::Url;

use crate::storage::Storage;
use crate::ws::ReconnectConfig;

pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";
pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_SEND_PACING_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Auth socket endpoint
    pub ws_url: String,
    /// REST base URL
    pub api_url: String,
    /// Handshake status poll interval
    pub poll_interval: Duration,
    /// Pause between sequential sends in immediate mode
    pub send_pacing: Duration,
    /// Per-request timeout on the socket channel; `None` waits indefinitely
    pub request_timeout: Option<Duration>,
    pub reconnect: ReconnectConfig,
    /// Where the session is persisted; `None` uses the platform config dir
    pub data_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            send_pacing: Duration::from_millis(DEFAULT_SEND_PACING_MS),
            request_timeout: None,
            reconnect: ReconnectConfig::default(),
            data_dir: None,
        }
    }
}

impl ClientConfig {
    /// Read configuration from the process environment.
    ///
    /// Environment variables:
    /// - `CONNECTSUITE_WS_URL` (default: "ws://localhost:8080/ws")
    /// - `CONNECTSUITE_API_URL` (default: "http://localhost:8080")
    /// - `CONNECTSUITE_POLL_INTERVAL_MS` (default: 2000)
    /// - `CONNECTSUITE_SEND_PACING_MS` (default: 500)
    /// - `CONNECTSUITE_REQUEST_TIMEOUT_MS` (default: unset, no timeout)
    /// - `CONNECTSUITE_CONNECT_RETRIES` (default: 0)
    /// - `CONNECTSUITE_DATA_DIR` (default: platform config dir)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an arbitrary variable source.
    /// Unparseable numbers fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let mut reconnect = defaults.reconnect.clone();
        if let Some(retries) = lookup("CONNECTSUITE_CONNECT_RETRIES")
            .and_then(|v| v.trim().parse::<u32>().ok())
        {
            reconnect.max_attempts = retries;
        }

        Self {
            ws_url: lookup("CONNECTSUITE_WS_URL").unwrap_or(defaults.ws_url),
            api_url: lookup("CONNECTSUITE_API_URL").unwrap_or(defaults.api_url),
            poll_interval: millis("CONNECTSUITE_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            send_pacing: millis("CONNECTSUITE_SEND_PACING_MS").unwrap_or(defaults.send_pacing),
            request_timeout: millis("CONNECTSUITE_REQUEST_TIMEOUT_MS"),
            reconnect,
            data_dir: lookup("CONNECTSUITE_DATA_DIR").map(PathBuf::from),
        }
    }

    /// Check that both endpoints parse and use the expected schemes.
    pub fn validate(&self) -> Result<(), ClientError> {
        check_scheme("socket", &self.ws_url, &["ws", "wss"])?;
        check_scheme("API", &self.api_url, &["http", "https"])?;
        if self.poll_interval.is_zero() {
            return Err(ClientError::Validation("poll interval must be positive".into()));
        }
        Ok(())
    }

    /// Storage for the persisted session.
    pub fn storage(&self) -> Option<Storage> {
        match &self.data_dir {
            Some(dir) => Some(Storage::new(dir)),
            None => Storage::platform_default(),
        }
    }
}

fn check_scheme(what: &str, raw: &str, allowed: &[&str]) -> Result<(), ClientError> {
    let url = Url::parse(raw)
        .map_err(|e| ClientError::Validation(format!("invalid {what} URL '{raw}': {e}")))?;
    if !allowed.contains(&url.scheme()) {
        return Err(ClientError::Validation(format!(
            "{what} URL '{raw}' must use one of: {}",
            allowed.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ClientConfig::from_lookup(|_| None);
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.send_pacing, Duration::from_millis(500));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.reconnect.max_attempts, 0);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn overrides_from_environment() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("CONNECTSUITE_WS_URL", "ws://example.test/ws"),
            ("CONNECTSUITE_POLL_INTERVAL_MS", "250"),
            ("CONNECTSUITE_SEND_PACING_MS", "0"),
            ("CONNECTSUITE_REQUEST_TIMEOUT_MS", "5000"),
            ("CONNECTSUITE_CONNECT_RETRIES", "3"),
            ("CONNECTSUITE_DATA_DIR", "/tmp/cs"),
        ]));
        assert_eq!(config.ws_url, "ws://example.test/ws");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.send_pacing, Duration::ZERO);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/cs")));
    }

    #[test]
    fn garbage_numbers_fall_back() {
        let config =
            ClientConfig::from_lookup(lookup_from(&[("CONNECTSUITE_POLL_INTERVAL_MS", "soon")]));
        assert_eq!(config.poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn validate_checks_schemes() {
        assert!(ClientConfig::default().validate().is_ok());

        let swapped = ClientConfig {
            ws_url: DEFAULT_API_URL.into(),
            ..Default::default()
        };
        assert!(matches!(swapped.validate(), Err(ClientError::Validation(_))));

        let broken = ClientConfig {
            api_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(broken.validate(), Err(ClientError::Validation(_))));

        let frozen = ClientConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(frozen.validate().is_err());
    }
}
