use serde::Deserialize;
use std::time::Duration;

/// Server settings, read from the environment (and `.env` if present).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    /// IP literal or hostname (`localhost` resolves at bind time).
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the contact-form frontend proxies `/api` to.
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Upper bound on JSON request bodies.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Fallback filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_concurrency_limit() -> usize {
    100
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env::<Config>()
    }

    /// Bind target for `TcpListener::bind`, which resolves hostnames.
    pub fn bind_addr(&self) -> (&str, u16) {
        (&self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            concurrency_limit: default_concurrency_limit(),
            max_body_bytes: default_max_body_bytes(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config: Config = envy::from_iter(vars(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.bind_addr(), ("127.0.0.1", 5000));
    }

    #[test]
    fn reads_overrides() {
        let config: Config = envy::from_iter(vars(&[
            ("HOST", "0.0.0.0"),
            ("PORT", "8080"),
            ("MAX_BODY_BYTES", "1024"),
            ("REQUEST_TIMEOUT_SECS", "5"),
            ("LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr(), ("0.0.0.0", 8080));
        assert_eq!(config.max_body_bytes, 1024);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.concurrency_limit, 100);
    }

    #[test]
    fn accepts_hostname_for_host() {
        let config: Config = envy::from_iter(vars(&[("HOST", "localhost")])).unwrap();
        assert_eq!(config.bind_addr(), ("localhost", 5000));
    }

    #[tokio::test]
    async fn hostname_binds_through_resolution() {
        let config = Config {
            host: "localhost".to_string(),
            port: 0,
            ..Config::default()
        };
        let listener = tokio::net::TcpListener::bind(config.bind_addr()).await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }

    #[test]
    fn rejects_non_numeric_port() {
        let result: Result<Config, _> = envy::from_iter(vars(&[("PORT", "five-thousand")]));
        assert!(result.is_err());
    }
}
