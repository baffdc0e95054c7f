use serde::Deserialize;
use std::time::Duration;

/// Complete bus configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub events: EventConfig,
}

/// Federation client and server settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Remote buses to open tunnels to as soon as the bus connects
    #[serde(default)]
    pub urls: Vec<String>,
    /// Maximum tunnels kept per remote url
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Shared secret presented on (and expected by) every tunnel handshake
    #[serde(default = "default_secret")]
    pub secret: String,
    /// Bind address for the federation server (binary only)
    #[serde(default)]
    pub listen: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,
    /// How long `find()` waits for remote buses to answer
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
}

fn default_pool_size() -> usize {
    10
}

fn default_secret() -> String {
    "notsosecret".to_string()
}

fn default_path() -> String {
    "/federate".to_string()
}

fn default_reconnect_delay() -> u64 {
    100
}

fn default_max_reconnect_delay() -> u64 {
    5000
}

fn default_discovery_timeout() -> u64 {
    2000
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            pool_size: default_pool_size(),
            secret: default_secret(),
            listen: None,
            path: default_path(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
            discovery_timeout_ms: default_discovery_timeout(),
        }
    }
}

impl FederationConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms.max(self.reconnect_delay_ms))
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }
}

/// Queue defaults
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// TTL armed on a queue's keys once its last attachment detaches
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Fallback wake-up for consume loops that missed a push notification
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl QueueConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Observer buffer sizing
#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    1024
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl BusConfig {
    /// Overlay environment variables on top of file/default values.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var("FEDBUS_FEDERATION_URLS") {
            self.federation.urls = v
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(v) = std::env::var("FEDBUS_FEDERATION_SECRET") {
            self.federation.secret = v;
        }
        if let Ok(v) = std::env::var("FEDBUS_FEDERATION_LISTEN") {
            if !v.is_empty() {
                self.federation.listen = Some(v);
            }
        }
        if let Ok(v) = std::env::var("FEDBUS_POOL_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                self.federation.pool_size = n;
            }
        }

        self
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<BusConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: BusConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.federation.pool_size, 10);
        assert_eq!(config.federation.secret, "notsosecret");
        assert_eq!(config.federation.path, "/federate");
        assert!(config.federation.urls.is_empty());
        assert_eq!(config.queue.default_ttl_secs, 30);
        assert_eq!(config.events.capacity, 1024);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [federation]
            urls = ["http://bus-a:8080/federate", "ws://bus-b:8080/federate"]
            pool_size = 3
            secret = "s3cret"
            listen = "0.0.0.0:9000"
            reconnect_delay_ms = 50

            [queue]
            default_ttl_secs = 5
            poll_interval_ms = 200

            [events]
            capacity = 64
        "#;

        let config: BusConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.federation.urls.len(), 2);
        assert_eq!(config.federation.pool_size, 3);
        assert_eq!(config.federation.listen.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(config.federation.reconnect_delay(), Duration::from_millis(50));
        assert_eq!(config.queue.default_ttl(), Duration::from_secs(5));
        assert_eq!(config.events.capacity, 64);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [queue]
            default_ttl_secs = 1
        "#;

        let config: BusConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.queue.default_ttl_secs, 1);
        assert_eq!(config.queue.poll_interval_ms, 1000); // Default
        assert_eq!(config.federation.max_reconnect_delay_ms, 5000); // Default
    }

    #[test]
    fn test_max_delay_never_below_base() {
        let config = FederationConfig {
            reconnect_delay_ms: 800,
            max_reconnect_delay_ms: 100,
            ..FederationConfig::default()
        };
        assert_eq!(config.max_reconnect_delay(), Duration::from_millis(800));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[federation]\nsecret = \"from-file\"").unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.federation.secret, "from-file");
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/fedbus.toml").is_err());
    }
}
