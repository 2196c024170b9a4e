use crate::stats::StopPolicy;
use crate::waves::LastWave;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub target: TargetConfig,
    pub load: LoadConfig,
    pub transport: TransportConfig,
    pub stats: StatsConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Reject settings the run cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.load.rps == 0 {
            anyhow::bail!("load.rps must be greater than zero");
        }
        if self.transport.max_idle_conns == 0 || self.transport.max_idle_conns_per_host == 0 {
            anyhow::bail!("transport pool limits must be greater than zero");
        }
        if self.stats.channel_capacity == 0 {
            anyhow::bail!("stats.channel_capacity must be greater than zero");
        }

        let url = url::Url::parse(&self.target.url)
            .map_err(|e| anyhow::anyhow!("Invalid target.url {}: {e}", self.target.url))?;
        match (url.scheme(), self.transport.kind) {
            ("http", TransportKind::Http1 | TransportKind::H2c) => {}
            ("https", TransportKind::Tls) => {}
            (scheme, kind) => anyhow::bail!(
                "target.url scheme {scheme} does not match transport kind {}",
                kind.as_str()
            ),
        }
        if url.host_str().is_none() {
            anyhow::bail!("target.url must include a host (got {})", self.target.url);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Every request is a POST to this URL
    pub url: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/".to_string(),
            timeout_ms: 10 * 60 * 1000,
        }
    }
}

impl TargetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Requests per wave
    pub rps: u64,
    /// Requests over the whole run
    pub total: u64,
    /// Pause between waves in milliseconds
    pub interval_ms: u64,
    pub last_wave: LastWave,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            rps: 100,
            total: 100,
            interval_ms: 0,
            last_wave: LastWave::default(),
        }
    }
}

impl LoadConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// HTTP/1.1 over plain TCP
    #[default]
    Http1,
    /// HTTP/2 with prior knowledge over plain TCP
    H2c,
    /// HTTPS; HTTP/2 only if negotiated through ALPN
    Tls,
}

impl TransportKind {
    pub fn from_flags(http2: bool, tls: bool) -> Self {
        match (http2, tls) {
            (_, true) => TransportKind::Tls,
            (true, false) => TransportKind::H2c,
            (false, false) => TransportKind::Http1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http1 => "http1",
            TransportKind::H2c => "h2c",
            TransportKind::Tls => "tls",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub tls: TlsConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            max_idle_conns: 100,
            max_idle_conns_per_host: 2,
            idle_timeout_ms: 90_000,
            connect_timeout_ms: 30_000,
            tls: TlsConfig::default(),
        }
    }
}

impl TransportConfig {
    /// hyper-util only pools per host. With a single target the global cap
    /// bounds the per-host one as well, so the smaller of the two wins.
    pub fn idle_per_host(&self) -> usize {
        self.max_idle_conns.min(self.max_idle_conns_per_host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Verify the server certificate chain and hostname
    pub verify: bool,
    /// Extra PEM bundle to trust on top of the webpki roots
    pub ca_file: Option<PathBuf>,
    /// Offer h2 through ALPN
    pub http2: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            ca_file: None,
            http2: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub channel_capacity: usize,
    pub stop_policy: StopPolicy,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::stats::DEFAULT_CHANNEL_CAPACITY,
            stop_policy: StopPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() {
        let config_str = r#"
[target]
url = "https://localhost:8443/"

[load]
rps = 10
total = 25
interval_ms = 250
last_wave = "trim"

[transport]
kind = "tls"
max_idle_conns = 50
max_idle_conns_per_host = 8

[transport.tls]
verify = false
http2 = true

[stats]
stop_policy = "drain"
        "#;

        let config: Config = toml::from_str(config_str).unwrap();
        assert_eq!(config.target.url, "https://localhost:8443/");
        assert_eq!(config.target.timeout_ms, 600_000);
        assert_eq!(config.load.rps, 10);
        assert_eq!(config.load.total, 25);
        assert_eq!(config.load.interval(), Duration::from_millis(250));
        assert_eq!(config.load.last_wave, LastWave::Trim);
        assert_eq!(config.transport.kind, TransportKind::Tls);
        assert_eq!(config.transport.idle_per_host(), 8);
        assert_eq!(config.transport.idle_timeout_ms, 90_000);
        assert!(!config.transport.tls.verify);
        assert!(config.transport.tls.http2);
        assert_eq!(config.stats.channel_capacity, 1000);
        assert_eq!(config.stats.stop_policy, StopPolicy::Drain);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults_match_legacy_flags() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.load.rps, 100);
        assert_eq!(config.load.total, 100);
        assert_eq!(config.load.interval_ms, 0);
        assert_eq!(config.load.last_wave, LastWave::Overshoot);
        assert_eq!(config.transport.kind, TransportKind::Http1);
        assert_eq!(config.transport.max_idle_conns, 100);
        assert_eq!(config.transport.max_idle_conns_per_host, 2);
        assert_eq!(config.stats.stop_policy, StopPolicy::Discard);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = Config::default();
        config.load.rps = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.kind = TransportKind::Tls;
        assert!(config.validate().is_err(), "http:// url with tls transport");

        let mut config = Config::default();
        config.target.url = "ftp://localhost/".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.max_idle_conns_per_host = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_kind_from_flags() {
        assert_eq!(TransportKind::from_flags(false, false), TransportKind::Http1);
        assert_eq!(TransportKind::from_flags(true, false), TransportKind::H2c);
        assert_eq!(TransportKind::from_flags(true, true), TransportKind::Tls);
        assert_eq!(TransportKind::from_flags(false, true), TransportKind::Tls);
    }
}
