use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::addr::HostMatcher;
use crate::{DUPLICATE_INTERVAL, REQUEST_RETRY_COUNT, REQUEST_RETRY_INTERVAL};

pub const RETRY_COUNT_MAX: u8 = 10;
pub const RETRY_INTERVAL_MAX: u8 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub transport: TransportSection,
    #[serde(default)]
    pub clients: Vec<ClientSection>,
    #[serde(default)]
    pub servers: Vec<ServerSection>,
    #[serde(default)]
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportSection {
    pub listen_addrs: Vec<SocketAddr>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u8,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u8,
    #[serde(default = "default_duplicate_interval_secs")]
    pub duplicate_interval_secs: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    pub name: String,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_listen_addr(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_retry_count() -> u8 {
    REQUEST_RETRY_COUNT
}

fn default_retry_interval_secs() -> u8 {
    REQUEST_RETRY_INTERVAL
}

fn default_duplicate_interval_secs() -> u8 {
    DUPLICATE_INTERVAL
}

fn default_metrics_listen_addr() -> SocketAddr {
    "127.0.0.1:9300".parse().expect("static metrics addr")
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        let cfg = Self::from_toml(&raw).with_context(|| "invalid config file")?;
        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.transport.listen_addrs.is_empty() && !self.clients.is_empty() {
            bail!("transport.listen_addrs must name at least one address when clients are configured");
        }
        if self.transport.idle_timeout_secs == 0 {
            bail!("transport.idle_timeout_secs must be > 0");
        }
        if self.transport.retry_count > RETRY_COUNT_MAX {
            bail!(
                "transport.retry_count must be <= {RETRY_COUNT_MAX}, got {}",
                self.transport.retry_count
            );
        }
        if self.transport.retry_interval_secs == 0
            || self.transport.retry_interval_secs > RETRY_INTERVAL_MAX
        {
            bail!(
                "transport.retry_interval_secs must be in 1..={RETRY_INTERVAL_MAX}, got {}",
                self.transport.retry_interval_secs
            );
        }

        for client in &self.clients {
            if client.name.is_empty() {
                bail!("client entries must be named");
            }
            HostMatcher::parse(&client.host)
                .with_context(|| format!("client {:?} host", client.name))?;
        }

        for server in &self.servers {
            if server.name.is_empty() {
                bail!("server entries must be named");
            }
            if server.host.is_empty() {
                bail!("server {:?} must name a host", server.name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_config() -> &'static str {
        r#"
[transport]
listen_addrs = ["127.0.0.1:1812"]
source = "0.0.0.0"
idle_timeout_secs = 60
retry_count = 2
retry_interval_secs = 5
duplicate_interval_secs = 60

[[clients]]
name = "lab"
host = "10.0.0.0/24"

[[clients]]
name = "nas1"
host = "192.0.2.9"

[[servers]]
name = "upstream1"
host = "10.0.0.7:1812"
source = "192.0.2.1"

[[servers]]
name = "upstream2"
host = "10.0.0.8:1812"
source = "192.0.2.1"

[metrics]
enabled = true
listen_addr = "127.0.0.1:9300"
"#
    }

    #[test]
    fn parse_valid_config() {
        let parsed = Config::from_toml(good_config()).expect("config should parse");
        assert_eq!(parsed.transport.listen_addrs.len(), 1);
        assert_eq!(parsed.transport.idle_timeout_secs, 60);
        assert_eq!(parsed.clients.len(), 2);
        assert_eq!(parsed.servers.len(), 2);
        assert_eq!(parsed.servers[0].source.as_deref(), Some("192.0.2.1"));
        assert!(parsed.metrics.enabled);
    }

    #[test]
    fn defaults_follow_the_protocol_record() {
        let cfg = r#"
[transport]
listen_addrs = ["127.0.0.1:1812"]
"#;
        let parsed = Config::from_toml(cfg).expect("config should parse");
        assert_eq!(parsed.transport.idle_timeout_secs, 60);
        assert_eq!(parsed.transport.retry_count, REQUEST_RETRY_COUNT);
        assert_eq!(parsed.transport.retry_interval_secs, REQUEST_RETRY_INTERVAL);
        assert_eq!(parsed.transport.duplicate_interval_secs, DUPLICATE_INTERVAL);
        assert!(!parsed.metrics.enabled);
    }

    #[test]
    fn reject_retry_count_over_protocol_maximum() {
        let cfg = good_config().replace("retry_count = 2", "retry_count = 11");
        let err = Config::from_toml(&cfg).expect_err("should fail validation");
        assert!(err.to_string().contains("retry_count"), "unexpected error: {err}");
    }

    #[test]
    fn reject_bad_client_host() {
        let cfg = good_config().replace("host = \"10.0.0.0/24\"", "host = \"10.0.0.0/40\"");
        let err = Config::from_toml(&cfg).expect_err("should fail validation");
        assert!(err.to_string().contains("lab"), "unexpected error: {err}");
    }

    #[test]
    fn reject_zero_idle_timeout() {
        let cfg = good_config().replace("idle_timeout_secs = 60", "idle_timeout_secs = 0");
        assert!(Config::from_toml(&cfg).is_err());
    }
}
