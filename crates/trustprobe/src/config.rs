//! Harness configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (TRUSTPROBE_*)
//! 2. Config file (trustprobe.toml)
//! 3. Default values

use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use trustprobe_harness::backoff::{DEFAULT_BASE_INTERVAL, DEFAULT_MAX_ATTEMPTS};
use trustprobe_harness::probe::DEFAULT_REQUEST_TIMEOUT;
use trustprobe_harness::registry_client::DEFAULT_PING_TIMEOUT;
use trustprobe_harness::{BackoffSchedule, TlsMaterial};

/// Environment variable prefix
const ENV_PREFIX: &str = "TRUSTPROBE";

/// Harness configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub probe: ProbeSection,
    pub server: ServerSection,
    pub client: ClientSection,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ProbeSection {
    /// Host the probe connects to (default "localhost")
    pub host: Option<String>,
    /// Delay before the second attempt, doubled for each later one
    pub base_interval_ms: Option<u64>,
    /// Attempts including the first
    pub max_attempts: Option<u32>,
    /// Deadline for a single request
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address (default 127.0.0.1:0)
    pub bind: Option<String>,
    /// Certificate PEM file; TLS is enabled when both cert and key are set
    #[serde(alias = "cert_path")]
    pub cert: Option<PathBuf>,
    /// Private key PEM file
    #[serde(alias = "key_path")]
    pub key: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientSection {
    /// Deadline for a registry ping
    pub timeout_ms: Option<u64>,
}

/// Configuration with every value decided
#[derive(Debug)]
pub struct ResolvedConfig {
    pub probe_host: String,
    pub schedule: BackoffSchedule,
    pub request_timeout: Duration,
    pub bind_addr: SocketAddr,
    pub tls: Option<TlsMaterial>,
    pub client_timeout: Duration,
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Option<T>> {
    match lookup(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid value for {}_{}: {}", ENV_PREFIX, name, value)),
        None => Ok(None),
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::debug!("No config file at {}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Resolve against the process environment
    pub fn resolve(self) -> anyhow::Result<ResolvedConfig> {
        self.resolve_with(|name| env::var(format!("{}_{}", ENV_PREFIX, name)).ok())
    }

    /// Resolve with `lookup` returning the value of `TRUSTPROBE_<name>`
    pub fn resolve_with(self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<ResolvedConfig> {
        let probe_host = lookup("PROBE_HOST")
            .or(self.probe.host)
            .unwrap_or_else(|| "localhost".to_string());

        let base_interval = parse_env::<u64>(&lookup, "BASE_INTERVAL_MS")?
            .or(self.probe.base_interval_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BASE_INTERVAL);
        let max_attempts = parse_env::<u32>(&lookup, "MAX_ATTEMPTS")?
            .or(self.probe.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }

        let request_timeout = parse_env::<u64>(&lookup, "REQUEST_TIMEOUT_MS")?
            .or(self.probe.request_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let bind_addr = match lookup("BIND").or(self.server.bind) {
            Some(bind) => bind
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", bind, e))?,
            None => SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        };

        let cert = lookup("CERT").map(PathBuf::from).or(self.server.cert);
        let key = lookup("KEY").map(PathBuf::from).or(self.server.key);
        let tls = match (cert, key) {
            (Some(cert_path), Some(key_path)) => Some(TlsMaterial::files(cert_path, key_path)),
            (None, None) => None,
            _ => anyhow::bail!(
                "TLS needs both a certificate and a key. Set {0}_CERT and {0}_KEY, or server.cert and server.key",
                ENV_PREFIX
            ),
        };

        let client_timeout = parse_env::<u64>(&lookup, "CLIENT_TIMEOUT_MS")?
            .or(self.client.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PING_TIMEOUT);

        Ok(ResolvedConfig {
            probe_host,
            schedule: BackoffSchedule::new(base_interval, max_attempts),
            request_timeout,
            bind_addr,
            tls,
            client_timeout,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedConfig> {
        Self::load(path)?.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "TRUSTPROBE");
    }

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default().resolve_with(no_env).unwrap();

        assert_eq!(config.probe_host, "localhost");
        assert_eq!(config.schedule, BackoffSchedule::default());
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(config.bind_addr, "127.0.0.1:0".parse().unwrap());
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_file_values() {
        let config: HarnessConfig = toml::from_str(
            r#"
            [probe]
            host = "127.0.0.1"
            base_interval_ms = 100
            max_attempts = 3

            [server]
            cert_path = "/tmp/test-tls.crt"
            key_path = "/tmp/test-tls.key"
            "#,
        )
        .unwrap();
        let resolved = config.resolve_with(no_env).unwrap();

        assert_eq!(resolved.probe_host, "127.0.0.1");
        assert_eq!(
            resolved.schedule,
            BackoffSchedule::new(Duration::from_millis(100), 3)
        );
        assert_eq!(
            resolved.tls,
            Some(TlsMaterial::files("/tmp/test-tls.crt", "/tmp/test-tls.key"))
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let config: HarnessConfig = toml::from_str("[probe]\nmax_attempts = 3\n").unwrap();
        let resolved = config
            .resolve_with(|name| (name == "MAX_ATTEMPTS").then(|| "9".to_string()))
            .unwrap();

        assert_eq!(resolved.schedule.max_attempts(), 9);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = HarnessConfig::default()
            .resolve_with(|name| (name == "BASE_INTERVAL_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("TRUSTPROBE_BASE_INTERVAL_MS"));
    }

    #[test]
    fn test_cert_without_key() {
        let config: HarnessConfig = toml::from_str("[server]\ncert = \"/tmp/a.crt\"\n").unwrap();
        assert!(config.resolve_with(no_env).is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config: HarnessConfig = toml::from_str("[probe]\nmax_attempts = 0\n").unwrap();
        assert!(config.resolve_with(no_env).is_err());
    }
}
