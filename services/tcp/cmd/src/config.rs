//! Configuration handling for the TCP service.
//!
//! Values come from the shared YAML config file first, then `REDB_TCP_*`
//! environment variables, then command line flags (applied in `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tcp_server::{Binding, ServerLimits};
use tcp_session::{ClientTlsOptions, TlsCertificate};
use tracing::{info, warn};

/// TCP service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Host name announced in greetings
    pub host_name: String,
    /// Listening points
    pub bindings: Vec<BindingConfig>,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Certificate files
    pub tls: TlsConfig,
}

/// One listening point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    /// Address to bind, e.g. 0.0.0.0
    pub address: IpAddr,
    /// Port to bind
    pub port: u16,
    /// Require TLS from the first byte
    #[serde(default)]
    pub tls: bool,
    /// Host name for this binding; falls back to the service host name
    #[serde(default)]
    pub host_name: Option<String>,
}

/// Connection limits; durations use humantime syntax ("100s", "2m")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent sessions; 0 is unlimited
    pub max_connections: usize,
    /// Maximum concurrent sessions per remote IP; 0 is unlimited
    pub max_connections_per_ip: usize,
    /// Idle timeout; "0s" disables the sweep
    pub session_idle_timeout: String,
    /// Acceptors per listening socket
    pub acceptors_per_socket: usize,
    /// Idle sweep period
    pub sweep_interval: String,
}

/// TLS files
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to the certificate chain (PEM)
    pub cert_file: Option<PathBuf>,
    /// Path to the private key (PEM)
    pub key_file: Option<PathBuf>,
    /// Path to extra trusted CA certificates for client sessions (PEM)
    pub ca_file: Option<PathBuf>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let defaults = ServerLimits::default();
        Self {
            max_connections: defaults.max_connections,
            max_connections_per_ip: defaults.max_connections_per_ip,
            session_idle_timeout: humantime::format_duration(defaults.session_idle_timeout)
                .to_string(),
            acceptors_per_socket: defaults.acceptors_per_socket,
            sweep_interval: humantime::format_duration(defaults.sweep_interval).to_string(),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            bindings: vec![BindingConfig {
                address: IpAddr::from([127, 0, 0, 1]),
                port: 2525,
                tls: false,
                host_name: None,
            }],
            limits: LimitsConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    tcp: Option<TcpConfig>,
}

impl TcpConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    info!("Loaded configuration from {:?}", path);
                    root.services.and_then(|s| s.tcp).unwrap_or_default()
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides();
        info!(
            "Final tcp configuration: host_name={}, bindings={}, max_connections={}, idle_timeout={}",
            config.host_name,
            config.bindings.len(),
            config.limits.max_connections,
            config.limits.session_idle_timeout
        );
        Ok(config)
    }

    /// Apply `REDB_TCP_*` overrides from the process environment
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "REDB_TCP_HOST_NAME" => {
                    info!("Host name overridden by environment: {}", value);
                    self.host_name = value;
                }
                "REDB_TCP_MAX_CONNECTIONS" => match value.parse() {
                    Ok(max) => self.limits.max_connections = max,
                    Err(_) => warn!("Ignoring invalid REDB_TCP_MAX_CONNECTIONS: {}", value),
                },
                "REDB_TCP_MAX_CONNECTIONS_PER_IP" => match value.parse() {
                    Ok(max) => self.limits.max_connections_per_ip = max,
                    Err(_) => warn!("Ignoring invalid REDB_TCP_MAX_CONNECTIONS_PER_IP: {}", value),
                },
                "REDB_TCP_IDLE_TIMEOUT" => self.limits.session_idle_timeout = value,
                "REDB_TCP_CERT_FILE" => self.tls.cert_file = Some(PathBuf::from(value)),
                "REDB_TCP_KEY_FILE" => self.tls.key_file = Some(PathBuf::from(value)),
                "REDB_TCP_CA_FILE" => self.tls.ca_file = Some(PathBuf::from(value)),
                _ => {}
            }
        }
    }

    /// Server limits with durations parsed
    pub fn server_limits(&self) -> Result<ServerLimits> {
        let limits = ServerLimits {
            max_connections: self.limits.max_connections,
            max_connections_per_ip: self.limits.max_connections_per_ip,
            session_idle_timeout: parse_duration(&self.limits.session_idle_timeout)
                .context("invalid session_idle_timeout")?,
            acceptors_per_socket: self.limits.acceptors_per_socket,
            sweep_interval: parse_duration(&self.limits.sweep_interval)
                .context("invalid sweep_interval")?,
            ..ServerLimits::default()
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Server certificate, when both files are configured
    pub fn certificate(&self) -> Result<Option<TlsCertificate>> {
        match (&self.tls.cert_file, &self.tls.key_file) {
            (Some(cert), Some(key)) => {
                let certificate = TlsCertificate::from_pem_files(cert, key)
                    .with_context(|| format!("failed to load certificate {:?}", cert))?;
                Ok(Some(certificate))
            }
            (None, None) => Ok(None),
            _ => anyhow::bail!("tls.cert_file and tls.key_file must be set together"),
        }
    }

    /// Server bindings. Every binding gets the certificate so plaintext
    /// bindings can offer STARTTLS.
    pub fn server_bindings(&self) -> Result<Vec<Binding>> {
        let certificate = self.certificate()?;
        self.bindings
            .iter()
            .map(|b| {
                let host_name = b.host_name.clone().unwrap_or_else(|| self.host_name.clone());
                let binding = Binding::new(b.address, b.port).with_host_name(host_name);
                match (&certificate, b.tls) {
                    (Some(cert), true) => Ok(binding.with_tls(cert.clone())),
                    (Some(cert), false) => Ok(binding.with_certificate(cert.clone())),
                    (None, true) => anyhow::bail!(
                        "binding {}:{} requires tls but no certificate is configured",
                        b.address,
                        b.port
                    ),
                    (None, false) => Ok(binding),
                }
            })
            .collect()
    }

    /// TLS options for client sessions
    pub fn client_tls(&self) -> Result<ClientTlsOptions> {
        let options = ClientTlsOptions::default();
        match &self.tls.ca_file {
            Some(path) => {
                let pem = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read CA file {:?}", path))?;
                Ok(options.with_pem_roots(&pem)?)
            }
            None => Ok(options),
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim()).with_context(|| format!("bad duration {:?}", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = TcpConfig::default();
        assert_eq!(config.host_name, "localhost");
        assert_eq!(config.bindings.len(), 1);
        assert_eq!(config.bindings[0].port, 2525);

        let limits = config.server_limits().unwrap();
        assert_eq!(limits, ServerLimits::default());
        assert!(config.certificate().unwrap().is_none());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  tcp:
    host_name: mx.test
    bindings:
      - address: 0.0.0.0
        port: 2525
      - address: "::1"
        port: 4650
        host_name: secure.test
    limits:
      max_connections: 50
      max_connections_per_ip: 5
      session_idle_timeout: 2m
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = TcpConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.host_name, "mx.test");
        assert_eq!(config.bindings.len(), 2);

        let limits = config.server_limits().unwrap();
        assert_eq!(limits.max_connections, 50);
        assert_eq!(limits.max_connections_per_ip, 5);
        assert_eq!(limits.session_idle_timeout, Duration::from_secs(120));
        assert_eq!(limits.sweep_interval, Duration::from_secs(30));

        let bindings = config.server_bindings().unwrap();
        assert_eq!(bindings[0].host_name(), "mx.test");
        assert_eq!(bindings[1].host_name(), "secure.test");
        assert!(bindings[1].ip().is_ipv6());
    }

    #[test]
    fn test_missing_or_invalid_file_uses_defaults() {
        let missing = TcpConfig::load_from_file("/nonexistent/redb-tcp.yaml").unwrap();
        assert_eq!(missing.bindings, TcpConfig::default().bindings);

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"services: [not, a, map").unwrap();
        let invalid = TcpConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(invalid.limits, LimitsConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = TcpConfig::default();
        config.apply_overrides(vec![
            ("REDB_TCP_HOST_NAME".to_string(), "env.test".to_string()),
            ("REDB_TCP_MAX_CONNECTIONS".to_string(), "7".to_string()),
            ("REDB_TCP_MAX_CONNECTIONS_PER_IP".to_string(), "many".to_string()),
            ("REDB_TCP_IDLE_TIMEOUT".to_string(), "0s".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        assert_eq!(config.host_name, "env.test");
        assert_eq!(config.limits.max_connections, 7);
        assert_eq!(config.limits.max_connections_per_ip, 0);
        assert!(config.server_limits().unwrap().session_idle_timeout.is_zero());
    }

    #[test]
    fn test_tls_binding_requires_certificate() {
        let mut config = TcpConfig::default();
        config.bindings[0].tls = true;
        assert!(config.server_bindings().is_err());

        config.tls.cert_file = Some(PathBuf::from("cert.pem"));
        assert!(config.certificate().is_err());
    }

    #[test]
    fn test_invalid_limits_are_rejected() {
        let mut config = TcpConfig::default();
        config.limits.acceptors_per_socket = 0;
        assert!(config.server_limits().is_err());

        let mut config = TcpConfig::default();
        config.limits.sweep_interval = "soon".to_string();
        assert!(config.server_limits().is_err());
    }
}
