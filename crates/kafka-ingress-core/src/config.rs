//! Configuration types for the Kafka ingress server.
//!
//! Configuration is loaded from YAML files and validated before use.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::admission::conn_rate::SubnetOverride;
use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the ingress server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngressConfig {
    /// Listening endpoints. Each gets its own accept loop.
    pub listeners: Vec<ListenerConfig>,

    /// Socket options applied to every accepted connection.
    #[serde(default)]
    pub socket: SocketConfig,

    /// Connection and request admission control.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A single listening endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// Listener name, reported with every connection accepted on it.
    pub name: String,

    /// Address to bind to, e.g., "0.0.0.0:9092".
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Whether clients must authenticate with SASL before other requests.
    #[serde(default)]
    pub sasl: bool,

    /// TLS settings. Plaintext when absent.
    #[serde(default)]
    pub tls: Option<ServerTlsConfig>,
}

impl ListenerConfig {
    /// Plaintext listener without authentication.
    #[must_use]
    pub fn plaintext(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            sasl: false,
            tls: None,
        }
    }

    /// Parse the bind address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not a valid `host:port`.
    pub fn socket_addr(&self) -> ConfigResult<SocketAddr> {
        self.address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))
    }
}

/// TLS configuration for inbound client connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerTlsConfig {
    /// Path to the server certificate chain (PEM).
    /// Supports environment variable expansion: "${TLS_DIR}/server.crt"
    pub cert_path: PathBuf,

    /// Path to the server private key (PEM).
    pub key_path: PathBuf,

    /// CA used to verify client certificates. Client certs are verified
    /// when presented if this is set.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Reject clients that do not present a certificate.
    #[serde(default)]
    pub require_client_cert: bool,

    /// Maximum time allowed for the TLS handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl ServerTlsConfig {
    /// Copy of this config with environment variables expanded in every path.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced variable is not set.
    pub fn resolved(&self) -> ConfigResult<Self> {
        Ok(Self {
            cert_path: expand_path(&self.cert_path)?,
            key_path: expand_path(&self.key_path)?,
            ca_cert_path: self.ca_cert_path.as_deref().map(expand_path).transpose()?,
            require_client_cert: self.require_client_cert,
            handshake_timeout_ms: self.handshake_timeout_ms,
        })
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Socket options applied at accept time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm.
    #[serde(default = "default_true")]
    pub nodelay: bool,

    /// Enable TCP keepalive.
    #[serde(default = "default_true")]
    pub keepalive: bool,

    /// Idle time before keepalive probes start.
    #[serde(default = "default_keepalive_idle_secs")]
    pub keepalive_idle_secs: u64,

    /// `SO_RCVBUF` in bytes. Kernel default when unset.
    #[serde(default)]
    pub recv_buffer_size: Option<usize>,

    /// `SO_SNDBUF` in bytes. Kernel default when unset.
    #[serde(default)]
    pub send_buffer_size: Option<usize>,
}

/// Admission control settings.
///
/// Connection quota, connection rate and throughput quota are disabled when
/// absent. The memory and request-slot budgets are always enforced.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub connection_quota: Option<ConnectionQuotaConfig>,

    #[serde(default)]
    pub connection_rate: Option<ConnectionRateConfig>,

    #[serde(default)]
    pub throughput: Option<ThroughputConfig>,

    /// Bytes of request memory shared by all connections of a server.
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: usize,

    /// Requests allowed in flight at once across all connections of a server.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Connection count limits.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectionQuotaConfig {
    /// Total connections across all sources.
    #[serde(default)]
    pub max_connections: Option<u32>,

    /// Connections from a single source address.
    #[serde(default)]
    pub max_connections_per_ip: Option<u32>,

    /// Per-address limits replacing `max_connections_per_ip`.
    #[serde(default)]
    pub overrides: Vec<IpLimitOverride>,
}

/// Connection limit for one source address.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpLimitOverride {
    pub address: IpAddr,
    pub max_connections: u32,
}

/// New-connection rate limiting.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionRateConfig {
    /// Connections accepted per second from any one source.
    pub rate_per_sec: u64,

    /// Per-subnet rates; the longest matching prefix wins.
    #[serde(default)]
    pub overrides: Vec<SubnetRateConfig>,

    /// How long an accepted connection may wait for a token before it is dropped.
    #[serde(default = "default_rate_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

/// Rate override for one subnet, e.g. `10.0.0.0/8`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubnetRateConfig {
    pub subnet: String,
    pub rate_per_sec: u64,
}

impl ConnectionRateConfig {
    /// Parse the configured subnet overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if any subnet is malformed.
    pub fn subnet_overrides(&self) -> ConfigResult<Vec<SubnetOverride>> {
        self.overrides
            .iter()
            .map(|o| SubnetOverride::parse(&o.subnet, o.rate_per_sec))
            .collect()
    }

    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

/// Per-client produce/fetch byte-rate throttling.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThroughputConfig {
    /// Target bytes per second per client id.
    pub target_bytes_per_sec: u64,

    /// Width of one accounting window.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Number of windows the rate is averaged over.
    #[serde(default = "default_num_windows")]
    pub num_windows: usize,

    /// Upper bound on any single throttle delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// How often idle client entries are collected.
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
fn expand_env_vars(s: &str) -> ConfigResult<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    let mut missing = None;
    let expanded = re.replace_all(s, |caps: &regex::Captures| match std::env::var(&caps[1]) {
        Ok(value) => value,
        Err(_) => {
            missing.get_or_insert_with(|| caps[1].to_string());
            String::new()
        }
    });
    match missing {
        Some(var) => Err(ConfigError::MissingEnvVar(var)),
        None => Ok(expanded.into_owned()),
    }
}

fn expand_path(path: &Path) -> ConfigResult<PathBuf> {
    expand_env_vars(&path.to_string_lossy()).map(PathBuf::from)
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_listen_address() -> String {
    "0.0.0.0:9092".to_string()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_keepalive_idle_secs() -> u64 {
    60
}

fn default_memory_budget_bytes() -> usize {
    512 * 1024 * 1024
}

fn default_max_concurrent_requests() -> usize {
    4096
}

fn default_rate_wait_timeout_ms() -> u64 {
    1_000
}

fn default_window_ms() -> u64 {
    1_000
}

fn default_num_windows() -> usize {
    10
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_gc_interval_ms() -> u64 {
    30_000
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: true,
            keepalive_idle_secs: default_keepalive_idle_secs(),
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            connection_quota: None,
            connection_rate: None,
            throughput: None,
            memory_budget_bytes: default_memory_budget_bytes(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Configuration loading and validation

impl IngressConfig {
    /// Config with a single plaintext listener and default admission settings.
    #[must_use]
    pub fn single_listener(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            listeners: vec![ListenerConfig::plaintext(name, address)],
            socket: SocketConfig::default(),
            admission: AdmissionConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - no listeners are configured, or two share a name
    /// - a listener address does not parse
    /// - a budget, limit or rate is zero
    /// - a subnet override is malformed
    pub fn validate(&self) -> ConfigResult<()> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let mut names = HashSet::new();
        for listener in &self.listeners {
            if !names.insert(listener.name.as_str()) {
                return Err(ConfigError::DuplicateListener(listener.name.clone()));
            }
            listener.socket_addr()?;
        }

        self.admission.validate()
    }
}

impl AdmissionConfig {
    /// Validate the admission settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a budget, limit or rate is zero or a subnet
    /// override does not parse.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.memory_budget_bytes == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "admission.memory_budget_bytes",
            });
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "admission.max_concurrent_requests",
            });
        }

        if let Some(rate) = &self.connection_rate {
            if rate.rate_per_sec == 0 {
                return Err(ConfigError::ZeroLimit {
                    field: "admission.connection_rate.rate_per_sec",
                });
            }
            rate.subnet_overrides()?;
        }

        if let Some(tp) = &self.throughput {
            if tp.target_bytes_per_sec == 0 {
                return Err(ConfigError::ZeroLimit {
                    field: "admission.throughput.target_bytes_per_sec",
                });
            }
            if tp.window_ms == 0 || tp.num_windows == 0 {
                return Err(ConfigError::ZeroLimit {
                    field: "admission.throughput.window_ms/num_windows",
                });
            }
        }

        Ok(())
    }
}
