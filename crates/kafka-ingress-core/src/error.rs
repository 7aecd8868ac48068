//! Domain error types for the Kafka ingress tier.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// At least one listener must be configured.
    #[error("no listeners configured")]
    NoListeners,

    /// Listener names must be unique.
    #[error("duplicate listener name: {0}")]
    DuplicateListener(String),

    /// A budget or limit that must be positive was zero.
    #[error("{field} must be greater than zero")]
    ZeroLimit { field: &'static str },

    /// Subnet override could not be parsed as `address/prefix`.
    #[error("invalid subnet override '{0}' (expected 'a.b.c.d/len')")]
    InvalidSubnet(String),

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// Referenced environment variable is not set.
    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),
}

/// Errors raised while building TLS acceptors or running handshakes.
#[derive(Error, Debug)]
pub enum TlsError {
    /// Certificate file could not be read.
    #[error("failed to load certificate from '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// Private key file could not be read.
    #[error("failed to load private key from '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// PEM file contained no usable certificate.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// PEM file contained no usable private key.
    #[error("no private keys found in '{0}'")]
    NoPrivateKeys(String),

    /// rustls rejected the configuration.
    #[error("invalid TLS configuration: {0}")]
    Config(String),

    /// Handshake with the client failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Handshake did not finish within the configured timeout.
    #[error("TLS handshake timed out")]
    HandshakeTimeout,
}

/// Errors raised by the admission controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Per-source or total connection quota exhausted.
    #[error("connection quota exhausted for {0}")]
    QuotaExhausted(std::net::IpAddr),

    /// No acceptance token became available before the wait timeout.
    #[error("timed out waiting for connection rate limiter")]
    RateLimitTimeout,

    /// Memory estimate is at or above the hard request ceiling.
    #[error("request memory estimate {estimate} exceeds ceiling {ceiling}")]
    EstimateTooLarge { estimate: usize, ceiling: usize },

    /// A budget semaphore was closed during shutdown.
    #[error("request budget closed")]
    BudgetClosed,
}

/// Errors that occur while accepting connections or processing requests.
#[derive(Error, Debug)]
pub enum IngressError {
    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// Failed to bind a listener at startup.
    #[error("failed to bind listener '{name}' on {address}: {source}")]
    Bind {
        name: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// Failed to decode Kafka protocol message.
    #[error("protocol decode error: {message}")]
    ProtocolDecode { message: String },

    /// Failed to encode Kafka protocol message.
    #[error("protocol encode error: {message}")]
    ProtocolEncode { message: String },

    /// Request header could not be parsed; the stream is out of sync.
    #[error("corrupted request header from {peer}: {message}")]
    HeaderCorrupted { peer: SocketAddr, message: String },

    /// Legacy authentication token exceeds the safety ceiling.
    #[error("authentication payload of {size} bytes exceeds limit of {limit}")]
    AuthPayloadTooLarge { size: usize, limit: usize },

    /// Authentication exchange failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Unsupported API key/version.
    #[error("unsupported API: key={api_key}, version={api_version}")]
    UnsupportedApi { api_key: i16, api_version: i16 },

    /// Handler rejected or failed a request.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Admission control refused the request or connection.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// TLS setup or handshake failure.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Attempted to spawn work after the shutdown gate was closed.
    #[error("shutdown gate closed")]
    GateClosed,

    /// Shutdown signal received.
    #[error("ingress shutting down")]
    Shutdown,
}

impl IngressError {
    /// Returns true when the error means the peer went away rather than
    /// anything going wrong on our side.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Connection(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            Self::Shutdown | Self::GateClosed => true,
            _ => false,
        }
    }
}

/// Result type alias for ingress operations.
pub type Result<T> = std::result::Result<T, IngressError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS setup.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
