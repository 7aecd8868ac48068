//! TLS acceptor for listeners configured with `tls`.
//!
//! Handshakes run inside the per-connection task and are bounded by the
//! listener's handshake timeout, so a slow client never stalls accepting.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::ServerTlsConfig;
use crate::error::{TlsError, TlsResult};

fn ensure_crypto_provider() {
    // Fails only when a provider is already installed.
    let _ = CryptoProvider::install_default(default_provider());
}

/// Server-side TLS for one listener.
#[derive(Clone)]
pub struct TlsServerAcceptor {
    inner: TlsAcceptor,
    handshake_timeout: Duration,
    client_auth: ClientAuth,
}

/// Client certificate policy of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    None,
    /// Verified when presented.
    Optional,
    Required,
}

impl TlsServerAcceptor {
    /// Load certificates and build the acceptor. Paths may reference
    /// environment variables as `${NAME}`.
    ///
    /// # Errors
    ///
    /// Returns an error if a path cannot be resolved, a certificate or key
    /// cannot be loaded, or rustls rejects the resulting configuration.
    pub fn new(config: &ServerTlsConfig) -> TlsResult<Self> {
        ensure_crypto_provider();
        let config = config
            .resolved()
            .map_err(|e| TlsError::Config(e.to_string()))?;

        let certs = load_certificates(&config.cert_path)?;
        let key = load_private_key(&config.key_path)?;
        let (verifier, client_auth) = client_verifier(&config)?;

        let builder = ServerConfig::builder();
        let builder = match verifier {
            Some(verifier) => builder.with_client_cert_verifier(verifier),
            None => builder.with_no_client_auth(),
        };
        let server_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| TlsError::Config(format!("failed to configure server cert: {e}")))?;

        Ok(Self {
            inner: TlsAcceptor::from(Arc::new(server_config)),
            handshake_timeout: config.handshake_timeout(),
            client_auth,
        })
    }

    #[must_use]
    pub fn client_auth(&self) -> ClientAuth {
        self.client_auth
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Run the server handshake on an accepted socket.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::HandshakeTimeout`] if the client does not finish
    /// in time and [`TlsError::Handshake`] if the handshake fails.
    pub async fn accept(&self, stream: TcpStream) -> TlsResult<TlsStream<TcpStream>> {
        match tokio::time::timeout(self.handshake_timeout, self.inner.accept(stream)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TlsError::Handshake(e.to_string())),
            Err(_) => Err(TlsError::HandshakeTimeout),
        }
    }
}

impl std::fmt::Debug for TlsServerAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerAcceptor")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("client_auth", &self.client_auth)
            .finish_non_exhaustive()
    }
}

fn client_verifier(
    config: &ServerTlsConfig,
) -> TlsResult<(Option<Arc<dyn ClientCertVerifier>>, ClientAuth)> {
    let Some(ca_path) = config.ca_cert_path.as_deref() else {
        if config.require_client_cert {
            return Err(TlsError::Config(
                "CA certificate path required when require_client_cert is true".to_string(),
            ));
        }
        return Ok((None, ClientAuth::None));
    };

    let roots = Arc::new(build_root_store(ca_path)?);
    let builder = WebPkiClientVerifier::builder(roots);
    let (builder, client_auth) = if config.require_client_cert {
        (builder, ClientAuth::Required)
    } else {
        (builder.allow_unauthenticated(), ClientAuth::Optional)
    };
    debug!(ca_path = %ca_path.display(), ?client_auth, "client certificate verification enabled");

    let verifier = builder
        .build()
        .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))?;
    Ok((Some(verifier), client_auth))
}

fn build_root_store(ca_path: &Path) -> TlsResult<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(load_certificates(ca_path)?);
    if ignored > 0 {
        warn!(path = %ca_path.display(), ignored, "ignored unparsable CA certificates");
    }
    if added == 0 {
        return Err(TlsError::NoCertificates(ca_path.display().to_string()));
    }
    Ok(root_store)
}

fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping invalid certificate");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }
    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// First RSA, PKCS#8 or SEC1 key in the file.
fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    loop {
        let item = rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::PrivateKeyLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        match item {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => {}
            None => return Err(TlsError::NoPrivateKeys(path.display().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    use crate::testing::tls::{TEST_CERT_PEM as TEST_CERT, TEST_KEY_PEM as TEST_KEY};

    fn temp_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn tls_config(cert: &Path, key: &Path, ca: Option<&Path>, require: bool) -> ServerTlsConfig {
        ServerTlsConfig {
            cert_path: cert.to_path_buf(),
            key_path: key.to_path_buf(),
            ca_cert_path: ca.map(Path::to_path_buf),
            require_client_cert: require,
            handshake_timeout_ms: 200,
        }
    }

    #[test]
    fn test_load_key_skips_certificates() {
        let combined = temp_file(&format!("{TEST_CERT}\n{TEST_KEY}\n"));
        assert!(load_private_key(combined.path()).is_ok());

        let cert_only = temp_file(TEST_CERT);
        assert!(matches!(
            load_private_key(cert_only.path()),
            Err(TlsError::NoPrivateKeys(_))
        ));
    }

    #[test]
    fn test_client_auth_modes() {
        let cert = temp_file(TEST_CERT);
        let key = temp_file(TEST_KEY);

        let none = TlsServerAcceptor::new(&tls_config(cert.path(), key.path(), None, false)).unwrap();
        assert_eq!(none.client_auth(), ClientAuth::None);
        assert_eq!(none.handshake_timeout(), Duration::from_millis(200));

        let optional =
            TlsServerAcceptor::new(&tls_config(cert.path(), key.path(), Some(cert.path()), false))
                .unwrap();
        assert_eq!(optional.client_auth(), ClientAuth::Optional);

        let required =
            TlsServerAcceptor::new(&tls_config(cert.path(), key.path(), Some(cert.path()), true))
                .unwrap();
        assert_eq!(required.client_auth(), ClientAuth::Required);
    }

    #[test]
    fn test_required_client_cert_needs_ca() {
        let cert = temp_file(TEST_CERT);
        let key = temp_file(TEST_KEY);
        let result = TlsServerAcceptor::new(&tls_config(cert.path(), key.path(), None, true));
        assert!(matches!(result, Err(TlsError::Config(_))));
    }

    #[test]
    fn test_missing_files() {
        let cert = temp_file(TEST_CERT);
        let key = temp_file(TEST_KEY);
        let missing = PathBuf::from("/nonexistent/file.pem");

        assert!(matches!(
            TlsServerAcceptor::new(&tls_config(&missing, key.path(), None, false)),
            Err(TlsError::CertificateLoad { .. })
        ));
        assert!(matches!(
            TlsServerAcceptor::new(&tls_config(cert.path(), &missing, None, false)),
            Err(TlsError::PrivateKeyLoad { .. })
        ));
    }

    #[test]
    fn test_unset_env_var_in_path() {
        let key = temp_file(TEST_KEY);
        let config = tls_config(
            Path::new("${KAFKA_INGRESS_TEST_UNSET_TLS_DIR}/server.crt"),
            key.path(),
            None,
            false,
        );
        assert!(matches!(TlsServerAcceptor::new(&config), Err(TlsError::Config(_))));
    }

    #[tokio::test]
    async fn test_handshake_times_out() {
        let cert = temp_file(TEST_CERT);
        let key = temp_file(TEST_KEY);
        let acceptor =
            TlsServerAcceptor::new(&tls_config(cert.path(), key.path(), None, false)).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        // The client never sends a ClientHello.
        assert!(matches!(
            acceptor.accept(server).await,
            Err(TlsError::HandshakeTimeout)
        ));
    }
}
