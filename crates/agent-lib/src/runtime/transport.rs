//! Connection factory for the runtime API
//!
//! Opens HTTP/1.1 connections to the container runtime over a unix socket,
//! plain TCP or TCP+TLS. Every [`Connection`] owns the task driving its socket;
//! dropping the connection aborts that task, which closes the socket and
//! unblocks any read pending on it.

use super::error::{Result, RuntimeError};
use bytes::Bytes;
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::{header, Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Host header sent over unix sockets, where there is no real authority
const UNIX_HOST: &str = "docker";

/// How to reach the runtime API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Socket,
    Http,
    Tls,
}

/// Transport settings as they appear in configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_kind")]
    pub kind: TransportKind,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub tls_ca: Option<PathBuf>,
}

fn default_kind() -> TransportKind {
    TransportKind::Socket
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

fn default_address() -> String {
    "localhost:4243".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            socket_path: default_socket_path(),
            address: default_address(),
            tls_cert: None,
            tls_key: None,
            tls_ca: None,
        }
    }
}

/// Resolved transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Unix(PathBuf),
    Tcp(String),
    Tls {
        address: String,
        cert: PathBuf,
        key: PathBuf,
        ca: Option<PathBuf>,
    },
}

impl Transport {
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        match config.kind {
            TransportKind::Socket => Ok(Transport::Unix(config.socket_path.clone())),
            TransportKind::Http => Ok(Transport::Tcp(config.address.clone())),
            TransportKind::Tls => {
                let cert = config.tls_cert.clone().ok_or_else(|| {
                    RuntimeError::TlsConfig("tls mode requires a client certificate".into())
                })?;
                let key = config.tls_key.clone().ok_or_else(|| {
                    RuntimeError::TlsConfig("tls mode requires a client key".into())
                })?;
                Ok(Transport::Tls {
                    address: config.address.clone(),
                    cert,
                    key,
                    ca: config.tls_ca.clone(),
                })
            }
        }
    }

    /// Human readable target, used in errors and logs
    pub fn target(&self) -> String {
        match self {
            Transport::Unix(path) => format!("unix://{}", path.display()),
            Transport::Tcp(address) => format!("tcp://{}", address),
            Transport::Tls { address, .. } => format!("tls://{}", address),
        }
    }
}

/// Stateless factory producing ready-to-use runtime connections
#[derive(Clone)]
pub struct ConnectionFactory {
    transport: Transport,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("transport", &self.transport)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl ConnectionFactory {
    /// Build a factory, loading TLS material up front so bad certificates fail at startup
    pub fn new(transport: Transport) -> Result<Self> {
        let tls = match &transport {
            Transport::Tls { cert, key, ca, .. } => {
                Some(load_tls_connector(cert, key, ca.as_deref())?)
            }
            _ => None,
        };

        Ok(Self { transport, tls })
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        Self::new(Transport::from_config(config)?)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Open a new connection
    pub async fn connect(&self) -> Result<Connection> {
        match &self.transport {
            Transport::Unix(path) => {
                let stream =
                    UnixStream::connect(path)
                        .await
                        .map_err(|source| RuntimeError::Connect {
                            target: self.transport.target(),
                            source,
                        })?;
                Connection::handshake(stream, UNIX_HOST).await
            }
            Transport::Tcp(address) => {
                let stream = TcpStream::connect(address.as_str()).await.map_err(|source| {
                    RuntimeError::Connect {
                        target: self.transport.target(),
                        source,
                    }
                })?;
                Connection::handshake(stream, address).await
            }
            Transport::Tls { address, .. } => {
                let connector = self.tls.as_ref().ok_or_else(|| {
                    RuntimeError::TlsConfig("TLS connector not initialised".into())
                })?;
                let server_name = rustls::ServerName::try_from(host_of(address))
                    .map_err(|err| RuntimeError::TlsConfig(err.to_string()))?;
                let stream = TcpStream::connect(address.as_str()).await.map_err(|source| {
                    RuntimeError::Connect {
                        target: self.transport.target(),
                        source,
                    }
                })?;
                let stream = connector.connect(server_name, stream).await.map_err(|source| {
                    RuntimeError::TlsHandshake {
                        target: self.transport.target(),
                        source,
                    }
                })?;
                Connection::handshake(stream, address).await
            }
        }
    }
}

/// Host part of a `host:port` address
fn host_of(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            host.trim_start_matches('[').trim_end_matches(']')
        }
        _ => address,
    }
}

fn load_tls_connector(cert: &Path, key: &Path, ca: Option<&Path>) -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    match ca {
        Some(ca) => {
            let certs = read_pem_certs(ca)?;
            let (added, _ignored) = roots.add_parsable_certificates(&certs);
            if added == 0 {
                return Err(RuntimeError::TlsConfig(format!(
                    "no usable CA certificate in `{}`",
                    ca.display()
                )));
            }
        }
        None => {
            roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
                rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject,
                    ta.spki,
                    ta.name_constraints,
                )
            }));
        }
    }

    let chain: Vec<rustls::Certificate> = read_pem_certs(cert)?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if chain.is_empty() {
        return Err(RuntimeError::TlsConfig(format!(
            "no certificate found in `{}`",
            cert.display()
        )));
    }
    let key = read_private_key(key)?;

    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|err| RuntimeError::TlsConfig(err.to_string()))?;

    Ok(TlsConnector::from(Arc::new(config)))
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| RuntimeError::TlsFile {
            path: path.to_path_buf(),
            source,
        })
}

fn read_pem_certs(path: &Path) -> Result<Vec<Vec<u8>>> {
    rustls_pemfile::certs(&mut open_pem(path)?).map_err(|source| RuntimeError::TlsFile {
        path: path.to_path_buf(),
        source,
    })
}

fn read_private_key(path: &Path) -> Result<rustls::PrivateKey> {
    let as_tls_err = |source| RuntimeError::TlsFile {
        path: path.to_path_buf(),
        source,
    };

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open_pem(path)?).map_err(as_tls_err)?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open_pem(path)?).map_err(as_tls_err)?;
    }

    keys.into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| RuntimeError::TlsConfig(format!("no private key in `{}`", path.display())))
}

/// One HTTP/1.1 connection to the runtime API
#[derive(Debug)]
pub struct Connection {
    sender: SendRequest<Empty<Bytes>>,
    driver: JoinHandle<()>,
    host: String,
}

impl Connection {
    async fn handshake<S>(stream: S, host: &str) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(RuntimeError::Handshake)?;

        let driver = tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(error = %err, "Runtime connection terminated");
            }
        });

        Ok(Self {
            sender,
            driver,
            host: host.to_string(),
        })
    }

    /// Whether the peer (or a previous failure) closed this connection
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.driver.is_finished()
    }

    /// Issue a GET request and return the response head with a streaming body
    pub async fn get(&mut self, path: &str) -> Result<Response<Incoming>> {
        self.sender.ready().await.map_err(RuntimeError::Transport)?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::HOST, self.host.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(RuntimeError::Request)?;

        self.sender
            .send_request(request)
            .await
            .map_err(RuntimeError::Transport)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_transport_from_config_socket() {
        let config = TransportConfig::default();
        let transport = Transport::from_config(&config).unwrap();
        assert_eq!(transport, Transport::Unix(PathBuf::from("/var/run/docker.sock")));
        assert_eq!(transport.target(), "unix:///var/run/docker.sock");
    }

    #[test]
    fn test_transport_from_config_http() {
        let config = TransportConfig {
            kind: TransportKind::Http,
            address: "10.0.0.2:2375".to_string(),
            ..TransportConfig::default()
        };
        let transport = Transport::from_config(&config).unwrap();
        assert_eq!(transport, Transport::Tcp("10.0.0.2:2375".to_string()));
    }

    #[test]
    fn test_tls_requires_cert_and_key() {
        let config = TransportConfig {
            kind: TransportKind::Tls,
            ..TransportConfig::default()
        };
        let err = Transport::from_config(&config).unwrap_err();
        assert!(matches!(err, RuntimeError::TlsConfig(_)));
    }

    #[test]
    fn test_tls_missing_files_fail_at_construction() {
        let transport = Transport::Tls {
            address: "docker.local:2376".to_string(),
            cert: PathBuf::from("/nonexistent/cert.pem"),
            key: PathBuf::from("/nonexistent/key.pem"),
            ca: None,
        };
        let err = ConnectionFactory::new(transport).unwrap_err();
        assert!(matches!(err, RuntimeError::TlsFile { .. }));
    }

    #[test]
    fn test_tls_empty_certificate_rejected() {
        let mut cert = NamedTempFile::new().unwrap();
        writeln!(cert, "not a certificate").unwrap();
        let mut key = NamedTempFile::new().unwrap();
        writeln!(key, "not a key").unwrap();

        let transport = Transport::Tls {
            address: "docker.local:2376".to_string(),
            cert: cert.path().to_path_buf(),
            key: key.path().to_path_buf(),
            ca: None,
        };
        let err = ConnectionFactory::new(transport).unwrap_err();
        assert!(matches!(err, RuntimeError::TlsConfig(_)));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("docker.local:2376"), "docker.local");
        assert_eq!(host_of("[::1]:2376"), "::1");
        assert_eq!(host_of("docker.local"), "docker.local");
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let factory = ConnectionFactory::new(Transport::Tcp(address)).unwrap();
        let err = factory.connect().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Connect { .. }));
        assert!(err.is_connection_fatal());
    }
}
