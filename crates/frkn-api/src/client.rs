//! Device API Client
//!
//! Uses hyper's HTTP/1.1 connection API over tokio, with rustls for HTTPS.
//! Two calls:
//! - device registration, returning the opaque device token
//! - server configuration, returning the proxy server descriptors

use crate::models::{ConfigResponse, RegisterRequest, RegisterResponse};
use frkn_tunnel::ServerDescriptor;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::{Host, Url};

const REGISTER_PATH: &str = "api/v1/devices/register";
const CONFIG_PATH: &str = "api/v1/devices/config";

/// API client errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("{operation} failed: HTTP {status}")]
    Status { operation: &'static str, status: u16 },

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Check if the server answered 401/403
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Status { status: 401 | 403, .. })
    }
}

/// API client configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Backend base URL
    pub base_url: String,
    /// TCP + TLS connect timeout
    pub connect_timeout: Duration,
    /// Request/response timeout
    pub request_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Platform reported at registration
    pub platform: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://riga.baby".to_string(),
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(15),
            user_agent: format!("frkn/{}", env!("CARGO_PKG_VERSION")),
            platform: "linux".to_string(),
        }
    }
}

/// Client for the device registration backend
pub struct ApiClient {
    config: ApiConfig,
    base: Url,
    tls: TlsConnector,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let mut base =
            Url::parse(&config.base_url).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ApiError::InvalidUrl(format!("unsupported scheme {}", base.scheme())));
        }
        if base.host().is_none() {
            return Err(ApiError::InvalidUrl("No host in URL".to_string()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        info!(
            "API client initialized ({}, timeout: {:?})",
            base, config.request_timeout
        );

        Ok(Self {
            config,
            base,
            tls: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Result<Self, ApiError> {
        Self::new(ApiConfig::default())
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Register this device and obtain its token
    pub async fn register(
        &self,
        device_id: &str,
        name: &str,
    ) -> Result<RegisterResponse, ApiError> {
        let request = RegisterRequest {
            device_id: device_id.to_string(),
            platform: self.config.platform.clone(),
            name: name.to_string(),
        };
        let body = serde_json::to_vec(&request).map_err(|e| ApiError::HttpError(e.to_string()))?;

        let bytes = self
            .send("Registration", Method::POST, REGISTER_PATH, None, Some(body))
            .await?;
        let response: RegisterResponse =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))?;

        info!(
            "Device registered (user {}, new: {})",
            response.user_id, response.is_new_user
        );
        Ok(response)
    }

    /// Fetch the server descriptors available to `token`.
    ///
    /// Descriptors that fail validation are skipped; an empty list is
    /// returned as-is.
    pub async fn fetch_config(&self, token: &str) -> Result<Vec<ServerDescriptor>, ApiError> {
        let bytes = self
            .send("Config fetch", Method::GET, CONFIG_PATH, Some(token), None)
            .await?;
        let response: ConfigResponse =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))?;

        let servers: Vec<_> = response
            .servers
            .into_iter()
            .filter(|server| match server.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping server descriptor {}: {}", server, e);
                    false
                }
            })
            .collect();

        info!("Received {} server(s)", servers.len());
        Ok(servers)
    }

    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Vec<u8>>,
    ) -> Result<Bytes, ApiError> {
        let start = Instant::now();
        let url = self.base.join(path).map_err(|e| ApiError::InvalidUrl(e.to_string()))?;

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(ApiError::InvalidUrl("No host in URL".to_string())),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ApiError::InvalidUrl("No port for URL".to_string()))?;
        let is_https = url.scheme() == "https";

        let authority = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap_or(&host), port),
            None => url.host_str().unwrap_or(&host).to_string(),
        };

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path_and_query(&url))
            .header(HOST, authority)
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, "application/json");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| ApiError::HttpError(e.to_string()))?;

        let connection = tokio::time::timeout(
            self.config.connect_timeout,
            self.connect(&host, port, is_https),
        )
        .await
        .map_err(|_| ApiError::Timeout)??;

        let roundtrip = async {
            match connection {
                Connection::Plain(stream) => exchange(stream, request).await,
                Connection::Tls(stream) => exchange(*stream, request).await,
            }
        };
        let (status, bytes) = tokio::time::timeout(self.config.request_timeout, roundtrip)
            .await
            .map_err(|_| ApiError::Timeout)??;

        debug!(
            "HTTP {} {} -> {} ({} bytes, {:?})",
            method,
            url,
            status,
            bytes.len(),
            start.elapsed()
        );

        if !status.is_success() {
            return Err(ApiError::Status {
                operation,
                status: status.as_u16(),
            });
        }
        Ok(bytes)
    }

    async fn connect(&self, host: &str, port: u16, is_https: bool) -> Result<Connection, ApiError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ApiError::ConnectionFailed(e.to_string()))?;

        if !is_https {
            return Ok(Connection::Plain(stream));
        }

        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|_| ApiError::TlsError("Invalid server name".to_string()))?;
        let tls_stream = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|e| ApiError::TlsError(e.to_string()))?;
        Ok(Connection::Tls(Box::new(tls_stream)))
    }
}

enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

async fn exchange<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<(StatusCode, Bytes), ApiError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ApiError::HttpError(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ApiError::HttpError(e.to_string()))?;

    let status = response.status();
    let collected = response
        .into_body()
        .collect()
        .await
        .map_err(|e| ApiError::HttpError(e.to_string()))?;
    Ok((status, collected.to_bytes()))
}
