//! Catalog query client
//!
//! Issues a single `GET /_cat/indices` over a tunnel's local port, in plain
//! HTTP or mutual TLS depending on whether credentials are supplied, and
//! checks the body for an index-name prefix by substring containment.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper::header::HOST;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::credentials::CredentialBundle;
use crate::error::{Error, Result};
use crate::tunnel::Tunnel;

/// Catalog listing endpoint
pub const CATALOG_PATH: &str = "/_cat/indices";

/// Host name dialed and verified against the server certificate
pub const CATALOG_HOST: &str = "localhost";

/// Upper bound for one request, connect included
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Catalog lookup against a local port, reusable across polls
#[derive(Clone)]
pub struct CatalogQuery {
    local_port: u16,
    prefix: String,
    tls: Option<Arc<ClientConfig>>,
    request_timeout: Duration,
}

impl std::fmt::Debug for CatalogQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogQuery")
            .field("url", &self.url())
            .field("prefix", &self.prefix)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl CatalogQuery {
    pub fn new(local_port: u16, prefix: impl Into<String>) -> Self {
        Self {
            local_port,
            prefix: prefix.into(),
            tls: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Use mutual TLS with the given client configuration
    pub fn with_tls(mut self, tls: Option<Arc<ClientConfig>>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn use_secure_transport(&self) -> bool {
        self.tls.is_some()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn url(&self) -> String {
        let scheme = if self.use_secure_transport() {
            "https"
        } else {
            "http"
        };
        format!(
            "{}://{}:{}{}",
            scheme, CATALOG_HOST, self.local_port, CATALOG_PATH
        )
    }

    /// Fetch the catalog and report whether any entry contains the prefix
    pub async fn has_entry(&self) -> Result<bool> {
        let body = self.fetch().await?;
        let found = catalog_contains(&body, &self.prefix);
        debug!(
            url = %self.url(),
            prefix = %self.prefix,
            found = found,
            "Catalog queried"
        );
        Ok(found)
    }

    /// Fetch the raw catalog body.
    ///
    /// Connection failures, TLS failures, timeouts and non-2xx statuses are
    /// all [`Error::QueryTransportError`].
    pub async fn fetch(&self) -> Result<String> {
        match tokio::time::timeout(self.request_timeout, self.fetch_inner()).await {
            Ok(result) => result.map_err(|reason| self.transport_error(reason)),
            Err(_) => Err(self.transport_error(format!(
                "no response within {:?}",
                self.request_timeout
            ))),
        }
    }

    async fn fetch_inner(&self) -> Result<String, String> {
        let tcp = TcpStream::connect((std::net::Ipv4Addr::LOCALHOST, self.local_port))
            .await
            .map_err(|e| format!("connection failed: {}", e))?;

        match &self.tls {
            None => self.send(tcp).await,
            Some(config) => {
                let server_name = ServerName::try_from(CATALOG_HOST)
                    .map_err(|e| format!("invalid server name: {}", e))?;
                let stream = TlsConnector::from(Arc::clone(config))
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| format!("TLS handshake failed: {}", e))?;
                self.send(stream).await
            }
        }
    }

    async fn send<S>(&self, stream: S) -> Result<String, String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| format!("HTTP handshake failed: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                trace!(error = %e, "Catalog connection closed");
            }
        });

        let request = Request::get(CATALOG_PATH)
            .header(HOST, format!("{}:{}", CATALOG_HOST, self.local_port))
            .body(Empty::<Bytes>::new())
            .map_err(|e| format!("invalid request: {}", e))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("failed to read body: {}", e))?
            .to_bytes();

        if !status.is_success() {
            return Err(format!(
                "unexpected status {}: {}",
                status,
                String::from_utf8_lossy(&body).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn transport_error(&self, reason: String) -> Error {
        Error::QueryTransportError {
            url: self.url(),
            reason,
        }
    }
}

/// Does any catalog entry contain `prefix`?
///
/// Plain substring containment over the whole body, no line parsing.
pub fn catalog_contains(body: &str, prefix: &str) -> bool {
    body.contains(prefix)
}

/// Query the catalog behind `tunnel` for an entry starting with `prefix`.
///
/// Plain HTTP when `credentials` is `None`, mutual TLS otherwise. Builds
/// a TLS client configuration per call; repeated checks should hold a
/// [`CatalogQuery`] instead.
pub async fn has_entry_with_prefix(
    tunnel: &Tunnel,
    prefix: &str,
    credentials: Option<&CredentialBundle>,
) -> Result<bool> {
    let tls = credentials
        .map(|bundle| bundle.client_config().map(Arc::new))
        .transpose()?;

    CatalogQuery::new(tunnel.local_port(), prefix)
        .with_tls(tls)
        .has_entry()
        .await
}
