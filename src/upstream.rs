//! Client side of the proxy: one fixed upstream, reached over HTTP/1.1
//!
//! Each forwarded request gets its own connection. Bodies are streamed in
//! both directions.

use hyper::body::{Body, Incoming};
use hyper::http::uri::InvalidUri;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("unsupported upstream scheme: {0}")]
    UnsupportedScheme(String),

    #[error("upstream url has no host")]
    MissingHost,

    #[error("invalid upstream server name: {0}")]
    InvalidServerName(String),

    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake with upstream failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("invalid upstream uri: {0}")]
    Uri(#[from] InvalidUri),

    #[error("upstream http error: {0}")]
    Http(#[from] hyper::Error),
}

struct UpstreamTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// The single backend every request is forwarded to
pub struct Upstream {
    base: Url,
    host: String,
    port: u16,
    tls: Option<UpstreamTls>,
}

impl Upstream {
    pub fn new(base: Url) -> Result<Self, UpstreamError> {
        let host = base
            .host_str()
            .ok_or(UpstreamError::MissingHost)?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let tls = match base.scheme() {
            "http" => None,
            "https" => Some(Self::tls_for(&host)?),
            other => return Err(UpstreamError::UnsupportedScheme(other.to_string())),
        };

        let port = base
            .port_or_known_default()
            .unwrap_or(if tls.is_some() { 443 } else { 80 });

        Ok(Self {
            base,
            host,
            port,
            tls,
        })
    }

    fn tls_for(host: &str) -> Result<UpstreamTls, UpstreamError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(host)
            .map_err(|_| UpstreamError::InvalidServerName(host.to_string()))?
            .to_owned();

        Ok(UpstreamTls {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Origin-form URI for the upstream: the base path joined with the
    /// request path, and both query strings combined.
    pub fn target_uri(&self, request_uri: &Uri) -> Result<Uri, UpstreamError> {
        let path = join_paths(self.base.path(), request_uri.path());

        let base_query = self.base.query().filter(|q| !q.is_empty());
        let request_query = request_uri.query().filter(|q| !q.is_empty());
        let target = match (base_query, request_query) {
            (Some(a), Some(b)) => format!("{}?{}&{}", path, a, b),
            (Some(q), None) | (None, Some(q)) => format!("{}?{}", path, q),
            (None, None) => path,
        };

        Ok(target.parse()?)
    }

    /// Open a connection and send the request, returning the streaming response
    pub async fn send<B>(&self, req: Request<B>) -> Result<Response<Incoming>, UpstreamError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|source| UpstreamError::Connect {
                addr: format!("{}:{}", self.host, self.port),
                source,
            })?;
        stream.set_nodelay(true).ok();

        match &self.tls {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(UpstreamError::Tls)?;
                send_over(stream, req).await
            }
            None => send_over(stream, req).await,
        }
    }
}

async fn send_over<S, B>(stream: S, req: Request<B>) -> Result<Response<Incoming>, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("Upstream connection error: {}", e);
        }
    });

    Ok(sender.send_request(req).await?)
}

/// Join two URL paths with exactly one slash between them
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}
