//! Proxy server implementation
//!
//! Terminates HTTP and HTTPS, resolves the requested hostname to a customer,
//! stamps the identity headers and forwards everything to the one upstream.

use crate::api::AdminApi;
use crate::certificate::CertificateManager;
use crate::hostname::normalize_host;
use crate::response::{redirect_response, status_response, text_response, ProxyBody};
use crate::signing::RequestSigner;
use crate::store::{Store, StoreError};
use crate::upstream::{Upstream, UpstreamError};
use anyhow::{Context, Result};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue, CONNECTION, HOST,
    PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use url::Url;

pub const X_CUSTOMER_DOMAIN: HeaderName = HeaderName::from_static("x-customer-domain");
pub const X_CUSTOMER_ID: HeaderName = HeaderName::from_static("x-customer-id");
pub const X_VANITY_SIGNATURE: HeaderName = HeaderName::from_static("x-vanity-signature");

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to resolve customer for {hostname}: {source}")]
    Resolve {
        hostname: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

/// Proxy server configuration
#[derive(Clone)]
pub struct ProxyConfig {
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    pub force_https: bool,
    /// Where every proxied request is sent
    pub upstream: Url,
    /// HMAC key for `X-Vanity-Signature`; signing is off when unset
    pub signing_secret: Option<String>,
    /// Requests for this hostname go to the admin API
    pub api_hostname: Option<String>,
    pub api_token: Option<String>,
}

impl ProxyConfig {
    pub fn new(upstream: Url) -> Self {
        Self {
            http_port: 8080,
            https_port: 8443,
            enable_https: false,
            force_https: false,
            upstream,
            signing_secret: None,
            api_hostname: None,
            api_token: None,
        }
    }

    pub fn with_ports(mut self, http_port: u16, https_port: u16) -> Self {
        self.http_port = http_port;
        self.https_port = https_port;
        self
    }

    pub fn with_https(mut self, enable_https: bool, force_https: bool) -> Self {
        self.enable_https = enable_https;
        self.force_https = force_https;
        self
    }

    pub fn with_signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    pub fn with_admin_api(mut self, hostname: impl Into<String>, token: Option<String>) -> Self {
        self.api_hostname = Some(hostname.into());
        self.api_token = token;
        self
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ProxyConfig")
            .field("http_port", &self.http_port)
            .field("https_port", &self.https_port)
            .field("enable_https", &self.enable_https)
            .field("force_https", &self.force_https)
            .field("upstream", &self.upstream.as_str())
            .field("signing_secret", &redact(&self.signing_secret))
            .field("api_hostname", &self.api_hostname)
            .field("api_token", &redact(&self.api_token))
            .finish()
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    store: Arc<dyn Store>,
    cert_manager: Arc<CertificateManager>,
    signer: Option<RequestSigner>,
    upstream: Upstream,
    api_hostname: Option<String>,
    api: AdminApi,
}

impl ProxyServer {
    /// Create a new proxy server
    ///
    /// `store` serves hostname lookups for every request; pass a
    /// [`crate::store::CachedStore`] in production.
    pub fn new(
        config: ProxyConfig,
        store: Arc<dyn Store>,
        cert_manager: Arc<CertificateManager>,
    ) -> Result<Self> {
        let signer = RequestSigner::from_secret(config.signing_secret.as_deref())
            .context("Invalid signing secret")?;
        if signer.is_none() {
            warn!("No signing secret configured, X-Vanity-Signature will not be sent");
        }

        let upstream = Upstream::new(config.upstream.clone())
            .with_context(|| format!("Invalid upstream {}", config.upstream))?;

        let api_hostname = config.api_hostname.as_deref().and_then(normalize_host);
        let api = AdminApi::new(store.clone(), config.api_token.clone());

        Ok(Self {
            config,
            store,
            cert_manager,
            signer,
            upstream,
            api_hostname,
            api,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Start the proxy server
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let http_addr: SocketAddr = ([0, 0, 0, 0], self.config.http_port).into();

        info!(
            "Proxy server starting on HTTP:{}, forwarding to {}",
            self.config.http_port,
            self.upstream.base()
        );

        if self.config.enable_https {
            let https_addr: SocketAddr = ([0, 0, 0, 0], self.config.https_port).into();
            tokio::try_join!(
                self.clone().run_http_server(http_addr),
                self.clone().run_https_server(https_addr),
            )?;
            Ok(())
        } else {
            self.run_http_server(http_addr).await
        }
    }

    /// Run HTTP server
    async fn run_http_server(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
        info!("HTTP server listening on {}", addr);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, remote_addr, false).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Run HTTPS server
    async fn run_https_server(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind HTTPS listener on {}", addr))?;
        info!("HTTPS server listening on {}", addr);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept HTTPS connection: {}", e);
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let server = self.clone();

            tokio::spawn(async move {
                let (stream, server_name) = match server.cert_manager.accept(stream).await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("TLS handshake from {} failed: {}", remote_addr, e);
                        return;
                    }
                };

                debug!("TLS connection from {} for {}", remote_addr, server_name);

                if let Err(e) = server.serve_connection(stream, remote_addr, true).await {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Serve HTTP/1.1 on an accepted connection, allowing protocol upgrades
    async fn serve_connection<I>(
        self: Arc<Self>,
        io: I,
        remote_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<(), hyper::Error>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req| {
            let server = self.clone();
            async move { server.handle_request(req, remote_addr, is_tls).await }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
    }

    /// Handle incoming request
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<ProxyBody>, Infallible> {
        debug!("{} {} from {}", req.method(), req.uri().path(), remote_addr);

        // Health check endpoint
        if !is_tls && req.uri().path() == "/health" {
            return Ok(text_response(StatusCode::OK, "OK"));
        }

        let hostname = match request_host(&req) {
            Some(h) => h,
            None => return Ok(text_response(StatusCode::BAD_REQUEST, "Missing Host header")),
        };

        // Force HTTPS redirect
        if !is_tls && self.config.force_https {
            let location = https_location(&hostname, self.config.https_port, req.uri());
            return Ok(redirect_response(&location));
        }

        if self.api_hostname.as_deref() == Some(hostname.as_str()) {
            return Ok(self.api.handle(req).await);
        }

        match self.proxy_request(req, remote_addr, is_tls, hostname).await {
            Ok(response) => Ok(response),
            Err(e) => {
                error!("Proxy error: {}", e);
                Ok(status_response(StatusCode::BAD_GATEWAY))
            }
        }
    }

    /// Resolve the customer, stamp identity headers and forward upstream
    async fn proxy_request(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
        is_tls: bool,
        hostname: String,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let customer_id = self
            .store
            .get_domain(&hostname)
            .await
            .map_err(|source| ProxyError::Resolve {
                hostname: hostname.clone(),
                source,
            })?;

        match &customer_id {
            Some(id) => debug!("{} resolved to customer {}", hostname, id),
            None => debug!("{} has no customer mapping", hostname),
        }

        let upgrade = upgrade_protocol(req.headers());
        let client_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let (mut parts, body) = req.into_parts();

        let original_host = parts.headers.get(HOST).cloned();
        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = upgrade {
            parts
                .headers
                .insert(CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(UPGRADE, protocol);
        }

        apply_identity_headers(
            &mut parts.headers,
            &hostname,
            customer_id.as_deref(),
            self.signer.as_ref(),
        )?;

        let forwarded_host = match original_host {
            Some(host) => host,
            None => {
                let host = HeaderValue::from_str(&hostname)?;
                parts.headers.insert(HOST, host.clone());
                host
            }
        };
        set_forwarded_headers(&mut parts.headers, remote_addr, forwarded_host, is_tls)?;

        parts.uri = self.upstream.target_uri(&parts.uri)?;
        parts.version = Version::HTTP_11;

        debug!("Proxying {} to {}{}", hostname, self.upstream.base(), parts.uri);

        let mut response = self
            .upstream
            .send(Request::from_parts(parts, body))
            .await?;

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            match client_upgrade {
                Some(client_upgrade) => {
                    let upstream_upgrade = hyper::upgrade::on(&mut response);
                    tokio::spawn(splice_upgraded(client_upgrade, upstream_upgrade, hostname));
                }
                None => {
                    warn!("Upstream switched protocols without an upgrade request");
                    return Ok(status_response(StatusCode::BAD_GATEWAY));
                }
            }
        } else {
            strip_hop_by_hop(response.headers_mut());
        }

        Ok(response.map(|body| body.boxed()))
    }
}

/// Relay bytes between the client and upstream once both sides have upgraded
async fn splice_upgraded(client: OnUpgrade, upstream: OnUpgrade, hostname: String) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!("Upgrade for {} failed: {}", hostname, e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(
            "Upgraded connection for {} closed ({} bytes up, {} bytes down)",
            hostname, sent, received
        ),
        Err(e) => debug!("Upgraded connection for {} ended: {}", hostname, e),
    }
}

/// Normalized target host: the request-URI authority if present, else `Host`
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return normalize_host(host);
    }

    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(normalize_host)
}

/// Overwrite the customer identity headers on a request about to be forwarded.
///
/// Client-supplied values never survive: the customer ID is removed for
/// unmapped hosts, the signature when no signer is configured.
pub fn apply_identity_headers(
    headers: &mut HeaderMap,
    hostname: &str,
    customer_id: Option<&str>,
    signer: Option<&RequestSigner>,
) -> Result<(), ProxyError> {
    headers.insert(X_CUSTOMER_DOMAIN, HeaderValue::from_str(hostname)?);

    match customer_id {
        Some(id) => {
            headers.insert(X_CUSTOMER_ID, HeaderValue::from_str(id)?);
        }
        None => {
            headers.remove(X_CUSTOMER_ID);
        }
    }

    match signer {
        Some(signer) => {
            let signature = signer.sign(customer_id.unwrap_or(""), hostname);
            headers.insert(X_VANITY_SIGNATURE, HeaderValue::from_str(&signature)?);
        }
        None => {
            headers.remove(X_VANITY_SIGNATURE);
        }
    }

    Ok(())
}

fn set_forwarded_headers(
    headers: &mut HeaderMap,
    remote_addr: SocketAddr,
    host: HeaderValue,
    is_tls: bool,
) -> Result<(), ProxyError> {
    let client_ip = remote_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip,
    };

    headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&forwarded_for)?);
    headers.insert(X_FORWARDED_HOST, host);
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if is_tls { "https" } else { "http" }),
    );

    Ok(())
}

/// Requested protocol when the client asks for a connection upgrade
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn https_location(hostname: &str, https_port: u16, uri: &Uri) -> String {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    if https_port == 443 {
        format!("https://{}{}", hostname, path)
    } else {
        format!("https://{}:{}{}", hostname, https_port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "s3cret";

    fn request_with_host(uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_request_host_from_header() {
        let req = request_with_host("/path", Some("A.Example.com:8443"));
        assert_eq!(request_host(&req), Some("a.example.com".to_string()));
    }

    #[test]
    fn test_request_host_prefers_authority() {
        let req = request_with_host("http://B.example.com/path", Some("a.example.com"));
        assert_eq!(request_host(&req), Some("b.example.com".to_string()));
    }

    #[test]
    fn test_request_host_missing() {
        assert_eq!(request_host(&request_with_host("/path", None)), None);
        assert_eq!(request_host(&request_with_host("/path", Some(""))), None);
    }

    #[test]
    fn test_identity_headers_for_mapped_host() {
        let signer = RequestSigner::new(SECRET).unwrap();
        let mut headers = HeaderMap::new();

        apply_identity_headers(&mut headers, "a.example.com", Some("cust-42"), Some(&signer))
            .unwrap();

        assert_eq!(headers.get(X_CUSTOMER_DOMAIN).unwrap(), "a.example.com");
        assert_eq!(headers.get(X_CUSTOMER_ID).unwrap(), "cust-42");
        assert_eq!(
            headers.get(X_VANITY_SIGNATURE).unwrap(),
            "c8e5a4d3f72e735ed4e650c6ab505517b5742bdccd7bad4f89d17d770d505bf4"
        );
    }

    #[test]
    fn test_identity_headers_overwrite_spoofed_values() {
        let signer = RequestSigner::new(SECRET).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(X_CUSTOMER_DOMAIN, HeaderValue::from_static("evil.example.com"));
        headers.insert(X_CUSTOMER_ID, HeaderValue::from_static("cust-666"));
        headers.insert(X_VANITY_SIGNATURE, HeaderValue::from_static("deadbeef"));

        apply_identity_headers(&mut headers, "unmapped.example.com", None, Some(&signer))
            .unwrap();

        assert_eq!(headers.get(X_CUSTOMER_DOMAIN).unwrap(), "unmapped.example.com");
        assert!(headers.get(X_CUSTOMER_ID).is_none());
        assert_eq!(
            headers.get(X_VANITY_SIGNATURE).unwrap(),
            "0b5ec8059a9b3bb9a2514bc39883afcf0a87584541adf37d3577597d781abab7"
        );
    }

    #[test]
    fn test_identity_headers_without_signer() {
        let mut headers = HeaderMap::new();
        headers.insert(X_VANITY_SIGNATURE, HeaderValue::from_static("deadbeef"));

        apply_identity_headers(&mut headers, "a.example.com", Some("cust-42"), None).unwrap();

        assert_eq!(headers.get(X_CUSTOMER_ID).unwrap(), "cust-42");
        assert!(headers.get(X_VANITY_SIGNATURE).is_none());
    }

    #[test]
    fn test_identity_headers_reject_invalid_customer_id() {
        let mut headers = HeaderMap::new();
        let result = apply_identity_headers(&mut headers, "a.example.com", Some("bad\nid"), None);
        assert!(matches!(result, Err(ProxyError::InvalidHeader(_))));
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-kept", HeaderValue::from_static("1"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-kept").unwrap(), "1");
    }

    #[test]
    fn test_upgrade_protocol() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(upgrade_protocol(&headers).is_none());

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(upgrade_protocol(&headers).unwrap(), "websocket");
    }

    #[test]
    fn test_forwarded_headers_append() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        let remote: SocketAddr = "192.0.2.7:40000".parse().unwrap();

        set_forwarded_headers(
            &mut headers,
            remote,
            HeaderValue::from_static("a.example.com"),
            true,
        )
        .unwrap();

        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.1, 192.0.2.7");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "a.example.com");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
    }

    #[test]
    fn test_https_location() {
        let uri: Uri = "/path?q=1".parse().unwrap();
        assert_eq!(
            https_location("a.example.com", 443, &uri),
            "https://a.example.com/path?q=1"
        );
        assert_eq!(
            https_location("a.example.com", 8443, &uri),
            "https://a.example.com:8443/path?q=1"
        );
    }

    #[test]
    fn test_config_debug_redacts_secrets() {
        let config = ProxyConfig::new("http://127.0.0.1:8000".parse().unwrap())
            .with_signing_secret(SECRET)
            .with_admin_api("admin.example.com", Some("t0ken".to_string()));

        let debug = format!("{:?}", config);
        assert!(!debug.contains(SECRET));
        assert!(!debug.contains("t0ken"));
        assert!(debug.contains("admin.example.com"));
    }
}
