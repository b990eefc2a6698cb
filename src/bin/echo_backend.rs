//! Example upstream for trying the proxy by hand
//!
//! Echoes what it received, including the identity headers and whether the
//! signature checks out against `PROXY_SECRET`.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderName;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use vanityproxy::proxy::{X_CUSTOMER_DOMAIN, X_CUSTOMER_ID, X_VANITY_SIGNATURE};
use vanityproxy::RequestSigner;

/// Echo backend for VanityProxy
#[derive(Parser, Debug)]
#[command(name = "vanityproxy-echo-backend")]
#[command(version = "1.0.0")]
#[command(about = "Echo backend that checks VanityProxy identity headers")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "9000")]
    port: u16,

    /// Shared secret used to verify X-Vanity-Signature
    #[arg(long, env = "PROXY_SECRET", hide_env_values = true)]
    proxy_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .compact()
        .init();

    let signer = RequestSigner::from_secret(args.proxy_secret.as_deref())
        .context("Invalid PROXY_SECRET")?
        .map(Arc::new);
    if signer.is_none() {
        warn!("PROXY_SECRET not set, signatures will not be verified");
    }

    let addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Echo backend listening on {}", addr);

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let signer = signer.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let signer = signer.clone();
                async move { echo(req, signer.as_deref()).await }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Connection error from {}: {}", remote_addr, e);
            }
        });
    }
}

async fn echo(
    req: Request<Incoming>,
    signer: Option<&RequestSigner>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let header = |name: HeaderName| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    let domain = header(X_CUSTOMER_DOMAIN);
    let customer_id = header(X_CUSTOMER_ID);
    let signature = header(X_VANITY_SIGNATURE);

    let verified = match signer {
        Some(signer) => signer.verify(&customer_id, &domain, &signature).to_string(),
        None => "unchecked".to_string(),
    };

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let body_len = match req.into_body().collect().await {
        Ok(body) => body.to_bytes().len(),
        Err(_) => 0,
    };

    info!(
        "{} {} domain={} customer={} verified={}",
        method, path, domain, customer_id, verified
    );

    let text = format!(
        "method: {}\npath: {}\nbody_bytes: {}\ncustomer_domain: {}\ncustomer_id: {}\nsignature_valid: {}\n",
        method, path, body_len, domain, customer_id, verified
    );

    Ok(Response::new(Full::new(Bytes::from(text))))
}
