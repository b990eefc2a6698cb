//! VanityProxy - Main entry point
//!
//! Multi-tenant reverse proxy for customer vanity domains

use anyhow::{Context, Result};
use clap::Parser;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;
use vanityproxy::store::cached::DEFAULT_CACHE_CAPACITY;
use vanityproxy::{
    CachedStore, CertificateManager, ProxyConfig, ProxyServer, SelfSignedIssuer, SqliteStore,
    Store, StoreCertCache,
};

/// VanityProxy - Multi-tenant reverse proxy for customer vanity domains
#[derive(Parser, Debug)]
#[command(name = "vanityproxy")]
#[command(author = "VanityProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Multi-tenant TLS-terminating reverse proxy for customer vanity domains")]
struct Args {
    /// Upstream every request is forwarded to
    #[arg(long, env = "BACKEND_URL")]
    backend_url: Url,

    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/vanity.db")]
    db_path: PathBuf,

    /// Number of hostname lookups kept in memory
    #[arg(long, env = "CACHE_CAPACITY", default_value_t = DEFAULT_CACHE_CAPACITY)]
    cache_capacity: usize,

    /// HMAC key for X-Vanity-Signature
    #[arg(long, env = "PROXY_SECRET", hide_env_values = true)]
    proxy_secret: Option<String>,

    /// Hostname serving the admin API
    #[arg(long, env = "VANITY_API_HOSTNAME")]
    api_hostname: Option<String>,

    /// Bearer token required by the admin API
    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "8443")]
    https_port: u16,

    /// Enable HTTPS server
    #[arg(long, env = "ENABLE_HTTPS", default_value = "false")]
    enable_https: bool,

    /// Force HTTPS redirect
    #[arg(long, env = "FORCE_HTTPS", default_value = "false")]
    force_https: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run in production mode (ports 80/443)
    #[arg(long)]
    production: bool,
}

const CACHE_STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();

    // Production mode overrides
    if args.production {
        args.http_port = 80;
        args.https_port = 443;
        args.enable_https = true;
        args.force_https = true;
    }

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting VanityProxy v{}", env!("CARGO_PKG_VERSION"));

    let capacity =
        NonZeroUsize::new(args.cache_capacity).context("--cache-capacity must be non-zero")?;

    // Initialize store
    let sqlite: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&args.db_path)
            .with_context(|| format!("Failed to open store at {}", args.db_path.display()))?,
    );
    info!("Store initialized at: {}", args.db_path.display());

    let cached = Arc::new(CachedStore::new(sqlite.clone(), capacity));
    let store: Arc<dyn Store> = cached.clone();
    info!("Domain cache capacity: {}", capacity);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_STATS_INTERVAL);
        loop {
            ticker.tick().await;
            let stats = cached.stats();
            debug!(
                "Domain cache: {} hits, {} misses, {}/{} entries",
                stats.hits, stats.misses, stats.entries, stats.capacity
            );
        }
    });

    // Initialize certificate manager
    let cert_cache = Arc::new(StoreCertCache::new(sqlite));
    let cert_manager = Arc::new(
        CertificateManager::new(cert_cache, store.clone(), Arc::new(SelfSignedIssuer))
            .with_extra_hosts(args.api_hostname.iter()),
    );

    if args.enable_https {
        info!("HTTPS port: {}", args.https_port);
        warn!("Certificates are self-signed; plug an ACME issuer in for public traffic");
    }

    // Create proxy configuration
    let mut config = ProxyConfig::new(args.backend_url)
        .with_ports(args.http_port, args.https_port)
        .with_https(args.enable_https, args.force_https);

    if let Some(secret) = args.proxy_secret {
        config = config.with_signing_secret(secret);
    }
    if let Some(hostname) = args.api_hostname {
        info!("Admin API served on: {}", hostname);
        config = config.with_admin_api(hostname, args.api_token);
    }

    // Create and run proxy server
    let server = Arc::new(ProxyServer::new(config, store, cert_manager)?);

    info!("VanityProxy started successfully");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    Ok(())
}
