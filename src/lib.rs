//! VanityProxy - A multi-tenant TLS-terminating reverse proxy
//!
//! Customers point their own domains at the proxy. Each request is resolved
//! to the owning customer and forwarded to a single upstream with:
//! - `X-Customer-Domain`: the normalized hostname
//! - `X-Customer-ID`: the mapped customer, when one exists
//! - `X-Vanity-Signature`: HMAC-SHA256 over both, when a secret is configured
//!
//! Mappings and certificates share one SQLite-backed store, fronted by an LRU
//! cache for lookups.

pub mod api;
pub mod certcache;
pub mod certificate;
pub mod hostname;
pub mod proxy;
pub mod response;
pub mod signing;
pub mod store;
pub mod upstream;

pub use api::AdminApi;
pub use certcache::{CertCache, CertCacheError, StoreCertCache};
pub use certificate::{CertificateIssuer, CertificateManager, SelfSignedIssuer};
pub use hostname::normalize_host;
pub use proxy::{ProxyConfig, ProxyServer};
pub use signing::RequestSigner;
pub use store::{CachedStore, DomainMapping, MemoryStore, SqliteStore, Store, StoreError};
