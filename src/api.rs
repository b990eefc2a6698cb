//! Administrative API for customer domain mappings
//!
//! Routes (JSON bodies):
//! - `POST /customers` with `{"domain", "customer_id"}`
//! - `GET /customers`
//! - `GET /customers/{domain}`
//! - `DELETE /customers/{domain}`
//!
//! When a token is configured every request needs `Authorization: Bearer <token>`.

use crate::hostname::normalize_host;
use crate::response::{empty_response, json_response, status_response, ProxyBody};
use crate::store::{DomainMapping, Store};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::AUTHORIZATION;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info};

const MAX_BODY_BYTES: usize = 64 * 1024;

enum Route<'a> {
    Collection,
    Item(Cow<'a, str>),
}

pub struct AdminApi {
    store: Arc<dyn Store>,
    token: Option<String>,
}

impl AdminApi {
    /// An empty token disables authentication
    pub fn new(store: Arc<dyn Store>, token: Option<String>) -> Self {
        Self {
            store,
            token: token.filter(|t| !t.is_empty()),
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        if !self.authorized(&req) {
            return status_response(StatusCode::UNAUTHORIZED);
        }

        let path = req.uri().path().to_string();
        let route = match path.strip_prefix("/customers") {
            Some("") | Some("/") => Route::Collection,
            Some(rest) => match rest.strip_prefix('/') {
                Some(segment) if !segment.contains('/') => match decode_segment(segment) {
                    Some(domain) => Route::Item(domain),
                    None => return status_response(StatusCode::BAD_REQUEST),
                },
                _ => return status_response(StatusCode::NOT_FOUND),
            },
            None => return status_response(StatusCode::NOT_FOUND),
        };

        match (req.method().clone(), route) {
            (Method::POST, Route::Collection) => self.create_customer(req).await,
            (Method::GET, Route::Collection) => self.list_customers().await,
            (Method::GET, Route::Item(domain)) => self.get_customer(&domain).await,
            (Method::DELETE, Route::Item(domain)) => self.delete_customer(&domain).await,
            _ => status_response(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    fn authorized<B>(&self, req: &Request<B>) -> bool {
        let Some(token) = &self.token else {
            return true;
        };

        let expected = format!("Bearer {}", token);
        req.headers()
            .get(AUTHORIZATION)
            .map(|value| bool::from(value.as_bytes().ct_eq(expected.as_bytes())))
            .unwrap_or(false)
    }

    async fn create_customer<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return status_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(_) => return status_response(StatusCode::BAD_REQUEST),
        };

        let mapping: DomainMapping = match serde_json::from_slice(&body) {
            Ok(mapping) => mapping,
            Err(_) => return status_response(StatusCode::BAD_REQUEST),
        };

        let Some(domain) = normalize_host(&mapping.domain) else {
            return status_response(StatusCode::BAD_REQUEST);
        };
        if mapping.customer_id.is_empty() {
            return status_response(StatusCode::BAD_REQUEST);
        }

        if let Err(e) = self.store.set_domain(&domain, &mapping.customer_id).await {
            error!("Error setting domain {}: {}", domain, e);
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }

        info!("Mapped {} to customer {}", domain, mapping.customer_id);
        empty_response(StatusCode::CREATED)
    }

    async fn list_customers(&self) -> Response<ProxyBody> {
        let domains = match self.store.list_domains().await {
            Ok(domains) => domains,
            Err(e) => {
                error!("Error listing domains: {}", e);
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let mut customers: Vec<DomainMapping> = domains
            .into_iter()
            .map(|(domain, customer_id)| DomainMapping {
                domain,
                customer_id,
            })
            .collect();
        customers.sort_by(|a, b| a.domain.cmp(&b.domain));

        to_json(StatusCode::OK, &customers)
    }

    async fn get_customer(&self, domain: &str) -> Response<ProxyBody> {
        let Some(domain) = normalize_host(domain) else {
            return status_response(StatusCode::NOT_FOUND);
        };

        match self.store.get_domain(&domain).await {
            Ok(Some(customer_id)) => to_json(
                StatusCode::OK,
                &DomainMapping {
                    domain,
                    customer_id,
                },
            ),
            Ok(None) => status_response(StatusCode::NOT_FOUND),
            Err(e) => {
                error!("Error looking up domain {}: {}", domain, e);
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn delete_customer(&self, domain: &str) -> Response<ProxyBody> {
        let Some(domain) = normalize_host(domain) else {
            return empty_response(StatusCode::NO_CONTENT);
        };

        if let Err(e) = self.store.delete_domain(&domain).await {
            error!("Error deleting domain {}: {}", domain, e);
            return status_response(StatusCode::INTERNAL_SERVER_ERROR);
        }

        info!("Removed mapping for {}", domain);
        empty_response(StatusCode::NO_CONTENT)
    }
}

fn to_json<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(status, body),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Percent-decode a `{domain}` path segment
fn decode_segment(segment: &str) -> Option<Cow<'_, str>> {
    urlencoding::decode(segment).ok()
}
