//! Response builders shared by the proxy and the admin API

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};

/// Body type for every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Create full body
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Plain-text response whose body is the status' canonical reason
pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    text_response(status, status.canonical_reason().unwrap_or("Error"))
}

pub fn json_response(status: StatusCode, body: Vec<u8>) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// Permanent redirect. Falls back to a 400 if `location` is not a valid header value.
pub fn redirect_response(location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = empty_response(StatusCode::MOVED_PERMANENTLY);
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => status_response(StatusCode::BAD_REQUEST),
    }
}
