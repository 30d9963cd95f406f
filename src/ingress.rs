//! Public HTTP side of the relay
//!
//! Requests for `/{subdomain}/{rest}` are forwarded down the matching tunnel
//! and answered with whatever the client sends back.

use std::time::Instant;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::server::RelayState;
use crate::tunnel::{collapse_headers, ResponsePayload};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Hop-by-hop headers of the local response; the relay frames its own body
const HOP_HEADERS: [HeaderName; 2] = [TRANSFER_ENCODING, CONNECTION];

const LANDING_TEXT: &str =
    "tunl relay server\n\nTo use a tunnel, visit: /<subdomain>/your/path\n";

/// Handle one public request
pub async fn handle<B>(state: &RelayState, req: Request<B>) -> Response<BoxBody>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let started = Instant::now();

    let Some((subdomain, path)) = split_path(req.uri()) else {
        return text_response(StatusCode::OK, LANDING_TEXT);
    };

    let tunnel = match state.registry.lookup(&subdomain).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            debug!(subdomain = %subdomain, "No tunnel for request");
            return text_response(StatusCode::NOT_FOUND, e.to_string());
        }
    };

    let method = req.method().to_string();
    let headers = collapse_headers(req.headers());
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(subdomain = %subdomain, error = %e, "Failed to read request body");
            return text_response(
                StatusCode::BAD_REQUEST,
                format!("Failed to read request body: {e}"),
            );
        }
    };

    let result = tunnel
        .forward(
            method.clone(),
            path.clone(),
            headers,
            body,
            state.config.forward_timeout,
        )
        .await;

    let response = match result {
        Ok(payload) => into_http_response(payload),
        Err(e) => {
            warn!(subdomain = %subdomain, method = %method, path = %path, error = %e, "Forwarding failed");
            error_response(&e)
        }
    };

    info!(
        subdomain = %subdomain,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "Forwarded request"
    );

    response
}

/// Split `/{subdomain}/{rest}?{query}` into the subdomain and `/{rest}?{query}`
///
/// Returns `None` when the path names no subdomain.
fn split_path(uri: &Uri) -> Option<(String, String)> {
    let path = uri.path();
    let path = path.strip_prefix('/').unwrap_or(path);
    let (subdomain, rest) = match path.split_once('/') {
        Some((subdomain, rest)) => (subdomain, rest),
        None => (path, ""),
    };
    if subdomain.is_empty() {
        return None;
    }

    let mut forward_path = format!("/{rest}");
    if let Some(query) = uri.query() {
        forward_path.push('?');
        forward_path.push_str(query);
    }
    Some((subdomain.to_string(), forward_path))
}

fn into_http_response(payload: ResponsePayload) -> Response<BoxBody> {
    let Ok(status) = StatusCode::from_u16(payload.status_code) else {
        warn!(id = %payload.id, status = payload.status_code, "Tunnel returned unusable status code");
        return text_response(
            StatusCode::BAD_GATEWAY,
            format!("Tunnel returned invalid status code {}", payload.status_code),
        );
    };

    let mut response = Response::new(full_body(Bytes::new()));
    for (name, value) in &payload.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            (Ok(name), Ok(_)) if HOP_HEADERS.contains(&name) => {}
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(id = %payload.id, header = %name, "Dropping invalid response header"),
        }
    }
    *response.status_mut() = status;
    *response.body_mut() = full_body(payload.body);
    response
}

fn error_response(err: &TunnelError) -> Response<BoxBody> {
    let status = match err {
        TunnelError::NotFound { .. } => StatusCode::NOT_FOUND,
        TunnelError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        TunnelError::Disconnected { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };
    text_response(status, err.to_string())
}

pub(crate) fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<BoxBody> {
    let mut response = Response::new(full_body(text));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

pub(crate) fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}
