//! Executes forwarded requests against the local server

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{info, warn};

use crate::tunnel::{collapse_headers, RequestPayload, ResponsePayload};

/// Deadline for the reachability probe before dialing the relay
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Headers describing the public hop; the local call sets its own
const HOP_HEADERS: [HeaderName; 4] = [HOST, CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION];

/// Turns [`RequestPayload`]s into calls against `target` and back into [`ResponsePayload`]s
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    client: Client<HttpConnector, Full<Bytes>>,
    target: String,
    timeout: Duration,
}

impl LocalExecutor {
    /// `target` is a base URL like `http://localhost:3000`, without trailing `/`
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            target: target.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Run one request. Always yields exactly one response:
    /// - 500 if the local request cannot be built
    /// - 502 if the local server cannot be reached in time
    /// - otherwise the local server's status, headers, and body
    pub async fn execute(&self, request: RequestPayload) -> ResponsePayload {
        let started = Instant::now();

        let response = match self.build(&request) {
            Ok(local) => self.call(&request.id, local).await,
            Err(e) => {
                warn!(method = %request.method, path = %request.path, error = %e, "Failed to create request");
                ResponsePayload::text(&request.id, 500, format!("Failed to create request: {e}"))
            }
        };

        info!(
            method = %request.method,
            path = %request.path,
            status = response.status_code,
            latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Handled request"
        );
        response
    }

    fn build(&self, request: &RequestPayload) -> Result<Request<Full<Bytes>>, http::Error> {
        let mut local = Request::builder()
            .method(request.method.as_str())
            .uri(format!("{}{}", self.target, request.path))
            .body(Full::new(request.body.clone()))?;

        let headers = local.headers_mut();
        for (name, value) in &request.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) else {
                warn!(id = %request.id, header = %name, "Dropping invalid request header");
                continue;
            };
            if !HOP_HEADERS.contains(&name) {
                headers.insert(name, value);
            }
        }

        Ok(local)
    }

    async fn call(&self, id: &str, local: Request<Full<Bytes>>) -> ResponsePayload {
        let result = tokio::time::timeout(self.timeout, async {
            let response = self.client.request(local).await.map_err(|e| e.to_string())?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await.map_err(|e| e.to_string())?.to_bytes();
            Ok::<_, String>((parts, body))
        })
        .await;

        match result {
            Ok(Ok((parts, body))) => ResponsePayload {
                id: id.to_string(),
                status_code: parts.status.as_u16(),
                headers: collapse_headers(&parts.headers),
                body,
            },
            Ok(Err(e)) => {
                warn!(target = %self.target, error = %e, "Local server unavailable");
                ResponsePayload::text(id, 502, "could not reach local server")
            }
            Err(_) => {
                warn!(target = %self.target, timeout_secs = self.timeout.as_secs(), "Local server timed out");
                ResponsePayload::text(id, 502, "could not reach local server")
            }
        }
    }

    /// Whether the local server answers at all
    pub async fn is_reachable(&self) -> bool {
        let Ok(probe) = Request::get(format!("{}/", self.target)).body(Full::new(Bytes::new()))
        else {
            return false;
        };
        matches!(
            tokio::time::timeout(PROBE_TIMEOUT, self.client.request(probe)).await,
            Ok(Ok(_))
        )
    }
}
