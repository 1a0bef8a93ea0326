//! Terminal filter forwarding requests to an upstream HTTP server
//!
//! Requests go through a pooled client so that keep-alive connections to
//! the backend are reused across requests.

use crate::context::{ConnectionInfo, RequestContext};
use crate::error::{standard_response, ProxyErrorCode};
use crate::filter::{ProxyBody, ProxyRequest, ProxyResponse, RequestFilter};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum PassthruError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("failed to build upstream request: {0}")]
    RequestBuild(#[from] hyper::http::Error),
}

/// Connection pool settings for the upstream client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Forwards every request to `http://<host>:<port>`
pub struct PassthruFilter {
    host: String,
    port: u16,
    timeout: Duration,
    client: Client<HttpConnector, ProxyBody>,
}

impl PassthruFilter {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_pool_config(host, port, PoolConfig::default())
    }

    pub fn with_pool_config(host: impl Into<String>, port: u16, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        let host = host.into();
        debug!(
            host = %host,
            port,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream client initialized"
        );

        Self {
            host,
            port,
            timeout: Self::DEFAULT_TIMEOUT,
            client,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn upstream(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn upstream_request(&self, req: ProxyRequest) -> Result<ProxyRequest, PassthruError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}:{}{}", self.host, self.port, path);

        let connection = req.extensions().get::<ConnectionInfo>().copied();
        let request_id = RequestContext::of(&req)
            .and_then(|ctx| ctx.request_id())
            .map(String::from);

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        // Overwritten rather than appended: this proxy is the first trusted hop
        if let Some(info) = connection {
            if let Ok(value) = HeaderValue::from_str(&info.peer_addr.ip().to_string()) {
                headers.insert(X_FORWARDED_FOR, value);
            }
            let proto = if info.tls { "https" } else { "http" };
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        }
        let host = headers
            .get(HOST)
            .cloned()
            .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));
        if let Some(host) = host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        if let Some(id) = request_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
            headers.insert(X_REQUEST_ID, id);
        }

        let mut upstream = Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(body)?;
        *upstream.headers_mut() = headers;
        Ok(upstream)
    }

    async fn forward(&self, req: ProxyRequest) -> Result<ProxyResponse, PassthruError> {
        let upstream = self.upstream_request(req)?;
        let response = self.client.request(upstream).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(ProxyResponse::from_parts(parts, body.boxed()))
    }
}

#[async_trait]
impl RequestFilter for PassthruFilter {
    async fn filter(&self, req: ProxyRequest) -> ProxyResponse {
        match tokio::time::timeout(self.timeout, self.forward(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(upstream = %self.upstream(), error = %e, "Failed to forward request");
                standard_response(ProxyErrorCode::ConnectionFailed)
            }
            Err(_) => {
                warn!(
                    upstream = %self.upstream(),
                    timeout_secs = self.timeout.as_secs(),
                    "Upstream request timed out"
                );
                standard_response(ProxyErrorCode::RequestTimeout)
            }
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
