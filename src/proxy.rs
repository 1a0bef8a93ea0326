use crate::context::{ConnectionInfo, RequestContext};
use crate::error::{standard_response, ProxyErrorCode};
use crate::filter::{ProxyResponse, RequestFilter};
use crate::passthru::X_REQUEST_ID;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Longest accepted client-supplied request id
const MAX_REQUEST_ID_LEN: usize = 128;

/// Default per-request deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Listener that runs every request through a root filter
pub struct ProxyServer {
    bind_addr: SocketAddr,
    handler: Arc<dyn RequestFilter>,
    tls_acceptor: Option<TlsAcceptor>,
    request_timeout: Duration,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, handler: Arc<dyn RequestFilter>) -> Self {
        Self {
            bind_addr,
            handler,
            tls_acceptor: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Bind the configured address and serve until shutdown is signalled
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.serve(listener, shutdown_rx).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let tls_acceptor = self.tls_acceptor.clone();
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, handler, true, request_timeout).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, handler, false, request_timeout).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %local_addr, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    handler: Arc<dyn RequestFilter>,
    is_tls: bool,
    request_timeout: Duration,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move {
            Ok::<_, Infallible>(handle_request(req, handler, addr, is_tls, request_timeout).await)
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    handler: Arc<dyn RequestFilter>,
    client_addr: SocketAddr,
    is_tls: bool,
    request_timeout: Duration,
) -> ProxyResponse {
    let request_id = request_id(req.headers());

    let (parts, body) = req.into_parts();
    let mut req = Request::from_parts(parts, body.boxed());
    req.extensions_mut().insert(RequestContext::new(request_id.clone()));
    req.extensions_mut().insert(ConnectionInfo {
        peer_addr: client_addr,
        tls: is_tls,
    });

    debug!(method = %req.method(), uri = %req.uri(), client = %client_addr, request_id = %request_id, "Incoming request");

    let mut response = match tokio::time::timeout(request_timeout, handler.filter(req)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(
                request_id = %request_id,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            standard_response(ProxyErrorCode::RequestTimeout)
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// Propagate a sane client-supplied request id or mint a new one
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
