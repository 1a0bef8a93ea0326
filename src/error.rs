//! Standard error pages returned by the pipeline

use crate::filter::{full_body, ProxyResponse};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};

/// Header carrying the machine-readable error code
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Error codes for responses generated by the proxy itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// No route or handler for the requested path
    NotFound,
    /// A filter failed in a way the caller cannot fix
    InternalError,
    /// The backend is asleep and is being woken up
    ServiceUnavailable,
    /// Failed to connect to the upstream
    ConnectionFailed,
    /// The request deadline elapsed
    RequestTimeout,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
            ProxyErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }

    fn page(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotFound => NOT_FOUND_PAGE,
            ProxyErrorCode::InternalError => INTERNAL_ERROR_PAGE,
            ProxyErrorCode::ServiceUnavailable => SERVICE_UNAVAILABLE_PAGE,
            ProxyErrorCode::ConnectionFailed => BAD_GATEWAY_PAGE,
            ProxyErrorCode::RequestTimeout => GATEWAY_TIMEOUT_PAGE,
        }
    }
}

/// Build the standard HTML response for `code`
pub fn standard_response(code: ProxyErrorCode) -> ProxyResponse {
    let mut response = Response::new(full_body(code.page()));
    *response.status_mut() = code.status_code();

    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(X_PROXY_ERROR, HeaderValue::from_static(code.as_header_value()));

    if code == ProxyErrorCode::ServiceUnavailable {
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
    }

    response
}

/// 404 page
pub fn not_found() -> ProxyResponse {
    standard_response(ProxyErrorCode::NotFound)
}

/// 500 page
pub fn internal_error() -> ProxyResponse {
    standard_response(ProxyErrorCode::InternalError)
}

pub const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>404 Not Found</title>
</head>
<body>
<h1>404 Not Found</h1>
<p>The requested page could not be found.</p>
</body>
</html>
"#;

pub const INTERNAL_ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>500 Internal Server Error</title>
</head>
<body>
<h1>500 Internal Server Error</h1>
<p>The server encountered an error while processing your request.</p>
</body>
</html>
"#;

pub const SERVICE_UNAVAILABLE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>503 Service Unavailable</title>
<meta http-equiv="refresh" content="5">
</head>
<body>
<h1>503 Service Unavailable</h1>
<p>The service is starting up. This page will reload automatically.</p>
</body>
</html>
"#;

pub const BAD_GATEWAY_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>502 Bad Gateway</title>
</head>
<body>
<h1>502 Bad Gateway</h1>
<p>The upstream server could not be reached.</p>
</body>
</html>
"#;

pub const GATEWAY_TIMEOUT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>504 Gateway Timeout</title>
</head>
<body>
<h1>504 Gateway Timeout</h1>
<p>The request did not complete in time.</p>
</body>
</html>
"#;
