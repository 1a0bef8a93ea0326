//! The request filter abstraction every pipeline stage implements.

use crate::error::{standard_response, ProxyErrorCode};
use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::future::Future;

/// Body type flowing through the pipeline in both directions
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;
pub type ProxyRequest = Request<ProxyBody>;
pub type ProxyResponse = Response<ProxyBody>;

/// A stage of the request pipeline.
///
/// A filter either answers the request itself or hands it to a downstream
/// filter it owns. Failures are expressed as responses, never as errors.
#[async_trait]
pub trait RequestFilter: Send + Sync {
    async fn filter(&self, req: ProxyRequest) -> ProxyResponse;
}

/// Body from a complete buffer
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// An HTML response with the given status
pub fn html_response(status: StatusCode, body: impl Into<Bytes>) -> ProxyResponse {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    response
}

/// Adapter turning an async closure into a filter
pub struct FilterFn<F> {
    f: F,
}

/// Build a filter from `f`
pub fn filter_fn<F, Fut>(f: F) -> FilterFn<F>
where
    F: Fn(ProxyRequest) -> Fut + Send + Sync,
    Fut: Future<Output = ProxyResponse> + Send,
{
    FilterFn { f }
}

#[async_trait]
impl<F, Fut> RequestFilter for FilterFn<F>
where
    F: Fn(ProxyRequest) -> Fut + Send + Sync,
    Fut: Future<Output = ProxyResponse> + Send,
{
    async fn filter(&self, req: ProxyRequest) -> ProxyResponse {
        (self.f)(req).await
    }
}

/// Always answers with one of the standard pages
#[derive(Debug, Clone, Copy)]
pub struct StandardResponseFilter {
    code: ProxyErrorCode,
}

impl StandardResponseFilter {
    pub fn new(code: ProxyErrorCode) -> Self {
        Self { code }
    }

    /// Look up the filter for a numeric status (404, 500 or 503)
    pub fn from_status(status: u16) -> Option<Self> {
        let code = match status {
            404 => ProxyErrorCode::NotFound,
            500 => ProxyErrorCode::InternalError,
            502 => ProxyErrorCode::ConnectionFailed,
            503 => ProxyErrorCode::ServiceUnavailable,
            504 => ProxyErrorCode::RequestTimeout,
            _ => return None,
        };
        Some(Self::new(code))
    }
}

#[async_trait]
impl RequestFilter for StandardResponseFilter {
    async fn filter(&self, _req: ProxyRequest) -> ProxyResponse {
        standard_response(self.code)
    }
}

/// Serves a static landing page, used when no configuration is available
#[derive(Debug, Clone, Copy, Default)]
pub struct LandingFilter;

#[async_trait]
impl RequestFilter for LandingFilter {
    async fn filter(&self, _req: ProxyRequest) -> ProxyResponse {
        html_response(StatusCode::OK, LANDING_PAGE)
    }
}

const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<title>Pullcord</title>
</head>
<body>
<h1>Pullcord</h1>
<p>This proxy is running but has not been configured yet.</p>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_request() -> ProxyRequest {
        Request::builder().uri("/").body(empty_body()).unwrap()
    }

    async fn body_string(response: ProxyResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_filter_fn() {
        let filter = filter_fn(|req: ProxyRequest| async move {
            html_response(StatusCode::OK, req.uri().path().to_string())
        });
        let response = filter.filter(empty_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "/");
    }

    #[tokio::test]
    async fn test_standard_response_filter() {
        let filter = StandardResponseFilter::from_status(404).unwrap();
        let response = filter.filter(empty_request()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_string(response).await.contains("404 Not Found"));
    }

    #[test]
    fn test_standard_response_unknown_status() {
        assert!(StandardResponseFilter::from_status(418).is_none());
    }

    #[tokio::test]
    async fn test_landing_filter() {
        let response = LandingFilter.filter(empty_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("Pullcord"));
    }
}
