//! Cookie-mask filter: hides a session handler's cookies from everything
//! downstream and attaches the handler's `Set-Cookie` headers on the way out.

use crate::context::RequestContext;
use crate::cookie::{replace_request_cookies, request_cookies, Cookie};
use crate::error::ProxyErrorCode;
use crate::filter::{ProxyRequest, ProxyResponse, RequestFilter, StandardResponseFilter};
use crate::session::{Session, SessionHandler};
use async_trait::async_trait;
use hyper::header::{HeaderValue, SET_COOKIE};
use std::sync::Arc;
use tracing::{error, warn};

pub struct CookieMaskFilter {
    handler: Arc<dyn SessionHandler>,
    masked: Arc<dyn RequestFilter>,
    on_error: Arc<dyn RequestFilter>,
}

impl CookieMaskFilter {
    /// Mask `handler`'s cookies in front of `masked`. Failures answer with
    /// the standard 500 page.
    pub fn new(handler: Arc<dyn SessionHandler>, masked: Arc<dyn RequestFilter>) -> Self {
        Self {
            handler,
            masked,
            on_error: Arc::new(StandardResponseFilter::new(ProxyErrorCode::InternalError)),
        }
    }

    /// Route masking failures to `on_error` instead of the default 500 page
    pub fn with_on_error(mut self, on_error: Arc<dyn RequestFilter>) -> Self {
        self.on_error = on_error;
        self
    }
}

#[async_trait]
impl RequestFilter for CookieMaskFilter {
    async fn filter(&self, mut req: ProxyRequest) -> ProxyResponse {
        let cookies = request_cookies(req.headers());

        let mut session = self.handler.get_session();
        let result = session.cookie_mask(cookies);
        let session: Arc<dyn Session> = Arc::from(session);

        // The session is published before either branch runs, so the error
        // path observes the same context as the normal one.
        RequestContext::of_mut(&mut req).set_session(session);

        let (mut response, set_cookies) = match result {
            Ok(outcome) => {
                RequestContext::of_mut(&mut req).merge_values(outcome.context);
                replace_request_cookies(req.headers_mut(), &outcome.forward);
                (self.masked.filter(req).await, outcome.set)
            }
            Err(err) => {
                error!(error = %err, staged = err.set.len(), "Cookie masking failed");
                replace_request_cookies(req.headers_mut(), &err.forward);
                (self.on_error.filter(req).await, err.set)
            }
        };

        append_set_cookies(&mut response, &set_cookies);
        response
    }
}

fn append_set_cookies(response: &mut ProxyResponse, cookies: &[Cookie]) {
    for cookie in cookies {
        match HeaderValue::from_str(&cookie.to_set_cookie()) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => {
                warn!(cookie = %cookie.name, error = %e, "Dropping unrepresentable Set-Cookie");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{empty_body, filter_fn, full_body};
    use crate::security::{EntropyError, EntropySource};
    use crate::session::MinSessionHandler;
    use http_body_util::BodyExt;
    use hyper::header::COOKIE;
    use hyper::{Request, Response, StatusCode};

    #[derive(Debug)]
    struct FailingEntropy;

    impl EntropySource for FailingEntropy {
        fn fill(&self, _dest: &mut [u8]) -> Result<(), EntropyError> {
            Err(EntropyError::new("exhausted"))
        }
    }

    /// Downstream that echoes the cookie header it received
    fn cookie_echo() -> Arc<dyn RequestFilter> {
        Arc::new(filter_fn(|req: ProxyRequest| async move {
            let cookies = req
                .headers()
                .get(COOKIE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let has_session = RequestContext::of(&req)
                .map(|ctx| ctx.session().is_some())
                .unwrap_or(false);
            let body = format!("cookies={};session={}", cookies, has_session);
            Response::new(full_body(body))
        }))
    }

    fn request(cookie: Option<&str>) -> ProxyRequest {
        let mut builder = Request::builder().uri("/");
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder.body(empty_body()).unwrap()
    }

    async fn body_string(response: ProxyResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn set_cookies(response: &ProxyResponse) -> Vec<String> {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_first_visit_sets_cookie() {
        let handler = Arc::new(MinSessionHandler::new("test", "/", "").unwrap());
        let filter = CookieMaskFilter::new(handler, cookie_echo());

        let response = filter.filter(request(Some("foo=bar"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let set = set_cookies(&response);
        assert_eq!(set.len(), 1);
        assert!(set[0].starts_with("test-"));
        assert!(set[0].contains("HttpOnly"));
        assert!(set[0].contains("Secure"));

        assert_eq!(body_string(response).await, "cookies=foo=bar;session=true");
    }

    #[tokio::test]
    async fn test_own_cookie_stripped() {
        let handler = Arc::new(MinSessionHandler::new("test", "/", "").unwrap());
        let filter = CookieMaskFilter::new(handler, cookie_echo());

        let first = filter.filter(request(None)).await;
        let pair = set_cookies(&first)[0]
            .split(';')
            .next()
            .unwrap()
            .to_string();

        let header = format!("a=1; {}; b=2", pair);
        let response = filter.filter(request(Some(&header))).await;
        assert!(set_cookies(&response).is_empty());
        assert_eq!(body_string(response).await, "cookies=a=1; b=2;session=true");
    }

    #[tokio::test]
    async fn test_session_adopted_next_to_utf8_cookie() {
        let handler = Arc::new(MinSessionHandler::new("test", "/", "").unwrap());
        let echo = filter_fn(|req: ProxyRequest| async move {
            let cookies = req
                .headers()
                .get(COOKIE)
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .unwrap_or_default();
            Response::new(full_body(cookies))
        });
        let filter = CookieMaskFilter::new(handler.clone(), Arc::new(echo));

        let first = filter.filter(request(None)).await;
        let pair = set_cookies(&first)[0]
            .split(';')
            .next()
            .unwrap()
            .to_string();

        let header = format!("app=café; {}", pair);
        let mut req = request(None);
        req.headers_mut()
            .insert(COOKIE, HeaderValue::from_bytes(header.as_bytes()).unwrap());
        let response = filter.filter(req).await;

        assert!(set_cookies(&response).is_empty());
        assert_eq!(handler.session_count(), 1);
        assert_eq!(body_string(response).await, "app=café");
    }

    #[tokio::test]
    async fn test_error_path_emits_staged_cookies() {
        let handler = Arc::new(
            MinSessionHandler::with_entropy("test", "/", "", Arc::new(FailingEntropy)).unwrap(),
        );
        let filter = CookieMaskFilter::new(handler, cookie_echo()).with_on_error(cookie_echo());

        let stale = format!("test-{}=abc", "e".repeat(64));
        let header = format!("{}; other=1", stale);
        let response = filter.filter(request(Some(&header))).await;

        let set = set_cookies(&response);
        assert_eq!(set.len(), 1);
        assert!(set[0].contains("Max-Age=0"));
        assert_eq!(body_string(response).await, "cookies=other=1;session=true");
    }

    #[tokio::test]
    async fn test_default_on_error_is_500() {
        let handler = Arc::new(
            MinSessionHandler::with_entropy("test", "/", "", Arc::new(FailingEntropy)).unwrap(),
        );
        let filter = CookieMaskFilter::new(handler, cookie_echo());

        let response = filter.filter(request(None)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(set_cookies(&response).is_empty());
    }
}
