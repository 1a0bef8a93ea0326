//! Exact path router

use crate::error::not_found;
use crate::filter::{ProxyRequest, ProxyResponse, RequestFilter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Dispatches on the exact request path. No normalization is applied, so
/// `/a` and `/a/` are distinct routes.
pub struct ExactPathRouter {
    routes: HashMap<String, Arc<dyn RequestFilter>>,
    default: Option<Arc<dyn RequestFilter>>,
}

impl ExactPathRouter {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            default: None,
        }
    }

    pub fn route(mut self, path: impl Into<String>, filter: Arc<dyn RequestFilter>) -> Self {
        self.routes.insert(path.into(), filter);
        self
    }

    pub fn with_default(mut self, filter: Arc<dyn RequestFilter>) -> Self {
        self.default = Some(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for ExactPathRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestFilter for ExactPathRouter {
    async fn filter(&self, req: ProxyRequest) -> ProxyResponse {
        let target = self
            .routes
            .get(req.uri().path())
            .or(self.default.as_ref())
            .cloned();

        match target {
            Some(filter) => filter.filter(req).await,
            None => {
                debug!(path = %req.uri().path(), "No route");
                not_found()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{empty_body, filter_fn, full_body};
    use http_body_util::BodyExt;
    use hyper::{Request, Response, StatusCode};

    fn named(name: &'static str) -> Arc<dyn RequestFilter> {
        Arc::new(filter_fn(move |_req: ProxyRequest| async move { Response::new(full_body(name)) }))
    }

    async fn call(router: &ExactPathRouter, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().uri(uri).body(empty_body()).unwrap();
        let response = router.filter(req).await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_exact_match() {
        let router = ExactPathRouter::new()
            .route("/a", named("a"))
            .route("/b", named("b"));

        assert_eq!(call(&router, "/a").await, (StatusCode::OK, "a".to_string()));
        assert_eq!(call(&router, "/b?x=1").await, (StatusCode::OK, "b".to_string()));
        assert_eq!(call(&router, "/a/").await.0, StatusCode::NOT_FOUND);
        assert_eq!(call(&router, "/A").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_default_route() {
        let router = ExactPathRouter::new()
            .route("/a", named("a"))
            .with_default(named("fallback"));

        assert_eq!(call(&router, "/elsewhere").await.1, "fallback");
        assert_eq!(call(&router, "/a").await.1, "a");
    }

    #[tokio::test]
    async fn test_empty_router_is_404() {
        let router = ExactPathRouter::new();
        let (status, body) = call(&router, "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("404"));
    }
}
