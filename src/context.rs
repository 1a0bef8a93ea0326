//! Per-request state threaded through the filter chain.
//!
//! The context lives in the request's extensions so that it travels with the
//! request through every filter without changing the filter signature.

use crate::session::Session;
use hyper::Request;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Facts about the client connection a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_addr: SocketAddr,
    pub tls: bool,
}

#[derive(Clone, Default)]
pub struct RequestContext {
    request_id: Option<String>,
    session: Option<Arc<dyn Session>>,
    authenticated_user: Option<String>,
    values: HashMap<String, Value>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Default::default()
        }
    }

    /// The context attached to `req`, if any
    pub fn of<B>(req: &Request<B>) -> Option<&RequestContext> {
        req.extensions().get::<RequestContext>()
    }

    /// The context attached to `req`, attaching an empty one first if needed
    pub fn of_mut<B>(req: &mut Request<B>) -> &mut RequestContext {
        req.extensions_mut().get_or_insert_default::<RequestContext>()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// The session published by the innermost cookie-mask filter
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.session.clone()
    }

    pub fn set_session(&mut self, session: Arc<dyn Session>) {
        self.session = Some(session);
    }

    pub fn authenticated_user(&self) -> Option<&str> {
        self.authenticated_user.as_deref()
    }

    pub fn set_authenticated_user(&mut self, user: impl Into<String>) {
        self.authenticated_user = Some(user.into());
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Merge `values` into the side table, overwriting existing keys
    pub fn merge_values(&mut self, values: impl IntoIterator<Item = (String, Value)>) {
        self.values.extend(values);
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("has_session", &self.session.is_some())
            .field("authenticated_user", &self.authenticated_user)
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}
