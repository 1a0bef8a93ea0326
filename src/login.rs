//! Login handler: an XSRF-guarded form that gates a downstream filter.
//!
//! Per session (and per handler identifier) the handler moves through
//! Unseen → Challenged → Authenticated. Every rejected attempt rotates the
//! XSRF token. Nothing in the pipeline moves a session back out of
//! Authenticated.

use crate::context::RequestContext;
use crate::error::internal_error;
use crate::filter::{empty_body, html_response, ProxyBody, ProxyRequest, ProxyResponse, RequestFilter};
use crate::password::{PasswordChecker, PasswordError};
use crate::security::{constant_time_eq, os_entropy, random_hex, EntropySource};
use crate::session::{Session, SessionError};
use async_trait::async_trait;
use http_body_util::{BodyExt, Limited};
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::{Method, Request, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Random bytes in an XSRF token (128 hex chars)
const XSRF_TOKEN_BYTES: usize = 64;

/// Upper bound on a login form body
const MAX_FORM_BYTES: usize = 64 * 1024;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Message shown above the login form after a rejected attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Banner {
    BadRequest,
    InvalidCredentials,
}

impl Banner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Banner::BadRequest => "Bad request",
            Banner::InvalidCredentials => "Invalid credentials",
        }
    }
}

/// Session keys (and form field names) scoped to one handler identifier
struct SessionKeys {
    authenticated: String,
    xsrf: String,
    username: String,
    password: String,
}

impl SessionKeys {
    fn new(identifier: &str) -> Self {
        Self {
            authenticated: format!("authenticated-{}", identifier),
            xsrf: format!("xsrf-{}", identifier),
            username: format!("username-{}", identifier),
            password: format!("password-{}", identifier),
        }
    }
}

enum Attempt {
    Authenticated(String),
    Rejected(Banner),
    Failed,
}

pub struct LoginHandler {
    identifier: String,
    password_checker: Arc<dyn PasswordChecker>,
    downstream: Arc<dyn RequestFilter>,
    entropy: Arc<dyn EntropySource>,
}

impl LoginHandler {
    pub fn new(
        identifier: impl Into<String>,
        password_checker: Arc<dyn PasswordChecker>,
        downstream: Arc<dyn RequestFilter>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            password_checker,
            downstream,
            entropy: os_entropy(),
        }
    }

    pub fn with_entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn pass_through(
        &self,
        mut req: ProxyRequest,
        session: &dyn Session,
        keys: &SessionKeys,
    ) -> ProxyResponse {
        if let Ok(Value::String(username)) = session.get_value(&keys.username) {
            RequestContext::of_mut(&mut req).set_authenticated_user(username);
        }
        self.downstream.filter(req).await
    }

    async fn attempt(&self, parts: &Parts, body: ProxyBody, token: &str, keys: &SessionKeys) -> Attempt {
        let form = match parse_form(parts, body).await {
            Ok(form) => form,
            Err(e) => {
                debug!(identifier = %self.identifier, error = %e, "Unparseable login form");
                return Attempt::Rejected(Banner::BadRequest);
            }
        };

        let submitted = match form.get(&keys.xsrf) {
            Some(values) => values,
            None => return Attempt::Rejected(Banner::InvalidCredentials),
        };
        if submitted.len() != 1 || !constant_time_eq(submitted[0].as_bytes(), token.as_bytes()) {
            info!(identifier = %self.identifier, "Login attempt with mismatched XSRF token");
            return Attempt::Rejected(Banner::InvalidCredentials);
        }

        let (username, password) = match (form.get(&keys.username), form.get(&keys.password)) {
            (Some(username), Some(password)) => (username, password),
            _ => return Attempt::Rejected(Banner::InvalidCredentials),
        };
        if username.len() != 1 || password.len() != 1 {
            return Attempt::Rejected(Banner::BadRequest);
        }

        let username = username[0].clone();
        let password = password[0].clone();
        let checker = Arc::clone(&self.password_checker);
        let user = username.clone();
        let result = tokio::task::spawn_blocking(move || checker.check_password(&user, &password)).await;

        match result {
            Ok(Ok(())) => Attempt::Authenticated(username),
            Ok(Err(PasswordError::NoSuchIdentifier)) | Ok(Err(PasswordError::BadPassword)) => {
                info!(identifier = %self.identifier, username = %username, "Failed login attempt");
                Attempt::Rejected(Banner::InvalidCredentials)
            }
            Ok(Err(e)) => {
                error!(identifier = %self.identifier, error = %e, "Password check failed");
                Attempt::Failed
            }
            Err(e) => {
                error!(identifier = %self.identifier, error = %e, "Password check task failed");
                Attempt::Failed
            }
        }
    }

    /// Issue a fresh XSRF token and render the login form
    fn challenge(&self, session: &dyn Session, keys: &SessionKeys, action: &str, banner: Option<Banner>) -> ProxyResponse {
        let token = match random_hex(self.entropy.as_ref(), XSRF_TOKEN_BYTES) {
            Ok(token) => token,
            Err(e) => {
                error!(identifier = %self.identifier, error = %e, "Failed to generate XSRF token");
                return internal_error();
            }
        };

        if let Err(e) = session.set_value(&keys.xsrf, Value::String(token.clone())) {
            error!(identifier = %self.identifier, error = %e, "Failed to store XSRF token");
            return internal_error();
        }

        let page = render_login_page(action, keys, &token, banner);
        let mut response = html_response(StatusCode::OK, page);
        response
            .headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

#[async_trait]
impl RequestFilter for LoginHandler {
    async fn filter(&self, req: ProxyRequest) -> ProxyResponse {
        let session = match RequestContext::of(&req).and_then(RequestContext::session) {
            Some(session) => session,
            None => {
                error!(identifier = %self.identifier, "Login handler reached without a session");
                return internal_error();
            }
        };
        let keys = SessionKeys::new(&self.identifier);

        match session.get_value(&keys.authenticated) {
            Ok(Value::Bool(true)) => return self.pass_through(req, session.as_ref(), &keys).await,
            Ok(_) | Err(SessionError::NoSuchSessionValue) => {}
            Err(e) => {
                error!(identifier = %self.identifier, error = %e, "Failed to read authentication state");
                return internal_error();
            }
        }

        let stored_token = match session.get_value(&keys.xsrf) {
            Ok(Value::String(token)) => Some(token),
            Err(SessionError::NoSuchSessionValue) => None,
            Ok(other) => {
                error!(identifier = %self.identifier, value = %other, "XSRF token is not a string");
                return internal_error();
            }
            Err(e) => {
                error!(identifier = %self.identifier, error = %e, "Failed to read XSRF token");
                return internal_error();
            }
        };

        let action = req.uri().path().to_string();

        let banner = match stored_token {
            None => None,
            Some(token) => {
                let (parts, body) = req.into_parts();
                match self.attempt(&parts, body, &token, &keys).await {
                    Attempt::Authenticated(username) => {
                        if let Err(e) = session
                            .set_value(&keys.authenticated, Value::Bool(true))
                            .and_then(|_| session.set_value(&keys.username, Value::String(username.clone())))
                        {
                            error!(identifier = %self.identifier, error = %e, "Failed to record login");
                            return internal_error();
                        }
                        info!(identifier = %self.identifier, username = %username, "Login succeeded");

                        // The form body has been consumed and carries the password
                        let mut req = Request::from_parts(parts, empty_body());
                        req.headers_mut().remove(CONTENT_LENGTH);
                        req.headers_mut().remove(CONTENT_TYPE);
                        RequestContext::of_mut(&mut req).set_authenticated_user(username);
                        return self.downstream.filter(req).await;
                    }
                    Attempt::Rejected(banner) => Some(banner),
                    Attempt::Failed => return internal_error(),
                }
            }
        };

        self.challenge(session.as_ref(), &keys, &action, banner)
    }
}

#[derive(Debug, thiserror::Error)]
enum FormError {
    #[error("failed to read form body: {0}")]
    Body(String),
}

/// Collect query and url-encoded body parameters. Body values come first.
async fn parse_form(parts: &Parts, body: ProxyBody) -> Result<HashMap<String, Vec<String>>, FormError> {
    let mut form: HashMap<String, Vec<String>> = HashMap::new();

    let has_form_body = matches!(parts.method, Method::POST | Method::PUT | Method::PATCH)
        && parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_start().to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE))
            .unwrap_or(false);

    if has_form_body {
        let bytes = Limited::new(body, MAX_FORM_BYTES)
            .collect()
            .await
            .map_err(|e| FormError::Body(e.to_string()))?
            .to_bytes();
        for (key, value) in url::form_urlencoded::parse(&bytes).into_owned() {
            form.entry(key).or_default().push(value);
        }
    }

    if let Some(query) = parts.uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()).into_owned() {
            form.entry(key).or_default().push(value);
        }
    }

    Ok(form)
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

fn render_login_page(action: &str, keys: &SessionKeys, token: &str, banner: Option<Banner>) -> String {
    let banner = banner
        .map(|b| format!("<p class=\"banner\">{}</p>\n", b.as_str()))
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<title>Login</title>
</head>
<body>
<h1>Login</h1>
{banner}<form method="POST" action="{action}">
<input type="hidden" name="{xsrf_field}" value="{token}">
<label>Username: <input type="text" name="{username_field}"></label><br>
<label>Password: <input type="password" name="{password_field}"></label><br>
<input type="submit" value="Log in">
</form>
</body>
</html>
"#,
        banner = banner,
        action = escape_html(action),
        xsrf_field = escape_html(&keys.xsrf),
        token = token,
        username_field = escape_html(&keys.username),
        password_field = escape_html(&keys.password),
    )
}
