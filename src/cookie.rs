//! Minimal cookie codec: `Cookie` request header parsing and `Set-Cookie`
//! rendering.

use hyper::header::{HeaderMap, HeaderValue, COOKIE};
use tracing::warn;

/// An HTTP cookie as seen in either direction.
///
/// Request cookies only carry `name` and `value`; the remaining attributes
/// are meaningful when the cookie is rendered into a `Set-Cookie` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    /// Seconds until expiry. A negative value asks the client to delete the
    /// cookie immediately.
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// A cookie that instructs the client to discard `name`
    pub fn deletion(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_age: Some(-1),
            ..Default::default()
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self.max_age, Some(age) if age < 0)
    }

    /// `name=value`, as sent in a `Cookie` request header
    pub fn pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }

    /// Render as a `Set-Cookie` header value
    pub fn to_set_cookie(&self) -> String {
        let mut out = self.pair();

        if let Some(path) = &self.path {
            if !path.is_empty() {
                out.push_str("; Path=");
                out.push_str(path);
            }
        }

        if let Some(domain) = &self.domain {
            if !domain.is_empty() {
                out.push_str("; Domain=");
                out.push_str(domain);
            }
        }

        match self.max_age {
            Some(age) if age < 0 => out.push_str("; Max-Age=0"),
            Some(age) => out.push_str(&format!("; Max-Age={}", age)),
            None => {}
        }

        if self.http_only {
            out.push_str("; HttpOnly");
        }

        if self.secure {
            out.push_str("; Secure");
        }

        out
    }
}

/// Parse a single `Cookie` header value into its name/value pairs, in order.
pub fn parse_cookie_header(header: &str) -> Vec<Cookie> {
    header.split(';').filter_map(parse_pair).collect()
}

fn parse_pair(part: &str) -> Option<Cookie> {
    let (name, value) = part.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some(Cookie::new(name, value))
}

/// All cookies carried by a request, across every `Cookie` header.
///
/// Pairs are split on raw bytes, so a UTF-8 value elsewhere in the header
/// does not hide its neighbours. Pairs that are not UTF-8 are dropped.
pub fn request_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    headers
        .get_all(COOKIE)
        .iter()
        .flat_map(|v| v.as_bytes().split(|b| *b == b';'))
        .filter_map(|part| std::str::from_utf8(part).ok())
        .filter_map(parse_pair)
        .collect()
}

/// Replace the request's `Cookie` headers with exactly `cookies`.
pub fn replace_request_cookies(headers: &mut HeaderMap, cookies: &[Cookie]) {
    headers.remove(COOKIE);
    if cookies.is_empty() {
        return;
    }

    let joined = cookies
        .iter()
        .map(Cookie::pair)
        .collect::<Vec<_>>()
        .join("; ");

    match HeaderValue::from_bytes(joined.as_bytes()) {
        Ok(value) => {
            headers.insert(COOKIE, value);
        }
        Err(_) => warn!("Dropping unrepresentable Cookie header"),
    }
}
