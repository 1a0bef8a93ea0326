//! Session handling.
//!
//! A [`SessionHandler`] owns server-side session state keyed by a proxy
//! cookie. Each request gets a fresh [`Session`] facade which is bound to an
//! existing or newly created session by [`Session::cookie_mask`].
//!
//! [`MinSessionHandler`] is the in-memory reference implementation: sessions
//! live in a single table guarded by one mutex and are lost on restart.

use crate::cookie::Cookie;
use crate::security::{constant_time_eq, os_entropy, random_hex, EntropyError, EntropySource};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifetime of a proxy session cookie, in seconds
pub const SESSION_MAX_AGE_SECS: i64 = 7200;

/// Random bytes in the cookie name suffix (64 hex chars)
const COOKIE_NAME_BYTES: usize = 32;
/// Random bytes in the cookie value (256 hex chars)
const COOKIE_VALUE_BYTES: usize = 128;
/// Minimum spacing between sweeps of expired sessions
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no such session value")]
    NoSuchSessionValue,

    #[error("session is not bound to a cookie")]
    Unbound,

    #[error("session no longer exists")]
    NoSuchSession,

    #[error(transparent)]
    InsufficientEntropy(#[from] EntropyError),

    #[error("invalid session handler name {name:?}: {source}")]
    InvalidName {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Result of a successful [`Session::cookie_mask`]
#[derive(Debug, Default)]
pub struct CookieMaskOutcome {
    /// Cookies that do not belong to this handler, in their original order
    pub forward: Vec<Cookie>,
    /// Cookies to emit via `Set-Cookie`
    pub set: Vec<Cookie>,
    /// Snapshot of the bound session's values
    pub context: HashMap<String, Value>,
}

/// A failed [`Session::cookie_mask`]. Cookies staged before the failure are
/// still handed back so they can be emitted.
#[derive(Debug, thiserror::Error)]
#[error("cookie masking failed: {source}")]
pub struct CookieMaskError {
    pub forward: Vec<Cookie>,
    pub set: Vec<Cookie>,
    #[source]
    pub source: SessionError,
}

/// Per-request view of a session
pub trait Session: Send + Sync {
    /// Read `key`, or [`SessionError::NoSuchSessionValue`] when unset
    fn get_value(&self, key: &str) -> Result<Value, SessionError>;

    /// Write `key` through to the handler's table
    fn set_value(&self, key: &str, value: Value) -> Result<(), SessionError>;

    /// Split `cookies` into those owned by this handler and the rest, and
    /// bind this facade to the session they identify (creating one if needed).
    fn cookie_mask(&mut self, cookies: Vec<Cookie>) -> Result<CookieMaskOutcome, CookieMaskError>;
}

pub trait SessionHandler: Send + Sync {
    /// A new, unbound session facade
    fn get_session(&self) -> Box<dyn Session>;
}

struct SessionEntry {
    expected_value: String,
    values: HashMap<String, Value>,
    created: Instant,
}

struct HandlerState {
    name: String,
    path: String,
    domain: String,
    cookie_pattern: Regex,
    max_age: Duration,
    entropy: Arc<dyn EntropySource>,
    table: Mutex<HashMap<String, SessionEntry>>,
    next_sweep: Mutex<Instant>,
}

impl HandlerState {
    fn is_expired(&self, entry: &SessionEntry, now: Instant) -> bool {
        now.duration_since(entry.created) >= self.max_age
    }

    /// True at most once per [`SWEEP_INTERVAL`]
    fn sweep_due(&self, now: Instant) -> bool {
        let mut next = self.next_sweep.lock();
        if now < *next {
            return false;
        }
        *next = now + SWEEP_INTERVAL;
        true
    }

    fn deletion_cookie(&self, name: String) -> Cookie {
        Cookie {
            path: Some(self.path.clone()),
            domain: Some(self.domain.clone()),
            ..Cookie::deletion(name)
        }
    }
}

/// In-memory session handler
#[derive(Clone)]
pub struct MinSessionHandler {
    state: Arc<HandlerState>,
}

impl MinSessionHandler {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        domain: impl Into<String>,
    ) -> Result<Self, SessionError> {
        Self::with_entropy(name, path, domain, os_entropy())
    }

    pub fn with_entropy(
        name: impl Into<String>,
        path: impl Into<String>,
        domain: impl Into<String>,
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Self, SessionError> {
        let name = name.into();
        let pattern = format!("^{}-[0-9a-fA-F]{{64}}$", regex::escape(&name));
        let cookie_pattern = Regex::new(&pattern).map_err(|source| SessionError::InvalidName {
            name: name.clone(),
            source,
        })?;

        Ok(Self {
            state: Arc::new(HandlerState {
                name,
                path: path.into(),
                domain: domain.into(),
                cookie_pattern,
                max_age: Duration::from_secs(SESSION_MAX_AGE_SECS as u64),
                entropy,
                table: Mutex::new(HashMap::new()),
                next_sweep: Mutex::new(Instant::now() + SWEEP_INTERVAL),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Whether `cookie_name` would be claimed by this handler
    pub fn owns_cookie(&self, cookie_name: &str) -> bool {
        self.state.cookie_pattern.is_match(cookie_name)
    }

    /// Number of live sessions in the table
    pub fn session_count(&self) -> usize {
        self.state.table.lock().len()
    }
}

impl fmt::Debug for MinSessionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinSessionHandler")
            .field("name", &self.state.name)
            .field("path", &self.state.path)
            .field("domain", &self.state.domain)
            .finish()
    }
}

impl SessionHandler for MinSessionHandler {
    fn get_session(&self) -> Box<dyn Session> {
        Box::new(MinSession {
            state: Arc::clone(&self.state),
            cookie_name: None,
        })
    }
}

/// Facade handed out by [`MinSessionHandler`]
pub struct MinSession {
    state: Arc<HandlerState>,
    cookie_name: Option<String>,
}

impl MinSession {
    /// Name of the cookie this facade is bound to
    pub fn cookie_name(&self) -> Option<&str> {
        self.cookie_name.as_deref()
    }
}

impl Session for MinSession {
    fn get_value(&self, key: &str) -> Result<Value, SessionError> {
        let name = self.cookie_name.as_ref().ok_or(SessionError::Unbound)?;
        let table = self.state.table.lock();
        table
            .get(name)
            .and_then(|entry| entry.values.get(key))
            .cloned()
            .ok_or(SessionError::NoSuchSessionValue)
    }

    fn set_value(&self, key: &str, value: Value) -> Result<(), SessionError> {
        let name = self.cookie_name.as_ref().ok_or(SessionError::Unbound)?;
        let mut table = self.state.table.lock();
        let entry = table.get_mut(name).ok_or(SessionError::NoSuchSession)?;
        entry.values.insert(key.to_string(), value);
        Ok(())
    }

    fn cookie_mask(&mut self, cookies: Vec<Cookie>) -> Result<CookieMaskOutcome, CookieMaskError> {
        let state = Arc::clone(&self.state);
        let now = Instant::now();
        let mut forward = Vec::with_capacity(cookies.len());
        let mut set = Vec::new();
        let mut adopted: Option<(String, HashMap<String, Value>)> = None;

        let mut table = state.table.lock();

        for cookie in cookies {
            if !state.cookie_pattern.is_match(&cookie.name) {
                forward.push(cookie);
                continue;
            }

            let valid = match table.get(&cookie.name) {
                Some(entry) if state.is_expired(entry, now) => {
                    debug!(handler = %state.name, "Expired session cookie presented");
                    table.remove(&cookie.name);
                    false
                }
                Some(entry) => {
                    if constant_time_eq(cookie.value.as_bytes(), entry.expected_value.as_bytes()) {
                        true
                    } else {
                        warn!(handler = %state.name, "Session cookie value mismatch, discarding session");
                        table.remove(&cookie.name);
                        false
                    }
                }
                None => {
                    debug!(handler = %state.name, "Unknown session cookie presented");
                    false
                }
            };

            if !valid {
                set.push(state.deletion_cookie(cookie.name));
            } else if adopted.is_none() {
                let values = table
                    .get(&cookie.name)
                    .map(|entry| entry.values.clone())
                    .unwrap_or_default();
                adopted = Some((cookie.name, values));
            }
        }

        if let Some((name, values)) = adopted {
            self.cookie_name = Some(name);
            return Ok(CookieMaskOutcome {
                forward,
                set,
                context: values,
            });
        }

        drop(table);

        let (name, value) = loop {
            let drawn = random_hex(state.entropy.as_ref(), COOKIE_NAME_BYTES).and_then(|suffix| {
                random_hex(state.entropy.as_ref(), COOKIE_VALUE_BYTES).map(|value| (suffix, value))
            });
            let (suffix, value) = match drawn {
                Ok(drawn) => drawn,
                Err(e) => {
                    return Err(CookieMaskError {
                        forward,
                        set,
                        source: e.into(),
                    })
                }
            };

            let name = format!("{}-{}", state.name, suffix);
            let mut table = state.table.lock();
            if table.contains_key(&name) || set.iter().any(|c| c.name == name) {
                debug!(handler = %state.name, "Session cookie name collision, drawing again");
                continue;
            }
            if state.sweep_due(now) {
                table.retain(|_, entry| !state.is_expired(entry, now));
            }
            table.insert(
                name.clone(),
                SessionEntry {
                    expected_value: value.clone(),
                    values: HashMap::new(),
                    created: now,
                },
            );
            break (name, value);
        };

        debug!(handler = %state.name, "New session created");

        set.push(Cookie {
            name: name.clone(),
            value,
            path: Some(state.path.clone()),
            domain: Some(state.domain.clone()),
            max_age: Some(SESSION_MAX_AGE_SECS),
            secure: true,
            http_only: true,
        });
        self.cookie_name = Some(name);

        Ok(CookieMaskOutcome {
            forward,
            set,
            context: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct FailingEntropy;

    impl EntropySource for FailingEntropy {
        fn fill(&self, _dest: &mut [u8]) -> Result<(), EntropyError> {
            Err(EntropyError::new("no randomness for you"))
        }
    }

    /// Yields all-zero buffers for the first three draws, then distinct ones
    #[derive(Debug, Default)]
    struct RepeatingEntropy {
        calls: AtomicUsize,
    }

    impl EntropySource for RepeatingEntropy {
        fn fill(&self, dest: &mut [u8]) -> Result<(), EntropyError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let byte = if call < 3 { 0 } else { call as u8 };
            dest.fill(byte);
            Ok(())
        }
    }

    fn handler() -> MinSessionHandler {
        MinSessionHandler::new("test", "/", "example.com").unwrap()
    }

    fn fresh_cookie(handler: &MinSessionHandler) -> Cookie {
        let mut session = handler.get_session();
        let outcome = session.cookie_mask(Vec::new()).unwrap();
        assert_eq!(outcome.set.len(), 1);
        outcome.set.into_iter().next().unwrap()
    }

    #[test]
    fn test_new_session_cookie_shape() {
        let handler = handler();
        let cookie = fresh_cookie(&handler);

        assert!(handler.owns_cookie(&cookie.name));
        assert!(cookie.name.starts_with("test-"));
        assert_eq!(cookie.name.len(), "test-".len() + 64);
        assert_eq!(cookie.value.len(), 256);
        assert!(cookie.value.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(cookie.path.as_deref(), Some("/"));
        assert_eq!(cookie.domain.as_deref(), Some("example.com"));
        assert_eq!(cookie.max_age, Some(SESSION_MAX_AGE_SECS));
        assert!(cookie.secure);
        assert!(cookie.http_only);
        assert_eq!(handler.session_count(), 1);
    }

    #[test]
    fn test_valid_cookie_adopts_session() {
        let handler = handler();

        let mut first = handler.get_session();
        let outcome = first.cookie_mask(Vec::new()).unwrap();
        let cookie = outcome.set[0].clone();
        first.set_value("color", json!("blue")).unwrap();

        let mut second = handler.get_session();
        let outcome = second
            .cookie_mask(vec![Cookie::new(cookie.name.clone(), cookie.value.clone())])
            .unwrap();

        assert!(outcome.set.is_empty());
        assert!(outcome.forward.is_empty());
        assert_eq!(outcome.context.get("color"), Some(&json!("blue")));
        assert_eq!(second.get_value("color").unwrap(), json!("blue"));
        assert_eq!(handler.session_count(), 1);
    }

    #[test]
    fn test_foreign_cookies_forwarded_in_order() {
        let handler = handler();
        let cookies = vec![
            Cookie::new("b", "2"),
            Cookie::new("test", "not-ours"),
            Cookie::new("a", "1"),
            Cookie::new("other-aaaa", "3"),
        ];

        let mut session = handler.get_session();
        let outcome = session.cookie_mask(cookies.clone()).unwrap();
        assert_eq!(outcome.forward, cookies);
        assert_eq!(outcome.set.len(), 1);
    }

    #[test]
    fn test_tampered_cookie_discards_session() {
        let handler = handler();

        let mut first = handler.get_session();
        let cookie = first.cookie_mask(Vec::new()).unwrap().set.remove(0);
        first.set_value("secret", json!(42)).unwrap();

        let mut tampered = cookie.value.clone();
        tampered.replace_range(0..1, if tampered.starts_with('0') { "1" } else { "0" });

        let mut second = handler.get_session();
        let outcome = second
            .cookie_mask(vec![Cookie::new(cookie.name.clone(), tampered)])
            .unwrap();

        assert_eq!(outcome.set.len(), 2);
        let deletion = &outcome.set[0];
        assert_eq!(deletion.name, cookie.name);
        assert!(deletion.is_deletion());
        let fresh = &outcome.set[1];
        assert_ne!(fresh.name, cookie.name);
        assert!(!fresh.is_deletion());
        assert!(outcome.context.is_empty());
        assert!(matches!(
            second.get_value("secret"),
            Err(SessionError::NoSuchSessionValue)
        ));

        // The original session is gone even for the rightful owner
        let mut third = handler.get_session();
        let outcome = third
            .cookie_mask(vec![Cookie::new(cookie.name.clone(), cookie.value)])
            .unwrap();
        assert!(outcome.set[0].is_deletion());
        assert_eq!(handler.session_count(), 2);
    }

    #[test]
    fn test_unknown_matching_cookie_deleted() {
        let handler = handler();
        let stranger = format!("test-{}", "ab".repeat(32));

        let mut session = handler.get_session();
        let outcome = session
            .cookie_mask(vec![Cookie::new(stranger.clone(), "whatever")])
            .unwrap();

        assert_eq!(outcome.set.len(), 2);
        assert_eq!(outcome.set[0].name, stranger);
        assert!(outcome.set[0].is_deletion());
        assert!(outcome.forward.is_empty());
    }

    #[test]
    fn test_unbound_session() {
        let handler = handler();
        let session = handler.get_session();
        assert!(matches!(session.get_value("x"), Err(SessionError::Unbound)));
        assert!(matches!(
            session.set_value("x", json!(1)),
            Err(SessionError::Unbound)
        ));
    }

    #[test]
    fn test_missing_value() {
        let handler = handler();
        let mut session = handler.get_session();
        session.cookie_mask(Vec::new()).unwrap();
        assert!(matches!(
            session.get_value("nothing"),
            Err(SessionError::NoSuchSessionValue)
        ));
    }

    #[test]
    fn test_entropy_failure_keeps_staged_cookies() {
        let handler =
            MinSessionHandler::with_entropy("test", "/", "", Arc::new(FailingEntropy)).unwrap();
        let stranger = format!("test-{}", "cd".repeat(32));

        let mut session = handler.get_session();
        let err = session
            .cookie_mask(vec![
                Cookie::new(stranger.clone(), "x"),
                Cookie::new("keep", "me"),
            ])
            .unwrap_err();

        assert!(matches!(err.source, SessionError::InsufficientEntropy(_)));
        assert_eq!(err.set.len(), 1);
        assert_eq!(err.set[0].name, stranger);
        assert_eq!(err.forward, vec![Cookie::new("keep", "me")]);
        assert_eq!(handler.session_count(), 0);
    }

    #[test]
    fn test_name_collision_redraws() {
        let handler = MinSessionHandler::with_entropy(
            "test",
            "/",
            "",
            Arc::new(RepeatingEntropy::default()),
        )
        .unwrap();

        let first = fresh_cookie(&handler);
        let second = fresh_cookie(&handler);
        assert_ne!(first.name, second.name);
        assert_eq!(handler.session_count(), 2);
    }

    #[test]
    fn test_handler_name_is_escaped() {
        let handler = MinSessionHandler::new("a.b", "/", "").unwrap();
        let suffix = "0".repeat(64);
        assert!(handler.owns_cookie(&format!("a.b-{}", suffix)));
        assert!(!handler.owns_cookie(&format!("aXb-{}", suffix)));
        assert!(!handler.owns_cookie(&format!("a.b-{}", &suffix[1..])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_replaced() {
        let handler = handler();
        let cookie = fresh_cookie(&handler);

        tokio::time::advance(Duration::from_secs(SESSION_MAX_AGE_SECS as u64 + 1)).await;

        let mut session = handler.get_session();
        let outcome = session
            .cookie_mask(vec![Cookie::new(cookie.name.clone(), cookie.value)])
            .unwrap();

        assert_eq!(outcome.set.len(), 2);
        assert_eq!(outcome.set[0].name, cookie.name);
        assert!(outcome.set[0].is_deletion());
        assert_eq!(handler.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_sessions_swept() {
        let handler = handler();
        fresh_cookie(&handler);
        fresh_cookie(&handler);
        assert_eq!(handler.session_count(), 2);

        tokio::time::advance(Duration::from_secs(SESSION_MAX_AGE_SECS as u64 + 1)).await;
        fresh_cookie(&handler);
        assert_eq!(handler.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_runs_at_most_once_per_interval() {
        let max_age = SESSION_MAX_AGE_SECS as u64;
        let handler = handler();
        fresh_cookie(&handler);

        // Sweeps, but nothing has expired yet
        tokio::time::advance(Duration::from_secs(max_age - 50)).await;
        fresh_cookie(&handler);
        assert_eq!(handler.session_count(), 2);

        // First session has expired, but the next sweep is not due
        tokio::time::advance(Duration::from_secs(51)).await;
        fresh_cookie(&handler);
        assert_eq!(handler.session_count(), 3);

        tokio::time::advance(SWEEP_INTERVAL).await;
        fresh_cookie(&handler);
        assert_eq!(handler.session_count(), 3);
    }
}
