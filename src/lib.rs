//! Pullcord - an authenticating reverse proxy that wakes backends on demand
//!
//! Requests flow through a chain of filters built from a JSON configuration:
//! - Cookie-mask filters hide proxy session cookies from everything downstream
//! - Login handlers gate a subtree behind an XSRF-protected form
//! - Monitor filters check backend liveness and fire wake triggers
//! - Passthru filters forward the survivors to the upstream server

pub mod cli;
pub mod config;
pub mod context;
pub mod cookie;
pub mod cookiemask;
pub mod error;
pub mod filter;
pub mod login;
pub mod monitor;
pub mod passthru;
pub mod password;
pub mod proxy;
pub mod resources;
pub mod router;
pub mod security;
pub mod session;
pub mod tls;
pub mod trigger;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
