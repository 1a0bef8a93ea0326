//! Factories for every component type that can appear in a configuration
//! document.

use crate::config::{parse_data, ConfigError, Resolver, Resource, TypeRegistry};
use crate::cookiemask::CookieMaskFilter;
use crate::filter::{LandingFilter, StandardResponseFilter};
use crate::login::LoginHandler;
use crate::monitor::{MinMonitor, MonitorFilter, ServiceConfig};
use crate::passthru::PassthruFilter;
use crate::password::{InMemPwdStore, Pbkdf2Hash};
use crate::proxy::ProxyServer;
use crate::router::ExactPathRouter;
use crate::session::MinSessionHandler;
use crate::tls::{tls_acceptor, CertificateProvider, PemFiles, SelfSigned};
use crate::trigger::{CompoundTrigger, DelayTrigger, RateLimitTrigger, ShellTrigger};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

impl TypeRegistry {
    /// A registry knowing every component of this crate
    pub fn with_builtin_types() -> Result<Self, ConfigError> {
        let mut registry = TypeRegistry::new();
        let builtins: [(&str, fn(&Value, &mut Resolver<'_>) -> Result<Resource, ConfigError>); 15] = [
            ("compoundtrigger", compound_trigger),
            ("delaytrigger", delay_trigger),
            ("ratelimittrigger", rate_limit_trigger),
            ("shelltrigger", shell_trigger),
            ("minsessionhandler", min_session_handler),
            ("cookiemaskfilter", cookie_mask_filter),
            ("inmempwdstore", in_mem_pwd_store),
            ("loginhandler", login_handler),
            ("minmonitor", min_monitor),
            ("monitorfilter", monitor_filter),
            ("exactpathrouter", exact_path_router),
            ("passthru", passthru),
            ("standardresponse", standard_response),
            ("landingfilter", landing_filter),
            ("server", server),
        ];

        for (type_name, factory) in builtins {
            registry.register(type_name, factory)?;
        }
        Ok(registry)
    }
}

/// Load a configuration file using the builtin types
pub fn load_config(path: impl AsRef<std::path::Path>) -> Result<crate::config::LoadedConfig, ConfigError> {
    TypeRegistry::with_builtin_types()?.load_file(path)
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CompoundTriggerData {
    triggers: Vec<Value>,
}

fn compound_trigger(data: &Value, resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: CompoundTriggerData = parse_data("compoundtrigger", data)?;
    let triggers = data
        .triggers
        .iter()
        .map(|t| resolver.trigger(t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Resource::Trigger(Arc::new(CompoundTrigger::new(triggers))))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DelayTriggerData {
    trigger: Value,
    delay_ms: u64,
}

fn delay_trigger(data: &Value, resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: DelayTriggerData = parse_data("delaytrigger", data)?;
    let target = resolver.trigger(&data.trigger)?;
    Ok(Resource::Trigger(Arc::new(DelayTrigger::new(
        target,
        Duration::from_millis(data.delay_ms),
    ))))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RateLimitTriggerData {
    trigger: Value,
    max_allowed: usize,
    window_secs: u64,
}

fn rate_limit_trigger(data: &Value, resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: RateLimitTriggerData = parse_data("ratelimittrigger", data)?;
    let target = resolver.trigger(&data.trigger)?;
    Ok(Resource::Trigger(Arc::new(RateLimitTrigger::new(
        target,
        data.max_allowed,
        Duration::from_secs(data.window_secs),
    ))))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellTriggerData {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    command_line: Option<String>,
}

fn shell_trigger(data: &Value, _resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: ShellTriggerData = parse_data("shelltrigger", data)?;
    let trigger = match (data.command, data.command_line) {
        (Some(command), None) => ShellTrigger::new(command, data.args),
        (None, Some(line)) if data.args.is_empty() => ShellTrigger::from_command_line(&line)
            .map_err(|e| ConfigError::component("shelltrigger", e))?,
        _ => {
            return Err(ConfigError::invalid(
                "shelltrigger",
                "expected either command (with optional args) or command_line",
            ))
        }
    };
    Ok(Resource::Trigger(Arc::new(trigger)))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MinSessionHandlerData {
    name: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    domain: String,
}

fn min_session_handler(data: &Value, _resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: MinSessionHandlerData = parse_data("minsessionhandler", data)?;
    let handler = MinSessionHandler::new(data.name, data.path, data.domain)
        .map_err(|e| ConfigError::component("minsessionhandler", e))?;
    Ok(Resource::SessionHandler(Arc::new(handler)))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CookieMaskFilterData {
    handler: Value,
    masked: Value,
    on_error: Option<Value>,
}

fn cookie_mask_filter(data: &Value, resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: CookieMaskFilterData = parse_data("cookiemaskfilter", data)?;
    let handler = resolver.session_handler(&data.handler)?;
    let masked = resolver.filter(&data.masked)?;

    let mut filter = CookieMaskFilter::new(handler, masked);
    if let Some(on_error) = resolver.optional_filter(data.on_error.as_ref())? {
        filter = filter.with_on_error(on_error);
    }
    Ok(Resource::Filter(Arc::new(filter)))
}

fn in_mem_pwd_store(data: &Value, _resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let records: HashMap<String, Pbkdf2Hash> = parse_data("inmempwdstore", data)?;
    let store = InMemPwdStore::new();
    for (identifier, hash) in records {
        store.insert(identifier, hash);
    }
    Ok(Resource::PasswordChecker(Arc::new(store)))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LoginHandlerData {
    identifier: String,
    password_checker: Value,
    downstream: Value,
}

fn login_handler(data: &Value, resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: LoginHandlerData = parse_data("loginhandler", data)?;
    let checker = resolver.password_checker(&data.password_checker)?;
    let downstream = resolver.filter(&data.downstream)?;
    Ok(Resource::Filter(Arc::new(LoginHandler::new(
        data.identifier,
        checker,
        downstream,
    ))))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MinMonitorData {
    #[serde(default)]
    services: BTreeMap<String, ServiceConfig>,
}

fn min_monitor(data: &Value, _resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: MinMonitorData = parse_data("minmonitor", data)?;
    let monitor = MinMonitor::new();
    for (name, service) in data.services {
        monitor
            .add(name, service)
            .map_err(|e| ConfigError::component("minmonitor", e))?;
    }
    Ok(Resource::Monitor(Arc::new(monitor)))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MonitorFilterData {
    monitor: Value,
    service: String,
    downstream: Value,
    on_down: Option<Value>,
    on_up: Option<Value>,
    always: Option<Value>,
    #[serde(default)]
    retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    retry_interval_ms: u64,
}

fn default_retry_interval_ms() -> u64 {
    500
}

fn monitor_filter(data: &Value, resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: MonitorFilterData = parse_data("monitorfilter", data)?;
    let monitor = resolver.monitor(&data.monitor)?;
    if !monitor.contains(&data.service) {
        return Err(ConfigError::invalid(
            "monitorfilter",
            format!("monitor has no service named '{}'", data.service),
        ));
    }
    let downstream = resolver.filter(&data.downstream)?;

    let mut filter = MonitorFilter::new(monitor, data.service, downstream)
        .with_retries(data.retries, Duration::from_millis(data.retry_interval_ms));
    if let Some(trigger) = resolver.optional_trigger(data.on_down.as_ref())? {
        filter = filter.on_down(trigger);
    }
    if let Some(trigger) = resolver.optional_trigger(data.on_up.as_ref())? {
        filter = filter.on_up(trigger);
    }
    if let Some(trigger) = resolver.optional_trigger(data.always.as_ref())? {
        filter = filter.always(trigger);
    }
    Ok(Resource::Filter(Arc::new(filter)))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ExactPathRouterData {
    #[serde(default)]
    routes: BTreeMap<String, Value>,
    default: Option<Value>,
}

fn exact_path_router(data: &Value, resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: ExactPathRouterData = parse_data("exactpathrouter", data)?;
    let mut router = ExactPathRouter::new();
    for (path, filter) in &data.routes {
        router = router.route(path.clone(), resolver.filter(filter)?);
    }
    if let Some(default) = resolver.optional_filter(data.default.as_ref())? {
        router = router.with_default(default);
    }
    Ok(Resource::Filter(Arc::new(router)))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PassthruData {
    host: String,
    port: u16,
    timeout_secs: Option<u64>,
}

fn passthru(data: &Value, _resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: PassthruData = parse_data("passthru", data)?;
    let mut filter = PassthruFilter::new(data.host, data.port);
    if let Some(secs) = data.timeout_secs {
        filter = filter.with_timeout(Duration::from_secs(secs));
    }
    Ok(Resource::Filter(Arc::new(filter)))
}

fn standard_response(data: &Value, _resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let status: u16 = parse_data("standardresponse", data)?;
    let filter = StandardResponseFilter::from_status(status).ok_or_else(|| {
        ConfigError::invalid("standardresponse", format!("no standard page for status {}", status))
    })?;
    Ok(Resource::Filter(Arc::new(filter)))
}

fn landing_filter(_data: &Value, _resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    Ok(Resource::Filter(Arc::new(LandingFilter)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TlsData {
    Files { cert_file: PathBuf, key_file: PathBuf },
    SelfSigned { self_signed: Vec<String> },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerData {
    listen: String,
    handler: Value,
    tls: Option<TlsData>,
    request_timeout_secs: Option<u64>,
}

fn server(data: &Value, resolver: &mut Resolver<'_>) -> Result<Resource, ConfigError> {
    let data: ServerData = parse_data("server", data)?;
    let addr: SocketAddr = data
        .listen
        .parse()
        .map_err(|e| ConfigError::invalid("server", format!("invalid listen address '{}': {}", data.listen, e)))?;
    let handler = resolver.filter(&data.handler)?;

    let mut server = ProxyServer::new(addr, handler);
    if let Some(tls) = data.tls {
        let provider: Box<dyn CertificateProvider> = match tls {
            TlsData::Files { cert_file, key_file } => Box::new(PemFiles::new(cert_file, key_file)),
            TlsData::SelfSigned { self_signed } if self_signed.is_empty() => Box::new(SelfSigned::default()),
            TlsData::SelfSigned { self_signed } => Box::new(SelfSigned::new(self_signed)),
        };
        let acceptor = tls_acceptor(provider.as_ref()).map_err(|e| ConfigError::component("server", e))?;
        server = server.with_tls(acceptor);
    }
    if let Some(secs) = data.request_timeout_secs {
        server = server.with_request_timeout(Duration::from_secs(secs));
    }
    Ok(Resource::Server(Arc::new(server)))
}
