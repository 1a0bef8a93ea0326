//! Service liveness monitor
//!
//! Tracks whether each configured backend accepts TCP connections. A
//! successful probe is trusted for the service's grace period, so hot paths
//! answer from the cache without touching the network.

use crate::error::{internal_error, standard_response, ProxyErrorCode};
use crate::filter::{ProxyRequest, ProxyResponse, RequestFilter};
use crate::trigger::Trigger;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default bound on a single probe's connect time
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("no such service: {0}")]
    NoSuchService(String),

    #[error("duplicate service: {0}")]
    DuplicateService(String),

    #[error("unsupported protocol '{protocol}' for service {service}")]
    UnsupportedProtocol { service: String, protocol: String },
}

/// How to reach a monitored service
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub address: String,
    pub port: u16,
    /// How long a successful probe is trusted
    #[serde(default)]
    pub grace_period_secs: u64,
    /// Skip the probe normally run when the service is added
    #[serde(default)]
    pub defer_probe: bool,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl ServiceConfig {
    pub fn tcp(address: impl Into<String>, port: u16, grace_period: Duration) -> Self {
        Self {
            protocol: default_protocol(),
            address: address.into(),
            port,
            grace_period_secs: grace_period.as_secs(),
            defer_probe: false,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

#[derive(Debug)]
struct ServiceEntry {
    config: ServiceConfig,
    up: bool,
    last_checked: Option<Instant>,
}

/// Minimal TCP reachability monitor
#[derive(Debug, Clone)]
pub struct MinMonitor {
    services: Arc<DashMap<String, ServiceEntry>>,
    connect_timeout: Duration,
}

impl MinMonitor {
    pub fn new() -> Self {
        Self {
            services: Arc::new(DashMap::new()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Register a service. Unless `defer_probe` is set, an initial probe is
    /// started in the background on the current runtime.
    pub fn add(&self, name: impl Into<String>, config: ServiceConfig) -> Result<(), MonitorError> {
        let name = name.into();

        if config.protocol != "tcp" {
            return Err(MonitorError::UnsupportedProtocol {
                service: name,
                protocol: config.protocol,
            });
        }

        let defer_probe = config.defer_probe;
        match self.services.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MonitorError::DuplicateService(name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(
                    service = %name,
                    address = %config.address,
                    port = config.port,
                    grace_period_secs = config.grace_period_secs,
                    "Monitoring service"
                );
                slot.insert(ServiceEntry {
                    config,
                    up: false,
                    last_checked: None,
                });
            }
        }

        if !defer_probe {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let monitor = self.clone();
                    handle.spawn(async move {
                        if let Err(e) = monitor.reprobe(&name).await {
                            warn!(service = %name, error = %e, "Initial probe failed");
                        }
                    });
                }
                Err(_) => {
                    debug!(service = %name, "No runtime available, initial probe deferred");
                }
            }
        }

        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Probe the service now. `Ok(false)` means the service is down.
    pub async fn reprobe(&self, name: &str) -> Result<bool, MonitorError> {
        let config = self
            .services
            .get(name)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| MonitorError::NoSuchService(name.to_string()))?;

        let up = self.probe(name, &config).await;

        let mut entry = self
            .services
            .get_mut(name)
            .ok_or_else(|| MonitorError::NoSuchService(name.to_string()))?;
        entry.up = up;
        entry.last_checked = Some(Instant::now());

        Ok(up)
    }

    /// Cached liveness: answers from the last probe while it is up and
    /// within its grace period, otherwise probes.
    pub async fn status(&self, name: &str) -> Result<bool, MonitorError> {
        let fresh = {
            let entry = self
                .services
                .get(name)
                .ok_or_else(|| MonitorError::NoSuchService(name.to_string()))?;
            match entry.last_checked {
                Some(checked) if entry.up => Instant::now() <= checked + entry.config.grace_period(),
                _ => false,
            }
        };

        if fresh {
            return Ok(true);
        }
        self.reprobe(name).await
    }

    /// Mark the service up without probing
    pub fn set_status_up(&self, name: &str) -> Result<(), MonitorError> {
        let mut entry = self
            .services
            .get_mut(name)
            .ok_or_else(|| MonitorError::NoSuchService(name.to_string()))?;
        entry.up = true;
        entry.last_checked = Some(Instant::now());
        Ok(())
    }

    async fn probe(&self, name: &str, config: &ServiceConfig) -> bool {
        let target = (config.address.as_str(), config.port);
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => {
                debug!(service = %name, "Probe succeeded");
                true
            }
            Ok(Err(e)) => {
                debug!(service = %name, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(service = %name, "Probe timed out");
                false
            }
        }
    }
}

impl Default for MinMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Gate that only lets requests through to `downstream` while a monitored
/// service is up, firing triggers to wake it otherwise.
pub struct MonitorFilter {
    monitor: Arc<MinMonitor>,
    service: String,
    downstream: Arc<dyn RequestFilter>,
    on_down: Option<Arc<dyn Trigger>>,
    on_up: Option<Arc<dyn Trigger>>,
    always: Option<Arc<dyn Trigger>>,
    retries: u32,
    retry_interval: Duration,
}

impl MonitorFilter {
    pub fn new(
        monitor: Arc<MinMonitor>,
        service: impl Into<String>,
        downstream: Arc<dyn RequestFilter>,
    ) -> Self {
        Self {
            monitor,
            service: service.into(),
            downstream,
            on_down: None,
            on_up: None,
            always: None,
            retries: 0,
            retry_interval: Duration::from_millis(500),
        }
    }

    pub fn on_down(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.on_down = Some(trigger);
        self
    }

    pub fn on_up(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.on_up = Some(trigger);
        self
    }

    pub fn always(mut self, trigger: Arc<dyn Trigger>) -> Self {
        self.always = Some(trigger);
        self
    }

    /// Re-check a down service `retries` times before giving up
    pub fn with_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.retries = retries;
        self.retry_interval = interval;
        self
    }

    async fn fire(&self, trigger: &Option<Arc<dyn Trigger>>, which: &'static str) {
        if let Some(trigger) = trigger {
            if let Err(e) = trigger.fire().await {
                warn!(service = %self.service, trigger = which, error = %e, "Trigger failed");
            }
        }
    }

    /// Wait for the service, returning whether it came up
    async fn wait_for_service(&self) -> Result<bool, MonitorError> {
        for attempt in 1..=self.retries {
            tokio::time::sleep(self.retry_interval).await;
            if self.monitor.status(&self.service).await? {
                debug!(service = %self.service, attempt, "Service came up");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl RequestFilter for MonitorFilter {
    async fn filter(&self, req: ProxyRequest) -> ProxyResponse {
        self.fire(&self.always, "always").await;

        let up = match self.monitor.status(&self.service).await {
            Ok(true) => true,
            Ok(false) => {
                info!(service = %self.service, "Service is down, waking it");
                self.fire(&self.on_down, "on_down").await;
                match self.wait_for_service().await {
                    Ok(up) => up,
                    Err(e) => {
                        error!(service = %self.service, error = %e, "Monitor lookup failed");
                        return internal_error();
                    }
                }
            }
            Err(e) => {
                error!(service = %self.service, error = %e, "Monitor lookup failed");
                return internal_error();
            }
        };

        if !up {
            return standard_response(ProxyErrorCode::ServiceUnavailable);
        }

        self.fire(&self.on_up, "on_up").await;
        self.downstream.filter(req).await
    }
}
