//! Declarative JSON configuration
//!
//! A document names its resources under `Resources` and gives the root
//! server under `Server`:
//!
//! ```json
//! {
//!   "Resources": {
//!     "sessions": {"type": "minsessionhandler", "data": {"name": "s", "path": "/", "domain": ""}}
//!   },
//!   "Server": {"type": "server", "data": {"listen": "0.0.0.0:443", "handler": {...}}}
//! }
//! ```
//!
//! Every resource is `{"type": ..., "data": ...}`. The `ref` type points at a
//! named resource: `{"type": "ref", "data": "sessions"}`. Named resources
//! are built on first reference and shared by every later one.

use crate::filter::RequestFilter;
use crate::monitor::MinMonitor;
use crate::password::PasswordChecker;
use crate::proxy::ProxyServer;
use crate::session::SessionHandler;
use crate::trigger::Trigger;
use serde::de::{DeserializeOwned, Error as _, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Type name reserved for named references
pub const REF_TYPE: &str = "ref";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cyclic dependency through resource '{0}'")]
    CyclicDependency(String),

    #[error("no such resource: {0}")]
    NoSuchResource(String),

    #[error("resource '{name}' is a {actual}, expected a {expected}")]
    UnexpectedResourceType {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("type '{0}' cannot be registered twice")]
    DuplicateTypeRegistration(String),

    #[error("unknown resource type '{0}'")]
    UnknownType(String),

    #[error("invalid data for '{type_name}': {reason}")]
    InvalidData { type_name: String, reason: String },

    #[error("failed to build '{type_name}': {source}")]
    Component {
        type_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ConfigError {
    pub fn invalid(type_name: &str, reason: impl fmt::Display) -> Self {
        ConfigError::InvalidData {
            type_name: type_name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Wrap a component's own error raised while it was being built
    pub fn component<E>(type_name: &str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ConfigError::Component {
            type_name: type_name.to_string(),
            source: Box::new(source),
        }
    }
}

/// A fully built configuration object
#[derive(Clone)]
pub enum Resource {
    Filter(Arc<dyn RequestFilter>),
    SessionHandler(Arc<dyn SessionHandler>),
    PasswordChecker(Arc<dyn PasswordChecker>),
    Monitor(Arc<MinMonitor>),
    Trigger(Arc<dyn Trigger>),
    Server(Arc<ProxyServer>),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Filter(_) => "filter",
            Resource::SessionHandler(_) => "session handler",
            Resource::PasswordChecker(_) => "password checker",
            Resource::Monitor(_) => "monitor",
            Resource::Trigger(_) => "trigger",
            Resource::Server(_) => "server",
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource::{}", self.kind())
    }
}

/// Raw `{"type": ..., "data": ...}` record
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub data: Value,
}

impl ResourceSpec {
    /// Name used in diagnostics: the target for references, else the type
    fn label(&self) -> String {
        match (&*self.type_name, self.data.as_str()) {
            (REF_TYPE, Some(name)) => name.to_string(),
            _ => self.type_name.clone(),
        }
    }
}

#[derive(Deserialize)]
struct Document {
    #[serde(rename = "Resources", default, deserialize_with = "unique_resources")]
    resources: HashMap<String, ResourceSpec>,
    #[serde(rename = "Server")]
    server: ResourceSpec,
}

fn unique_resources<'de, D>(deserializer: D) -> Result<HashMap<String, ResourceSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UniqueResources;

    impl<'de> Visitor<'de> for UniqueResources {
        type Value = HashMap<String, ResourceSpec>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of resource names to resources")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut resources = HashMap::new();
            while let Some((name, spec)) = access.next_entry::<String, ResourceSpec>()? {
                if resources.contains_key(&name) {
                    return Err(A::Error::custom(format!("duplicate resource name '{}'", name)));
                }
                resources.insert(name, spec);
            }
            Ok(resources)
        }
    }

    deserializer.deserialize_map(UniqueResources)
}

/// Builds a resource from its `data` payload
pub type Factory =
    Box<dyn Fn(&Value, &mut Resolver<'_>) -> Result<Resource, ConfigError> + Send + Sync>;

/// Type name → factory table
#[derive(Default)]
pub struct TypeRegistry {
    factories: HashMap<String, Factory>,
}

impl TypeRegistry {
    /// An empty registry. See `with_builtin_types` for the standard one.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F) -> Result<(), ConfigError>
    where
        F: Fn(&Value, &mut Resolver<'_>) -> Result<Resource, ConfigError> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        if type_name == REF_TYPE || self.factories.contains_key(&type_name) {
            return Err(ConfigError::DuplicateTypeRegistration(type_name));
        }
        self.factories.insert(type_name, Box::new(factory));
        Ok(())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        type_name == REF_TYPE || self.factories.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<LoadedConfig, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = self.load_str(&content)?;
        info!(path = %path.display(), resources = config.resources.len(), "Configuration loaded");
        Ok(config)
    }

    pub fn load_str(&self, json: &str) -> Result<LoadedConfig, ConfigError> {
        let document: Document = serde_json::from_str(json)?;

        let mut resolver = Resolver {
            registry: self,
            specs: &document.resources,
            states: HashMap::new(),
        };

        let server = match resolver.build(&document.server)? {
            Resource::Server(server) => server,
            other => {
                return Err(ConfigError::UnexpectedResourceType {
                    name: "Server".to_string(),
                    expected: "server",
                    actual: other.kind(),
                })
            }
        };

        let resources = resolver
            .states
            .into_iter()
            .filter_map(|(name, state)| match state {
                ResolveState::Built(resource) => Some((name, resource)),
                ResolveState::UnderConstruction => None,
            })
            .collect();

        Ok(LoadedConfig { server, resources })
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

/// Result of a successful load
pub struct LoadedConfig {
    pub server: Arc<ProxyServer>,
    resources: HashMap<String, Resource>,
}

impl LoadedConfig {
    /// A named resource, if anything referenced it
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

enum ResolveState {
    UnderConstruction,
    Built(Resource),
}

/// Handed to factories so they can build nested and referenced resources
pub struct Resolver<'a> {
    registry: &'a TypeRegistry,
    specs: &'a HashMap<String, ResourceSpec>,
    states: HashMap<String, ResolveState>,
}

impl<'a> Resolver<'a> {
    /// Build the resource described by `value`, following references
    pub fn resolve(&mut self, value: &Value) -> Result<Resource, ConfigError> {
        let spec = ResourceSpec::deserialize(value)
            .map_err(|e| ConfigError::invalid("resource", e))?;
        self.build(&spec)
    }

    /// The named resource, building it on first use
    pub fn named(&mut self, name: &str) -> Result<Resource, ConfigError> {
        match self.states.get(name) {
            Some(ResolveState::Built(resource)) => return Ok(resource.clone()),
            Some(ResolveState::UnderConstruction) => {
                return Err(ConfigError::CyclicDependency(name.to_string()))
            }
            None => {}
        }

        let specs = self.specs;
        let spec = specs
            .get(name)
            .ok_or_else(|| ConfigError::NoSuchResource(name.to_string()))?;

        self.states.insert(name.to_string(), ResolveState::UnderConstruction);
        match self.build(spec) {
            Ok(resource) => {
                debug!(name, kind = resource.kind(), "Built resource");
                self.states
                    .insert(name.to_string(), ResolveState::Built(resource.clone()));
                Ok(resource)
            }
            Err(e) => {
                self.states.remove(name);
                Err(e)
            }
        }
    }

    fn build(&mut self, spec: &ResourceSpec) -> Result<Resource, ConfigError> {
        if spec.type_name == REF_TYPE {
            let name = spec
                .data
                .as_str()
                .ok_or_else(|| ConfigError::invalid(REF_TYPE, "expected a resource name"))?;
            return self.named(name);
        }

        let registry = self.registry;
        let factory = registry
            .factories
            .get(&spec.type_name)
            .ok_or_else(|| ConfigError::UnknownType(spec.type_name.clone()))?;
        factory(&spec.data, self)
    }

    fn resolve_labeled(&mut self, value: &Value) -> Result<(String, Resource), ConfigError> {
        let spec = ResourceSpec::deserialize(value)
            .map_err(|e| ConfigError::invalid("resource", e))?;
        let resource = self.build(&spec)?;
        Ok((spec.label(), resource))
    }

    pub fn filter(&mut self, value: &Value) -> Result<Arc<dyn RequestFilter>, ConfigError> {
        match self.resolve_labeled(value)? {
            (_, Resource::Filter(filter)) => Ok(filter),
            (name, other) => Err(unexpected(name, "filter", &other)),
        }
    }

    pub fn session_handler(&mut self, value: &Value) -> Result<Arc<dyn SessionHandler>, ConfigError> {
        match self.resolve_labeled(value)? {
            (_, Resource::SessionHandler(handler)) => Ok(handler),
            (name, other) => Err(unexpected(name, "session handler", &other)),
        }
    }

    pub fn password_checker(&mut self, value: &Value) -> Result<Arc<dyn PasswordChecker>, ConfigError> {
        match self.resolve_labeled(value)? {
            (_, Resource::PasswordChecker(checker)) => Ok(checker),
            (name, other) => Err(unexpected(name, "password checker", &other)),
        }
    }

    pub fn monitor(&mut self, value: &Value) -> Result<Arc<MinMonitor>, ConfigError> {
        match self.resolve_labeled(value)? {
            (_, Resource::Monitor(monitor)) => Ok(monitor),
            (name, other) => Err(unexpected(name, "monitor", &other)),
        }
    }

    pub fn trigger(&mut self, value: &Value) -> Result<Arc<dyn Trigger>, ConfigError> {
        match self.resolve_labeled(value)? {
            (_, Resource::Trigger(trigger)) => Ok(trigger),
            (name, other) => Err(unexpected(name, "trigger", &other)),
        }
    }

    /// Resolve `value` as a filter when present
    pub fn optional_filter(&mut self, value: Option<&Value>) -> Result<Option<Arc<dyn RequestFilter>>, ConfigError> {
        value.map(|v| self.filter(v)).transpose()
    }

    /// Resolve `value` as a trigger when present
    pub fn optional_trigger(&mut self, value: Option<&Value>) -> Result<Option<Arc<dyn Trigger>>, ConfigError> {
        value.map(|v| self.trigger(v)).transpose()
    }
}

fn unexpected(name: String, expected: &'static str, actual: &Resource) -> ConfigError {
    ConfigError::UnexpectedResourceType {
        name,
        expected,
        actual: actual.kind(),
    }
}

/// Deserialize a factory's `data` payload
pub fn parse_data<T: DeserializeOwned>(type_name: &str, data: &Value) -> Result<T, ConfigError> {
    T::deserialize(data).map_err(|e| ConfigError::invalid(type_name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::LandingFilter;
    use crate::trigger::tests::CountingTrigger;

    #[derive(Deserialize)]
    struct WrapData {
        inner: Value,
    }

    /// Registry with a leaf filter, a wrapping filter, a trigger and a server
    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry
            .register("leaf", |_data: &Value, _resolver: &mut Resolver<'_>| {
                Ok(Resource::Filter(Arc::new(LandingFilter)))
            })
            .unwrap();
        registry
            .register("wrap", |data: &Value, resolver: &mut Resolver<'_>| {
                let data: WrapData = parse_data("wrap", data)?;
                Ok(Resource::Filter(resolver.filter(&data.inner)?))
            })
            .unwrap();
        registry
            .register("counter", |_data: &Value, _resolver: &mut Resolver<'_>| {
                Ok(Resource::Trigger(Arc::new(CountingTrigger::default())))
            })
            .unwrap();
        registry
            .register("testserver", |data: &Value, resolver: &mut Resolver<'_>| {
                let handler = resolver.filter(data)?;
                let addr = "127.0.0.1:0".parse().map_err(|e| ConfigError::invalid("testserver", e))?;
                Ok(Resource::Server(Arc::new(ProxyServer::new(addr, handler))))
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_register_rejects_duplicates_and_ref() {
        let mut registry = registry();
        let noop = |_: &Value, _: &mut Resolver<'_>| Ok(Resource::Filter(Arc::new(LandingFilter)));
        assert!(matches!(
            registry.register("leaf", noop),
            Err(ConfigError::DuplicateTypeRegistration(name)) if name == "leaf"
        ));
        assert!(matches!(
            registry.register("ref", noop),
            Err(ConfigError::DuplicateTypeRegistration(_))
        ));
    }

    #[test]
    fn test_inline_server() {
        let config = registry()
            .load_str(r#"{"Server": {"type": "testserver", "data": {"type": "leaf"}}}"#)
            .unwrap();
        assert!(config.resource_names().is_empty());
    }

    #[test]
    fn test_shared_reference_is_one_instance() {
        let json = r#"{
            "Resources": {
                "shared": {"type": "wrap", "data": {"inner": {"type": "leaf"}}},
                "a": {"type": "wrap", "data": {"inner": {"type": "ref", "data": "shared"}}},
                "b": {"type": "wrap", "data": {"inner": {"type": "ref", "data": "shared"}}},
                "unused": {"type": "nonsense"}
            },
            "Server": {"type": "testserver", "data": {"type": "ref", "data": "a"}}
        }"#;

        let mut registry = registry();
        registry
            .register("pair", |data: &Value, resolver: &mut Resolver<'_>| {
                let items = data.as_array().cloned().unwrap_or_default();
                let first = resolver.filter(&items[0])?;
                let second = resolver.filter(&items[1])?;
                assert!(Arc::ptr_eq(&first, &second));
                Ok(Resource::Filter(first))
            })
            .unwrap();
        let config = registry.load_str(json).unwrap();

        let shared = match config.resource("shared") {
            Some(Resource::Filter(f)) => f.clone(),
            other => panic!("unexpected {:?}", other),
        };
        let a = match config.resource("a") {
            Some(Resource::Filter(f)) => f.clone(),
            other => panic!("unexpected {:?}", other),
        };
        assert!(Arc::ptr_eq(&shared, &a));

        // Unreferenced resources are never built
        assert!(config.resource("b").is_none());
        assert!(config.resource("unused").is_none());

        let json = r#"{
            "Resources": {"shared": {"type": "leaf"}},
            "Server": {"type": "testserver", "data": {"type": "pair", "data": [
                {"type": "ref", "data": "shared"},
                {"type": "ref", "data": "shared"}
            ]}}
        }"#;
        registry.load_str(json).unwrap();
    }

    #[test]
    fn test_cycle_detected() {
        let json = r#"{
            "Resources": {
                "a": {"type": "wrap", "data": {"inner": {"type": "ref", "data": "b"}}},
                "b": {"type": "wrap", "data": {"inner": {"type": "ref", "data": "a"}}}
            },
            "Server": {"type": "testserver", "data": {"type": "ref", "data": "a"}}
        }"#;
        assert!(matches!(
            registry().load_str(json),
            Err(ConfigError::CyclicDependency(name)) if name == "a"
        ));
    }

    #[test]
    fn test_self_reference_detected() {
        let json = r#"{
            "Resources": {"a": {"type": "wrap", "data": {"inner": {"type": "ref", "data": "a"}}}},
            "Server": {"type": "testserver", "data": {"type": "ref", "data": "a"}}
        }"#;
        assert!(matches!(registry().load_str(json), Err(ConfigError::CyclicDependency(_))));
    }

    #[test]
    fn test_no_such_resource() {
        let json = r#"{"Server": {"type": "testserver", "data": {"type": "ref", "data": "ghost"}}}"#;
        assert!(matches!(
            registry().load_str(json),
            Err(ConfigError::NoSuchResource(name)) if name == "ghost"
        ));
    }

    #[test]
    fn test_unexpected_resource_type() {
        let json = r#"{
            "Resources": {"t": {"type": "counter"}},
            "Server": {"type": "testserver", "data": {"type": "ref", "data": "t"}}
        }"#;
        match registry().load_str(json) {
            Err(ConfigError::UnexpectedResourceType { name, expected, actual }) => {
                assert_eq!(name, "t");
                assert_eq!(expected, "filter");
                assert_eq!(actual, "trigger");
            }
            other => panic!("unexpected {:?}", other.err()),
        }
    }

    #[test]
    fn test_top_level_must_be_server() {
        let json = r#"{"Server": {"type": "leaf"}}"#;
        assert!(matches!(
            registry().load_str(json),
            Err(ConfigError::UnexpectedResourceType { expected: "server", .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let json = r#"{"Server": {"type": "testserver", "data": {"type": "mystery"}}}"#;
        assert!(matches!(registry().load_str(json), Err(ConfigError::UnknownType(t)) if t == "mystery"));
    }

    #[test]
    fn test_duplicate_resource_names() {
        let json = r#"{
            "Resources": {"a": {"type": "leaf"}, "a": {"type": "leaf"}},
            "Server": {"type": "testserver", "data": {"type": "ref", "data": "a"}}
        }"#;
        assert!(matches!(registry().load_str(json), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_server() {
        assert!(matches!(
            registry().load_str(r#"{"Resources": {}}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_file_missing() {
        assert!(matches!(
            registry().load_file("/nonexistent/pullcord.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
