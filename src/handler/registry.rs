//! Service registry mapping echo paths to handlers.
//!
//! Services form a tree rooted at `$`; nested services join with `.` and an
//! echo hangs off its service after `:`:
//!
//! ```text
//! $                      root service
//! $.user                 service "user"
//! $.user.admin           service "admin" inside "user"
//! $.user:sayHello        echo "sayHello" on "user"
//! ```
//!
//! The registry is filled through `&mut Registry` before the processor
//! starts, then frozen behind an `Arc`.
//!
//! # Example
//!
//! ```ignore
//! use echowire::handler::{Context, Registry};
//!
//! let mut registry = Registry::new(16);
//! let user = registry.add_service("$", "user")?;
//! registry.add_echo(&user, "sayHello", true, |ctx: &mut Context, name: String| {
//!     ctx.ok(format!("hello {}", name))
//! })?;
//!
//! let schema = registry.schema();
//! ```

use std::collections::{BTreeMap, HashMap};
use std::panic::Location;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::args::ArgKind;
use super::echo::{Echo, EchoBuilder, Handler, IntoEcho, TypedHandler};
use crate::error::{MountError, MountErrorKind};

/// Path of the root service.
pub const ROOT_SERVICE: &str = "$";

static SERVICE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[_0-9a-zA-Z]+$").expect("service name pattern"));
static ECHO_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[_a-zA-Z][_0-9a-zA-Z]*$").expect("echo name pattern"));

/// One service node.
#[derive(Debug)]
struct ServiceNode {
    parent: Option<String>,
    depth: u64,
    location: String,
}

/// Public description of one exported echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EchoInfo {
    /// Full path.
    pub path: String,
    /// Argument type names.
    pub args: Vec<&'static str>,
    /// Fingerprint letters.
    pub fingerprint: String,
}

/// Registry of services and echoes.
pub struct Registry {
    max_node_depth: u64,
    capture_origins: bool,
    services: HashMap<String, ServiceNode>,
    echoes: HashMap<String, Arc<Echo>>,
}

impl Registry {
    /// Create a registry holding only the root service.
    pub fn new(max_node_depth: u64) -> Self {
        let mut services = HashMap::new();
        services.insert(
            ROOT_SERVICE.to_string(),
            ServiceNode {
                parent: None,
                depth: 0,
                location: String::new(),
            },
        );
        Self {
            max_node_depth,
            capture_origins: false,
            services,
            echoes: HashMap::new(),
        }
    }

    /// Registry using the node depth limit and origin capture of `config`.
    pub fn from_config(config: &crate::config::Config) -> Self {
        let mut registry = Self::new(config.max_node_depth);
        registry.set_capture_origins(config.capture_origins);
        registry
    }

    /// Record caller origins in every echo mounted afterwards.
    pub fn set_capture_origins(&mut self, capture: bool) {
        self.capture_origins = capture;
    }

    /// Mount a service under `parent`. Returns the new service path.
    #[track_caller]
    pub fn add_service(&mut self, parent: &str, name: &str) -> Result<String, MountError> {
        let location = Location::caller();
        self.mount_service(parent, name, location).map_err(|kind| {
            let err = MountError::new(kind, location);
            tracing::error!("mount service failed: {} ({})", err, err.debug);
            err
        })
    }

    fn mount_service(
        &mut self,
        parent: &str,
        name: &str,
        location: &Location<'_>,
    ) -> Result<String, MountErrorKind> {
        if !SERVICE_NAME.is_match(name) {
            return Err(MountErrorKind::IllegalServiceName(name.to_string()));
        }
        let parent_depth = self
            .services
            .get(parent)
            .map(|node| node.depth)
            .ok_or_else(|| MountErrorKind::ServiceNotFound(parent.to_string()))?;

        let path = format!("{parent}.{name}");
        let depth = parent_depth + 1;
        if depth > self.max_node_depth {
            return Err(MountErrorKind::DepthOverflow {
                path,
                depth,
                limit: self.max_node_depth,
            });
        }
        if let Some(existing) = self.services.get(&path) {
            return Err(MountErrorKind::Duplicate {
                what: "service",
                name: name.to_string(),
                location: existing.location.clone(),
            });
        }

        self.services.insert(
            path.clone(),
            ServiceNode {
                parent: Some(parent.to_string()),
                depth,
                location: format!("{}:{}", location.file(), location.line()),
            },
        );
        tracing::debug!("mounted service {}", path);
        Ok(path)
    }

    /// Mount a typed echo on `service`. Returns the echo path.
    ///
    /// The handler's parameter list after `&mut Context` is the echo
    /// signature; only [`EchoArg`](super::EchoArg) types are accepted.
    #[track_caller]
    pub fn add_echo<F, Args>(
        &mut self,
        service: &str,
        name: &str,
        export: bool,
        handler: F,
    ) -> Result<String, MountError>
    where
        F: IntoEcho<Args>,
        Args: 'static,
    {
        self.mount_echo(
            service,
            name,
            export,
            F::arg_kinds(),
            true,
            Box::new(TypedHandler::new(handler)),
            Location::caller(),
        )
    }

    /// Start declaring a dynamic echo on `service`.
    pub fn echo(&mut self, service: &str, name: &str) -> EchoBuilder<'_> {
        EchoBuilder::new(self, service, name)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn mount_echo(
        &mut self,
        service: &str,
        name: &str,
        export: bool,
        kinds: Vec<ArgKind>,
        typed: bool,
        handler: Box<dyn Handler>,
        location: &Location<'_>,
    ) -> Result<String, MountError> {
        let fail = |kind: MountErrorKind| {
            let err = MountError::new(kind, location);
            tracing::error!("mount echo failed: {} ({})", err, err.debug);
            err
        };

        if !ECHO_NAME.is_match(name) {
            return Err(fail(MountErrorKind::IllegalEchoName(name.to_string())));
        }
        if !self.services.contains_key(service) {
            return Err(fail(MountErrorKind::ServiceNotFound(service.to_string())));
        }
        let path = format!("{service}:{name}");
        if let Some(existing) = self.echoes.get(&path) {
            return Err(fail(MountErrorKind::Duplicate {
                what: "echo",
                name: name.to_string(),
                location: existing.location().to_string(),
            }));
        }

        let echo = Echo::new(
            path.clone(),
            export,
            kinds,
            typed,
            handler,
            format!("{}:{}", location.file(), location.line()),
            self.capture_origins,
        );
        tracing::debug!("mounted echo {} [{}]", path, echo.fingerprint());
        self.echoes.insert(path.clone(), Arc::new(echo));
        Ok(path)
    }

    /// Look up an echo by full path.
    pub fn get_echo(&self, path: &str) -> Option<&Arc<Echo>> {
        self.echoes.get(path)
    }

    /// Whether a service path is mounted.
    pub fn has_service(&self, path: &str) -> bool {
        self.services.contains_key(path)
    }

    /// Parent path of a service (`None` for the root or unknown paths).
    pub fn service_parent(&self, path: &str) -> Option<&str> {
        self.services.get(path)?.parent.as_deref()
    }

    /// Depth of a service below the root.
    pub fn service_depth(&self, path: &str) -> Option<u64> {
        self.services.get(path).map(|node| node.depth)
    }

    /// All mounted echoes.
    pub fn echoes(&self) -> impl Iterator<Item = &Arc<Echo>> {
        self.echoes.values()
    }

    /// Number of mounted echoes.
    pub fn echo_count(&self) -> usize {
        self.echoes.len()
    }

    /// Describe exported echoes, sorted by path.
    pub fn schema(&self) -> Vec<EchoInfo> {
        let sorted: BTreeMap<&str, &Arc<Echo>> = self
            .echoes
            .iter()
            .filter(|(_, echo)| echo.is_exported())
            .map(|(path, echo)| (path.as_str(), echo))
            .collect();
        sorted
            .into_values()
            .map(|echo| EchoInfo {
                path: echo.path().to_string(),
                args: echo.arg_kinds().iter().map(|k| k.type_name()).collect(),
                fingerprint: echo.fingerprint().to_string(),
            })
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_NODE_DEPTH)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("services", &self.services.len())
            .field("echoes", &self.echoes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Context;

    #[test]
    fn test_add_service_and_echo() {
        let mut registry = Registry::new(4);
        let user = registry.add_service(ROOT_SERVICE, "user").unwrap();
        assert_eq!(user, "$.user");

        let path = registry
            .add_echo(&user, "sayHello", true, |ctx: &mut Context, name: String| {
                ctx.ok(format!("hello {name}"))
            })
            .unwrap();
        assert_eq!(path, "$.user:sayHello");

        let echo = registry.get_echo("$.user:sayHello").unwrap();
        assert_eq!(echo.fingerprint(), "S");
        assert!(echo.location().contains("registry.rs"));
        assert_eq!(registry.service_parent("$.user"), Some("$"));
    }

    #[test]
    fn test_nested_service_paths() {
        let mut registry = Registry::new(4);
        let a = registry.add_service("$", "a").unwrap();
        let b = registry.add_service(&a, "b").unwrap();
        assert_eq!(b, "$.a.b");
        assert_eq!(registry.service_depth(&b), Some(2));
    }

    #[test]
    fn test_illegal_names() {
        let mut registry = Registry::new(4);
        let err = registry.add_service("$", "bad-name").unwrap_err();
        assert_eq!(
            err.kind,
            MountErrorKind::IllegalServiceName("bad-name".to_string())
        );

        // service names may start with a digit, echo names may not
        assert!(registry.add_service("$", "2fa").is_ok());
        let err = registry
            .add_echo("$", "2fa", true, |ctx: &mut Context| ctx.ok(()))
            .unwrap_err();
        assert_eq!(err.kind, MountErrorKind::IllegalEchoName("2fa".to_string()));
    }

    #[test]
    fn test_unknown_parent() {
        let mut registry = Registry::new(4);
        let err = registry.add_service("$.missing", "x").unwrap_err();
        assert!(matches!(err.kind, MountErrorKind::ServiceNotFound(_)));
    }

    #[test]
    fn test_depth_limit() {
        let mut registry = Registry::new(2);
        let a = registry.add_service("$", "a").unwrap();
        let b = registry.add_service(&a, "b").unwrap();
        let err = registry.add_service(&b, "c").unwrap_err();
        assert_eq!(
            err.kind,
            MountErrorKind::DepthOverflow {
                path: "$.a.b.c".to_string(),
                depth: 3,
                limit: 2,
            }
        );
    }

    #[test]
    fn test_duplicate_quotes_existing_location() {
        let mut registry = Registry::new(4);
        registry
            .add_echo("$", "ping", true, |ctx: &mut Context| ctx.ok(()))
            .unwrap();
        let first = registry.get_echo("$:ping").unwrap().location().to_string();

        let err = registry
            .add_echo("$", "ping", true, |ctx: &mut Context| ctx.ok(()))
            .unwrap_err();
        match err.kind {
            MountErrorKind::Duplicate { what, location, .. } => {
                assert_eq!(what, "echo");
                assert_eq!(location, first);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.debug.contains("registry.rs"));
        assert_ne!(err.debug, first);
    }

    #[test]
    fn test_dynamic_echo_builder() {
        let mut registry = Registry::new(4);
        let path = registry
            .echo("$", "sum")
            .arg_i64()
            .arg_i64()
            .export(false)
            .build(|ctx, args| {
                let total: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
                ctx.ok(total)
            })
            .unwrap();
        let echo = registry.get_echo(&path).unwrap();
        assert_eq!(echo.fingerprint(), "II");
        assert!(!echo.has_fast_path());
        assert!(registry.schema().is_empty());
    }

    #[test]
    fn test_schema_lists_exported_echoes() {
        let mut registry = Registry::new(4);
        registry
            .add_echo("$", "b", true, |ctx: &mut Context, _: u64, _: f64| ctx.ok(()))
            .unwrap();
        registry
            .add_echo("$", "a", true, |ctx: &mut Context| ctx.ok(()))
            .unwrap();

        let schema = registry.schema();
        assert_eq!(schema.len(), 2);
        assert_eq!(schema[0].path, "$:a");
        assert_eq!(schema[1].args, vec!["uint64", "float64"]);
        assert_eq!(schema[1].fingerprint, "UF");
    }
}
