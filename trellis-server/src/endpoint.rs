//! Endpoints: one tenant application bound to host:port(:virtualHost),
//! owning services and instances.
//!
//! Initialization parses and validates the config file and resolves the
//! host. Start verifies the home, prepares the metadata directory and type
//! cache, dry-runs every service, and loads whatever instances already
//! exist on disk, pruning the ones that fail independently. Requests then
//! resolve a service and an instance, creating the instance on first POST.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{self, DecisionLevel, KeyRule};
use crate::defaults::{RuntimeDefaults, TYPE_CACHE_FILE};
use crate::error::HttpError;
use crate::instance::{Instance, InstanceError};
use crate::message::{Incoming, Outgoing};
use crate::sandbox::{ContextId, SandboxError, ScriptEngine};
use crate::service::{Service, ServiceDef, ServiceError, normalize_services};
use crate::tls::{self, TlsError};
use trellis_core::{is_endpoint_name, is_resource_id};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("cannot read endpoint config {path}: {source}")]
    ReadConfig {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid endpoint config: {0}")]
    Config(String),

    #[error("invalid endpoint name '{0}'")]
    InvalidName(String),

    #[error("cannot resolve host '{host}': {detail}")]
    Dns { host: String, detail: String },

    #[error(transparent)]
    Services(#[from] ServiceError),

    #[error("endpoint home {0} does not exist or is not a directory")]
    HomeMissing(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error("service '{id}' failed its dry run: {source}")]
    DryRun { id: String, source: SandboxError },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Initialized,
    Starting,
    Started,
    Failed,
}

pub struct Endpoint {
    pub name: String,
    pub host: Ipv4Addr,
    pub port: u16,
    pub virtual_host: Option<String>,
    pub home: PathBuf,
    pub dummy: bool,
    metadata_dir: PathBuf,
    service_defs: Vec<ServiceDef>,
    services: RwLock<HashMap<String, Arc<Service>>>,
    instances: DashMap<String, Arc<Instance>>,
    creation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    type_cache: Mutex<serde_json::Map<String, Value>>,
    state: RwLock<EndpointState>,
    runtime: OnceLock<(ScriptEngine, ContextId)>,
}

impl Endpoint {
    /// Parse and validate one endpoint config file. The endpoint name falls
    /// back to the config file's basename; the host is resolved to IPv4.
    pub async fn init(
        config_path: &Path,
        metadata_root: &Path,
        defaults: &RuntimeDefaults,
    ) -> Result<Self, EndpointError> {
        debug!(config = %config_path.display(), "initializing endpoint");

        let raw = fs::read(config_path).map_err(|source| EndpointError::ReadConfig {
            path: config_path.display().to_string(),
            source,
        })?;
        let parsed: Value = serde_json::from_slice(&raw)
            .map_err(|e| EndpointError::Config(format!("not valid JSON: {e}")))?;
        let overrides = parsed
            .as_object()
            .ok_or_else(|| EndpointError::Config("config root must be an object".to_string()))?;

        let file_stem = config_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();

        let mut defaults_map = std::collections::BTreeMap::new();
        defaults_map.insert("host", Value::String(defaults.host.clone()));
        defaults_map.insert("port", Value::from(u64::from(defaults.port)));
        defaults_map.insert(
            "virtualHost",
            defaults
                .virtual_host
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        defaults_map.insert("name", Value::String(file_stem.clone()));
        defaults_map.insert("logLevel", Value::String(defaults.log_level.clone()));
        defaults_map.insert("dummy", Value::Bool(false));

        let mut rules = std::collections::BTreeMap::new();
        rules.insert(
            "host",
            KeyRule {
                description: "listen host",
                check: config::check_host,
            },
        );
        rules.insert(
            "port",
            KeyRule {
                description: "listen port",
                check: config::check_port,
            },
        );
        rules.insert(
            "virtualHost",
            KeyRule {
                description: "virtual host",
                check: config::check_virtual_host,
            },
        );
        rules.insert(
            "name",
            KeyRule {
                description: "endpoint name",
                check: check_name,
            },
        );
        rules.insert(
            "logLevel",
            KeyRule {
                description: "endpoint log level",
                check: config::check_log_level,
            },
        );
        rules.insert(
            "dummy",
            KeyRule {
                description: "dummy endpoint flag",
                check: config::check_bool,
            },
        );

        let merged = config::validate("endpoint", &defaults_map, Some(overrides), &rules);
        let rejected = merged
            .decisions
            .iter()
            .filter(|d| d.level == DecisionLevel::Error)
            .count();
        if rejected > 0 {
            warn!(
                config = %config_path.display(),
                "{rejected} config values were invalid and fell back to defaults"
            );
        }
        let values = merged.values;

        let name = values["name"].as_str().unwrap_or(&file_stem).to_string();
        if !is_endpoint_name(&name) {
            return Err(EndpointError::InvalidName(name));
        }

        let home = overrides
            .get("home")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| EndpointError::Config("'home' is required".to_string()))?;

        let services_value = overrides
            .get("services")
            .ok_or_else(|| EndpointError::Config("'services' is required".to_string()))?;
        let service_defs = normalize_services(services_value)?;
        if service_defs.is_empty() {
            return Err(EndpointError::Config(
                "'services' must name at least one service".to_string(),
            ));
        }

        let host_value = values["host"].as_str().unwrap_or(&defaults.host).to_string();
        let host = resolve_ipv4(&host_value).await?;

        let endpoint = Self {
            metadata_dir: metadata_root.join(&name),
            name,
            host,
            port: values["port"].as_u64().unwrap_or(u64::from(defaults.port)) as u16,
            virtual_host: values["virtualHost"].as_str().map(str::to_string),
            home,
            dummy: values["dummy"].as_bool().unwrap_or(false),
            service_defs,
            services: RwLock::new(HashMap::new()),
            instances: DashMap::new(),
            creation_locks: Mutex::new(HashMap::new()),
            type_cache: Mutex::new(serde_json::Map::new()),
            state: RwLock::new(EndpointState::Initialized),
            runtime: OnceLock::new(),
        };

        info!(endpoint = %endpoint.key(), "endpoint initialized");
        Ok(endpoint)
    }

    /// Human-readable uniqueness token: `(virtualHost|*)host:port/name`.
    pub fn key(&self) -> String {
        let vhost = self.virtual_host.as_deref().unwrap_or("*");
        format!("({vhost}){}:{}/{}", self.host, self.port, self.name)
    }

    pub fn state(&self) -> EndpointState {
        *self.state.read()
    }

    pub fn is_started(&self) -> bool {
        self.state() == EndpointState::Started
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn start(&self, engine: &ScriptEngine) -> Result<(), EndpointError> {
        *self.state.write() = EndpointState::Starting;
        match self.start_inner(engine).await {
            Ok(()) => {
                *self.state.write() = EndpointState::Started;
                info!(endpoint = %self.key(), "endpoint started");
                Ok(())
            }
            Err(e) => {
                *self.state.write() = EndpointState::Failed;
                Err(e)
            }
        }
    }

    async fn start_inner(&self, engine: &ScriptEngine) -> Result<(), EndpointError> {
        if !self.home.is_dir() {
            return Err(EndpointError::HomeMissing(self.home.clone()));
        }

        fs::create_dir_all(&self.metadata_dir).map_err(|source| EndpointError::Io {
            context: format!("cannot create {}", self.metadata_dir.display()),
            source,
        })?;

        self.load_type_cache()?;

        // Dry-run every service in a context shared across the endpoint.
        let dry_ctx = engine.create_context(self.home.clone()).await?;
        let mut services = HashMap::new();
        for def in &self.service_defs {
            let mut service = Service::read(&self.home, def)?;
            let caps = engine
                .load_service(
                    dry_ctx,
                    &service.id,
                    &service.path.display().to_string(),
                    &service.source,
                    service.preprocess,
                )
                .await
                .map_err(|source| EndpointError::DryRun {
                    id: service.id.clone(),
                    source,
                })?;
            service.caps = caps;
            debug!(endpoint = %self.name, service = %service.id, ?caps, "service verified");
            services.insert(service.id.clone(), Arc::new(service));
        }
        self.update_type_cache(&services)?;
        *self.services.write() = services;
        let _ = self.runtime.set((engine.clone(), dry_ctx));

        // Load existing instances; failures prune, they do not abort.
        let entries = fs::read_dir(&self.metadata_dir).map_err(|source| EndpointError::Io {
            context: format!("cannot list {}", self.metadata_dir.display()),
            source,
        })?;
        for entry in entries.flatten() {
            let id = entry.file_name().to_string_lossy().to_string();
            if !is_resource_id(&id) || !entry.path().is_dir() {
                continue;
            }
            match self.load_and_start_instance(&id, engine).await {
                Ok(instance) => {
                    self.instances.insert(id, instance);
                }
                Err(e) => {
                    warn!(endpoint = %self.name, instance = %id, "dropping instance: {e}");
                }
            }
        }

        Ok(())
    }

    fn load_type_cache(&self) -> Result<(), EndpointError> {
        let path = self.metadata_dir.join(TYPE_CACHE_FILE);
        let cache = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ => {
                    warn!(endpoint = %self.name, "type cache is corrupt, reinitializing");
                    serde_json::Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fs::write(&path, b"{}").map_err(|source| EndpointError::Io {
                    context: format!("cannot write {}", path.display()),
                    source,
                })?;
                serde_json::Map::new()
            }
            Err(source) => {
                return Err(EndpointError::Io {
                    context: format!("cannot read {}", path.display()),
                    source,
                });
            }
        };
        *self.type_cache.lock() = cache;
        Ok(())
    }

    /// Reconcile the persisted type cache with the sources just verified,
    /// keyed by service ID, valued by source fingerprint. A changed entry
    /// means the tenant shipped new code since the last start.
    fn update_type_cache(
        &self,
        services: &HashMap<String, Arc<Service>>,
    ) -> Result<(), EndpointError> {
        let fresh: serde_json::Map<String, Value> = services
            .iter()
            .map(|(id, s)| (id.clone(), Value::String(s.fingerprint.clone())))
            .collect();

        let mut cache = self.type_cache.lock();
        if *cache == fresh {
            return Ok(());
        }
        for (id, fingerprint) in &fresh {
            if cache.get(id).is_some_and(|old| old != fingerprint) {
                debug!(endpoint = %self.name, service = %id, "service source changed");
            }
        }

        let path = self.metadata_dir.join(TYPE_CACHE_FILE);
        fs::write(&path, Value::Object(fresh.clone()).to_string()).map_err(|source| {
            EndpointError::Io {
                context: format!("cannot write {}", path.display()),
                source,
            }
        })?;
        *cache = fresh;
        Ok(())
    }

    async fn load_and_start_instance(
        &self,
        id: &str,
        engine: &ScriptEngine,
    ) -> Result<Arc<Instance>, InstanceError> {
        let instance = Arc::new(Instance::load(id, self.metadata_dir.join(id))?);
        instance.start(engine, &self.home).await?;
        Ok(instance)
    }

    pub fn stop(&self) {
        if let Some((engine, ctx)) = self.runtime.get() {
            engine.drop_context(*ctx);
        }
        for instance in self.instances.iter() {
            instance.stop();
        }
        *self.state.write() = EndpointState::Failed;
    }

    pub async fn handle_request(
        &self,
        incoming: &Incoming,
        outgoing: &mut Outgoing,
        request_id: &str,
    ) {
        if !self.is_started() {
            outgoing.resolve_error(&HttpError::unavailable("endpoint is not ready"));
            return;
        }

        let service = self.services.read().get(&incoming.service_id).cloned();
        let Some(service) = service else {
            outgoing.resolve_error(&HttpError::not_found(format!(
                "endpoint '{}' has no service '{}'",
                self.name, incoming.service_id
            )));
            return;
        };

        if self.dummy {
            self.handle_dummy(incoming, outgoing);
            return;
        }

        // Structural validation guarantees the header is present.
        let Some(instance_id) = incoming.instance_id.clone() else {
            outgoing.resolve_error(&HttpError::bad_request("missing instance ID"));
            return;
        };

        if let Some(instance) = self.instances.get(&instance_id).map(|e| e.value().clone()) {
            if !instance.is_started() {
                outgoing.resolve_error(&HttpError::unavailable("instance is not ready"));
                return;
            }
            instance
                .handle_request(&self.name, &service, incoming, outgoing, request_id)
                .await;
            return;
        }

        if incoming.method != http::Method::POST {
            outgoing.resolve_error(&HttpError::not_found(format!(
                "no instance '{instance_id}' on endpoint '{}'",
                self.name
            )));
            return;
        }

        self.create_instance_and_replay(&instance_id, &service, incoming, outgoing, request_id)
            .await;
    }

    fn handle_dummy(&self, incoming: &Incoming, outgoing: &mut Outgoing) {
        match incoming.method.as_str() {
            "POST" | "PUT" => {
                let body: Value = if incoming.body.is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    match serde_json::from_slice(&incoming.body) {
                        Ok(value) => value,
                        Err(_) => {
                            outgoing
                                .resolve_error(&HttpError::internal("unable to parse request body"));
                            return;
                        }
                    }
                };
                outgoing.resolve_json(200, body);
            }
            "DELETE" => outgoing.resolve_empty(204),
            other => {
                outgoing.resolve_error(&HttpError::internal(format!(
                    "unsupported method '{other}'"
                )));
            }
        }
    }

    /// First POST for an unknown instance creates it from credentials in
    /// the request body, then replays the request through it. Creation is
    /// serialized per instance ID so concurrent first requests settle on
    /// one instance object.
    async fn create_instance_and_replay(
        &self,
        instance_id: &str,
        service: &Arc<Service>,
        incoming: &Incoming,
        outgoing: &mut Outgoing,
        request_id: &str,
    ) {
        let lock = self
            .creation_locks
            .lock()
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        // A concurrent request may have won the race while we waited.
        let instance = if let Some(existing) =
            self.instances.get(instance_id).map(|e| e.value().clone())
        {
            existing
        } else {
            match self.create_instance(instance_id, incoming).await {
                Ok(instance) => {
                    self.instances
                        .insert(instance_id.to_string(), instance.clone());
                    instance
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.name,
                        instance = %instance_id,
                        "instance creation failed: {e}"
                    );
                    outgoing.resolve_error(&HttpError::internal(format!(
                        "unable to create instance '{instance_id}': {e}"
                    )));
                    drop(guard);
                    self.prune_creation_lock(instance_id);
                    return;
                }
            }
        };

        drop(guard);
        self.prune_creation_lock(instance_id);

        instance
            .handle_request(&self.name, service, incoming, outgoing, request_id)
            .await;
    }

    fn prune_creation_lock(&self, instance_id: &str) {
        let mut locks = self.creation_locks.lock();
        if let Some(lock) = locks.get(instance_id)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(instance_id);
        }
    }

    async fn create_instance(
        &self,
        instance_id: &str,
        incoming: &Incoming,
    ) -> Result<Arc<Instance>, InstanceCreateError> {
        let home = self.metadata_dir.join(instance_id);

        // A home persisted by an earlier create whose start failed, or
        // pruned at the last startup, is loaded instead of recreated.
        let instance = if home.is_dir() {
            let instance = Arc::new(Instance::load(instance_id, home)?);
            info!(endpoint = %self.name, instance = %instance_id, "adopted existing instance home");
            instance
        } else {
            let body: Value = serde_json::from_slice(&incoming.body)
                .map_err(|e| InstanceCreateError::Body(e.to_string()))?;
            let blob = body
                .get("aps")
                .and_then(|aps| aps.get("certificate"))
                .and_then(Value::as_str)
                .ok_or(InstanceCreateError::MissingCredentials)?;

            let credentials = tls::split_credentials_pem(blob)?;

            let instance = Arc::new(Instance::create(
                instance_id,
                home,
                &credentials.cert_pem,
                &credentials.key_pem,
                &credentials.controller_pem,
            )?);
            info!(endpoint = %self.name, instance = %instance_id, "instance created on demand");
            instance
        };

        let (engine, _) = self
            .runtime
            .get()
            .ok_or(InstanceCreateError::NotStarted)?;
        instance.start(engine, &self.home).await?;

        Ok(instance)
    }
}

#[derive(Debug, Error)]
enum InstanceCreateError {
    #[error("request body is not valid JSON ({0})")]
    Body(String),

    #[error("request body carries no 'aps.certificate' credentials")]
    MissingCredentials,

    #[error("invalid credentials: {0}")]
    Credentials(#[from] TlsError),

    #[error("{0}")]
    Instance(#[from] InstanceError),

    #[error("endpoint is not started")]
    NotStarted,
}

fn check_name(value: &Value) -> Option<Value> {
    let s = value.as_str()?;
    if is_endpoint_name(s) {
        Some(Value::String(s.to_string()))
    } else {
        None
    }
}

async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr, EndpointError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| EndpointError::Dns {
            host: host.to_string(),
            detail: e.to_string(),
        })?;
    addrs
        .filter_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
            _ => None,
        })
        .next()
        .ok_or_else(|| EndpointError::Dns {
            host: host.to_string(),
            detail: "no IPv4 address".to_string(),
        })
}
