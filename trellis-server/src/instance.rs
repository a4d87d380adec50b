//! Per-customer instances: TLS identity, persisted config, and a private
//! execution context.
//!
//! An instance is either created (first POST carrying credentials) or
//! loaded back from its home directory. Both paths validate the identity
//! material the same way and converge on opening a sandbox context at
//! start. The controller certificate is kept as raw DER for the per-request
//! equality check.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};

use crate::config::InstanceConfig;
use crate::defaults::{
    CONFIG_MODE, CONTROLLER_CERT_FILE, HOME_MODE, INSTANCE_CERT_FILE, INSTANCE_CONFIG_FILE,
    INSTANCE_KEY_FILE, INSTANCE_LOG_FILE, KEY_MODE,
};
use crate::error::HttpError;
use crate::message::{Incoming, Outgoing};
use crate::sandbox::{
    ContextId, HelperContext, LifecycleMethod, Outcome, SandboxError, ScriptEngine,
};
use crate::service::Service;
use crate::tls::{self, TlsError};

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance home {0} already exists")]
    HomeExists(PathBuf),

    #[error("instance home {0} does not exist or is not a directory")]
    HomeMissing(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("invalid instance config: {0}")]
    Config(String),

    #[error("instance is not started")]
    NotStarted,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> InstanceError {
    let context = context.into();
    move |source| InstanceError::Io { context, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Uninitialized,
    Initializing,
    Initialized,
    Starting,
    Started,
    Failed,
}

struct InstanceRuntime {
    engine: ScriptEngine,
    ctx: ContextId,
    loaded: Mutex<HashSet<String>>,
}

struct InstanceLog {
    writer: Mutex<Option<(NonBlocking, WorkerGuard)>>,
}

impl InstanceLog {
    fn closed() -> Self {
        Self {
            writer: Mutex::new(None),
        }
    }

    fn open(&self, home: &Path) {
        let appender = tracing_appender::rolling::never(home, INSTANCE_LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        *self.writer.lock() = Some((writer, guard));
    }

    fn write(&self, level: &str, message: &str) {
        use std::io::Write;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        if let Some((writer, _)) = self.writer.lock().as_mut() {
            let _ = writeln!(writer, "{millis} {level:5} {message}");
        }
    }
}

pub struct Instance {
    pub id: String,
    pub home: PathBuf,
    pub config: InstanceConfig,
    state: RwLock<InstanceState>,
    controller_cert_der: Vec<u8>,
    runtime: OnceLock<InstanceRuntime>,
    log: InstanceLog,
}

impl Instance {
    /// An empty shell at the start of the state machine; `create` and
    /// `load` fill it in before handing it out.
    fn bare(id: &str, home: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            home,
            config: InstanceConfig::default(),
            state: RwLock::new(InstanceState::Uninitialized),
            controller_cert_der: Vec::new(),
            runtime: OnceLock::new(),
            log: InstanceLog::closed(),
        }
    }

    fn transition(&self, next: InstanceState) {
        debug!(instance = %self.id, state = ?next, "instance state changed");
        *self.state.write() = next;
    }

    /// Create-mode construction: validate the supplied credentials, make a
    /// fresh home directory, and persist everything. Fails if the home
    /// already exists; that is how "new" is told apart from "existing".
    pub fn create(
        id: &str,
        home: PathBuf,
        cert_pem: &str,
        key_pem: &str,
        controller_pem: &str,
    ) -> Result<Self, InstanceError> {
        let mut instance = Self::bare(id, home);
        debug!(instance = id, home = %instance.home.display(), "creating instance");

        instance.transition(InstanceState::Initializing);
        if let Err(e) = instance.persist(cert_pem, key_pem, controller_pem) {
            instance.transition(InstanceState::Failed);
            return Err(e);
        }
        instance.transition(InstanceState::Initialized);

        info!(instance = id, "instance created");
        Ok(instance)
    }

    fn persist(
        &mut self,
        cert_pem: &str,
        key_pem: &str,
        controller_pem: &str,
    ) -> Result<(), InstanceError> {
        tls::validate_identity(cert_pem.as_bytes(), key_pem.as_bytes())?;
        self.controller_cert_der = tls::cert_der(controller_pem.as_bytes())?;

        match fs::create_dir(&self.home) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(InstanceError::HomeExists(self.home.clone()));
            }
            Err(e) => return Err(io_err(format!("cannot create {}", self.home.display()))(e)),
        }
        set_mode(&self.home, HOME_MODE)?;

        write_file(
            &self.home.join(INSTANCE_CERT_FILE),
            cert_pem.as_bytes(),
            CONFIG_MODE,
        )?;
        write_file(&self.home.join(INSTANCE_KEY_FILE), key_pem.as_bytes(), KEY_MODE)?;
        write_file(
            &self.home.join(CONTROLLER_CERT_FILE),
            controller_pem.as_bytes(),
            CONFIG_MODE,
        )?;
        write_file(
            &self.home.join(INSTANCE_CONFIG_FILE),
            self.config.to_value().to_string().as_bytes(),
            CONFIG_MODE,
        )
    }

    /// Load-mode construction: read persisted materials back and re-validate
    /// them exactly as create does.
    pub fn load(id: &str, home: PathBuf) -> Result<Self, InstanceError> {
        let mut instance = Self::bare(id, home);
        debug!(instance = id, home = %instance.home.display(), "loading instance");

        instance.transition(InstanceState::Initializing);
        if let Err(e) = instance.hydrate() {
            instance.transition(InstanceState::Failed);
            return Err(e);
        }
        instance.transition(InstanceState::Initialized);

        Ok(instance)
    }

    fn hydrate(&mut self) -> Result<(), InstanceError> {
        if !self.home.is_dir() {
            return Err(InstanceError::HomeMissing(self.home.clone()));
        }

        let read = |file: &str| {
            fs::read(self.home.join(file)).map_err(io_err(format!("cannot read {file}")))
        };
        let cert_pem = read(INSTANCE_CERT_FILE)?;
        let key_pem = read(INSTANCE_KEY_FILE)?;
        let controller_pem = read(CONTROLLER_CERT_FILE)?;

        tls::validate_identity(&cert_pem, &key_pem)?;
        self.controller_cert_der = tls::cert_der(&controller_pem)?;

        self.config = match fs::read(self.home.join(INSTANCE_CONFIG_FILE)) {
            Ok(raw) => {
                let parsed: Value = serde_json::from_slice(&raw)
                    .map_err(|e| InstanceError::Config(e.to_string()))?;
                InstanceConfig::from_overrides(parsed.as_object())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(instance = %self.id, "instance config missing, using defaults");
                InstanceConfig::default()
            }
            Err(e) => return Err(io_err("cannot read instance config")(e)),
        };
        Ok(())
    }

    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    pub fn is_started(&self) -> bool {
        self.state() == InstanceState::Started
    }

    #[cfg(test)]
    pub fn controller_cert_der(&self) -> &[u8] {
        &self.controller_cert_der
    }

    /// Open the private execution context. The service root for module
    /// resolution is the endpoint home, passed in by the caller.
    pub async fn start(&self, engine: &ScriptEngine, service_root: &Path) -> Result<(), InstanceError> {
        self.transition(InstanceState::Starting);

        let ctx = match engine.create_context(service_root.to_path_buf()).await {
            Ok(ctx) => ctx,
            Err(e) => {
                self.transition(InstanceState::Failed);
                return Err(e.into());
            }
        };

        self.log.open(&self.home);
        let _ = self.runtime.set(InstanceRuntime {
            engine: engine.clone(),
            ctx,
            loaded: Mutex::new(HashSet::new()),
        });

        self.transition(InstanceState::Started);
        self.log.write("info", "instance started");
        info!(instance = %self.id, "instance started");
        Ok(())
    }

    /// Release the execution context. The on-disk home is left alone;
    /// removing an instance is the controller's business, not ours.
    pub fn stop(&self) {
        if let Some(runtime) = self.runtime.get() {
            runtime.engine.drop_context(runtime.ctx);
        }
        self.transition(InstanceState::Failed);
    }

    fn check_peer_certificate(&self, peer_der: Option<&[u8]>) -> Result<(), HttpError> {
        if !self.config.check_certificate {
            return Ok(());
        }
        match peer_der {
            None => Err(HttpError::forbidden("client certificate required")),
            // Exact DER equality against the controller certificate; this
            // is identity pinning, not chain validation.
            Some(der) if der == self.controller_cert_der.as_slice() => Ok(()),
            Some(_) => Err(HttpError::forbidden(
                "client certificate does not match the controller certificate",
            )),
        }
    }

    pub async fn handle_request(
        &self,
        endpoint_name: &str,
        service: &Service,
        incoming: &Incoming,
        outgoing: &mut Outgoing,
        request_id: &str,
    ) {
        if !self.is_started() {
            outgoing.resolve_error(&HttpError::unavailable("instance is not ready"));
            return;
        }
        let Some(runtime) = self.runtime.get() else {
            outgoing.resolve_error(&HttpError::unavailable("instance is not ready"));
            return;
        };

        if let Err(e) = self.check_peer_certificate(incoming.peer_cert_der.as_deref()) {
            self.log
                .write("warn", &format!("{request_id}: rejected peer certificate"));
            outgoing.resolve_error(&e);
            return;
        }

        // Expose the context so a request timeout can terminate execution.
        let _ = incoming.cancel.set(runtime.ctx.as_raw());

        let body: Value = if incoming.body.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_slice(&incoming.body) {
                Ok(value) => value,
                Err(e) => {
                    self.log
                        .write("error", &format!("{request_id}: unparseable body: {e}"));
                    outgoing.resolve_error(&HttpError::internal("unable to parse request body"));
                    return;
                }
            }
        };

        let method = match incoming.method.as_str() {
            "POST" => LifecycleMethod::Provision,
            "PUT" => LifecycleMethod::Configure,
            "DELETE" => LifecycleMethod::Unprovision,
            other => {
                outgoing.resolve_error(&HttpError::internal(format!(
                    "unsupported method '{other}'"
                )));
                return;
            }
        };

        if !runtime.loaded.lock().contains(&service.id) {
            let loaded = runtime
                .engine
                .load_service(
                    runtime.ctx,
                    &service.id,
                    &service.path.display().to_string(),
                    &service.source,
                    service.preprocess,
                )
                .await;
            match loaded {
                Ok(_) => {
                    runtime.loaded.lock().insert(service.id.clone());
                }
                Err(e) => {
                    self.log
                        .write("error", &format!("{request_id}: service load failed: {e}"));
                    outgoing.resolve_error(&HttpError::internal(format!(
                        "service '{}' failed to load",
                        service.id
                    )));
                    return;
                }
            }
        }

        // Capabilities were fixed at the endpoint's dry run; skip the
        // sandbox round trip when the method cannot exist.
        let outcome = if !service.caps.has(method) {
            Ok(Outcome::NoHandler)
        } else {
            let helper = HelperContext {
                endpoint: endpoint_name.to_string(),
                service: service.id.clone(),
                instance_id: self.id.clone(),
                resource_id: incoming.resource_id.clone(),
                controller_uri: incoming.controller_uri.clone(),
                transaction_id: incoming.transaction_id.clone(),
                phase_async: incoming.phase_async,
                request_id: request_id.to_string(),
            };
            runtime
                .engine
                .dispatch(runtime.ctx, &service.id, method, body.clone(), helper)
                .await
        };

        match outcome {
            Ok(Outcome::Completed(resource)) => {
                self.log.write(
                    "info",
                    &format!("{request_id}: {} completed", method.name()),
                );
                if method == LifecycleMethod::Unprovision {
                    outgoing.resolve_empty(204);
                } else {
                    outgoing.resolve_json(200, resource);
                }
            }
            Ok(Outcome::NoHandler) => {
                self.log.write(
                    "info",
                    &format!("{request_id}: no {} handler, pass-through", method.name()),
                );
                if method == LifecycleMethod::Unprovision {
                    outgoing.resolve_empty(204);
                } else {
                    outgoing.resolve_json(200, body);
                }
            }
            Ok(Outcome::Failed(message)) => {
                self.log.write(
                    "error",
                    &format!("{request_id}: {} failed: {message}", method.name()),
                );
                outgoing.resolve_error(&HttpError::internal(message));
            }
            Ok(Outcome::TimedOut) => {
                self.log.write(
                    "error",
                    &format!("{request_id}: {} exceeded the execution cap", method.name()),
                );
                outgoing.resolve_error(&HttpError::internal(
                    "service execution exceeded the time limit",
                ));
            }
            Err(e) => {
                self.log
                    .write("error", &format!("{request_id}: dispatch error: {e}"));
                outgoing.resolve_error(&HttpError::internal("service execution failed"));
            }
        }
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<(), InstanceError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(io_err(format!("cannot set permissions on {}", path.display())))
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), InstanceError> {
    fs::write(path, contents).map_err(io_err(format!("cannot write {}", path.display())))?;
    set_mode(path, mode)
}
