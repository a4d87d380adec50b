//! Sandboxed execution of tenant service code.
//!
//! Each instance gets a private V8 isolate with a constrained global
//! environment: a console shim routed to tracing, a directory-confined
//! module loader, and the request helper the host injects. Isolates are
//! `!Send`, so a dedicated worker thread owns all of them and the rest of
//! the daemon talks to it over channels.
//!
//! Execution is wall-clock bounded. A watchdog thread terminates the
//! isolate when a script spins past the cap; the context is then rebuilt
//! from its recorded service loads before the next use, so one runaway
//! request cannot poison an instance.

use dashmap::DashMap;
use deno_core::error::{AnyError, generic_error};
use deno_core::v8;
use deno_core::{JsRuntime, ModuleCodeString, OpState, PollEventLoopOptions, RuntimeOptions, op2};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("unknown sandbox context")]
    UnknownContext,

    #[error("sandbox worker is gone")]
    ChannelClosed,
}

/// Opaque handle to one isolate owned by the worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// Lifecycle capabilities of a service's exported factory, introspected
/// once at load time from a probe construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ServiceCaps {
    pub provision: bool,
    pub configure: bool,
    pub unprovision: bool,
}

impl ServiceCaps {
    pub fn has(&self, method: LifecycleMethod) -> bool {
        match method {
            LifecycleMethod::Provision => self.provision,
            LifecycleMethod::Configure => self.configure,
            LifecycleMethod::Unprovision => self.unprovision,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleMethod {
    Provision,
    Configure,
    Unprovision,
}

impl LifecycleMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Configure => "configure",
            Self::Unprovision => "unprovision",
        }
    }

    /// `configure` receives the constructed resource as its argument; the
    /// other lifecycle methods take none.
    fn passes_resource(&self) -> bool {
        matches!(self, Self::Configure)
    }
}

/// Request-scoped context the tenant code sees as `aps.request`.
#[derive(Debug, Clone, Serialize)]
pub struct HelperContext {
    pub endpoint: String,
    pub service: String,
    pub instance_id: String,
    pub resource_id: Option<String>,
    pub controller_uri: Option<String>,
    pub transaction_id: Option<String>,
    pub phase_async: bool,
    pub request_id: String,
}

/// Result of dispatching one lifecycle call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The lifecycle method ran (or resolved); carries the serialized
    /// resource.
    Completed(Value),
    /// The resource exposes no such lifecycle method.
    NoHandler,
    /// The method threw or its promise rejected.
    Failed(String),
    /// The execution cap fired and the isolate was terminated.
    TimedOut,
}

struct LoadRequest {
    ctx: ContextId,
    service_id: String,
    path: String,
    source: String,
    preprocess: bool,
    reply: oneshot::Sender<Result<ServiceCaps, SandboxError>>,
}

struct DispatchRequest {
    ctx: ContextId,
    service_id: String,
    method: LifecycleMethod,
    body: Value,
    helper: HelperContext,
    reply: oneshot::Sender<Result<Outcome, SandboxError>>,
}

enum EngineRequest {
    CreateContext {
        root: PathBuf,
        reply: oneshot::Sender<Result<ContextId, SandboxError>>,
    },
    DropContext {
        ctx: ContextId,
    },
    Load(LoadRequest),
    Dispatch(DispatchRequest),
}

struct ContextControl {
    handle: v8::IsolateHandle,
    cancelled: Arc<AtomicBool>,
}

/// Handle to the sandbox worker; cheap to clone.
#[derive(Clone)]
pub struct ScriptEngine {
    tx: mpsc::UnboundedSender<EngineRequest>,
    controls: Arc<DashMap<u64, ContextControl>>,
    exec_timeout: Duration,
}

impl ScriptEngine {
    pub fn spawn(exec_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let controls: Arc<DashMap<u64, ContextControl>> = Arc::new(DashMap::new());
        let worker_controls = controls.clone();

        std::thread::Builder::new()
            .name("trellis-sandbox".to_string())
            .spawn(move || worker_main(rx, worker_controls, exec_timeout))
            .expect("failed to spawn sandbox worker thread");

        Self {
            tx,
            controls,
            exec_timeout,
        }
    }

    pub fn execution_timeout(&self) -> Duration {
        self.exec_timeout
    }

    pub async fn create_context(&self, root: PathBuf) -> Result<ContextId, SandboxError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::CreateContext { root, reply })
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)?
    }

    pub fn drop_context(&self, ctx: ContextId) {
        let _ = self.tx.send(EngineRequest::DropContext { ctx });
    }

    pub async fn load_service(
        &self,
        ctx: ContextId,
        service_id: &str,
        path: &str,
        source: &str,
        preprocess: bool,
    ) -> Result<ServiceCaps, SandboxError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Load(LoadRequest {
                ctx,
                service_id: service_id.to_string(),
                path: path.to_string(),
                source: source.to_string(),
                preprocess,
                reply,
            }))
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)?
    }

    pub async fn dispatch(
        &self,
        ctx: ContextId,
        service_id: &str,
        method: LifecycleMethod,
        body: Value,
        helper: HelperContext,
    ) -> Result<Outcome, SandboxError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Dispatch(DispatchRequest {
                ctx,
                service_id: service_id.to_string(),
                method,
                body,
                helper,
                reply,
            }))
            .map_err(|_| SandboxError::ChannelClosed)?;
        rx.await.map_err(|_| SandboxError::ChannelClosed)?
    }

    /// Terminate whatever the given context is executing. Used by the
    /// request-timeout path; the context rebuilds before its next use.
    pub fn cancel(&self, ctx_raw: u64) {
        if let Some(control) = self.controls.get(&ctx_raw) {
            control.cancelled.store(true, Ordering::SeqCst);
            control.handle.terminate_execution();
        }
    }
}

struct ServiceRoot(PathBuf);

#[op2(fast)]
fn op_trellis_log(#[string] level: &str, #[string] message: &str) {
    match level {
        "error" => tracing::error!(target: "service", "{message}"),
        "warn" => tracing::warn!(target: "service", "{message}"),
        "debug" => tracing::debug!(target: "service", "{message}"),
        _ => tracing::info!(target: "service", "{message}"),
    }
}

/// Read a module file for the sandboxed `require`, confined to the service
/// root directory.
#[op2]
#[string]
fn op_trellis_read_module(
    state: &mut OpState,
    #[string] dirname: String,
    #[string] spec: String,
) -> Result<String, AnyError> {
    let root = state.borrow::<ServiceRoot>().0.clone();

    let mut path = Path::new(&dirname).join(&spec);
    if path.extension().is_none() {
        path.set_extension("js");
    }
    let resolved = path
        .canonicalize()
        .map_err(|e| generic_error(format!("cannot resolve module '{spec}': {e}")))?;
    let root = root
        .canonicalize()
        .map_err(|e| generic_error(format!("cannot resolve service root: {e}")))?;
    if !resolved.starts_with(&root) {
        return Err(generic_error(format!(
            "module '{spec}' is outside the service directory"
        )));
    }

    std::fs::read_to_string(&resolved)
        .map_err(|e| generic_error(format!("cannot read module '{spec}': {e}")))
}

deno_core::extension!(
    trellis_host,
    ops = [op_trellis_log, op_trellis_read_module],
    options = { root: PathBuf },
    state = |state, options| {
        state.put(ServiceRoot(options.root));
    },
);

const BOOTSTRAP: &str = r#"
(() => {
  const ops = Deno.core.ops;
  const log = (level) => (...args) => {
    ops.op_trellis_log(level, args.map(String).join(' '));
  };
  globalThis.console = {
    log: log('info'),
    info: log('info'),
    warn: log('warn'),
    error: log('error'),
    debug: log('debug'),
  };
  globalThis.__trellis = {
    services: Object.create(null),
    helper: {
      log(level, message) { ops.op_trellis_log(String(level), String(message)); },
      request: null,
    },
  };
  globalThis.__trellisRequire = function (dirname) {
    const cache = Object.create(null);
    return function require(spec) {
      spec = String(spec);
      if (spec in cache) {
        return cache[spec].exports;
      }
      const source = ops.op_trellis_read_module(dirname, spec);
      const module = { exports: {} };
      cache[spec] = module;
      const factory = new Function(
        'exports', 'require', 'module', '__filename', '__dirname', source);
      factory(module.exports, require, module, spec, dirname);
      return module.exports;
    };
  };
})();
"#;

struct LoadedService {
    service_id: String,
    path: String,
    source: String,
    preprocess: bool,
}

struct ContextSlot {
    runtime: JsRuntime,
    root: PathBuf,
    loaded: Vec<LoadedService>,
}

fn worker_main(
    mut rx: mpsc::UnboundedReceiver<EngineRequest>,
    controls: Arc<DashMap<u64, ContextControl>>,
    exec_timeout: Duration,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!("sandbox worker failed to build runtime: {e}");
            return;
        }
    };

    runtime.block_on(async move {
        let mut contexts: HashMap<u64, ContextSlot> = HashMap::new();
        let mut next_id: u64 = 1;

        while let Some(request) = rx.recv().await {
            match request {
                EngineRequest::CreateContext { root, reply } => {
                    let id = next_id;
                    next_id += 1;
                    match new_slot(&root) {
                        Ok(slot) => {
                            controls.insert(
                                id,
                                ContextControl {
                                    handle: slot.runtime.v8_isolate().thread_safe_handle(),
                                    cancelled: Arc::new(AtomicBool::new(false)),
                                },
                            );
                            contexts.insert(id, slot);
                            let _ = reply.send(Ok(ContextId(id)));
                        }
                        Err(e) => {
                            warn!("failed to create sandbox context: {e}");
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                EngineRequest::DropContext { ctx } => {
                    contexts.remove(&ctx.0);
                    controls.remove(&ctx.0);
                }
                EngineRequest::Load(load) => {
                    let result = match revive(&mut contexts, &controls, load.ctx) {
                        Err(e) => Err(e),
                        Ok(slot) => {
                            let result = load_into(slot, &load, &controls, exec_timeout).await;
                            if result.is_ok() {
                                slot.loaded.push(LoadedService {
                                    service_id: load.service_id.clone(),
                                    path: load.path.clone(),
                                    source: load.source.clone(),
                                    preprocess: load.preprocess,
                                });
                            }
                            result
                        }
                    };
                    let _ = load.reply.send(result);
                }
                EngineRequest::Dispatch(dispatch) => {
                    let result = match revive(&mut contexts, &controls, dispatch.ctx) {
                        Err(e) => Err(e),
                        Ok(slot) => run_dispatch(slot, &dispatch, &controls, exec_timeout).await,
                    };
                    let _ = dispatch.reply.send(result);
                }
            }
        }
    });
}

fn new_slot(root: &Path) -> Result<ContextSlot, SandboxError> {
    // The root confines module reads; it has to resolve before any
    // tenant code runs against it.
    let root = root.canonicalize().map_err(|e| {
        SandboxError::Execution(format!("cannot resolve service root {}: {e}", root.display()))
    })?;
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![trellis_host::init_ops(root.clone())],
        ..Default::default()
    });
    runtime
        .execute_script("trellis:bootstrap", ModuleCodeString::from(BOOTSTRAP.to_string()))
        .map_err(|e| SandboxError::Execution(format!("bootstrap failed: {e}")))?;
    Ok(ContextSlot {
        runtime,
        root,
        loaded: Vec::new(),
    })
}

/// Get a context, rebuilding it first if a termination poisoned the
/// isolate. Rebuilding replays every service load the context has seen.
fn revive<'a>(
    contexts: &'a mut HashMap<u64, ContextSlot>,
    controls: &DashMap<u64, ContextControl>,
    ctx: ContextId,
) -> Result<&'a mut ContextSlot, SandboxError> {
    let cancelled = controls
        .get(&ctx.0)
        .map(|c| c.cancelled.load(Ordering::SeqCst))
        .unwrap_or(false);

    if cancelled {
        let old = contexts.remove(&ctx.0).ok_or(SandboxError::UnknownContext)?;
        debug!(context = ctx.0, "rebuilding terminated sandbox context");
        let mut slot = new_slot(&old.root)?;
        for service in &old.loaded {
            let script = load_script(service);
            if let Err(e) = slot
                .runtime
                .execute_script("trellis:reload", ModuleCodeString::from(script))
            {
                warn!(service = %service.service_id, "service reload failed: {e}");
            }
        }
        slot.loaded = old.loaded;
        controls.insert(
            ctx.0,
            ContextControl {
                handle: slot.runtime.v8_isolate().thread_safe_handle(),
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        );
        contexts.insert(ctx.0, slot);
    }

    contexts.get_mut(&ctx.0).ok_or(SandboxError::UnknownContext)
}

fn prepared_source(source: &str, preprocess: bool) -> String {
    if !preprocess {
        return source.to_string();
    }
    let stripped = source.trim_start_matches('\u{feff}');
    if stripped.starts_with("#!") {
        stripped.splitn(2, '\n').nth(1).unwrap_or("").to_string()
    } else {
        stripped.to_string()
    }
}

fn load_script(service: &LoadedService) -> String {
    let dirname = Path::new(&service.path)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    format!(
        r#"
(() => {{
  const module = {{ exports: {{}} }};
  (function (exports, require, module, __filename, __dirname, aps) {{
{source}
  }})(module.exports, globalThis.__trellisRequire({dirname_js}), module,
     {filename_js}, {dirname_js}, globalThis.__trellis.helper);
  const factory = module.exports;
  if (typeof factory !== 'function') {{
    throw new TypeError('service did not export a factory function');
  }}
  const probe = new factory();
  globalThis.__trellis.services[{id_js}] = factory;
  return JSON.stringify({{
    provision: typeof probe.provision === 'function',
    configure: typeof probe.configure === 'function',
    unprovision: typeof probe.unprovision === 'function',
  }});
}})()
"#,
        source = prepared_source(&service.source, service.preprocess),
        dirname_js = js_string(&dirname),
        filename_js = js_string(&service.path),
        id_js = js_string(&service.service_id),
    )
}

fn dispatch_script(request: &DispatchRequest) -> Result<String, SandboxError> {
    let helper = serde_json::to_value(&request.helper)
        .map_err(|e| SandboxError::Execution(e.to_string()))?;
    Ok(format!(
        r#"
(() => {{
  const factory = globalThis.__trellis.services[{id_js}];
  if (typeof factory !== 'function') {{
    return JSON.stringify({{ kind: 'unloaded' }});
  }}
  globalThis.__trellis.helper.request = {helper_js};
  const body = {body_js};
  const fields = (body && typeof body === 'object' && !Array.isArray(body)) ? body : {{}};
  let resource;
  try {{
    resource = new factory();
    for (const key of Object.keys(fields)) {{
      if (!(key in resource)) {{
        resource[key] = fields[key];
      }}
    }}
  }} catch (e) {{
    return JSON.stringify({{ kind: 'failed', message: String((e && e.message) || e) }});
  }}
  const handler = resource[{method_js}];
  if (typeof handler !== 'function') {{
    return JSON.stringify({{ kind: 'no-handler' }});
  }}
  const done = () => JSON.stringify({{ kind: 'completed', resource }});
  const fail = (e) => JSON.stringify({{ kind: 'failed', message: String((e && e.message) || e) }});
  try {{
    const out = {call};
    if (out && typeof out.then === 'function') {{
      return Promise.resolve(out).then(done, fail);
    }}
    return done();
  }} catch (e) {{
    return fail(e);
  }}
}})()
"#,
        id_js = js_string(&request.service_id),
        helper_js = helper,
        body_js = request.body,
        method_js = js_string(request.method.name()),
        call = if request.method.passes_resource() {
            "handler.call(resource, resource)"
        } else {
            "handler.call(resource)"
        },
    ))
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Run one script under the execution cap. A watchdog thread terminates
/// the isolate when the deadline passes while the script is still running.
struct Watchdog {
    done: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(handle: v8::IsolateHandle, timeout: Duration) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicBool::new(false));
        let thread_done = done.clone();
        let thread_fired = fired.clone();

        std::thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if thread_done.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            if !thread_done.load(Ordering::SeqCst) {
                thread_fired.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });

        Self { done, fired }
    }

    fn disarm(&self) -> bool {
        self.done.store(true, Ordering::SeqCst);
        self.fired.load(Ordering::SeqCst)
    }
}

// Early returns must never leave a live watchdog behind; it would
// terminate whatever the isolate runs next.
impl Drop for Watchdog {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

fn mark_cancelled(controls: &DashMap<u64, ContextControl>, ctx: ContextId) {
    if let Some(control) = controls.get(&ctx.0) {
        control.cancelled.store(true, Ordering::SeqCst);
    }
}

async fn load_into(
    slot: &mut ContextSlot,
    load: &LoadRequest,
    controls: &DashMap<u64, ContextControl>,
    exec_timeout: Duration,
) -> Result<ServiceCaps, SandboxError> {
    let script = load_script(&LoadedService {
        service_id: load.service_id.clone(),
        path: load.path.clone(),
        source: load.source.clone(),
        preprocess: load.preprocess,
    });

    let watchdog = Watchdog::arm(
        slot.runtime.v8_isolate().thread_safe_handle(),
        exec_timeout,
    );
    let result = slot
        .runtime
        .execute_script("trellis:load", ModuleCodeString::from(script));
    let timed_out = watchdog.disarm();

    match result {
        Err(e) if timed_out => {
            mark_cancelled(controls, load.ctx);
            debug!(service = %load.service_id, "service load timed out: {e}");
            Err(SandboxError::Execution(
                "service load exceeded the execution cap".to_string(),
            ))
        }
        Err(e) => {
            let message = e.to_string();
            if message.contains("SyntaxError") {
                Err(SandboxError::Syntax(message))
            } else {
                Err(SandboxError::Execution(message))
            }
        }
        Ok(global) => {
            let scope = &mut slot.runtime.handle_scope();
            let local = v8::Local::new(scope, global);
            let caps_json: String = deno_core::serde_v8::from_v8(scope, local)
                .map_err(|e| SandboxError::Execution(e.to_string()))?;
            serde_json::from_str(&caps_json).map_err(|e| SandboxError::Execution(e.to_string()))
        }
    }
}

async fn run_dispatch(
    slot: &mut ContextSlot,
    dispatch: &DispatchRequest,
    controls: &DashMap<u64, ContextControl>,
    exec_timeout: Duration,
) -> Result<Outcome, SandboxError> {
    let script = dispatch_script(dispatch)?;
    let started = Instant::now();

    let watchdog = Watchdog::arm(
        slot.runtime.v8_isolate().thread_safe_handle(),
        exec_timeout,
    );

    let global = match slot
        .runtime
        .execute_script("trellis:dispatch", ModuleCodeString::from(script))
    {
        Ok(global) => global,
        Err(e) => {
            let timed_out = watchdog.disarm();
            if timed_out {
                mark_cancelled(controls, dispatch.ctx);
                return Ok(Outcome::TimedOut);
            }
            return Err(SandboxError::Execution(e.to_string()));
        }
    };

    // The script returns either a JSON string or a promise of one; drive
    // the event loop until the promise settles or time runs out.
    let settled = loop {
        let state = {
            let scope = &mut slot.runtime.handle_scope();
            let local = v8::Local::new(scope, global.clone());
            match v8::Local::<v8::Promise>::try_from(local) {
                Err(_) => break extract_string(scope, local)?,
                Ok(promise) => match promise.state() {
                    v8::PromiseState::Fulfilled => {
                        let result = promise.result(scope);
                        break extract_string(scope, result)?;
                    }
                    v8::PromiseState::Rejected => {
                        let reason = promise.result(scope);
                        let message = reason.to_rust_string_lossy(scope);
                        if watchdog.disarm() {
                            mark_cancelled(controls, dispatch.ctx);
                        }
                        return Ok(Outcome::Failed(message));
                    }
                    v8::PromiseState::Pending => v8::PromiseState::Pending,
                },
            }
        };
        debug_assert_eq!(state, v8::PromiseState::Pending);

        let remaining = exec_timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            mark_cancelled(controls, dispatch.ctx);
            watchdog.disarm();
            return Ok(Outcome::TimedOut);
        }

        let pumped = tokio::time::timeout(
            remaining,
            slot.runtime.run_event_loop(PollEventLoopOptions::default()),
        )
        .await;

        match pumped {
            Err(_) => {
                // Deadline passed with the promise still pending.
                mark_cancelled(controls, dispatch.ctx);
                watchdog.disarm();
                return Ok(Outcome::TimedOut);
            }
            Ok(Err(e)) => {
                let timed_out = watchdog.disarm();
                if timed_out {
                    mark_cancelled(controls, dispatch.ctx);
                    return Ok(Outcome::TimedOut);
                }
                return Err(SandboxError::Execution(e.to_string()));
            }
            Ok(Ok(())) => {
                // Event loop drained; if the promise is still pending after
                // this, nothing can ever resolve it.
                let scope = &mut slot.runtime.handle_scope();
                let local = v8::Local::new(scope, global.clone());
                if let Ok(promise) = v8::Local::<v8::Promise>::try_from(local)
                    && promise.state() == v8::PromiseState::Pending
                {
                    watchdog.disarm();
                    return Ok(Outcome::TimedOut);
                }
            }
        }
    };

    let timed_out = watchdog.disarm();
    if timed_out {
        mark_cancelled(controls, dispatch.ctx);
        return Ok(Outcome::TimedOut);
    }

    parse_envelope(&settled)
}

fn extract_string(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> Result<String, SandboxError> {
    deno_core::serde_v8::from_v8::<String>(scope, value)
        .map_err(|e| SandboxError::Execution(format!("unexpected dispatch result: {e}")))
}

#[derive(Deserialize)]
struct Envelope {
    kind: String,
    #[serde(default)]
    resource: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

fn parse_envelope(raw: &str) -> Result<Outcome, SandboxError> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| SandboxError::Execution(e.to_string()))?;
    match envelope.kind.as_str() {
        "completed" => Ok(Outcome::Completed(
            envelope.resource.unwrap_or(Value::Null),
        )),
        "no-handler" => Ok(Outcome::NoHandler),
        "failed" => Ok(Outcome::Failed(
            envelope.message.unwrap_or_else(|| "unknown error".to_string()),
        )),
        "unloaded" => Err(SandboxError::Execution(
            "service is not loaded in this context".to_string(),
        )),
        other => Err(SandboxError::Execution(format!(
            "unexpected dispatch envelope kind '{other}'"
        ))),
    }
}
