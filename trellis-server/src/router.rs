//! Request routing: listeners, the endpoint table, and the HTTPS front end.
//!
//! `RoutingTable` is pure logic (no sockets) so the attach conflicts and
//! match preference rules are easy to test. `Router` wraps it with the
//! startup fan-in, the TLS accept loops, and the per-request pipeline.
//!
//! Startup tolerates partial failure: endpoints that cannot initialize or
//! start are dropped with a warning, and only a board wiped completely
//! clean (zero endpoints initialized, zero listeners bound, zero endpoints
//! started) is fatal.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::defaults::RuntimeDefaults;
use crate::endpoint::Endpoint;
use crate::error::{HttpError, ServerError};
use crate::message::{Incoming, Outgoing};
use crate::sandbox::ScriptEngine;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("endpoint {key} on 0.0.0.0:{port} overlaps listener {listener}")]
    WildcardOverlap {
        key: String,
        port: u16,
        listener: SocketAddrV4,
    },

    #[error("endpoint {key} duplicates an endpoint already on listener {listener}")]
    Duplicate { key: String, listener: SocketAddrV4 },
}

/// Maps (listener, virtual host, endpoint name) to an endpoint.
///
/// One listener exists per distinct (host, port). A wildcard-host listener
/// (`0.0.0.0:port`) owns the whole port: attaching it next to a
/// specific-host listener on the same port, or the other way around, is a
/// conflict, because both would claim the same connections.
#[derive(Default)]
pub struct RoutingTable {
    listeners: BTreeMap<SocketAddrV4, Vec<Arc<Endpoint>>>,
}

impl RoutingTable {
    pub fn attach(&mut self, endpoint: Arc<Endpoint>) -> Result<(), RouteError> {
        let addr = SocketAddrV4::new(endpoint.host, endpoint.port);
        let wildcard = endpoint.host == Ipv4Addr::UNSPECIFIED;

        let overlapping = self.listeners.keys().find(|listener| {
            listener.port() == endpoint.port
                && **listener != addr
                && (wildcard || *listener.ip() == Ipv4Addr::UNSPECIFIED)
        });
        if let Some(listener) = overlapping {
            return Err(RouteError::WildcardOverlap {
                key: endpoint.key(),
                port: endpoint.port,
                listener: *listener,
            });
        }

        if let Some(attached) = self.listeners.get(&addr)
            && attached
                .iter()
                .any(|e| e.virtual_host == endpoint.virtual_host && e.name == endpoint.name)
        {
            return Err(RouteError::Duplicate {
                key: endpoint.key(),
                listener: addr,
            });
        }

        self.listeners.entry(addr).or_default().push(endpoint);
        Ok(())
    }

    /// Drop endpoints that never reached the started state, and any
    /// listener left with nothing attached.
    pub fn cleanup(&mut self) -> Vec<String> {
        let mut removed = Vec::new();
        for attached in self.listeners.values_mut() {
            attached.retain(|endpoint| {
                if endpoint.is_started() {
                    true
                } else {
                    removed.push(endpoint.key());
                    false
                }
            });
        }
        self.listeners.retain(|_, attached| !attached.is_empty());
        removed
    }

    pub fn remove_listener(&mut self, listener: &SocketAddrV4) -> Vec<String> {
        self.listeners
            .remove(listener)
            .map(|attached| attached.iter().map(|e| e.key()).collect())
            .unwrap_or_default()
    }

    pub fn listeners(&self) -> Vec<SocketAddrV4> {
        self.listeners.keys().copied().collect()
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.listeners.values().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// A virtual-host-specific endpoint wins over a wildcard one; among
    /// wildcards the first attached wins. A request without a usable Host
    /// header can only reach wildcard endpoints.
    pub fn select(
        &self,
        listener: &SocketAddrV4,
        virtual_host: Option<&str>,
        name: &str,
    ) -> Option<Arc<Endpoint>> {
        let attached = self.listeners.get(listener)?;
        let mut fallback = None;
        for endpoint in attached.iter().filter(|e| e.name == name) {
            match (&endpoint.virtual_host, virtual_host) {
                (Some(vhost), Some(requested)) if vhost == requested => {
                    return Some(endpoint.clone());
                }
                (None, _) if fallback.is_none() => fallback = Some(endpoint.clone()),
                _ => {}
            }
        }
        fallback
    }

    /// Printable endpoint tree, nested host, port, virtual host
    /// (`*` for wildcard), then endpoint name with its instance count.
    pub fn render(&self) -> String {
        let mut hosts: BTreeMap<Ipv4Addr, BTreeMap<u16, BTreeMap<String, Vec<Arc<Endpoint>>>>> =
            BTreeMap::new();
        for (listener, attached) in &self.listeners {
            for endpoint in attached {
                let vhost = endpoint
                    .virtual_host
                    .clone()
                    .unwrap_or_else(|| "*".to_string());
                hosts
                    .entry(*listener.ip())
                    .or_default()
                    .entry(listener.port())
                    .or_default()
                    .entry(vhost)
                    .or_default()
                    .push(endpoint.clone());
            }
        }

        let mut out = String::new();
        for (host, ports) in hosts {
            out.push_str(&format!("{host}\n"));
            for (port, vhosts) in ports {
                out.push_str(&format!("  {port}\n"));
                for (vhost, mut endpoints) in vhosts {
                    out.push_str(&format!("    {vhost}\n"));
                    endpoints.sort_by(|a, b| a.name.cmp(&b.name));
                    for endpoint in endpoints {
                        out.push_str(&format!(
                            "      {} ({} instances)\n",
                            endpoint.name,
                            endpoint.instance_ids().len()
                        ));
                    }
                }
            }
        }
        out
    }
}

/// The running front end: owns the table, the sandbox engine handle, and
/// the accept loops.
pub struct Router {
    table: RwLock<RoutingTable>,
    engine: ScriptEngine,
    defaults: RuntimeDefaults,
    started: AtomicBool,
}

impl Router {
    /// Initialize every endpoint config concurrently and attach the
    /// survivors. Fatal only when not a single endpoint makes it in.
    pub async fn init(
        config_paths: Vec<PathBuf>,
        metadata_root: PathBuf,
        defaults: RuntimeDefaults,
        engine: ScriptEngine,
    ) -> Result<Arc<Self>, ServerError> {
        let mut joins = tokio::task::JoinSet::new();
        for path in config_paths {
            let metadata_root = metadata_root.clone();
            let defaults = defaults.clone();
            joins.spawn(async move {
                let result = Endpoint::init(&path, &metadata_root, &defaults).await;
                (path, result)
            });
        }

        let mut table = RoutingTable::default();
        while let Some(joined) = joins.join_next().await {
            let Ok((path, result)) = joined else {
                continue;
            };
            match result {
                Ok(endpoint) => {
                    let endpoint = Arc::new(endpoint);
                    if let Err(e) = table.attach(endpoint) {
                        warn!(config = %path.display(), "dropping endpoint: {e}");
                    }
                }
                Err(e) => {
                    warn!(config = %path.display(), "endpoint failed to initialize: {e}");
                }
            }
        }

        if table.is_empty() {
            return Err(ServerError::Fatal(
                "no endpoint could be initialized".to_string(),
            ));
        }

        Ok(Arc::new(Self {
            table: RwLock::new(table),
            engine,
            defaults,
            started: AtomicBool::new(false),
        }))
    }

    /// Start every attached endpoint concurrently and prune the failures.
    /// Fatal only when none starts.
    pub async fn start_endpoints(&self) -> Result<(), ServerError> {
        let endpoints = self.table.read().endpoints();

        let mut joins = tokio::task::JoinSet::new();
        for endpoint in endpoints {
            let engine = self.engine.clone();
            joins.spawn(async move {
                let result = endpoint.start(&engine).await;
                (endpoint.key(), result)
            });
        }
        while let Some(joined) = joins.join_next().await {
            if let Ok((key, Err(e))) = joined {
                warn!(endpoint = %key, "endpoint failed to start: {e}");
            }
        }

        let removed = self.table.write().cleanup();
        for key in &removed {
            debug!(endpoint = %key, "detached endpoint that did not start");
        }
        if self.table.read().is_empty() {
            return Err(ServerError::Fatal("no endpoint could start".to_string()));
        }

        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Bind one TCP listener per distinct (host, port) and spawn its accept
    /// loop. A listener that cannot bind takes its endpoints with it; fatal
    /// only when none binds.
    pub async fn bind(
        self: &Arc<Self>,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<(), ServerError> {
        let mut bound = 0usize;
        for addr in self.table.read().listeners() {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(listener = %addr, "listening");
                    self.spawn_accept_loop(listener, addr, TlsAcceptor::from(tls.clone()));
                    bound += 1;
                }
                Err(e) => {
                    warn!(listener = %addr, "cannot bind: {e}");
                    for key in self.table.write().remove_listener(&addr) {
                        warn!(endpoint = %key, "detached endpoint, listener is gone");
                    }
                }
            }
        }

        if bound == 0 {
            return Err(ServerError::Fatal(
                "no listener could be bound".to_string(),
            ));
        }
        Ok(())
    }

    fn spawn_accept_loop(
        self: &Arc<Self>,
        listener: TcpListener,
        addr: SocketAddrV4,
        acceptor: TlsAcceptor,
    ) {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(listener = %addr, "accept failed: {e}");
                        continue;
                    }
                };
                let router = router.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(e) => {
                            debug!(peer = %peer, "TLS handshake failed: {e}");
                            return;
                        }
                    };
                    let peer_cert = tls_stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .and_then(|certs| certs.first())
                        .map(|cert| cert.as_ref().to_vec());

                    let service = hyper::service::service_fn(move |request| {
                        let router = router.clone();
                        let peer_cert = peer_cert.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                router.dispatch(addr, request, peer_cert).await,
                            )
                        }
                    });

                    let io = TokioIo::new(tls_stream);
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        debug!(peer = %peer, "connection error: {e}");
                    }
                });
            }
        });
    }

    async fn dispatch(
        &self,
        listener: SocketAddrV4,
        request: hyper::Request<hyper::body::Incoming>,
        peer_cert: Option<Vec<u8>>,
    ) -> hyper::Response<Full<Bytes>> {
        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let mut outgoing = Outgoing::new();
                outgoing.resolve_error(&HttpError::bad_request(format!(
                    "failed to read request body: {e}"
                )));
                return outgoing.into_response();
            }
        };

        let incoming = Incoming::from_parts(&parts, body, peer_cert);
        let mut outgoing = Outgoing::new();
        self.handle(listener, &incoming, &mut outgoing).await;
        outgoing.into_response()
    }

    /// The per-request pipeline: readiness, structural validation, endpoint
    /// match, then the endpoint itself under the request timeout. A timeout
    /// also terminates whatever the request left running in the sandbox.
    pub async fn handle(
        &self,
        listener: SocketAddrV4,
        incoming: &Incoming,
        outgoing: &mut Outgoing,
    ) {
        let request_id = nanoid::nanoid!(10);
        debug!(
            request = %request_id,
            method = %incoming.method,
            path = %incoming.path,
            version = ?incoming.version,
            "request received"
        );
        if !incoming.trailing.is_empty() {
            debug!(
                request = %request_id,
                segments = ?incoming.trailing,
                "ignoring path segments past the resource ID"
            );
        }
        if let Some(tx) = &incoming.transaction_id {
            let _ = outgoing.set_header(trellis_core::HEADER_TRANSACTION_ID, tx);
        }

        if !self.started.load(Ordering::SeqCst) {
            outgoing.resolve_error(&HttpError::unavailable("server is not ready"));
            return;
        }

        if let Some(problem) = &incoming.validation_error {
            outgoing.resolve_error(&HttpError::bad_request(problem.clone()));
            return;
        }

        let endpoint = self.table.read().select(
            &listener,
            incoming.virtual_host().as_deref(),
            &incoming.endpoint_name,
        );
        let Some(endpoint) = endpoint else {
            outgoing.resolve_error(&HttpError::not_found(format!(
                "no endpoint '{}' on this listener",
                incoming.endpoint_name
            )));
            return;
        };

        let handled = tokio::time::timeout(
            self.defaults.request_timeout,
            endpoint.handle_request(incoming, outgoing, &request_id),
        )
        .await;
        if handled.is_err() {
            if let Some(ctx) = incoming.cancel.get() {
                self.engine.cancel(*ctx);
            }
            warn!(request = %request_id, "request timed out");
            outgoing.resolve_error(&HttpError::timeout(
                "request processing exceeded the time limit",
            ));
        } else if !outgoing.is_handled() {
            warn!(request = %request_id, "endpoint returned without resolving");
            outgoing.resolve_error(&HttpError::internal("request was not handled"));
        }

        debug!(
            request = %request_id,
            elapsed_ms = incoming.elapsed().as_millis() as u64,
            "request finished"
        );
    }

    pub fn render_table(&self) -> String {
        self.table.read().render()
    }

    pub fn shutdown(&self) {
        for endpoint in self.table.read().endpoints() {
            endpoint.stop();
        }
        self.started.store(false, Ordering::SeqCst);
    }
}
