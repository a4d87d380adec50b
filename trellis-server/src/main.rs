mod config;
mod defaults;
mod endpoint;
mod error;
mod instance;
mod message;
mod router;
mod sandbox;
mod service;
mod supervisor;
mod tls;

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::defaults::{
    CONFIG_DIR, DAEMON_CERT_FILE, DAEMON_CONFIG_FILE, DAEMON_KEY_FILE, DAEMON_LOG_FILE,
    ENDPOINT_DIR, LOG_DIR,
};
use crate::error::ServerError;
use crate::router::Router;
use crate::sandbox::ScriptEngine;
use crate::supervisor::Supervisor;

/// Trellis Server - multi-tenant application endpoint daemon
#[derive(Parser)]
#[command(name = "trellis-server")]
#[command(version)]
#[command(about = "Trellis Server - multi-tenant application endpoint daemon")]
pub struct Args {
    /// Directory holding config.json, daemon.crt, daemon.key and the
    /// endpoint config files
    #[arg(long, default_value = CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// Directory holding per-endpoint metadata and instance homes
    #[arg(long, default_value = ENDPOINT_DIR)]
    pub endpoint_dir: PathBuf,

    /// Directory for the daemon log file
    #[arg(long, default_value = LOG_DIR)]
    pub log_dir: PathBuf,

    /// Unix socket of a supervising process to report startup progress to
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Log level override (trace|debug|info|warn|error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Request handling timeout override, in seconds
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Service execution cap override, in seconds
    #[arg(long)]
    pub execution_timeout: Option<u64>,

    /// Log to stderr instead of the daemon log file
    #[arg(long)]
    pub foreground: bool,
}

/// Read the daemon log level without going through the validated merge, so
/// the tracing filter can be installed before anything logs. The full merge
/// runs again afterwards with logging in place.
fn peek_log_level(config_dir: &Path) -> Option<String> {
    let raw = std::fs::read(config_dir.join(DAEMON_CONFIG_FILE)).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value.get("logLevel")?.as_str().map(str::to_string)
}

fn read_daemon_overrides(
    config_dir: &Path,
) -> Option<serde_json::Map<String, serde_json::Value>> {
    let path = config_dir.join(DAEMON_CONFIG_FILE);
    match std::fs::read(&path) {
        Ok(raw) => match serde_json::from_slice::<serde_json::Value>(&raw) {
            Ok(value) => value.as_object().cloned(),
            Err(e) => {
                warn!(config = %path.display(), "daemon config is not valid JSON, using defaults: {e}");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(config = %path.display(), "no daemon config, using defaults");
            None
        }
        Err(e) => {
            warn!(config = %path.display(), "cannot read daemon config, using defaults: {e}");
            None
        }
    }
}

/// Every `*.json` in the config directory except the daemon's own config
/// is an endpoint definition.
fn endpoint_configs(config_dir: &Path) -> Result<Vec<PathBuf>, ServerError> {
    let entries = std::fs::read_dir(config_dir).map_err(|source| ServerError::Io {
        context: format!("cannot list {}", config_dir.display()),
        source,
    })?;
    let mut configs: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .filter(|path| path.file_name().is_none_or(|name| name != DAEMON_CONFIG_FILE))
        .collect();
    configs.sort();
    Ok(configs)
}

async fn bootstrap(args: &Args) -> Result<Arc<Router>, ServerError> {
    let overrides = read_daemon_overrides(&args.config_dir);
    let mut defaults = DaemonConfig::from_overrides(overrides.as_ref()).defaults;
    if let Some(level) = &args.log_level {
        defaults.log_level = level.clone();
    }
    if let Some(secs) = args.request_timeout {
        defaults.request_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.execution_timeout {
        defaults.execution_timeout = Duration::from_secs(secs);
    }

    let tls = crate::tls::listener_config(
        &args.config_dir.join(DAEMON_CERT_FILE),
        &args.config_dir.join(DAEMON_KEY_FILE),
    )?;

    let configs = endpoint_configs(&args.config_dir)?;
    if configs.is_empty() {
        return Err(ServerError::Fatal(format!(
            "no endpoint configs in {}",
            args.config_dir.display()
        )));
    }

    std::fs::create_dir_all(&args.endpoint_dir).map_err(|source| ServerError::Io {
        context: format!("cannot create {}", args.endpoint_dir.display()),
        source,
    })?;

    let engine = ScriptEngine::spawn(defaults.execution_timeout);
    info!(
        request_timeout = ?defaults.request_timeout,
        execution_timeout = ?engine.execution_timeout(),
        "runtime limits"
    );

    let router = Router::init(configs, args.endpoint_dir.clone(), defaults, engine).await?;
    router.start_endpoints().await?;
    router.bind(tls).await?;
    Ok(router)
}

fn install_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    install_rustls_crypto_provider();

    let args = Args::parse();

    let level = args
        .log_level
        .clone()
        .or_else(|| peek_log_level(&args.config_dir))
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_path = args.log_dir.join(DAEMON_LOG_FILE);
    let _log_guard = if args.foreground {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        None
    } else {
        let _ = std::fs::create_dir_all(&args.log_dir);
        let appender = tracing_appender::rolling::never(&args.log_dir, DAEMON_LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(writer)
            .init();
        Some(guard)
    };

    info!("Trellis Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Config directory: {}", args.config_dir.display());
    info!("Endpoint directory: {}", args.endpoint_dir.display());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let supervisor = Supervisor::new(args.socket.clone());
        supervisor.report_config(&log_path).await;

        match bootstrap(&args).await {
            Ok(router) => {
                let table = router.render_table();
                info!("startup complete\n{table}");
                supervisor.report_success(table).await;

                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("cannot wait for interrupt: {e}");
                }
                info!("shutting down");
                router.shutdown();
                Ok(())
            }
            Err(e) => {
                error!("startup failed: {e}");
                supervisor.report_error(e.to_string()).await;
                std::process::exit(1);
            }
        }
    })
}
