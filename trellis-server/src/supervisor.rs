//! Startup reporting to an optional supervising process.
//!
//! When launched with `--socket`, the daemon narrates its startup over that
//! Unix socket: first the log path, then either the routing table on
//! success or the fatal error. A missing or dead supervisor never blocks
//! startup; failures to report are logged and swallowed.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use trellis_socket::{StartupMessage, send_startup_message};

pub struct Supervisor {
    socket: Option<PathBuf>,
}

impl Supervisor {
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self { socket }
    }

    pub async fn report_config(&self, log_path: &Path) {
        self.send(StartupMessage::Config {
            log_path: log_path.display().to_string(),
        })
        .await;
    }

    pub async fn report_success(&self, table: String) {
        self.send(StartupMessage::Success { table }).await;
    }

    pub async fn report_error(&self, message: String) {
        self.send(StartupMessage::Error { message }).await;
    }

    async fn send(&self, message: StartupMessage) {
        let Some(socket) = &self.socket else {
            return;
        };
        match send_startup_message(socket, &message).await {
            Ok(()) => debug!(socket = %socket.display(), "reported startup progress"),
            Err(e) => warn!(socket = %socket.display(), "cannot reach supervisor: {e}"),
        }
    }
}
