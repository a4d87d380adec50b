use std::time::Duration;

pub const CONFIG_DIR: &str = "/etc/trellis";
pub const ENDPOINT_DIR: &str = "/var/lib/trellis/endpoints";
pub const LOG_DIR: &str = "/var/log/trellis";

pub const DAEMON_CONFIG_FILE: &str = "config.json";
pub const DAEMON_CERT_FILE: &str = "daemon.crt";
pub const DAEMON_KEY_FILE: &str = "daemon.key";
pub const DAEMON_LOG_FILE: &str = "daemon.log";

pub const INSTANCE_CERT_FILE: &str = "instance.crt";
pub const INSTANCE_KEY_FILE: &str = "instance.key";
pub const CONTROLLER_CERT_FILE: &str = "apsc.crt";
pub const INSTANCE_CONFIG_FILE: &str = "config.json";
pub const INSTANCE_LOG_FILE: &str = "instance.log";
pub const TYPE_CACHE_FILE: &str = "types.json";

pub const HOME_MODE: u32 = 0o700;
pub const KEY_MODE: u32 = 0o600;
pub const CONFIG_MODE: u32 = 0o644;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide fallbacks applied wherever an endpoint or instance config
/// leaves a key unset. Passed explicitly into every constructor that needs
/// them; nothing reads these through globals.
#[derive(Debug, Clone)]
pub struct RuntimeDefaults {
    pub host: String,
    pub port: u16,
    pub virtual_host: Option<String>,
    pub log_level: String,
    pub request_timeout: Duration,
    pub execution_timeout: Duration,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 443,
            virtual_host: None,
            log_level: "info".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }
}
