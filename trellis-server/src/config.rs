//! Configuration merging and validation.
//!
//! Every on-disk config file goes through the same merge: a map of defaults,
//! an optional map of user overrides, and a per-key checker. The outcome is
//! a plain merged map plus a decision per key so operators can audit the
//! effective configuration from the logs.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::defaults::RuntimeDefaults;

pub type Checker = fn(&Value) -> Option<Value>;

pub struct KeyRule {
    pub description: &'static str,
    pub check: Checker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionLevel {
    Info,
    Warning,
    Error,
}

/// One per-key record of how the effective value was chosen.
#[derive(Debug, Clone)]
pub struct Decision {
    pub key: String,
    pub level: DecisionLevel,
    pub detail: String,
}

pub struct Validated {
    pub values: Map<String, Value>,
    pub decisions: Vec<Decision>,
}

/// Merge `overrides` onto `defaults` key by key.
///
/// With no override map at all, every default is accepted outright. With an
/// override map, a missing key is accepted with a warning, a key whose
/// checker returns a normalized value is accepted, and a key whose checker
/// rejects falls back to the default with an error-level decision naming
/// the invalid value. Keys in `overrides` that have no default are ignored.
pub fn validate(
    scope: &str,
    defaults: &BTreeMap<&'static str, Value>,
    overrides: Option<&Map<String, Value>>,
    rules: &BTreeMap<&'static str, KeyRule>,
) -> Validated {
    let mut values = Map::new();
    let mut decisions = Vec::new();

    for (key, default) in defaults {
        let rule = rules.get(key);
        let description = rule.map(|r| r.description).unwrap_or("value");

        let (value, decision) = match overrides {
            None => (
                default.clone(),
                Decision {
                    key: key.to_string(),
                    level: DecisionLevel::Info,
                    detail: format!("no custom configuration, using default {} ({})", default, description),
                },
            ),
            Some(map) => match map.get(*key) {
                None => (
                    default.clone(),
                    Decision {
                        key: key.to_string(),
                        level: DecisionLevel::Warning,
                        detail: format!("key not found, using default {} ({})", default, description),
                    },
                ),
                Some(custom) => {
                    let checked = rule.and_then(|r| (r.check)(custom));
                    match checked {
                        Some(normalized) => (
                            normalized.clone(),
                            Decision {
                                key: key.to_string(),
                                level: DecisionLevel::Info,
                                detail: format!("using custom value {} ({})", normalized, description),
                            },
                        ),
                        None => (
                            default.clone(),
                            Decision {
                                key: key.to_string(),
                                level: DecisionLevel::Error,
                                detail: format!(
                                    "invalid custom value {}, using default {} ({})",
                                    custom, default, description
                                ),
                            },
                        ),
                    }
                }
            },
        };

        match decision.level {
            DecisionLevel::Info => info!(scope, key = %decision.key, "{}", decision.detail),
            DecisionLevel::Warning => warn!(scope, key = %decision.key, "{}", decision.detail),
            DecisionLevel::Error => error!(scope, key = %decision.key, "{}", decision.detail),
        }

        values.insert(key.to_string(), value);
        decisions.push(decision);
    }

    Validated { values, decisions }
}

pub fn check_log_level(value: &Value) -> Option<Value> {
    let s = value.as_str()?.to_ascii_lowercase();
    match s.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Some(Value::String(s)),
        _ => None,
    }
}

pub fn check_port(value: &Value) -> Option<Value> {
    let n = value.as_u64()?;
    if (1..=65535).contains(&n) {
        Some(Value::from(n))
    } else {
        None
    }
}

pub fn check_host(value: &Value) -> Option<Value> {
    let s = value.as_str()?;
    if s.parse::<std::net::Ipv4Addr>().is_ok() || trellis_core::is_hostname(s) {
        Some(Value::String(s.to_string()))
    } else {
        None
    }
}

/// Virtual hosts are compared case-insensitively; `null` means wildcard.
pub fn check_virtual_host(value: &Value) -> Option<Value> {
    match value {
        Value::Null => Some(Value::Null),
        Value::String(s) if trellis_core::is_hostname(s) => {
            Some(Value::String(s.to_ascii_lowercase()))
        }
        _ => None,
    }
}

pub fn check_bool(value: &Value) -> Option<Value> {
    value.as_bool().map(Value::Bool)
}

pub fn check_timeout_secs(value: &Value) -> Option<Value> {
    let n = value.as_u64()?;
    if n > 0 { Some(Value::from(n)) } else { None }
}

/// Effective daemon-wide configuration, from `config.json` in the config dir.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub defaults: RuntimeDefaults,
}

impl DaemonConfig {
    pub fn from_overrides(overrides: Option<&Map<String, Value>>) -> Self {
        let mut defaults_map = BTreeMap::new();
        defaults_map.insert("logLevel", Value::String("info".to_string()));
        defaults_map.insert("defaultHost", Value::String("0.0.0.0".to_string()));
        defaults_map.insert("defaultPort", Value::from(443u64));
        defaults_map.insert("defaultVirtualHost", Value::Null);
        defaults_map.insert("requestTimeout", Value::from(30u64));
        defaults_map.insert("executionTimeout", Value::from(10u64));

        let mut rules = BTreeMap::new();
        rules.insert(
            "logLevel",
            KeyRule {
                description: "daemon log level",
                check: check_log_level,
            },
        );
        rules.insert(
            "defaultHost",
            KeyRule {
                description: "default endpoint host",
                check: check_host,
            },
        );
        rules.insert(
            "defaultPort",
            KeyRule {
                description: "default endpoint port",
                check: check_port,
            },
        );
        rules.insert(
            "defaultVirtualHost",
            KeyRule {
                description: "default endpoint virtual host",
                check: check_virtual_host,
            },
        );
        rules.insert(
            "requestTimeout",
            KeyRule {
                description: "request handling timeout in seconds",
                check: check_timeout_secs,
            },
        );
        rules.insert(
            "executionTimeout",
            KeyRule {
                description: "service execution cap in seconds",
                check: check_timeout_secs,
            },
        );

        let merged = validate("daemon", &defaults_map, overrides, &rules);
        let values = &merged.values;

        let defaults = RuntimeDefaults {
            host: values["defaultHost"].as_str().unwrap_or("0.0.0.0").to_string(),
            port: values["defaultPort"].as_u64().unwrap_or(443) as u16,
            virtual_host: values["defaultVirtualHost"].as_str().map(str::to_string),
            log_level: values["logLevel"].as_str().unwrap_or("info").to_string(),
            request_timeout: std::time::Duration::from_secs(
                values["requestTimeout"].as_u64().unwrap_or(30),
            ),
            execution_timeout: std::time::Duration::from_secs(
                values["executionTimeout"].as_u64().unwrap_or(10),
            ),
        };

        Self { defaults }
    }
}

/// Per-instance configuration, from `config.json` in the instance home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub log_level: String,
    pub check_certificate: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            check_certificate: true,
        }
    }
}

impl InstanceConfig {
    pub fn from_overrides(overrides: Option<&Map<String, Value>>) -> Self {
        let mut defaults_map = BTreeMap::new();
        defaults_map.insert("logLevel", Value::String("info".to_string()));
        defaults_map.insert("checkCertificate", Value::Bool(true));

        let mut rules = BTreeMap::new();
        rules.insert(
            "logLevel",
            KeyRule {
                description: "instance log level",
                check: check_log_level,
            },
        );
        rules.insert(
            "checkCertificate",
            KeyRule {
                description: "whether to verify the peer certificate",
                check: check_bool,
            },
        );

        let merged = validate("instance", &defaults_map, overrides, &rules);
        Self {
            log_level: merged.values["logLevel"].as_str().unwrap_or("info").to_string(),
            check_certificate: merged.values["checkCertificate"].as_bool().unwrap_or(true),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "logLevel": self.log_level,
            "checkCertificate": self.check_certificate,
        })
    }
}
