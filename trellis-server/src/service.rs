//! Service definitions and source loading.
//!
//! An endpoint config names its services either as a list of IDs (each
//! implying `<id>.js`) or as a map from ID to filename, with an extended
//! object form for per-service flags. Normalization resolves every entry
//! to a concrete filename and rejects collisions before anything touches
//! the disk.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use trellis_core::{is_service_id, source_fingerprint};

use crate::sandbox::ServiceCaps;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid service ID '{0}'")]
    InvalidId(String),

    #[error("invalid service entry for '{id}': {detail}")]
    InvalidEntry { id: String, detail: String },

    #[error("services '{first}' and '{second}' both resolve to file '{file}'")]
    DuplicateFile {
        file: String,
        first: String,
        second: String,
    },

    #[error("'services' must be an array of IDs or an object mapping ID to filename")]
    BadShape,

    #[error("failed to read service '{id}' from {path}: {source}")]
    Read {
        id: String,
        path: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDef {
    pub id: String,
    pub file: String,
    pub preprocess: bool,
}

fn with_js_suffix(name: &str) -> String {
    if Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{name}.js")
    }
}

/// Resolve the `services` config value into concrete definitions.
/// Idempotent over its own output shape and order-stable by ID.
pub fn normalize_services(value: &Value) -> Result<Vec<ServiceDef>, ServiceError> {
    let mut defs = match value {
        Value::Array(ids) => {
            let mut defs = Vec::new();
            for entry in ids {
                let id = entry.as_str().ok_or(ServiceError::BadShape)?;
                if !is_service_id(id) {
                    return Err(ServiceError::InvalidId(id.to_string()));
                }
                defs.push(ServiceDef {
                    id: id.to_string(),
                    file: format!("{id}.js"),
                    preprocess: false,
                });
            }
            defs
        }
        Value::Object(map) => {
            let mut defs = Vec::new();
            for (id, entry) in map {
                if !is_service_id(id) {
                    return Err(ServiceError::InvalidId(id.to_string()));
                }
                let def = match entry {
                    Value::Null => ServiceDef {
                        id: id.clone(),
                        file: format!("{id}.js"),
                        preprocess: false,
                    },
                    Value::String(file) => ServiceDef {
                        id: id.clone(),
                        file: with_js_suffix(file),
                        preprocess: false,
                    },
                    Value::Object(spec) => {
                        let file = spec
                            .get("file")
                            .and_then(Value::as_str)
                            .map(with_js_suffix)
                            .unwrap_or_else(|| format!("{id}.js"));
                        let preprocess =
                            spec.get("preprocess").and_then(Value::as_bool).unwrap_or(false);
                        ServiceDef {
                            id: id.clone(),
                            file,
                            preprocess,
                        }
                    }
                    other => {
                        return Err(ServiceError::InvalidEntry {
                            id: id.clone(),
                            detail: format!("unsupported value {other}"),
                        });
                    }
                };
                defs.push(def);
            }
            defs
        }
        _ => return Err(ServiceError::BadShape),
    };

    defs.sort_by(|a, b| a.id.cmp(&b.id));

    let mut seen: HashMap<&str, &str> = HashMap::new();
    for def in &defs {
        if let Some(first) = seen.insert(def.file.as_str(), def.id.as_str()) {
            return Err(ServiceError::DuplicateFile {
                file: def.file.clone(),
                first: first.to_string(),
                second: def.id.clone(),
            });
        }
    }

    Ok(defs)
}

/// One loaded service: source text read once at endpoint start, dry-run
/// verified, then reused across requests and instances.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: String,
    pub path: PathBuf,
    pub source: String,
    pub fingerprint: String,
    pub preprocess: bool,
    pub caps: ServiceCaps,
}

impl Service {
    pub fn read(home: &Path, def: &ServiceDef) -> Result<Self, ServiceError> {
        let path = home.join(&def.file);
        let source = std::fs::read_to_string(&path).map_err(|source| ServiceError::Read {
            id: def.id.clone(),
            path: path.display().to_string(),
            source,
        })?;
        let fingerprint = source_fingerprint(&source);
        Ok(Self {
            id: def.id.clone(),
            path,
            source,
            fingerprint,
            preprocess: def.preprocess,
            caps: ServiceCaps::default(),
        })
    }
}
