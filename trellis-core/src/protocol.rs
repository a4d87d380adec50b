//! Wire protocol constants and the error envelope
//!
//! These types are shared between the server and anything that needs to
//! speak or test the provisioning wire protocol.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Runtime identity reported in the `Server` response header.
pub const SERVER_PRODUCT: &str = "trellis";

/// Required header carrying the controller's callback URL.
pub const HEADER_CONTROLLER_URI: &str = "aps-controller-uri";
/// Required header carrying the target instance ID.
pub const HEADER_INSTANCE_ID: &str = "aps-instance-id";
/// Optional header flagging the asynchronous request phase.
pub const HEADER_REQUEST_PHASE: &str = "aps-request-phase";
/// Optional header carrying the controller transaction ID.
pub const HEADER_TRANSACTION_ID: &str = "aps-transaction-id";
/// Optional header carrying the API version the controller speaks.
pub const HEADER_VERSION: &str = "aps-version";

/// Value of [`HEADER_REQUEST_PHASE`] marking an asynchronous phase.
pub const REQUEST_PHASE_ASYNC: &str = "async";

/// `Server` header value for this build.
pub fn server_signature() -> String {
    format!("{}/{}", SERVER_PRODUCT, env!("CARGO_PKG_VERSION"))
}

/// JSON error body sent on every failed request.
///
/// The `type` field is fixed to `"Exception"` on the wire; internal error
/// detail never leaves the process, only the human-readable message does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: "Exception".to_string(),
            message: message.into(),
        }
    }
}

/// Stable fingerprint of a service source file, used to detect changed
/// sources across restarts and to key compiled-unit reuse.
pub fn source_fingerprint(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_serializes_with_type_tag() {
        let body = ErrorBody::new(404, "no such endpoint");
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains(r#""code":404"#));
        assert!(json.contains(r#""type":"Exception""#));
        assert!(json.contains("no such endpoint"));
    }

    #[test]
    fn error_body_roundtrips() {
        let body = ErrorBody::new(500, "boom");
        let parsed: ErrorBody = serde_json::from_str(&serde_json::to_string(&body).unwrap()).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn server_signature_carries_product_and_version() {
        let sig = server_signature();
        assert!(sig.starts_with("trellis/"));
        assert!(sig.len() > "trellis/".len());
    }

    #[test]
    fn fingerprint_is_stable_and_distinguishes_sources() {
        let a = source_fingerprint("module.exports = class {}");
        let b = source_fingerprint("module.exports = class {}");
        let c = source_fingerprint("module.exports = class A {}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
