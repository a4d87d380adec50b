//! Request and response envelopes.
//!
//! `Incoming` parses the raw request once, up front, and records the first
//! structural problem instead of failing: the router decides what a broken
//! request is worth (a 400) after it has a response envelope to say it
//! through. `Outgoing` owns the response until exactly one terminal
//! resolution wins; later resolutions lose silently.

use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use http_body_util::Full;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crate::error::HttpError;
use trellis_core::{
    self as core, ErrorBody, HEADER_CONTROLLER_URI, HEADER_INSTANCE_ID, HEADER_REQUEST_PHASE,
    HEADER_TRANSACTION_ID, HEADER_VERSION, REQUEST_PHASE_ASYNC,
};

/// Slot the dispatch path fills with the sandbox context handling this
/// request, so a router timeout can terminate the execution it abandons.
pub type CancelSlot = Arc<OnceLock<u64>>;

#[derive(Debug)]
pub struct Incoming {
    pub method: Method,
    pub path: String,
    pub endpoint_name: String,
    pub service_id: String,
    pub resource_id: Option<String>,
    pub trailing: Vec<String>,
    pub controller_uri: Option<String>,
    pub instance_id: Option<String>,
    pub phase_async: bool,
    pub transaction_id: Option<String>,
    pub version: Option<String>,
    pub host: Option<String>,
    pub body: Bytes,
    pub peer_cert_der: Option<Vec<u8>>,
    pub received_at: Instant,
    pub cancel: CancelSlot,
    /// First structural problem found while parsing, if any. A request with
    /// a recorded error is never dispatched.
    pub validation_error: Option<String>,
}

impl Incoming {
    pub fn from_parts(
        parts: &http::request::Parts,
        body: Bytes,
        peer_cert_der: Option<Vec<u8>>,
    ) -> Self {
        let mut validation_error = None;
        let mut record = |msg: String| {
            if validation_error.is_none() {
                validation_error = Some(msg);
            }
        };

        let path = parts.uri.path().to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let endpoint_name = segments.first().copied().unwrap_or("").to_string();
        let service_id = segments.get(1).copied().unwrap_or("").to_string();
        let resource_id = segments.get(2).map(|s| s.to_string());
        let trailing = segments.iter().skip(3).map(|s| s.to_string()).collect();

        if !core::is_endpoint_name(&endpoint_name) {
            record(format!("invalid endpoint name in request path '{path}'"));
        }
        if !core::is_service_id(&service_id) {
            record(format!("invalid service ID in request path '{path}'"));
        }
        if let Some(id) = &resource_id
            && !core::is_resource_id(id)
        {
            record(format!("invalid resource ID '{id}' in request path"));
        }

        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let controller_uri = header(HEADER_CONTROLLER_URI);
        match &controller_uri {
            None => record(format!("missing required header '{HEADER_CONTROLLER_URI}'")),
            Some(raw) => {
                let parsed = raw.parse::<Uri>();
                match parsed {
                    Ok(uri) if uri.scheme().is_some() && uri.authority().is_some() => {}
                    _ => record(format!(
                        "header '{HEADER_CONTROLLER_URI}' is not a valid URL: '{raw}'"
                    )),
                }
            }
        }

        let instance_id = header(HEADER_INSTANCE_ID);
        match &instance_id {
            None => record(format!("missing required header '{HEADER_INSTANCE_ID}'")),
            Some(id) if !core::is_resource_id(id) => {
                record(format!("header '{HEADER_INSTANCE_ID}' is not a resource ID: '{id}'"));
            }
            Some(_) => {}
        }

        let phase_async = header(HEADER_REQUEST_PHASE)
            .map(|v| v.eq_ignore_ascii_case(REQUEST_PHASE_ASYNC))
            .unwrap_or(false);

        Self {
            method: parts.method.clone(),
            path,
            endpoint_name,
            service_id,
            resource_id,
            trailing,
            controller_uri,
            instance_id,
            phase_async,
            transaction_id: header(HEADER_TRANSACTION_ID),
            version: header(HEADER_VERSION),
            host: header("host"),
            body,
            peer_cert_der,
            received_at: Instant::now(),
            cancel: Arc::new(OnceLock::new()),
            validation_error,
        }
    }

    /// Host header with any `:port` suffix removed, lower-cased, for
    /// matching against endpoint virtual hosts.
    pub fn virtual_host(&self) -> Option<String> {
        self.host
            .as_deref()
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }
}

enum Payload {
    Empty,
    Json(Value),
    Error(ErrorBody),
}

/// Response envelope. Exactly one resolution wins; later calls are ignored.
pub struct Outgoing {
    code: Option<u16>,
    headers: Vec<(String, String)>,
    payload: Payload,
    handled: bool,
}

impl Outgoing {
    pub fn new() -> Self {
        Self {
            code: None,
            headers: vec![("Server".to_string(), core::server_signature())],
            payload: Payload::Empty,
            handled: false,
        }
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        if !core::is_http_token(name) {
            return Err(HttpError::internal(format!(
                "illegal response header name '{name}'"
            )));
        }
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    pub fn resolve_json(&mut self, code: u16, body: Value) {
        self.resolve(code, Payload::Json(body));
    }

    pub fn resolve_empty(&mut self, code: u16) {
        self.resolve(code, Payload::Empty);
    }

    pub fn resolve_error(&mut self, err: &HttpError) {
        self.resolve(err.code, Payload::Error(err.body()));
    }

    fn resolve(&mut self, code: u16, payload: Payload) {
        if self.handled {
            return;
        }
        self.code = Some(code);
        self.payload = payload;
        self.handled = true;
    }

    /// Render the final wire response. An unresolved envelope or an unknown
    /// status code degrades to a 500 with a structured body.
    pub fn into_response(self) -> http::Response<Full<Bytes>> {
        let (code, payload) = if self.handled {
            (self.code.unwrap_or(200), self.payload)
        } else {
            (
                500,
                Payload::Error(ErrorBody::new(500, "request was never handled")),
            )
        };

        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match &payload {
            Payload::Empty => Bytes::new(),
            Payload::Json(value) => Bytes::from(value.to_string()),
            Payload::Error(err) => {
                Bytes::from(serde_json::to_string(err).unwrap_or_else(|_| "{}".to_string()))
            }
        };

        let mut builder = http::Response::builder().status(status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !matches!(payload, Payload::Empty) {
            builder = builder.header("Content-Type", "application/json");
        }

        builder
            .body(Full::new(body))
            .unwrap_or_else(|_| http::Response::new(Full::new(Bytes::new())))
    }
}

impl Default for Outgoing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts_for(method: &str, path: &str, headers: &[(&str, &str)]) -> http::request::Parts {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    const INSTANCE: &str = "11111111-1111-1111-1111-111111111111";

    fn valid_headers() -> Vec<(&'static str, &'static str)> {
        vec![
            (HEADER_CONTROLLER_URI, "https://controller.example.com/cb"),
            (HEADER_INSTANCE_ID, INSTANCE),
            ("host", "Apps.Example.com:8443"),
        ]
    }

    #[test]
    fn parses_full_request_path() {
        let parts = parts_for(
            "POST",
            &format!("/billing/svc/{INSTANCE}/extra/bits"),
            &valid_headers(),
        );
        let incoming = Incoming::from_parts(&parts, Bytes::new(), None);

        assert!(incoming.validation_error.is_none());
        assert_eq!(incoming.endpoint_name, "billing");
        assert_eq!(incoming.service_id, "svc");
        assert_eq!(incoming.resource_id.as_deref(), Some(INSTANCE));
        assert_eq!(incoming.trailing, vec!["extra", "bits"]);
        assert_eq!(incoming.virtual_host().as_deref(), Some("apps.example.com"));
    }

    #[test]
    fn records_invalid_service_id() {
        let parts = parts_for("POST", "/billing/svc1", &valid_headers());
        let incoming = Incoming::from_parts(&parts, Bytes::new(), None);
        assert!(
            incoming
                .validation_error
                .as_deref()
                .is_some_and(|e| e.contains("service ID"))
        );
    }

    #[test]
    fn records_missing_controller_header() {
        let parts = parts_for("POST", "/billing/svc", &[(HEADER_INSTANCE_ID, INSTANCE)]);
        let incoming = Incoming::from_parts(&parts, Bytes::new(), None);
        assert!(
            incoming
                .validation_error
                .as_deref()
                .is_some_and(|e| e.contains(HEADER_CONTROLLER_URI))
        );
    }

    #[test]
    fn records_malformed_controller_uri() {
        let parts = parts_for(
            "POST",
            "/billing/svc",
            &[
                (HEADER_CONTROLLER_URI, "not a url"),
                (HEADER_INSTANCE_ID, INSTANCE),
            ],
        );
        let incoming = Incoming::from_parts(&parts, Bytes::new(), None);
        assert!(
            incoming
                .validation_error
                .as_deref()
                .is_some_and(|e| e.contains("not a valid URL"))
        );
    }

    #[test]
    fn records_bad_instance_id_header() {
        let parts = parts_for(
            "POST",
            "/billing/svc",
            &[
                (HEADER_CONTROLLER_URI, "https://c.example.com"),
                (HEADER_INSTANCE_ID, "not-an-id"),
            ],
        );
        let incoming = Incoming::from_parts(&parts, Bytes::new(), None);
        assert!(
            incoming
                .validation_error
                .as_deref()
                .is_some_and(|e| e.contains(HEADER_INSTANCE_ID))
        );
    }

    #[test]
    fn async_phase_flag_is_parsed() {
        let mut headers = valid_headers();
        headers.push((HEADER_REQUEST_PHASE, "async"));
        let parts = parts_for("POST", "/billing/svc", &headers);
        let incoming = Incoming::from_parts(&parts, Bytes::new(), None);
        assert!(incoming.phase_async);
    }

    #[test]
    fn first_resolution_wins() {
        let mut outgoing = Outgoing::new();
        assert!(!outgoing.is_handled());

        outgoing.resolve_empty(204);
        outgoing.resolve_error(&HttpError::internal("too late"));

        assert!(outgoing.is_handled());
        let response = outgoing.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn unresolved_envelope_renders_500() {
        let outgoing = Outgoing::new();
        let response = outgoing.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn responses_carry_server_signature() {
        let mut outgoing = Outgoing::new();
        outgoing.resolve_json(200, serde_json::json!({"ok": true}));
        let response = outgoing.into_response();
        let server = response.headers().get("Server").unwrap().to_str().unwrap();
        assert!(server.starts_with("trellis/"));
    }

    #[test]
    fn rejects_illegal_header_names() {
        let mut outgoing = Outgoing::new();
        assert!(outgoing.set_header("X-Fine", "1").is_ok());
        assert!(outgoing.set_header("bad header", "1").is_err());
    }
}
