mod support;

use serde_json::json;
use support::{can_bind_local_ports, credentials_blob, https_request, identity, Fixture};
use trellis_socket::StartupMessage;

const CONTROLLER_URI: &str = "https://controller.test.local/callback";
const INSTANCE: &str = "11111111-2222-3333-4444-555555555555";

fn aps_headers() -> [(&'static str, &'static str); 2] {
    [
        ("aps-controller-uri", CONTROLLER_URI),
        ("aps-instance-id", INSTANCE),
    ]
}

#[test]
fn dummy_endpoint_echoes_and_startup_is_reported() {
    if !can_bind_local_ports() {
        return;
    }
    let fixture = Fixture::new();
    let home = fixture.add_home("billing");
    std::fs::write(home.join("alpha.js"), "module.exports = class {};").unwrap();
    fixture.add_endpoint("billing", &home, json!({"services": ["alpha"], "dummy": true}));
    let server = fixture.spawn();

    let messages = server.messages();
    assert!(
        matches!(messages.first(), Some(StartupMessage::Config { log_path }) if !log_path.is_empty()),
        "first startup message should carry the log path: {messages:?}"
    );
    assert!(
        messages.iter().any(|m| matches!(
            m,
            StartupMessage::Success { table } if table.contains("billing")
        )),
        "success message should list the endpoint: {messages:?}"
    );

    let response = https_request(
        fixture.port,
        "POST",
        "/billing/alpha",
        None,
        &aps_headers(),
        r#"{"plan": "gold"}"#,
        None,
    );
    assert_eq!(response.status, 200);
    assert!(response.body.contains("gold"));
    assert!(
        response
            .header("server")
            .is_some_and(|v| v.starts_with("trellis/")),
        "server header missing"
    );

    let response = https_request(
        fixture.port,
        "DELETE",
        "/billing/alpha",
        None,
        &aps_headers(),
        "",
        None,
    );
    assert_eq!(response.status, 204);
}

#[test]
fn rejects_malformed_and_unroutable_requests() {
    if !can_bind_local_ports() {
        return;
    }
    let fixture = Fixture::new();
    let home = fixture.add_home("billing");
    std::fs::write(home.join("alpha.js"), "module.exports = class {};").unwrap();
    fixture.add_endpoint("billing", &home, json!({"services": ["alpha"], "dummy": true}));
    let _server = fixture.spawn();

    // No aps headers at all.
    let response = https_request(fixture.port, "POST", "/billing/alpha", None, &[], "{}", None);
    assert_eq!(response.status, 400);
    assert!(response.body.contains("Exception"));

    // Unknown endpoint name.
    let response = https_request(
        fixture.port,
        "POST",
        "/crm/alpha",
        None,
        &aps_headers(),
        "{}",
        None,
    );
    assert_eq!(response.status, 404);

    // Unknown service on a known endpoint.
    let response = https_request(
        fixture.port,
        "POST",
        "/billing/beta",
        None,
        &aps_headers(),
        "{}",
        None,
    );
    assert_eq!(response.status, 404);
}

#[test]
fn virtual_host_routing_matches_the_host_header() {
    if !can_bind_local_ports() {
        return;
    }
    let fixture = Fixture::new();
    let home = fixture.add_home("billing");
    std::fs::write(home.join("alpha.js"), "module.exports = class {};").unwrap();
    fixture.add_endpoint(
        "billing",
        &home,
        json!({
            "services": ["alpha"],
            "dummy": true,
            "virtualHost": "apps.example.com"
        }),
    );
    let _server = fixture.spawn();

    let response = https_request(
        fixture.port,
        "POST",
        "/billing/alpha",
        Some("apps.example.com"),
        &aps_headers(),
        "{}",
        None,
    );
    assert_eq!(response.status, 200);

    let response = https_request(
        fixture.port,
        "POST",
        "/billing/alpha",
        Some("other.example.com"),
        &aps_headers(),
        "{}",
        None,
    );
    assert_eq!(response.status, 404);
}

#[test]
fn provisions_configures_and_unprovisions_an_instance() {
    if !can_bind_local_ports() {
        return;
    }
    let fixture = Fixture::new();
    let home = fixture.add_home("billing");
    std::fs::write(
        home.join("alpha.js"),
        r#"
            module.exports = class Account {
                provision() { this.ready = true; }
                configure(resource) { this.seen = resource.plan; }
                unprovision() {}
            };
        "#,
    )
    .unwrap();
    fixture.add_endpoint("billing", &home, json!({"services": ["alpha"]}));
    let _server = fixture.spawn();

    let controller = identity("controller.test.local");
    let instance = identity("instance.test.local");
    let create_body = json!({
        "aps": {"certificate": credentials_blob(&instance, &controller)},
        "plan": "gold"
    })
    .to_string();

    // First POST creates the instance and replays the provision through it.
    let response = https_request(
        fixture.port,
        "POST",
        "/billing/alpha",
        None,
        &aps_headers(),
        &create_body,
        Some(&controller),
    );
    assert_eq!(response.status, 200, "provision failed: {}", response.body);
    assert!(response.body.contains(r#""ready":true"#));
    assert!(response.body.contains(r#""plan":"gold""#));

    let instance_home = fixture.endpoint_dir.path().join("billing").join(INSTANCE);
    for file in ["instance.crt", "instance.key", "apsc.crt", "config.json"] {
        assert!(instance_home.join(file).is_file(), "missing {file}");
    }

    let response = https_request(
        fixture.port,
        "PUT",
        "/billing/alpha",
        None,
        &aps_headers(),
        r#"{"plan": "silver"}"#,
        Some(&controller),
    );
    assert_eq!(response.status, 200, "configure failed: {}", response.body);
    assert!(response.body.contains(r#""seen":"silver""#));

    // The pinned controller certificate is required once the instance exists.
    let response = https_request(
        fixture.port,
        "PUT",
        "/billing/alpha",
        None,
        &aps_headers(),
        "{}",
        None,
    );
    assert_eq!(response.status, 403);

    let intruder = identity("intruder.test.local");
    let response = https_request(
        fixture.port,
        "PUT",
        "/billing/alpha",
        None,
        &aps_headers(),
        "{}",
        Some(&intruder),
    );
    assert_eq!(response.status, 403);

    let response = https_request(
        fixture.port,
        "DELETE",
        "/billing/alpha",
        None,
        &aps_headers(),
        "",
        Some(&controller),
    );
    assert_eq!(response.status, 204);
}

#[test]
fn preseeded_instance_without_certificate_check_echoes_provisioning() {
    if !can_bind_local_ports() {
        return;
    }
    let fixture = Fixture::new();
    let home = fixture.add_home("billing");
    std::fs::write(home.join("alpha.js"), "module.exports = class {};").unwrap();
    fixture.add_endpoint("billing", &home, json!({"services": ["alpha"]}));

    // An instance home written by an earlier daemon run, with the
    // controller-certificate check switched off.
    let instance = identity("instance.test.local");
    let controller = identity("controller.test.local");
    let instance_home = fixture.endpoint_dir.path().join("billing").join(INSTANCE);
    std::fs::create_dir_all(&instance_home).unwrap();
    std::fs::write(instance_home.join("instance.crt"), &instance.cert_pem).unwrap();
    std::fs::write(instance_home.join("instance.key"), &instance.key_pem).unwrap();
    std::fs::write(instance_home.join("apsc.crt"), &controller.cert_pem).unwrap();
    std::fs::write(
        instance_home.join("config.json"),
        r#"{"checkCertificate": false}"#,
    )
    .unwrap();

    let _server = fixture.spawn();

    // No client certificate, and the factory has no provision handler;
    // the body comes straight back.
    let response = https_request(
        fixture.port,
        "POST",
        "/billing/alpha",
        None,
        &aps_headers(),
        r#"{"foo": 1}"#,
        None,
    );
    assert_eq!(response.status, 200, "unexpected reply: {}", response.body);
    assert!(response.body.contains(r#""foo":1"#));
}

#[test]
fn reloads_persisted_instances_after_restart() {
    if !can_bind_local_ports() {
        return;
    }
    let fixture = Fixture::new();
    let home = fixture.add_home("billing");
    std::fs::write(
        home.join("alpha.js"),
        r#"
            module.exports = class Account {
                provision() {}
                configure() { this.reconfigured = true; }
            };
        "#,
    )
    .unwrap();
    fixture.add_endpoint("billing", &home, json!({"services": ["alpha"]}));

    let controller = identity("controller.test.local");
    let instance = identity("instance.test.local");

    let mut server = fixture.spawn();
    let create_body = json!({
        "aps": {"certificate": credentials_blob(&instance, &controller)}
    })
    .to_string();
    let response = https_request(
        fixture.port,
        "POST",
        "/billing/alpha",
        None,
        &aps_headers(),
        &create_body,
        Some(&controller),
    );
    assert_eq!(response.status, 200, "provision failed: {}", response.body);
    server.stop();

    let _server = fixture.spawn();
    let response = https_request(
        fixture.port,
        "PUT",
        "/billing/alpha",
        None,
        &aps_headers(),
        "{}",
        Some(&controller),
    );
    assert_eq!(
        response.status, 200,
        "configure after restart failed: {}",
        response.body
    );
    assert!(response.body.contains(r#""reconfigured":true"#));
}

#[test]
fn stuck_service_calls_hit_the_request_timeout() {
    if !can_bind_local_ports() {
        return;
    }
    let fixture = Fixture::new();
    fixture.write_daemon_config(&json!({"requestTimeout": 1}));
    let home = fixture.add_home("billing");
    std::fs::write(
        home.join("alpha.js"),
        r#"
            module.exports = class Account {
                provision() { for (;;) {} }
            };
        "#,
    )
    .unwrap();
    fixture.add_endpoint("billing", &home, json!({"services": ["alpha"]}));
    let _server = fixture.spawn();

    let controller = identity("controller.test.local");
    let instance = identity("instance.test.local");
    let create_body = json!({
        "aps": {"certificate": credentials_blob(&instance, &controller)}
    })
    .to_string();

    let response = https_request(
        fixture.port,
        "POST",
        "/billing/alpha",
        None,
        &aps_headers(),
        &create_body,
        Some(&controller),
    );
    assert_eq!(response.status, 408, "expected timeout: {}", response.body);
    assert!(response.body.contains("Exception"));
}

#[test]
fn startup_without_endpoint_configs_is_fatal() {
    let fixture = Fixture::new();
    let (status, messages) = fixture.spawn_expect_failure();

    assert_eq!(status.code(), Some(1));
    assert!(
        messages
            .iter()
            .any(|m| matches!(m, StartupMessage::Error { message } if !message.is_empty())),
        "expected a startup error message: {messages:?}"
    );
}
