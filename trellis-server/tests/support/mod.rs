use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use trellis_socket::StartupMessage;

fn workspace_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| manifest_dir.to_path_buf())
}

fn apply_coverage_env(cmd: &mut Command) {
    let Some(profile) = std::env::var_os("LLVM_PROFILE_FILE") else {
        return;
    };
    let profile = PathBuf::from(profile);
    if profile.is_absolute() {
        return;
    }
    let absolute = workspace_root().join(profile);
    if let Some(parent) = absolute.parent() {
        let _ = fs::create_dir_all(parent);
    }
    cmd.env("LLVM_PROFILE_FILE", absolute);
}

pub fn wait_for<F>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}

pub fn can_bind_local_ports() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn pick_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub struct TestIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn identity(name: &str) -> TestIdentity {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![name.to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    TestIdentity {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    }
}

/// One credentials blob the way the controller delivers it: instance
/// certificate, instance key, controller certificate, concatenated.
pub fn credentials_blob(instance: &TestIdentity, controller: &TestIdentity) -> String {
    format!(
        "{}{}{}",
        instance.cert_pem, instance.key_pem, controller.cert_pem
    )
}

/// On-disk layout for one daemon under test: config dir with the daemon
/// identity, endpoint homes, and the endpoint metadata dir. Outlives server
/// restarts so reload behavior can be exercised.
pub struct Fixture {
    pub config_dir: TempDir,
    pub endpoint_dir: TempDir,
    pub log_dir: TempDir,
    pub homes: TempDir,
    pub port: u16,
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self {
            config_dir: TempDir::new().unwrap(),
            endpoint_dir: TempDir::new().unwrap(),
            log_dir: TempDir::new().unwrap(),
            homes: TempDir::new().unwrap(),
            port: pick_port(),
        };

        let daemon = identity("daemon.test.local");
        fs::write(fixture.config_dir.path().join("daemon.crt"), &daemon.cert_pem).unwrap();
        fs::write(fixture.config_dir.path().join("daemon.key"), &daemon.key_pem).unwrap();
        fixture
    }

    pub fn write_daemon_config(&self, config: &serde_json::Value) {
        fs::write(
            self.config_dir.path().join("config.json"),
            config.to_string(),
        )
        .unwrap();
    }

    pub fn add_home(&self, name: &str) -> PathBuf {
        let home = self.homes.path().join(name);
        fs::create_dir_all(&home).unwrap();
        home
    }

    /// Write one endpoint config, pinned to the fixture's listener port.
    pub fn add_endpoint(&self, name: &str, home: &Path, mut config: serde_json::Value) {
        config["host"] = serde_json::json!("127.0.0.1");
        config["port"] = serde_json::json!(self.port);
        config["home"] = serde_json::json!(home.display().to_string());
        fs::write(
            self.config_dir.path().join(format!("{name}.json")),
            config.to_string(),
        )
        .unwrap();
    }

    pub fn spawn(&self) -> TestServer {
        let server = self.launch();
        if !wait_for(Duration::from_secs(20), || {
            server
                .messages()
                .iter()
                .any(|m| matches!(m, StartupMessage::Success { .. } | StartupMessage::Error { .. }))
        }) {
            panic!("trellis-server never reported startup completion");
        }
        if let Some(StartupMessage::Error { message }) = server
            .messages()
            .iter()
            .find(|m| matches!(m, StartupMessage::Error { .. }))
        {
            panic!("trellis-server startup failed: {message}");
        }
        server
    }

    pub fn spawn_expect_failure(&self) -> (ExitStatus, Vec<StartupMessage>) {
        let mut server = self.launch();
        let status = server
            .child
            .take()
            .unwrap()
            .wait()
            .expect("wait for trellis-server");
        thread::sleep(Duration::from_millis(200));
        (status, server.messages())
    }

    fn launch(&self) -> TestServer {
        let socket_dir = TempDir::new().unwrap();
        let socket_path = socket_dir.path().join("supervisor.sock");
        let messages = listen_for_startup_messages(&socket_path);

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_trellis-server"));
        cmd.args([
            "--config-dir",
            self.config_dir.path().to_string_lossy().as_ref(),
            "--endpoint-dir",
            self.endpoint_dir.path().to_string_lossy().as_ref(),
            "--log-dir",
            self.log_dir.path().to_string_lossy().as_ref(),
            "--socket",
            socket_path.to_string_lossy().as_ref(),
            "--foreground",
        ])
        .env("RUST_LOG", "warn")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
        apply_coverage_env(&mut cmd);
        let child = cmd.spawn().expect("failed to start trellis-server");

        TestServer {
            child: Some(child),
            messages,
            _socket_dir: socket_dir,
        }
    }
}

pub struct TestServer {
    child: Option<Child>,
    messages: Arc<Mutex<Vec<StartupMessage>>>,
    _socket_dir: TempDir,
}

impl TestServer {
    pub fn messages(&self) -> Vec<StartupMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The daemon reports each startup message over its own short-lived
/// connection; collect them all in the background.
fn listen_for_startup_messages(socket_path: &Path) -> Arc<Mutex<Vec<StartupMessage>>> {
    let listener = UnixListener::bind(socket_path).unwrap();
    let messages: Arc<Mutex<Vec<StartupMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                return;
            };
            let mut raw = String::new();
            let mut reader = std::io::BufReader::new(stream);
            if std::io::Read::read_to_string(&mut reader, &mut raw).is_err() {
                continue;
            }
            for line in raw.lines() {
                if let Ok(message) = serde_json::from_str::<StartupMessage>(line) {
                    sink.lock().unwrap().push(message);
                }
            }
        }
    });

    messages
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Minimal HTTPS client that can present a client certificate, which the
/// daemon's certificate pinning needs and stock test clients cannot do.
pub fn https_request(
    port: u16,
    method: &str,
    path: &str,
    host: Option<&str>,
    headers: &[(&str, &str)],
    body: &str,
    client_identity: Option<&TestIdentity>,
) -> HttpResponse {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)));

    let config = match client_identity {
        Some(id) => {
            let certs: Vec<_> = rustls_pemfile::certs(&mut id.cert_pem.as_bytes())
                .collect::<Result<_, _>>()
                .unwrap();
            let key = rustls_pemfile::private_key(&mut id.key_pem.as_bytes())
                .unwrap()
                .unwrap();
            builder.with_client_auth_cert(certs, key).unwrap()
        }
        None => builder.with_no_client_auth(),
    };

    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let conn = rustls::ClientConnection::new(Arc::new(config), server_name).unwrap();
    let sock = TcpStream::connect(("127.0.0.1", port)).expect("connect tls listener");
    sock.set_read_timeout(Some(Duration::from_secs(20))).unwrap();
    let mut tls = rustls::StreamOwned::new(conn, sock);

    let host = host.unwrap_or("127.0.0.1");
    let mut request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    request.push_str(body);

    tls.write_all(request.as_bytes()).expect("write request");
    let mut raw = Vec::new();
    // A close without close_notify still leaves the full response buffered.
    let _ = tls.read_to_end(&mut raw);

    let text = String::from_utf8_lossy(&raw).to_string();
    let (head, body) = text
        .split_once("\r\n\r\n")
        .unwrap_or((text.as_str(), ""));
    let mut lines = head.lines();
    let status_line = lines.next().expect("response status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status code");
    let headers = lines
        .filter_map(|line| {
            line.split_once(": ")
                .map(|(n, v)| (n.to_string(), v.to_string()))
        })
        .collect();

    HttpResponse {
        status,
        headers,
        body: body.to_string(),
    }
}
