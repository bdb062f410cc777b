//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair,
};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;
use serde_json::{Value, json};

use secure_relay::config::{AuthConfig, Config};
use secure_relay::gateway::{AppState, Gatekeeper, Relay, create_router};

/// A client identity and the DER pieces its PKCS#12 bundle was built from.
pub struct MintedIdentity {
    pub pfx: Vec<u8>,
    pub leaf_der: Vec<u8>,
    pub ca_der: Vec<u8>,
}

/// Mint a CA-signed client certificate and pack it as PKCS#12.
pub fn mint_identity(password: &str) -> MintedIdentity {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = dn("Integration CA");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let issuer = Issuer::new(ca_params, ca_key);

    let leaf_key = KeyPair::generate().unwrap();
    let mut leaf_params = CertificateParams::default();
    leaf_params.distinguished_name = dn("integration-client");
    leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let leaf_cert = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

    let leaf_der = leaf_cert.der().to_vec();
    let ca_der = ca_cert.der().to_vec();
    let pfx = p12::PFX::new(
        &leaf_der,
        &leaf_key.serialize_der(),
        Some(&ca_der),
        password,
        "integration-client",
    )
    .unwrap()
    .to_der();

    MintedIdentity {
        pfx,
        leaf_der,
        ca_der,
    }
}

/// PKCS#12 bytes of a freshly minted identity.
pub fn mint_pfx(password: &str) -> Vec<u8> {
    mint_identity(password).pfx
}

fn dn(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn
}

/// Request seen by a fake upstream
#[derive(Debug, Clone)]
pub struct Seen {
    pub headers: HeaderMap,
    pub body: Value,
}

/// Plain-HTTP stand-in for the partner API
pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub seen: Arc<Mutex<Vec<Seen>>>,
}

impl FakeUpstream {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

/// Spawn an upstream answering `POST /v1/command` with 201 and an echo of the route.
pub async fn spawn_upstream(tag: &'static str) -> FakeUpstream {
    let seen: Arc<Mutex<Vec<Seen>>> = Arc::default();

    async fn command(
        State((seen, tag)): State<(Arc<Mutex<Vec<Seen>>>, &'static str)>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let route = body["data"]["route"].clone();
        seen.lock().push(Seen { headers, body });
        (
            StatusCode::CREATED,
            Json(json!({ "accepted": route, "env": tag })),
        )
    }

    let app = Router::new()
        .route("/v1/command", post(command))
        .with_state((Arc::clone(&seen), tag));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeUpstream { addr, seen }
}

/// Spawn an upstream that holds every `POST /v1/command` for `delay` before answering.
pub async fn spawn_slow_upstream(delay: Duration) -> SocketAddr {
    let app = Router::new().route(
        "/v1/command",
        post(move || async move {
            tokio::time::sleep(delay).await;
            Json(json!({ "late": true }))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// HTTPS stand-in for the partner API, terminating TLS with rustls
pub struct TlsUpstream {
    pub addr: SocketAddr,
    /// PEM of the CA that issued the server certificate
    pub server_ca_pem: String,
    /// Leaf certificate each accepted client presented, in accept order
    pub client_leaves: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TlsUpstream {
    pub fn base_url(&self) -> String {
        format!("https://{}", self.addr)
    }

    /// Write the server CA where `upstream.ca_cert_path` can point at it.
    pub fn write_server_ca(&self, dir: &std::path::Path) -> String {
        let path = dir.join("upstream-ca.pem");
        std::fs::write(&path, &self.server_ca_pem).unwrap();
        path.to_string_lossy().to_string()
    }
}

/// Spawn an HTTPS upstream on 127.0.0.1.
///
/// With `client_ca`, the handshake requires a client certificate chaining to
/// it; without, no client certificate is requested.
pub async fn spawn_tls_upstream(client_ca: Option<&[u8]>) -> TlsUpstream {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = dn("Upstream CA");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let issuer = Issuer::new(ca_params, ca_key);

    let server_key = KeyPair::generate().unwrap();
    let server_cert = CertificateParams::new(vec!["127.0.0.1".to_string()])
        .unwrap()
        .signed_by(&server_key, &issuer)
        .unwrap();

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .unwrap();
    let builder = match client_ca {
        Some(der) => {
            let mut roots = RootCertStore::empty();
            roots.add(CertificateDer::from(der.to_vec())).unwrap();
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .unwrap();
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let mut config = builder
        .with_single_cert(
            vec![CertificateDer::from(server_cert.der().to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der())),
        )
        .unwrap();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client_leaves: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let seen = Arc::clone(&client_leaves);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let mut tls = match acceptor.accept(tcp).into_fallible().await {
                    Ok(tls) => tls,
                    Err((_, mut tcp)) => {
                        // Hold the socket until the client has read the alert
                        let mut rest = Vec::new();
                        let _ = tokio::time::timeout(
                            Duration::from_secs(2),
                            tcp.read_to_end(&mut rest),
                        )
                        .await;
                        return;
                    }
                };
                if let Some(leaf) = tls.get_ref().1.peer_certificates().and_then(|c| c.first()) {
                    seen.lock().push(leaf.as_ref().to_vec());
                }

                read_request(&mut tls).await;
                let body = br#"{"accepted":"mtls"}"#;
                let head = format!(
                    "HTTP/1.1 201 Created\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = tls.write_all(head.as_bytes()).await;
                let _ = tls.write_all(body).await;
                let _ = tls.shutdown().await;
            });
        }
    });

    TlsUpstream {
        addr,
        server_ca_pem: ca_cert.pem(),
        client_leaves,
    }
}

/// Read one HTTP/1.1 request (head plus `content-length` body).
async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return buf;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let len = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + len {
                return buf;
            }
        }
    }
}

/// Relay router plus handles tests inspect
pub struct TestRelay {
    pub router: Router,
    pub state: Arc<AppState>,
    pub scratch: tempfile::TempDir,
}

/// Build the relay with the given auth settings and upstream bases.
pub fn relay(auth: AuthConfig, uat: &str, prod: &str) -> TestRelay {
    relay_with(auth, uat, prod, |_| {})
}

/// Like [`relay`], with a hook to adjust the configuration before the relay is built.
pub fn relay_with(
    auth: AuthConfig,
    uat: &str,
    prod: &str,
    adjust: impl FnOnce(&mut Config),
) -> TestRelay {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = Config {
        auth,
        ..Default::default()
    };
    config.upstream.uat_base_url = uat.to_string();
    config.upstream.prod_base_url = prod.to_string();
    config.upstream.scratch_dir = Some(scratch.path().to_string_lossy().to_string());
    adjust(&mut config);

    let state = Arc::new(AppState {
        relay: Arc::new(Relay::from_config(&config).unwrap()),
        gatekeeper: Arc::new(Gatekeeper::from_config(&config.auth).unwrap()),
        request_timeout: config.server.request_timeout,
    });

    TestRelay {
        router: create_router(Arc::clone(&state)),
        state,
        scratch,
    }
}
