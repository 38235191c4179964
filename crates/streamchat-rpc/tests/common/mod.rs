//! Shared fixtures for the end-to-end tests.
//!
//! Certificates are generated at test runtime with rcgen: one CA that
//! signs a `localhost` server certificate and a client certificate.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use streamchat_rpc::config::{ClientConfig, ServerConfig};
use streamchat_rpc::interceptors::TokenValidator;
use streamchat_rpc::proto::Message;
use streamchat_rpc::{CallDispatcher, RpcServer};
use streamchat_types::config::SessionConfig;
use streamchat_types::AccessPolicy;

/// Upper bound on any single awaited step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Awaits `fut`, failing the test if it takes longer than [`STEP_TIMEOUT`].
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .expect("step timed out")
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// PEM material for one test PKI.
pub struct TestPki {
    pub ca_cert: Vec<u8>,
    pub server_cert: Vec<u8>,
    pub server_key: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

fn leaf(
    common_name: &str,
    usage: ExtendedKeyUsagePurpose,
    ca: &rcgen::Certificate,
    ca_key: &KeyPair,
) -> (Vec<u8>, Vec<u8>) {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.subject_alt_names = vec![
        SanType::DnsName("localhost".try_into().unwrap()),
        SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
    ];
    params.extended_key_usages = vec![usage];

    let key = KeyPair::generate().expect("Failed to generate key pair");
    let cert = params
        .signed_by(&key, ca, ca_key)
        .expect("Failed to sign certificate");
    (cert.pem().into_bytes(), key.serialize_pem().into_bytes())
}

/// Generates a CA plus server and client leaf certificates.
pub fn generate_pki() -> TestPki {
    let ca_key = KeyPair::generate().expect("Failed to generate CA key");
    let mut ca_params = CertificateParams::default();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "streamchat test CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = ca_params
        .self_signed(&ca_key)
        .expect("Failed to self-sign CA");

    let (server_cert, server_key) = leaf("localhost", ExtendedKeyUsagePurpose::ServerAuth, &ca, &ca_key);
    let (client_cert, client_key) = leaf("test-client", ExtendedKeyUsagePurpose::ClientAuth, &ca, &ca_key);

    TestPki {
        ca_cert: ca.pem().into_bytes(),
        server_cert,
        server_key,
        client_cert,
        client_key,
    }
}

// ---------------------------------------------------------------------------
// Configs and servers
// ---------------------------------------------------------------------------

pub fn fast_session() -> SessionConfig {
    SessionConfig {
        send_interval_ms: 20,
        drain_deadline_ms: 2_000,
        outbound_capacity: 16,
    }
}

pub fn server_config(policy: AccessPolicy) -> ServerConfig {
    ServerConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        policy,
        session: fast_session(),
    }
}

pub fn client_config(addr: SocketAddr, token: &str) -> ClientConfig {
    ClientConfig {
        address: addr.to_string(),
        server_name: Some("localhost".into()),
        token: token.into(),
        connect_timeout_ms: 5_000,
        session: fast_session(),
    }
}

/// A server serving on a background task.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<streamchat_types::Result<()>>,
}

impl TestServer {
    /// Cancels the server and waits for `serve` to return.
    pub async fn stop(self) -> streamchat_types::Result<()> {
        self.shutdown.cancel();
        within(self.task).await.expect("server task panicked")
    }
}

pub async fn spawn_server(server: RpcServer) -> TestServer {
    let bound = server.bind().await.expect("failed to bind test server");
    let addr = bound.local_addr();
    let shutdown = bound.shutdown_token();
    let task = tokio::spawn(bound.serve());
    TestServer {
        addr,
        shutdown,
        task,
    }
}

// ---------------------------------------------------------------------------
// Dispatchers and validators
// ---------------------------------------------------------------------------

/// Forwards every inbound body to the test and never replies.
pub struct Recorder(pub mpsc::UnboundedSender<String>);

pub fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder(tx)), rx)
}

#[tonic::async_trait]
impl CallDispatcher for Recorder {
    async fn on_message(&self, message: Message) -> Result<Option<Message>, Status> {
        let _ = self.0.send(message.body);
        Ok(None)
    }
}

/// Echoes like the reference dispatcher and counts messages.
#[derive(Default)]
pub struct CountingEcho {
    pub seen: AtomicUsize,
}

#[tonic::async_trait]
impl CallDispatcher for CountingEcho {
    async fn on_message(&self, message: Message) -> Result<Option<Message>, Status> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(Some(message))
    }
}

/// Accepts any non-empty token and counts how often it was asked.
#[derive(Default)]
pub struct CountingValidator {
    pub calls: AtomicUsize,
}

impl TokenValidator for CountingValidator {
    fn validate(&self, token: &str, _policy: &AccessPolicy) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        !token.is_empty()
    }
}

/// Collects `n` bodies from `rx`.
pub async fn collect(rx: &mut mpsc::UnboundedReceiver<String>, n: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(within(rx.recv()).await.expect("recorder closed early"));
    }
    out
}
