//! Client and server over a real loopback connection.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::Status;

use streamchat_rpc::config::ClientConfig;
use streamchat_rpc::interceptors::{
    CallInfo, Handler, Interceptor, ServerCall, ServerReply, StaticTokens,
};
use streamchat_rpc::proto::Message;
use streamchat_rpc::{
    ClientCredential, CloseReason, LifecycleController, LifecycleOutcome, PendingSession,
    RpcClient, RpcServer, ScriptedProducer, ServerCredential, SessionRole, SessionState,
    ShutdownSignal,
};
use streamchat_types::{AccessPolicy, StreamchatError, TlsMode};

use common::*;

async fn plaintext_client(config: &ClientConfig) -> RpcClient {
    within(RpcClient::connect(config, &ClientCredential::insecure()))
        .await
        .expect("failed to connect")
}

#[tokio::test]
async fn plaintext_echo_relays_body_unchanged() {
    let server = spawn_server(RpcServer::new(
        server_config(AccessPolicy::allow_all()),
        ServerCredential::insecure(),
    ))
    .await;
    let client = plaintext_client(&client_config(server.addr, "")).await;

    let reply = within(client.echo("alice wants beer")).await.unwrap();
    assert_eq!(reply.body, "alice wants beer");

    let (pending, handle) = PendingSession::new(SessionRole::Client, fast_session());
    let (dispatcher, mut bodies) = recorder();
    let session = within(client.establish(pending))
        .await
        .unwrap()
        .expect("stream should establish")
        .with_dispatcher(dispatcher)
        .with_producer(ScriptedProducer::new(["alice wants beer"]));
    let run = tokio::spawn(session.run());

    assert_eq!(collect(&mut bodies, 1).await, vec!["alice wants beer"]);

    assert!(handle.shutdown());
    let report = within(run).await.unwrap();
    assert_eq!(report.reason, CloseReason::LocalShutdown);
    assert_eq!(report.sent, 1);
    assert_eq!(report.received, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn per_direction_order_is_preserved() {
    let server = spawn_server(RpcServer::new(
        server_config(AccessPolicy::allow_all()),
        ServerCredential::insecure(),
    ))
    .await;
    let client = plaintext_client(&client_config(server.addr, "")).await;

    let script: Vec<String> = (1..=10).map(|i| format!("m{i}")).collect();
    let (pending, handle) = PendingSession::new(SessionRole::Client, fast_session());
    let (dispatcher, mut bodies) = recorder();
    let session = within(client.establish(pending))
        .await
        .unwrap()
        .expect("stream should establish")
        .with_dispatcher(dispatcher)
        .with_producer(ScriptedProducer::new(script.clone()));
    let run = tokio::spawn(session.run());

    assert_eq!(collect(&mut bodies, script.len()).await, script);

    handle.shutdown();
    within(run).await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn missing_identity_is_rejected_at_establishment() {
    let echo = Arc::new(CountingEcho::default());
    let server = spawn_server(
        RpcServer::new(
            server_config(AccessPolicy::require(["user"])),
            ServerCredential::insecure(),
        )
        .with_dispatcher(echo.clone()),
    )
    .await;
    let client = plaintext_client(&client_config(server.addr, "")).await;

    let (pending, handle) = PendingSession::new(SessionRole::Client, fast_session());
    let err = within(client.establish(pending)).await.err().unwrap();
    assert!(
        matches!(err, StreamchatError::Unauthenticated { .. }),
        "unexpected error: {err}"
    );
    assert_eq!(handle.state(), SessionState::Closed);

    let err = within(client.echo("hello")).await.unwrap_err();
    assert!(matches!(err, StreamchatError::Unauthenticated { .. }));
    assert_eq!(echo.seen.load(Ordering::SeqCst), 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn wrong_token_is_permission_denied() {
    let server = spawn_server(
        RpcServer::new(
            server_config(AccessPolicy::require(["user"])),
            ServerCredential::insecure(),
        )
        .with_validator(Arc::new(StaticTokens::new(["s3cret"]))),
    )
    .await;

    let denied = plaintext_client(&client_config(server.addr, "guess")).await;
    let err = within(denied.echo("hi")).await.unwrap_err();
    assert!(matches!(err, StreamchatError::PermissionDenied { .. }), "{err}");

    let allowed = plaintext_client(&client_config(server.addr, "Bearer s3cret")).await;
    assert_eq!(within(allowed.echo("hi")).await.unwrap().body, "hi");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stream_is_authorized_once_not_per_message() {
    let validator = Arc::new(CountingValidator::default());
    let server = spawn_server(
        RpcServer::new(
            server_config(AccessPolicy::require(["user"])),
            ServerCredential::insecure(),
        )
        .with_validator(validator.clone()),
    )
    .await;
    let client = plaintext_client(&client_config(server.addr, "user")).await;

    let (pending, handle) = PendingSession::new(SessionRole::Client, fast_session());
    let (dispatcher, mut bodies) = recorder();
    let session = within(client.establish(pending))
        .await
        .unwrap()
        .expect("stream should establish")
        .with_dispatcher(dispatcher)
        .with_producer(ScriptedProducer::new(["a", "b", "c", "d", "e"]));
    let run = tokio::spawn(session.run());

    assert_eq!(collect(&mut bodies, 5).await.len(), 5);
    assert_eq!(validator.calls.load(Ordering::SeqCst), 1);

    handle.shutdown();
    within(run).await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn signal_while_idle_drains_and_closes_within_deadline() {
    let server = spawn_server(RpcServer::new(
        server_config(AccessPolicy::allow_all()),
        ServerCredential::insecure(),
    ))
    .await;
    let client = plaintext_client(&client_config(server.addr, "")).await;

    let session_config = fast_session();
    let deadline = session_config.drain_deadline();
    let (pending, handle) = PendingSession::new(SessionRole::Client, session_config);
    // No producer: the session only listens.
    let session = within(client.establish(pending))
        .await
        .unwrap()
        .expect("stream should establish");
    assert_eq!(handle.state(), SessionState::Active);

    let (signal_tx, signal_rx) = oneshot::channel::<ShutdownSignal>();
    let signal = async move { signal_rx.await.unwrap_or(ShutdownSignal::Interrupt) };

    let controller = LifecycleController::new(deadline);
    let started = Instant::now();
    let lifecycle = tokio::spawn({
        let handle = handle.clone();
        async move {
            controller
                .run(session.run(), signal, move |_| {
                    handle.shutdown();
                })
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    signal_tx.send(ShutdownSignal::Interrupt).unwrap();

    let outcome = within(lifecycle).await.unwrap();
    assert!(started.elapsed() < deadline + Duration::from_millis(500));
    let report = match outcome {
        LifecycleOutcome::Drained { signal, output } => {
            assert_eq!(signal, ShutdownSignal::Interrupt);
            output
        }
        other => panic!("expected a clean drain, got {other:?}"),
    };

    assert_eq!(
        report.transitions,
        vec![
            SessionState::Establishing,
            SessionState::Active,
            SessionState::Draining,
            SessionState::Closed,
        ]
    );
    assert_eq!(report.reason, CloseReason::LocalShutdown);
    assert!(report.half_closed);
    assert!(!report.deadline_elapsed);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_while_waiting_for_the_server_is_not_an_error() {
    // Accepts connections and never answers, so the stream never opens.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    let client = plaintext_client(&client_config(addr, "")).await;

    let (pending, handle) = PendingSession::new(SessionRole::Client, fast_session());
    let establishing = client.establish(pending);
    tokio::pin!(establishing);
    tokio::select! {
        _ = &mut establishing => panic!("a silent server cannot open a stream"),
        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
    }
    assert_eq!(handle.state(), SessionState::Establishing);

    assert!(handle.shutdown());
    let result = within(establishing).await;
    assert!(matches!(result, Ok(None)), "expected a clean abort");
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(handle.cancel_signal().reason(), Some(CloseReason::LocalShutdown));

    silent.abort();
}

#[tokio::test]
async fn server_shutdown_ends_client_sessions() {
    let server = spawn_server(RpcServer::new(
        server_config(AccessPolicy::allow_all()),
        ServerCredential::insecure(),
    ))
    .await;
    let client = plaintext_client(&client_config(server.addr, "")).await;

    let (pending, _handle) = PendingSession::new(SessionRole::Client, fast_session());
    let (dispatcher, mut bodies) = recorder();
    let session = within(client.establish(pending))
        .await
        .unwrap()
        .expect("stream should establish")
        .with_dispatcher(dispatcher)
        .with_producer(ScriptedProducer::new(["before shutdown"]));
    let run = tokio::spawn(session.run());
    collect(&mut bodies, 1).await;

    server.stop().await.unwrap();

    let report = within(run).await.unwrap();
    assert_ne!(report.reason, CloseReason::LocalShutdown);
    assert!(!report.half_closed);
}

// ---------------------------------------------------------------------------
// TLS
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_auth_tls_echo() {
    let pki = generate_pki();
    let server_credential = ServerCredential::from_pem(
        TlsMode::ServerAuth,
        None,
        Some(pki.server_cert.as_slice()),
        Some(pki.server_key.as_slice()),
    )
    .unwrap();
    let server = spawn_server(RpcServer::new(
        server_config(AccessPolicy::require(["user"])),
        server_credential,
    ))
    .await;

    let credential =
        ClientCredential::from_pem(TlsMode::ServerAuth, Some(pki.ca_cert.as_slice()), None, None).unwrap();
    let client = within(RpcClient::connect(&client_config(server.addr, "user"), &credential))
        .await
        .unwrap();

    assert_eq!(within(client.echo("over tls")).await.unwrap().body, "over tls");
    server.stop().await.unwrap();
}

#[tokio::test]
async fn mutual_tls_stream_round_trip() {
    let pki = generate_pki();
    let server_credential = ServerCredential::from_pem(
        TlsMode::Mutual,
        Some(pki.ca_cert.as_slice()),
        Some(pki.server_cert.as_slice()),
        Some(pki.server_key.as_slice()),
    )
    .unwrap();
    let server = spawn_server(RpcServer::new(
        server_config(AccessPolicy::allow_all()),
        server_credential,
    ))
    .await;

    let credential = ClientCredential::from_pem(
        TlsMode::Mutual,
        Some(pki.ca_cert.as_slice()),
        Some(pki.client_cert.as_slice()),
        Some(pki.client_key.as_slice()),
    )
    .unwrap();
    let client = within(RpcClient::connect(&client_config(server.addr, ""), &credential))
        .await
        .unwrap();

    let (pending, handle) = PendingSession::new(SessionRole::Client, fast_session());
    let (dispatcher, mut bodies) = recorder();
    let session = within(client.establish(pending))
        .await
        .unwrap()
        .expect("stream should establish")
        .with_dispatcher(dispatcher)
        .with_producer(ScriptedProducer::new(["one", "two"]));
    let run = tokio::spawn(session.run());

    assert_eq!(collect(&mut bodies, 2).await, vec!["one", "two"]);
    handle.shutdown();
    within(run).await.unwrap();
    server.stop().await.unwrap();
}

async fn echo_once(config: &ClientConfig, credential: &ClientCredential) -> Result<Message, StreamchatError> {
    let client = RpcClient::connect(config, credential).await?;
    client.echo("should not arrive").await
}

#[tokio::test]
async fn mutual_server_rejects_client_without_certificate() {
    let pki = generate_pki();
    let echo = Arc::new(CountingEcho::default());
    let server_credential = ServerCredential::from_pem(
        TlsMode::Mutual,
        Some(pki.ca_cert.as_slice()),
        Some(pki.server_cert.as_slice()),
        Some(pki.server_key.as_slice()),
    )
    .unwrap();
    let server = spawn_server(
        RpcServer::new(server_config(AccessPolicy::allow_all()), server_credential)
            .with_dispatcher(echo.clone()),
    )
    .await;

    // Trusts the server but presents no certificate of its own.
    let credential =
        ClientCredential::from_pem(TlsMode::ServerAuth, Some(pki.ca_cert.as_slice()), None, None).unwrap();
    let result = within(echo_once(&client_config(server.addr, ""), &credential)).await;

    assert!(result.is_err(), "certless client was served");
    assert_eq!(echo.seen.load(Ordering::SeqCst), 0);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn plaintext_client_cannot_talk_to_tls_server() {
    let pki = generate_pki();
    let server_credential = ServerCredential::from_pem(
        TlsMode::ServerAuth,
        None,
        Some(pki.server_cert.as_slice()),
        Some(pki.server_key.as_slice()),
    )
    .unwrap();
    let server = spawn_server(RpcServer::new(
        server_config(AccessPolicy::allow_all()),
        server_credential,
    ))
    .await;

    let result = within(echo_once(&client_config(server.addr, ""), &ClientCredential::insecure())).await;
    assert!(result.is_err());
    server.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Extra interceptors
// ---------------------------------------------------------------------------

/// Records every call that reaches it.
struct MethodLog(Arc<Mutex<Vec<String>>>);

impl Interceptor<ServerCall, ServerReply> for MethodLog {
    fn intercept(
        &self,
        call: ServerCall,
        next: Handler<ServerCall, ServerReply>,
    ) -> BoxFuture<'static, Result<ServerReply, Status>> {
        self.0
            .lock()
            .unwrap()
            .push(format!("{} {}", call.method(), call.kind()));
        next(call)
    }
}

#[tokio::test]
async fn extra_server_interceptors_run_inside_authorization() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let server = spawn_server(
        RpcServer::new(server_config(AccessPolicy::require(["user"])), ServerCredential::insecure())
            .with_interceptor(Arc::new(MethodLog(Arc::clone(&seen)))),
    )
    .await;

    let anonymous = plaintext_client(&client_config(server.addr, "")).await;
    let err = within(anonymous.echo("nobody")).await.unwrap_err();
    assert!(matches!(err, StreamchatError::Unauthenticated { .. }));
    assert!(seen.lock().unwrap().is_empty(), "rejected calls must not reach inner interceptors");

    let client = plaintext_client(&client_config(server.addr, "s3cret")).await;
    assert_eq!(within(client.echo("hello")).await.unwrap().body, "hello");
    let (pending, handle) = PendingSession::new(SessionRole::Client, fast_session());
    let session = within(client.establish(pending))
        .await
        .unwrap()
        .expect("stream should establish");
    handle.shutdown();
    within(session.run()).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["/chat.Chat/Echo unary", "/chat.Chat/ChatStream streaming"]
    );

    server.stop().await.unwrap();
}
