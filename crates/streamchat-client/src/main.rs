//! streamchat client -- streams chat lines to a server and logs the echoes.
//!
//! Usage:
//!
//!   streamchat-client [OPTIONS]
//!
//! Options:
//!
//!   --address <HOST:PORT>     Server address (default: 127.0.0.1:50051)
//!   --tls <MODE>              none | server-auth | mutual (default: none)
//!   --ca <PATH>               Server CA bundle (default: cert/ca-cert.pem)
//!   --cert <PATH>             Client certificate (default: cert/client-cert.pem)
//!   --key <PATH>              Client key (default: cert/client-key.pem)
//!   --server-name <NAME>      Name to verify in the server certificate
//!   --token <TOKEN>           Identity token
//!   --interval-ms <MS>        Time between messages (default: 1000)
//!   --message <BODY>          Send fixed bodies instead of random lines (repeatable)
//!   --count <N>               Stop after N random lines
//!   --drain-deadline-ms <MS>  Graceful shutdown bound (default: 5000)
//!   --config <PATH>           Load config from JSON file
//!
//! Environment:
//!
//!   STREAMCHAT_TOKEN          Identity token (same as --token)
//!
//! The client runs until interrupted with Ctrl+C or until the server
//! ends the stream.

use clap::Parser;

use streamchat_rpc::{
    shutdown_signal, CancelSignal, ClientCredential, LifecycleController, LifecycleOutcome,
    PendingSession, RpcClient, ScriptedProducer, SessionReport, SessionRole,
};
use streamchat_types::Result;

mod config;
mod phrases;

use phrases::PhraseProducer;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = config::CliArgs::parse();

    let settings = match config::ClientSettings::resolve(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_client(settings).await {
        tracing::error!("client error: {e}");
        std::process::exit(1);
    }

    tracing::warn!("Bye!");
}

async fn run_client(settings: config::ClientSettings) -> Result<()> {
    let credential = ClientCredential::build(
        settings.tls,
        Some(&settings.ca),
        Some(&settings.cert),
        Some(&settings.key),
    )?;
    let (pending, handle) = PendingSession::new(SessionRole::Client, settings.rpc.session.clone());
    let deadline = settings.rpc.session.drain_deadline();
    let work = connect_and_run(&settings, &credential, pending, handle.cancel_signal().clone());

    let outcome = LifecycleController::new(deadline)
        .run(work, shutdown_signal(), |_| {
            handle.shutdown();
        })
        .await;

    match outcome {
        LifecycleOutcome::Finished(report) | LifecycleOutcome::Drained { output: report, .. } => {
            match report? {
                Some(report) => log_report(&report),
                None => tracing::info!("shut down before the chat stream was established"),
            }
            Ok(())
        }
        LifecycleOutcome::DeadlineElapsed { .. } => {
            tracing::warn!("session did not close before the drain deadline");
            Ok(())
        }
    }
}

/// Connects, establishes and runs the session.
///
/// A shutdown before the stream is up yields `Ok(None)`.
async fn connect_and_run(
    settings: &config::ClientSettings,
    credential: &ClientCredential,
    pending: PendingSession,
    cancel: CancelSignal,
) -> Result<Option<SessionReport>> {
    let client = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        connected = RpcClient::connect(&settings.rpc, credential) => connected?,
    };
    let Some(session) = client.establish(pending).await? else {
        return Ok(None);
    };
    tracing::info!("chat stream established");

    let session = if settings.messages.is_empty() {
        let producer = match settings.count {
            Some(count) => PhraseProducer::new().limit(count),
            None => PhraseProducer::new(),
        };
        session.with_producer(producer)
    } else {
        session.with_producer(ScriptedProducer::new(settings.messages.iter().cloned()))
    };
    Ok(Some(session.run().await))
}

fn log_report(report: &SessionReport) {
    tracing::info!(
        reason = %report.reason,
        sent = report.sent,
        received = report.received,
        send_failures = report.send_failures,
        "session closed",
    );
}
