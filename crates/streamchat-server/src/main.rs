//! streamchat server -- relays chat messages back to their sender.
//!
//! Usage:
//!
//!   streamchat-server [OPTIONS]
//!
//! Options:
//!
//!   --bind <IP>               Address to bind (default: 0.0.0.0)
//!   --port <PORT>             Listen port (default: 50051)
//!   --tls <MODE>              none | server-auth | mutual (default: none)
//!   --cert <PATH>             Server certificate (default: cert/server-cert.pem)
//!   --key <PATH>              Server key (default: cert/server-key.pem)
//!   --client-ca <PATH>        Client CA bundle for mutual mode (default: cert/ca-cert.pem)
//!   --role <ROLE>             Required role (repeatable, default: user)
//!   --allow-all               Accept calls without credentials
//!   --token <TOKEN>           Accepted token (repeatable)
//!   --drain-deadline-ms <MS>  Graceful shutdown bound (default: 5000)
//!   --config <PATH>           Load config from JSON file
//!
//! The server runs until interrupted with Ctrl+C (SIGINT/SIGTERM).

use std::sync::Arc;

use clap::Parser;

use streamchat_rpc::interceptors::StaticTokens;
use streamchat_rpc::{shutdown_signal, LifecycleController, LifecycleOutcome, RpcServer, ServerCredential};
use streamchat_types::Result;

mod config;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Tracing / logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = config::CliArgs::parse();

    let settings = match config::ServerSettings::resolve(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_server(settings).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Server main logic
// ---------------------------------------------------------------------------

async fn run_server(settings: config::ServerSettings) -> Result<()> {
    let credential = ServerCredential::build(
        settings.tls,
        Some(&settings.client_ca),
        Some(&settings.cert),
        Some(&settings.key),
    )?;

    let deadline = settings.rpc.session.drain_deadline();
    let mut server = RpcServer::new(settings.rpc, credential);
    if !settings.tokens.is_empty() {
        tracing::info!(count = settings.tokens.len(), "using static token allow-list");
        server = server.with_validator(Arc::new(StaticTokens::new(&settings.tokens)));
    }

    let bound = server.bind().await?;
    let shutdown = bound.shutdown_token();
    tracing::info!(addr = %bound.local_addr(), tls = %settings.tls, "server listening");

    let outcome = LifecycleController::new(deadline)
        .run(bound.serve(), shutdown_signal(), |_| shutdown.cancel())
        .await;

    match outcome {
        LifecycleOutcome::Finished(result) => result,
        LifecycleOutcome::Drained { output, .. } => {
            output?;
            tracing::info!("server stopped");
            Ok(())
        }
        LifecycleOutcome::DeadlineElapsed { .. } => {
            tracing::warn!("server stopped before every session drained");
            Ok(())
        }
    }
}
