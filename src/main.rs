use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use fabric_controller::config::Cli;
use fabric_controller::orchestrator::Orchestrator;
use fabric_controller::upload::{self, UploadState};

fn main() -> ExitCode {
    let cli = Cli::parse();
    cli.init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    match runtime.block_on(try_main(cli)) {
        Ok(()) => {
            tracing::info!("controller shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main(cli: Cli) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::bootstrap(&cli)
        .await
        .context("failed to bootstrap the fabric controller")?;

    let router = upload::router(UploadState {
        orchestrator: orchestrator.clone(),
        persist_path: cli.persist_path.clone(),
    });

    let listener = tokio::net::TcpListener::bind(cli.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen_addr))?;

    tracing::info!(addr = %cli.listen_addr, "configuration-upload endpoint listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("upload server exited unexpectedly")?;

    orchestrator.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(e) => tracing::warn!(error = %e, "failed to install ctrl-c handler"),
    }
}
