use anyhow::Context;
use build_reaper::commands::{Cli, CommandRunner, EXIT_FATAL};
use build_reaper::config::CleanupConfig;
use build_reaper::logging::init_logger;
use build_reaper::reaper::CancellationFlag;
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match main_impl(cli).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("build-reaper: {err:#}");
            ExitCode::from(EXIT_FATAL as u8)
        }
    }
}

async fn main_impl(cli: Cli) -> anyhow::Result<i32> {
    let config = CleanupConfig::load(cli.global.overrides())
        .map_err(|err| anyhow::anyhow!(err.user_message()))?;
    init_logger(cli.global.log_level.as_deref(), &config)
        .context("failed to initialize logging")?;

    let cancel = CancellationFlag::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; abandoning remaining cleanup");
            on_interrupt.cancel();
        }
    });

    let runner = CommandRunner::new(config, cancel);
    let command = cli.command;
    let code = tokio::task::spawn_blocking(move || runner.run(command))
        .await
        .context("cleanup task panicked")?;
    Ok(code)
}
