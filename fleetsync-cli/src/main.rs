//! `fleetsync` entry point: watch configured resources and print every
//! published snapshot as one JSON line on stdout.

use std::io::Write;

use fleetsync_cli::config::CliConfig;
use fleetsync_cli::error::CliError;
use fleetsync_cli::telemetry::init_logging;
use fleetsync_cli::watch::{build_context, Watchers};

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let config = CliConfig::load()?;
    init_logging(&config.log)?;

    let ctx = build_context(&config)?;
    let mut watchers = Watchers::spawn(&ctx, &config.resources)?;

    let stdout = std::io::stdout();
    loop {
        tokio::select! {
            line = watchers.next_line() => match line {
                Some(line) => {
                    let mut out = stdout.lock();
                    writeln!(out, "{line}")?;
                    out.flush()?;
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    watchers.shutdown().await;
    ctx.shutdown().await;
    Ok(())
}
