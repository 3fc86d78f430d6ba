// Solstage entry point.
//
// Startup sequence:
// 1. Parse the command line
// 2. Initialize tracing (log to file, stdout is for command output)
// 3. Load config and open the local cache (inside `cli::run`)
// 4. Dispatch the command

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use solstage_app::cli::{self, Cli};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.base_dir)?;
    info!("solstage starting: {:?}", cli.command);

    if let Err(e) = cli::run(cli).await {
        error!("command failed: {e:#}");
        return Err(e);
    }
    Ok(())
}

/// Initialize tracing to log to `<base_dir>/logs/solstage.log`.
fn init_tracing(base_dir: &Path) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = base_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_file = std::fs::File::create(log_dir.join("solstage.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("solstage=info,solstage_app=info,solstage_core=info,solstage_client=info,warn")
        }))
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
