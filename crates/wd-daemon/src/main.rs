//! warden daemon — tails the workflow event log, maintains workflow state,
//! and turns detected issues into queued tasks and notifications.

use anyhow::{Context, Result};
use tracing::info;

use wd_core::config::Config;
use wd_daemon::logging;
use wd_daemon::supervisor::Supervisor;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Detection thresholds and the expected chain come from here, so a bad
    // file is a startup error rather than a silently different watcher.
    let config = Config::load().context("failed to load configuration")?;

    match config.general.log_format.as_str() {
        "json" => logging::init_logging_json("wd-daemon", &config.general.log_level),
        _ => logging::init_logging("wd-daemon", &config.general.log_level),
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        project = %config.general.project_name,
        "warden daemon starting"
    );

    std::fs::create_dir_all(&config.paths.working_dir).with_context(|| {
        format!(
            "failed to create working directory {}",
            config.paths.working_dir.display()
        )
    })?;

    let supervisor = Supervisor::new(config);
    let shutdown = supervisor.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    supervisor.run().await?;

    info!("warden daemon stopped");
    Ok(())
}
