use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use drivecheck::config::AppConfig;
use drivecheck::core::{BatchListener, BatchRunner, Blake3Source, CheckStatus};
use drivecheck::logging::{self, LogConfig};

#[derive(Parser, Serialize)]
#[command(name = "drivecheck")]
#[command(about = "Verify removable media by repeated write/readback cycles", long_about = None)]
struct Cli {
    /// Mount paths of the devices to verify
    #[serde(skip)]
    #[arg(required = true)]
    devices: Vec<PathBuf>,

    /// File whose bytes are written to and read back from every device
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    test_file: Option<PathBuf>,

    /// Write/verify cycles per device (0 = run until interrupted)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    iterations: Option<u32>,

    /// Emit logs and the final report as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,
}

/// Logs status transitions and flips a watch flag when the batch stops.
struct CliListener {
    stopped: watch::Sender<bool>,
}

#[async_trait]
impl BatchListener for CliListener {
    async fn on_batch_start(&self) {
        info!("batch started");
    }

    async fn on_batch_stop(&self) {
        let _ = self.stopped.send(true);
    }

    async fn on_device_status_changed(&self, device: &Path, status: CheckStatus) {
        info!(device = %device.display(), %status, "device status changed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::new(Some(&cli))?;
    logging::init(&LogConfig {
        json: config.json,
        verbose: config.verbose,
    });

    let test_file = config
        .test_file
        .clone()
        .context("no test file configured; pass --test-file")?;
    let metadata = std::fs::metadata(&test_file)
        .with_context(|| format!("cannot read test file {}", test_file.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a regular file", test_file.display());
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let listener = Arc::new(CliListener { stopped: stop_tx });
    let runner = BatchRunner::new(
        cli.devices.clone(),
        test_file,
        config.iterations,
        Arc::new(Blake3Source),
        listener,
    );

    runner.start();

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; canceling batch");
                runner.cancel();
            }
        }
    }

    let mut failed = 0usize;
    for check in runner.checks() {
        let status = check.status();
        if status == CheckStatus::Failed {
            failed += 1;
        }
        if config.json {
            println!(
                "{}",
                serde_json::json!({
                    "device": check.device(),
                    "status": status,
                    "iterations": check.iterations_completed(),
                    "started_at": check.started_at(),
                    "finished_at": check.finished_at(),
                })
            );
        } else {
            println!(
                "{}  {}  ({} iterations)",
                check.device().display(),
                status,
                check.iterations_completed()
            );
        }
    }

    if failed > 0 {
        bail!("{failed} device(s) failed verification");
    }
    Ok(())
}
