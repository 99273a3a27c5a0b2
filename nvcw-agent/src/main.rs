//! nvcw - GPU telemetry agent
//!
//! Reads every NVIDIA GPU on the workstation at a fixed interval and publishes
//! fan, temperature, power, memory and P-state metrics to the configured sink.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nvcw_agent::config::{AgentConfig, SinkKind};
use nvcw_agent::hardware::HardwareSource;
use nvcw_agent::{identity, sink, DevicePolicy, DeviceReader, Overrides, Publisher, Scheduler};

#[derive(Debug, Parser)]
#[command(name = "nvcw", version, about = "Publish NVIDIA GPU metrics on a fixed interval")]
struct Cli {
    /// Host label attached to every metric (defaults to the hostname)
    workstation: Option<String>,

    /// Seconds between sampling cycles
    #[arg(short, long)]
    interval: Option<i64>,

    /// Metrics namespace
    #[arg(short, long)]
    namespace: Option<String>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    sink: Option<SinkKind>,

    /// What to do when a single GPU cannot be read
    #[arg(long, value_enum)]
    device_policy: Option<DevicePolicy>,

    /// Run one cycle and exit
    #[arg(long)]
    once: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    print_config: bool,

    /// JSON log lines on stderr
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("nvcw_agent=info,nvcw=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(feature = "nvml")]
fn hardware_source() -> Result<Arc<dyn HardwareSource>> {
    Ok(Arc::new(nvcw_agent::hardware::NvmlSource::new()))
}

#[cfg(not(feature = "nvml"))]
fn hardware_source() -> Result<Arc<dyn HardwareSource>> {
    bail!("nvcw was built without NVML support")
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let mut config = AgentConfig::load(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;
    config
        .apply_env(|name| std::env::var(name).ok())
        .context("Invalid environment override")?;
    config.apply_overrides(Overrides {
        host: cli.workstation,
        interval_secs: cli.interval,
        namespace: cli.namespace,
        sink: cli.sink,
        device_policy: cli.device_policy,
    });

    if cli.print_config {
        let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
        print!("{}", rendered);
        return Ok(());
    }

    let resolved = config
        .resolve(identity::detect_hostname)
        .context("Invalid configuration")?;

    info!("nvcw agent v{} starting", env!("CARGO_PKG_VERSION"));

    let reader = DeviceReader::new(hardware_source()?, resolved.device_policy);
    match reader.count_devices_off_runtime().await {
        Ok(0) => warn!("No GPUs found, cycles will publish nothing"),
        Ok(devices) => info!(devices, host = %resolved.schedule.host, "Monitoring GPUs"),
        // Every cycle retries; the driver may come up later
        Err(e) => warn!("GPU monitoring unavailable at startup: {}", e),
    }

    let sink = sink::from_config(
        &resolved.sink,
        &resolved.schedule.host,
        resolved.publisher.max_payload_bytes,
        resolved.publisher.request_timeout,
    )
    .context("Failed to create metrics sink")?;
    let publisher = Publisher::new(sink, resolved.publisher);
    let scheduler = Scheduler::new(resolved.schedule, reader, publisher);

    if cli.once {
        let outcome = scheduler.run_cycle(1).await;
        scheduler.close().await;
        return match outcome.result {
            Ok(report) if report.is_complete() => {
                info!(points = report.accepted.len(), "Published");
                Ok(())
            }
            Ok(report) => bail!("{} metric points were rejected", report.failed.len()),
            Err(e) => Err(e).context("Cycle failed"),
        };
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));
    scheduler.run(shutdown).await;

    Ok(())
}
