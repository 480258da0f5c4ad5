//! Event recorder binary.
//!
//! Runs the recorder graph until the stream ends or Ctrl+C is received.
//!
//! ```text
//! eventcam [-e <0|1>] [-c <DIR>]
//! ```

use anyhow::Context;
use clap::Parser;
use eventcam_recorder::config::{LoggingConfig, RecorderConfig};
use eventcam_recorder::{Pipeline, Termination};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "eventcam", version, about = "Detection-triggered clip recorder")]
struct Args {
    /// Show annotations in recorded files (1) or record clean video (0)
    #[arg(short = 'e', long = "enable", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1))]
    enable: u8,

    /// Configuration directory
    #[arg(short = 'c', long = "config", env = "RECORDER_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = load_config(&args)?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "eventcam-recorder",
        version = env!("CARGO_PKG_VERSION"),
        source = ?config.source.kind,
        annotations_visible = config.recording.annotations_visible,
        "Starting event recorder"
    );

    // Validate configuration
    config.validate()?;

    let pipeline = Pipeline::new(config)?;

    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    match pipeline.run(shutdown_signal).await {
        Ok(summary) => {
            match summary.termination {
                Termination::EndOfStream => info!("Stream ended, recorder stopped"),
                Termination::Shutdown => info!("Shutdown complete"),
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Event recorder failed");
            Err(e.into())
        }
    }
}

/// Load configuration and apply command-line overrides.
fn load_config(args: &Args) -> anyhow::Result<RecorderConfig> {
    // Try loading from files first, fall back to environment
    let mut config = RecorderConfig::load(&args.config_dir)
        .or_else(|e| {
            warn!(error = %e, "Failed to load config from files, trying environment");
            RecorderConfig::from_env()
        })
        .with_context(|| format!("loading configuration from {}", args.config_dir.display()))?;

    config.recording.annotations_visible = args.enable == 1;
    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("eventcam_recorder={}", level).parse()?)
        .add_directive(format!("eventcam={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    }

    Ok(())
}
