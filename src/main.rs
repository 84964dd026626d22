use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use itscam::device::{SensorEventSink, SimulatedCamera, SimulatedHaptics, SimulatedMotion, TiffDngEncoder};
use itscam::server::{CommandHandler, ItsServer};
use itscam::session::SensorEventLog;
use itscam::ItsConfig;

#[derive(Parser, Debug)]
#[command(name = "itscam")]
#[command(about = "Camera test-control service")]
#[command(version)]
#[command(long_about = "Serves a line-oriented JSON control protocol on a TCP port. A test host \
connects, issues capture and 3A commands, and receives capture metadata and image payloads \
back on the same connection.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "itscam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<String>,

    /// Override the listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the camera to open
    #[arg(long, value_name = "ID")]
    camera_id: Option<String>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without opening the camera")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        let rendered = toml::to_string_pretty(&ItsConfig::default())
            .context("Failed to render default configuration")?;
        println!("# itscam configuration file");
        println!("{}", rendered);
        return Ok(());
    }

    let _log_guard = init_logging(&args)?;

    info!("Starting itscam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = ItsConfig::load_from_file(&args.config).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(id) = &args.camera_id {
        config.camera.id = id.clone();
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }
    if args.validate_config {
        println!("✓ Configuration is valid");
        return Ok(());
    }

    let camera = Arc::new(SimulatedCamera::new(
        config.camera.id.clone(),
        config.simulator.clone(),
    )?);
    let sensors = Arc::new(SensorEventLog::new());
    let mut motion = if config.simulator.sensor_rate_hz > 0 {
        let sink: Arc<dyn SensorEventSink> = sensors.clone();
        Some(SimulatedMotion::spawn(sink, config.simulator.sensor_rate_hz)?)
    } else {
        info!("Motion sensors disabled");
        None
    };

    let handler = CommandHandler::open(
        camera,
        &config,
        Arc::new(TiffDngEncoder::new()),
        sensors,
        Some(Arc::new(SimulatedHaptics::new())),
    )?;
    let mut server = ItsServer::new(config.server.clone(), handler);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let outcome = server.run(shutdown).await;
    if let Err(e) = &outcome {
        error!("Server stopped with error: {}", e);
    }

    if let Some(motion) = motion.as_mut() {
        motion.stop();
    }
    if let Err(e) = server.close() {
        warn!("Failed to close camera cleanly: {}", e);
    }
    info!("itscam shutdown complete");

    outcome.map_err(Into::into)
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM
fn setup_signal_handlers(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    if sigterm.recv().await.is_some() {
                        info!("Received SIGTERM signal");
                        shutdown.cancel();
                    }
                }
                Err(e) => warn!("Failed to register SIGTERM handler: {}", e),
            }
        });
    }

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("itscam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "itscam.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}
