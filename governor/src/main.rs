//! # Governor binary
//!
//! Loads one or more machine configurations, compiles them, binds the
//! PV namespace and runs until Ctrl-C or a Kill command.
//!
//! # Usage
//!
//! ```bash
//! # Two machines sharing a sync map, channels prefixed for the beamline
//! governor -c config/human.yml config/robot.yml -s config/sync.yml --prefix "XF:17ID:AMX"
//!
//! # Validate the configuration and exit
//! governor -c config/human.yml --check_config
//! ```

use clap::{Parser, ValueEnum};
use governor::pv::PvBinding;
use governor::supervisor::{self, sim_io_factory, Governor};
use governor_common::config::{load_sync, GovernorConfig, SyncMap};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Log level choices of the `-l` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn tracing_level(self) -> Level {
        match self {
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }
}

/// Governor - supervisory state manager for beamline positioners
#[derive(Parser, Debug)]
#[command(name = "governor")]
#[command(version)]
#[command(about = "Supervisory state manager for positioners sharing a motion envelope")]
struct Args {
    /// Machine configuration file(s), one YAML file per machine
    #[arg(short = 'c', long = "config", required = true, num_args = 1..)]
    configs: Vec<PathBuf>,

    /// Parse and validate the configuration, then exit
    #[arg(long = "check_config")]
    check_config: bool,

    /// Log level
    #[arg(short = 'l', long = "log_level", value_enum, default_value = "INFO")]
    log_level: LogLevel,

    /// String prepended to every published channel
    #[arg(long, default_value = "")]
    prefix: String,

    /// Sync map file (YAML)
    #[arg(short = 's', long = "sync")]
    sync: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run().await {
        error!("governor startup failed: {e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    info!("Governor v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load every file before validating, so the operator sees all
    // problems in one pass.
    let mut configs = Vec::new();
    let mut load_problems = Vec::new();
    for path in &args.configs {
        match GovernorConfig::load(path) {
            Ok(cfg) => configs.push(cfg),
            Err(e) => load_problems.push(format!("{}: {e}", path.display())),
        }
    }
    let sync = match &args.sync {
        Some(path) => match load_sync(path) {
            Ok(sync) => sync,
            Err(e) => {
                load_problems.push(format!("{}: {e}", path.display()));
                SyncMap::new()
            }
        },
        None => SyncMap::new(),
    };
    if !load_problems.is_empty() {
        for p in &load_problems {
            error!("{p}");
        }
        return Err("configuration loading failed".into());
    }

    if args.check_config {
        supervisor::validate_configs(&configs, &sync)?;
        info!("configuration OK: {} machine(s)", configs.len());
        return Ok(());
    }

    let mut sim = sim_io_factory();
    let gov = Governor::build(&configs, sync, &mut |_machine, key, dev| sim(key, dev))?;
    let binding = PvBinding::new(gov.clone(), &args.prefix);
    info!(
        machines = configs.len(),
        channels = binding.registry().names().len(),
        "pv binding up"
    );

    let mut shutdown = gov.shutdown_rx();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            gov.kill();
        }
        _ = shutdown.changed() => {
            info!("kill command received");
        }
    }

    // Give the poll and republish tasks a moment to observe the signal.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Governor shutdown complete");
    Ok(())
}

fn setup_tracing(args: &Args) {
    let filter =
        EnvFilter::from_default_env().add_directive(args.log_level.tracing_level().into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
