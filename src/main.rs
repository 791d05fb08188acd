//! Binary entrypoint for the aquanet hub.
//!
//! Commands:
//! - `start [--port <path>]` - run the hub, optionally on a serial radio bridge
//! - `init` - write a starter `config.toml`
//! - `status` - print the persisted fleet summary as JSON
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};

use aquanet::config::Config;
use aquanet::hub::bootstrap;

#[derive(Parser)]
#[command(name = "aquanet")]
#[command(about = "Reliable control plane for ESP-NOW aquarium device networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hub
    Start {
        /// Radio bridge serial port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show the persisted fleet
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port } => {
            let config = Config::load(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting aquanet v{} ({})", env!("CARGO_PKG_VERSION"), config.hub.name);

            if let Some(dir) = std::path::Path::new(&config.hub.state_file).parent() {
                if !dir.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(dir).await?;
                }
            }

            let hub = bootstrap::build_hub(&config, port.as_deref())?;
            let (stop, shutdown) = tokio::sync::watch::channel(false);
            let runner = tokio::spawn(hub.run(shutdown));

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal");
            let _ = stop.send(true);
            match runner.await {
                Ok(result) => result?,
                Err(e) => error!("Hub task failed: {}", e),
            }
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if std::path::Path::new(&cli.config).exists() {
                info!("{} already exists; leaving it untouched", cli.config);
                return Ok(());
            }
            Config::create_default(&cli.config).await?;
            info!("Wrote default configuration to {}", cli.config);
            println!("Created {}. Edit [hub].bridge_port and [[aquariums]], then run `aquanet start`.", cli.config);
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await.unwrap_or_default();
            init_logging(&Some(config.clone()), cli.verbose);
            let summary = bootstrap::fleet_summary(&config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match (verbosity, config) {
        (0, Some(cfg)) => cfg.logging.level.parse().unwrap_or(log::LevelFilter::Info),
        (0, None) => log::LevelFilter::Info,
        (1, _) => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| std::fs::OpenOptions::new().create(true).append(true).open(path).ok());

    if let Some(f) = log_file {
        let file = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Only mirror to the console when someone is watching it
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
