//! svc-host: request dispatch host with supervised service processes
//!
//! Listens for WebSocket connections, routes each request to a named
//! function (in-process) or service (child process), and exits on its own
//! once no client has been connected for `disconnectTimeout`.
//!
//! Usage:
//!   svc-host --config host.json                  # Run the configured host
//!   svc-host --config host.json --port 8080      # Override the port
//!   svc-host --config host.json --print-config   # Print the resolved config
//!   svc-host worker --handler double             # Serve one handler on stdio

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use host_server::{Host, HostConfig, WorkerConfig, run_worker};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "svc-host", version, about = "Request dispatch host with supervised services")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Host config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on (0 for OS-assigned)
    #[arg(long)]
    port: Option<u16>,

    /// Hostname to bind to
    #[arg(long)]
    hostname: Option<String>,

    /// Shut down after this many ms without a connection (0 = never)
    #[arg(long)]
    disconnect_timeout: Option<u64>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Print the resolved config as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Write logs to a file (defaults to ~/.svc-host/logs/host.log if no path given)
    #[arg(long, global = true, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve one sample handler over stdin/stdout (child side of a service)
    Worker {
        /// Sample handler kind, e.g. `double`
        #[arg(long)]
        handler: String,

        /// Operation name requests arrive under (defaults to the kind)
        #[arg(long)]
        name: Option<String>,

        /// Handler options as a JSON object
        #[arg(long)]
        options: Option<String>,
    },
}

/// Install the tracing subscriber. Logs go to stderr (or the log file):
/// stdout carries the listen line in host mode and the wire protocol in
/// worker mode.
fn init_tracing(verbose: bool, log_file: Option<&str>) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let Some(log_file_arg) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return;
    };

    let log_path = if log_file_arg == "DEFAULT" {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".svc-host/logs/host.log")
    } else {
        PathBuf::from(log_file_arg)
    };
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
            eprintln!("Logging to {}", log_path.display());
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            error!("Failed to open log file {}: {e}", log_path.display());
        }
    }
}

/// Load the config file (if any) and apply CLI overrides.
fn resolve_config(cli: &Cli) -> Result<HostConfig, host_server::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(hostname) = &cli.hostname {
        config.address = hostname.clone();
    }
    if let Some(timeout) = cli.disconnect_timeout {
        config.disconnect_timeout = timeout;
    }
    if let Some(max) = cli.max_connections {
        config.max_connections = Some(max);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_file.as_deref());

    if let Some(Command::Worker {
        handler,
        name,
        options,
    }) = &cli.command
    {
        let result = match WorkerConfig::new(handler, name.as_deref(), options.as_deref()) {
            Ok(config) => run_worker(config).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Worker failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    if cli.print_config {
        match serde_json::to_string_pretty(&config) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                error!("Failed to serialize config: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let host = match Host::start(config).await {
        Ok(host) => host,
        Err(e) => {
            error!("Failed to start host: {e}");
            std::process::exit(1);
        }
    };

    // Parent processes read this line to find the OS-assigned port
    match serde_json::to_string(&host.status().listen_info()) {
        Ok(line) => println!("{line}"),
        Err(e) => error!("Failed to serialize listen info: {e}"),
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
        _ = host.wait_for_shutdown() => {
            info!("Idle timeout reached");
        }
    }

    host.stop().await;
    info!("Host stopped");
}
