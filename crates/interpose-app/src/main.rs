//! Interpose - transparent HTTP/HTTPS redirect to an intercepting proxy.
//!
//! `interpose serve` runs the daemon: it owns the iptables rules, the control
//! API and the quick toggle. Every other subcommand is a client of that API.

use std::panic;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use interpose_app::client::{ApiClient, ClientError};
use interpose_app::daemon::{self, DaemonOptions};
use interpose_core::{ProxyState, StateEvent, SurfaceView};
use interpose_server::{ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Interpose - redirect ports 80 and 443 to an intercepting proxy
#[derive(Parser, Debug)]
#[command(name = "interpose", version, about)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Control API host
    #[arg(long, global = true, default_value = DEFAULT_HOST)]
    api_host: String,

    /// Control API port
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    api_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon
    Serve {
        /// Settings database path
        #[arg(long)]
        db: Option<PathBuf>,

        /// Privileged shell used to run iptables ("su", "sudo -n sh", "sh")
        #[arg(long, default_value = "su")]
        shell: String,
    },

    /// Show the current redirect state
    Status,

    /// Enable redirection (missing values come from saved settings)
    On {
        /// Proxy IPv4 address
        #[arg(long)]
        address: Option<String>,

        /// Proxy port; invalid values fall back to 8080
        #[arg(long)]
        port: Option<String>,
    },

    /// Disable redirection
    Off,

    /// Flip the current state
    Toggle,

    /// Follow state changes until the daemon exits
    Watch,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "interpose", "Interpose").map(|dirs| dirs.data_dir().join("logs"))
}

fn env_filter(args: &Args) -> EnvFilter {
    let log_level = if args.debug { "debug" } else { &args.log_level };
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("interpose={},warn", log_level)))
}

/// Initialize daemon logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = env_filter(args);

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("interpose")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                if args.debug {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(std::io::stdout))
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                } else {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                        .init();
                }

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Client commands keep stdout for their own output.
fn init_client_logging(args: &Args) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(args))
        .with_writer(std::io::stderr)
        .init();
}

fn print_state(state: ProxyState) {
    let mut view = SurfaceView::new();
    view.apply(&StateEvent::Snapshot { state });
    println!("{} ({})", view.headline(), view.status_text());
    match view.notification() {
        Some(line) => println!("{}", line),
        None => println!("Target {}", state.target),
    }
}

fn watch(client: &ApiClient) -> Result<(), ClientError> {
    let mut view = SurfaceView::new();
    client.watch(|event| {
        view.apply(&event);
        match &event {
            StateEvent::Failed { request, error, .. } => {
                println!("{:?} failed: {}", request, error);
            }
            _ => println!("{} | {}", view.tile_label(), view.status_text()),
        }
        true
    })?;
    println!("Daemon stopped");
    Ok(())
}

fn run_client(args: &Args, client: &ApiClient) -> Result<(), ClientError> {
    match &args.command {
        Command::Status => print_state(client.state()?),
        Command::On { address, port } => {
            print_state(client.start(address.clone(), port.clone())?)
        }
        Command::Off => print_state(client.stop()?),
        Command::Toggle => print_state(client.toggle()?),
        Command::Watch => watch(client)?,
        Command::Serve { .. } => unreachable!("serve is not a client command"),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Command::Serve { db, shell } = &args.command {
        // Keep the guard alive for the duration of the program
        let _log_guard = init_logging(&args);

        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            tracing::error!("PANIC: {}", panic_info);
            default_hook(panic_info);
        }));

        tracing::info!("Starting Interpose...");
        tracing::debug!("Args: {:?}", args);

        let options = DaemonOptions {
            db_path: db.clone(),
            shell: shell.clone(),
            api: ServerConfig::default()
                .with_host(args.api_host.clone())
                .with_port(args.api_port),
        };
        return match daemon::run(options) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("Daemon error: {:#}", e);
                eprintln!("interpose: {:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    init_client_logging(&args);
    let client = ApiClient::for_port(&args.api_host, args.api_port);
    match run_client(&args, &client) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("interpose: {}", e);
            if let ClientError::Http(_) = e {
                eprintln!("is `interpose serve` running on {}?", client.base_url());
            }
            ExitCode::FAILURE
        }
    }
}
