//! wsline - WebSocket to line-terminal bridge
//!
//! wsline accepts WebSocket connections speaking the "ascii" sub-protocol
//! and gives each one a line-editing terminal session attached to a
//! multi-user text host. The bundled host is a small talker.
//!
//! # Quick Start
//!
//! ```text
//! wsline                       # Listen on 127.0.0.1:4000
//! wsline -l 0.0.0.0:8080       # Listen elsewhere
//! wsline -c ./wsline.toml      # Use an explicit config file
//! ```
//!
//! # Line editing
//!
//! | Key | Action |
//! |-----|--------|
//! | Left/Right | Move the cursor |
//! | Home/End | Start/end of line |
//! | Backspace, DEL | Delete before the cursor |
//! | Delete | Delete at the cursor |
//! | Enter | Send the line |

mod config;
mod core;
mod net;
mod talker;

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Config, LogConfig};
use crate::net::Server;
use crate::talker::Talker;

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line options
#[derive(Debug, Default)]
struct Options {
    /// Explicit config file
    config: Option<PathBuf>,
    /// Listen address override
    listen: Option<String>,
}

fn print_version() {
    eprintln!("wsline {}", VERSION);
}

fn print_help() {
    eprintln!("wsline {} - WebSocket to line-terminal bridge", VERSION);
    eprintln!();
    eprintln!("Usage: wsline [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <FILE>   Read configuration from FILE");
    eprintln!("  -l, --listen <ADDR>   Listen address (default 127.0.0.1:4000)");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.wsline/config.toml");
    eprintln!("Log filter: RUST_LOG overrides [log] level");
    eprintln!();
    eprintln!("Exit: Ctrl+C");
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing config file argument".to_string());
                }
                options.config = Some(PathBuf::from(&args[i]));
            }
            "-l" | "--listen" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing listen address argument".to_string());
                }
                options.listen = Some(args[i].clone());
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Install the global subscriber, writing to the log file if one is set
fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file = log.file.as_ref().and_then(|path| {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        // Append mode
        OpenOptions::new().create(true).append(true).open(path).ok()
    });

    match file {
        Some(file) => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let options = match parse_args() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut config = match &options.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(listen) = options.listen {
        config.server.listen = listen;
    }

    init_logging(&config.log);
    info!("wsline {} starting...", VERSION);

    let talker = Talker::new(&config.talker);
    // Keep full redraws of a full line inside the terminal width
    config.terminal.prompt_width = config.terminal.prompt_width.max(talker.prompt_width());
    let server = Server::bind(config).await?;
    info!("Listening on {}", server.local_addr()?);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    server.run(talker, shutdown).await?;

    info!("wsline stopped");
    Ok(())
}
