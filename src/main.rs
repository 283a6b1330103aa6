// Main

mod amf;
mod base;
mod callback;
mod codec;
mod group;
mod log;
mod remux;
mod rtmp;
mod server;
mod session;
mod utils;

use std::sync::Arc;

use clap::Parser;
use log::{LogConfig, Logger};
use server::{ServerConfiguration, ServerManager};

/// Exit code for configuration errors
const EXIT_CODE_CONFIG: i32 = 1;

/// Exit code if a listener could not be started
const EXIT_CODE_LISTEN: i32 = 2;

/// Live stream server: RTMP, RTSP, HTTP-FLV and HTTP-TS
#[derive(Parser, Debug)]
#[command(name = "stream-group-server", disable_version_flag = true)]
struct Args {
    /// Configuration file (KEY=VALUE lines). Defaults to .env if present.
    #[arg(short = 'c', value_name = "confFile")]
    config_file: Option<String>,

    /// Print the version and exit
    #[arg(short = 'v')]
    version: bool,
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main function
#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) => {
            let _ = e.print();

            match e.kind() {
                clap::error::ErrorKind::DisplayHelp => std::process::exit(0),
                _ => std::process::exit(EXIT_CODE_CONFIG),
            }
        }
    };

    if args.version {
        println!("stream-group-server {}", VERSION);
        return;
    }

    // Load configuration file

    match &args.config_file {
        Some(file) => {
            if let Err(e) = dotenvy::from_filename(file) {
                eprintln!("Could not load configuration file {}: {}", file, e);
                std::process::exit(EXIT_CODE_CONFIG);
            }
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    // Initialize logger

    let logger = Arc::new(Logger::new(LogConfig::load_from_env()));

    log_info!(logger, format!("Stream group server ({})", VERSION));

    // Load server configuration

    let config = match ServerConfiguration::load_from_env(&logger) {
        Ok(c) => Arc::new(c),
        Err(_) => {
            std::process::exit(EXIT_CODE_CONFIG);
        }
    };

    // Start

    let manager = ServerManager::new(logger.clone(), config);

    let mut end_receiver = match manager.start().await {
        Ok(r) => r,
        Err(_) => {
            std::process::exit(EXIT_CODE_LISTEN);
        }
    };

    // Wait for a signal or a listener failure

    let listener_failed = tokio::select! {
        _ = tokio::signal::ctrl_c() => false,
        _ = end_receiver.recv() => true,
    };

    manager.shutdown().await;

    if listener_failed {
        std::process::exit(EXIT_CODE_LISTEN);
    }
}
