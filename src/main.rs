//! CLI for stompcooler
//!
//! Subcommands:
//! - `serve`: run the STOMP over WebSocket broker
//! - `demo`: publish the HTML fragment demo sequence
//! - `rpc`: answer `/queue/rpc-demo` requests over the wire
//! - `token`: print a bearer token for a login

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use stompcooler::client::{Authenticator, ConnectionManager, StompClient};
use stompcooler::config::{self, Settings};
use stompcooler::demo;
use stompcooler::transport::websocket;
use stompcooler::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "stompcooler", version)]
struct Cli {
    /// Configuration file, without extension (default: config/default)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker
    Serve {
        /// Also answer `/queue/rpc-demo` in-process
        #[arg(long)]
        rpc_demo: bool,
    },
    /// Publish the fragment demo to a running broker
    Demo {
        #[arg(long, default_value = "ws://127.0.0.1:15674/ws")]
        url: String,
        #[arg(long, default_value = "guest")]
        login: String,
        #[arg(long, default_value = "guest")]
        passcode: String,
        /// Pause before each step, in milliseconds
        #[arg(long, default_value_t = 1000)]
        pause_ms: u64,
    },
    /// Answer RPC demo requests on a running broker
    Rpc {
        #[arg(long, default_value = "ws://127.0.0.1:15674/ws")]
        url: String,
        #[arg(long, default_value = "guest")]
        login: String,
        #[arg(long, default_value = "guest")]
        passcode: String,
        #[arg(long, default_value = demo::RPC_QUEUE)]
        queue: String,
    },
    /// Print a bearer token usable as the CONNECT passcode
    Token { login: String },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.server.log_level);

    let result = match cli.command {
        Command::Serve { rpc_demo } => run_server(settings, rpc_demo).await,
        Command::Demo {
            url,
            login,
            passcode,
            pause_ms,
        } => run_demo(&url, &login, &passcode, Duration::from_millis(pause_ms)).await,
        Command::Rpc {
            url,
            login,
            passcode,
            queue,
        } => run_rpc(&url, &login, &passcode, &queue).await,
        Command::Token { login } => print_token(&settings, &login),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings, rpc_demo: bool) -> Result<(), Box<dyn std::error::Error>> {
    let manager = Arc::new(ConnectionManager::from_settings(&settings));
    if rpc_demo {
        demo::start_rpc_demo(&manager, demo::RPC_QUEUE)?;
    }

    let listener = websocket::bind(&settings.bind_addr()).await?;

    tokio::select! {
        _ = websocket::serve(listener, manager.clone(), settings) => {
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    manager.shutdown();
    Ok(())
}

async fn run_demo(
    url: &str,
    login: &str,
    passcode: &str,
    pause: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = StompClient::connect(url, login, passcode).await?;
    demo::run_fragment_demo(&mut client, pause).await?;
    client.disconnect().await?;
    info!("demo finished");
    Ok(())
}

async fn run_rpc(
    url: &str,
    login: &str,
    passcode: &str,
    queue: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = StompClient::connect(url, login, passcode).await?;
    tokio::select! {
        result = demo::run_rpc_responder(&mut client, queue) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }
    Ok(())
}

fn print_token(settings: &Settings, login: &str) -> Result<(), Box<dyn std::error::Error>> {
    let token = Authenticator::from_settings(&settings.auth).issue_token(login)?;
    println!("{token}");
    Ok(())
}
