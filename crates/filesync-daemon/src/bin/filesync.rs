//! FileSync CLI - send files and folders to a peer
//!
//! Usage:
//!   filesync send <addr> <path>...    Send files or folders
//!   filesync receive                  Accept incoming transfers
//!   filesync code                     Print a fresh pairing code
//!   filesync config                   Print a sample configuration

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use filesync_core::security::{generate_pairing_code, validate_pairing_code};
use filesync_core::{Config, SessionOptions};
use filesync_daemon::{receive_once, send_paths, serve, ReceiveConfig, SendConfig};

#[derive(Parser)]
#[command(name = "filesync")]
#[command(about = "Chunked file and folder transfer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config dir)
    #[arg(short, long, global = true, env = "FILESYNC_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files or folders to a receiver
    Send {
        /// Receiver address (e.g., 192.168.1.20:7878)
        addr: SocketAddr,

        /// Files or folders to send
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Pairing code shared with the receiver
        #[arg(long)]
        code: Option<String>,

        /// Data block size in bytes
        #[arg(long)]
        block_size: Option<usize>,
    },

    /// Receive transfers
    Receive {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Destination directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Pairing code shared with the sender
        #[arg(long)]
        code: Option<String>,

        /// Exit after the first connection
        #[arg(long)]
        once: bool,
    },

    /// Print a fresh pairing code
    Code,

    /// Show configuration
    Config {
        /// Print the config file path instead of a sample
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Send {
            addr,
            paths,
            code,
            block_size,
        } => run_send(&config, addr, paths, code, block_size).await,
        Commands::Receive {
            port,
            bind,
            dir,
            code,
            once,
        } => run_receive(&config, port, bind, dir, code, once).await,
        Commands::Code => {
            println!("{}", generate_pairing_code().context("generating pairing code")?);
            Ok(())
        }
        Commands::Config { path } => {
            if path {
                match Config::default_path() {
                    Some(p) => println!("{}", p.display()),
                    None => bail!("no configuration directory on this platform"),
                }
            } else {
                print!("{}", Config::sample());
            }
            Ok(())
        }
    }
}

fn check_code(code: Option<String>, require: bool) -> Result<Option<String>> {
    match code {
        Some(code) if !validate_pairing_code(&code) => bail!("invalid pairing code: {}", code),
        None if require => bail!("encryption is required by config; pass --code"),
        code => Ok(code),
    }
}

async fn run_send(
    config: &Config,
    addr: SocketAddr,
    paths: Vec<PathBuf>,
    code: Option<String>,
    block_size: Option<usize>,
) -> Result<()> {
    let code = check_code(code, config.transfer.encrypt)?;
    let session = match block_size {
        Some(size) => SessionOptions::with_block_size(size),
        None => config.transfer.session_options(),
    };

    let send_config = SendConfig {
        session,
        code,
        connect_timeout: config.network.connect_timeout(),
    };

    info!("Sending {} item(s) to {}", paths.len(), addr);
    let report = send_paths(addr, &paths, &send_config)
        .await
        .with_context(|| format!("sending to {}", addr))?;

    for sent in &report.sent {
        info!("  sent {} ({} bytes)", sent.name, sent.bytes);
    }
    for (path, reason) in &report.failed {
        error!("  failed {:?}: {}", path, reason);
    }
    if !report.failed.is_empty() {
        bail!("{} transfer(s) failed", report.failed.len());
    }
    Ok(())
}

async fn run_receive(
    config: &Config,
    port: Option<u16>,
    bind: Option<IpAddr>,
    dir: Option<PathBuf>,
    code: Option<String>,
    once: bool,
) -> Result<()> {
    let code = check_code(code, config.transfer.encrypt)?;
    let addr = SocketAddr::new(
        bind.unwrap_or(config.network.bind),
        port.unwrap_or(config.network.port),
    );
    let receive_config = ReceiveConfig {
        dest: dir.unwrap_or_else(|| config.receive.download_dir()),
        overwrite: config.receive.overwrite,
        code,
        max_frame_size: config.network.max_frame_size,
    };

    if once {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        info!("Waiting for one sender on {}", addr);
        for received in receive_once(&listener, &receive_config).await? {
            info!("  received {:?} ({} bytes)", received.path, received.bytes);
        }
        return Ok(());
    }

    // Handle Ctrl+C
    tokio::select! {
        result = serve(addr, receive_config) => {
            if let Err(e) = result {
                error!("Receiver error: {}", e);
                return Err(e.into());
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
