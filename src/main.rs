//! poted — online test executor daemon.
//!
//! Parses the CLI, wires the components together and serves the HTTP API
//! until the process is killed. The scheduler and the wardens are daemon
//! workers; there is no graceful shutdown.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pote::archive::Archive;
use pote::catalog::TestCatalog;
use pote::config::{self, Config};
use pote::scheduler::Scheduler;
use pote::server::{self, AppState};

#[derive(Debug, Parser)]
#[command(name = "poted")]
#[command(about = "Online test executor daemon", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Interface to listen on.
    #[arg(long, default_value = config::DEF_BINDADDR)]
    bindaddr: IpAddr,

    /// TCP port to listen on.
    #[arg(long, default_value_t = config::DEF_BINDPORT)]
    bindport: u16,

    /// Number of test environments.
    #[arg(long, default_value_t = config::DEF_ENVOS_COUNT)]
    envos_count: usize,

    /// Base path for the environment working directories.
    #[arg(long, default_value = config::DEF_ENVOS_PATH)]
    envos_path: PathBuf,

    /// Directory with the installed test programs.
    #[arg(long, default_value = config::DEF_TESTS_PATH)]
    tests_path: PathBuf,

    /// Base path for the persistent job queues.
    #[arg(long, default_value = config::DEF_QUEUE_PATH)]
    queue_path: PathBuf,

    /// Root of the finished-jobs archive.
    #[arg(long, default_value = config::DEF_ARCHIVE_PATH)]
    archive_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let config = Config {
        bindaddr: cli.bindaddr,
        bindport: cli.bindport,
        envos_count: cli.envos_count,
        envos_path: cli.envos_path,
        tests_path: cli.tests_path,
        queue_path: cli.queue_path,
        archive_path: cli.archive_path,
    };

    info!("starting...");
    let archive = Archive::new(&config.archive_path);
    let catalog = Arc::new(TestCatalog::new(&config.tests_path));
    let scheduler = Scheduler::spawn(&config, Arc::clone(&catalog), archive.clone());
    let state = AppState {
        scheduler,
        catalog,
        archive,
    };

    let addr = SocketAddr::new(config.bindaddr, config.bindport);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, server::router(state))
        .await
        .context("http server")?;
    Ok(())
}
