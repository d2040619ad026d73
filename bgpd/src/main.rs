// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{Context, Result};
use bgp::config::ServerConfig;
use bgp::server::TcpServer;
use clap::{Args, Parser, Subcommand};
use slog::{info, Drain, Logger};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::sync_channel;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a BGP speaker.
    Run(Run),
}

#[derive(Args, Debug)]
struct Run {
    /// Local autonomous system number.
    #[arg(long, env = "BGPD_ASN")]
    asn: u32,

    /// Router id. Overrides the config file.
    #[arg(long)]
    router_id: Option<Ipv4Addr>,

    /// Listening port. Overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log bunyan JSON instead of terminal output.
    #[arg(long)]
    json_log: bool,

    /// Log bunyan JSON to this file. Takes precedence over --json-log.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    match args.command {
        Commands::Run(r) => run(r),
    }
}

fn run(args: Run) -> Result<()> {
    let log = match &args.log_file {
        Some(path) => speaker_common::log::init_file_logger(
            &path.to_string_lossy(),
        )
        .with_context(|| format!("open {}", path.display()))?,
        None if args.json_log => speaker_common::log::init_logger(),
        None => init_logger(),
    };

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    config.asn = args.asn;
    if let Some(id) = args.router_id {
        config.router_id = Some(id);
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let server = TcpServer::new(config.asn, config.listen, log.clone())
        .context("start server")?;
    server.apply_config(&config).context("apply config")?;
    info!(log, "bgpd running";
        "asn" => config.asn,
        "neighbors" => config.neighbors.len()
    );

    let (stop_tx, stop_rx) = sync_channel(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("set termination handler")?;
    let _ = stop_rx.recv();

    info!(log, "shutting down");
    server.shutdown().context("shutdown")?;
    Ok(())
}

fn load_config(path: &Path) -> Result<ServerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let config: ServerConfig = serde_json::from_str(&text)
        .with_context(|| format!("parse {}", path.display()))?;
    if config.port == 0 {
        anyhow::bail!("{}: port 0 is not a listening port", path.display());
    }
    Ok(config)
}

fn init_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x2000)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}
