//! sshfs mount server binary.
//!
//! Connects to an instance with the system `ssh` client, launches sshfs
//! inside it, and serves the SFTP side of the mount from the host.
//!
//! Run with: cargo run --bin gangway-sftp-server

use clap::Parser;
use gangway_sftp::{CommandSsh, MountConfig, SftpServer, UnixPlatform};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gangway-sftp-server",
    version,
    about = "Serve a host directory to an sshfs mount inside an instance"
)]
struct Args {
    /// Configuration file path (TOML); flags below override its values
    #[arg(short, long)]
    config: Option<String>,

    /// Absolute host directory to expose
    #[arg(long)]
    source: Option<String>,

    /// Mount point inside the instance
    #[arg(long)]
    target: Option<String>,

    /// uid mapping as host:instance (repeatable)
    #[arg(long = "uid-map", value_parser = parse_id_pair)]
    uid_maps: Vec<(i64, i64)>,

    /// gid mapping as host:instance (repeatable)
    #[arg(long = "gid-map", value_parser = parse_id_pair)]
    gid_maps: Vec<(i64, i64)>,

    /// SSH user on the instance
    #[arg(long, default_value = "ubuntu")]
    user: String,

    /// Instance address
    #[arg(long)]
    host: String,

    /// SSH port on the instance
    #[arg(long, default_value_t = 22)]
    port: u16,

    /// SSH client command used to reach the instance
    #[arg(long, default_value = "ssh")]
    ssh_command: String,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

fn parse_id_pair(value: &str) -> Result<(i64, i64), String> {
    let (host, instance) = value
        .split_once(':')
        .ok_or_else(|| format!("expected host:instance, got '{}'", value))?;
    let host = host
        .parse()
        .map_err(|e| format!("invalid host id '{}': {}", host, e))?;
    let instance = instance
        .parse()
        .map_err(|e| format!("invalid instance id '{}': {}", instance, e))?;
    Ok((host, instance))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let mut config = match &args.config {
        Some(path) => match MountConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => MountConfig::default(),
    };

    if let Some(source) = args.source {
        config.source = source;
    }
    if let Some(target) = args.target {
        config.target = target;
    }
    if !args.uid_maps.is_empty() {
        config.uid_mappings = args.uid_maps;
    }
    if !args.gid_maps.is_empty() {
        config.gid_mappings = args.gid_maps;
    }

    let ssh = Arc::new(CommandSsh::new(
        &args.ssh_command,
        &args.user,
        &args.host,
        args.port,
    ));

    let mut server = match SftpServer::new(ssh, Arc::new(UnixPlatform), config).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start mount server: {}", e);
            std::process::exit(1);
        }
    };

    let stop = server.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stopping mount server");
            stop.stop();
        }
    });

    info!("serving sshfs mount");
    if let Err(e) = server.run().await {
        error!("mount server exited with error: {}", e);
        std::process::exit(1);
    }
}
