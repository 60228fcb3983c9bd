//! Launcher: loads a TOML configuration, builds the share registry, and
//! runs the server until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use smbserve::acl::Acl;
use smbserve::auth::LocalAuth;
use smbserve::config::ServerConfig;
use smbserve::disk::memory::MemoryDisk;
use smbserve::share::{DefaultAccessControl, ShareKind, ShareRegistry, VolumeInfo};
use smbserve::state::standalone::StandaloneCache;
use smbserve::Server;

#[derive(Parser)]
#[command(name = "smbserved", about = "SMB/CIFS file server")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// TCP port for the native SMB transport.
    #[arg(long, default_value_t = 445)]
    port: u16,

    /// Also listen on the NetBIOS session service port.
    #[arg(long)]
    netbios_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ServerConfig::from_toml(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::with_name("SMBSERVE"),
    };

    let cache = StandaloneCache::new(Duration::from_secs(config.state_cache_ttl_secs));
    cache.spawn_reaper(
        Duration::from_secs(config.state_cache_ttl_secs),
        Duration::from_secs(config.state_cache_ttl_secs.max(1)),
    );

    let mut shares = ShareRegistry::new();
    let disk = Arc::new(MemoryDisk::new());
    disk.seed_file("hello.txt", b"Hello, SMB!\r\n").await;
    shares.add(
        "PUBLIC",
        ShareKind::Disk,
        "Public files",
        disk,
        Acl::open(),
        VolumeInfo::default(),
        cache.clone(),
    );
    shares.add(
        "IPC$",
        ShareKind::Ipc,
        "IPC service",
        Arc::new(MemoryDisk::new()),
        Acl::open(),
        VolumeInfo::default(),
        cache.clone(),
    );

    let bind = config.bind_address.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let server = Server::new(
        config,
        shares,
        Arc::new(LocalAuth::new(true)),
        Arc::new(DefaultAccessControl),
    );

    if let Some(port) = args.netbios_port {
        let listener = TcpListener::bind((bind.as_str(), port)).await?;
        info!(port, "netbios session service listening");
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let _ = smbserve::handle_forever_netbios(listener, server).await;
        });
    }

    let listener = TcpListener::bind((bind.as_str(), args.port)).await?;
    info!(port = args.port, "native SMB listening");
    smbserve::handle_forever(listener, server).await?;
    Ok(())
}
