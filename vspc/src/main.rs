use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;

use vspc::backend::{Backend, FileBackend, MemoryBackend};
use vspc::config::{
    Config, TlsConfig, DEFAULT_ADMIN_PORT, DEFAULT_EXPIRE_SECS, DEFAULT_PROXY_PORT,
    DEFAULT_VM_PORT_START,
};
use vspc::server::Server;

#[derive(Parser, Debug)]
#[clap(name = "vspcd", version, about = "Virtual serial port concentrator for VMware guests")]
struct Args {
    /// Address all listeners bind to
    #[clap(long, default_value = "0.0.0.0")]
    listen: IpAddr,
    /// Port hypervisors dial with their virtual serial connections
    #[clap(long, default_value_t = DEFAULT_PROXY_PORT)]
    proxy_port: u16,
    /// Port the admin protocol (and the bundled client) uses
    #[clap(long, default_value_t = DEFAULT_ADMIN_PORT)]
    admin_port: u16,
    /// First port handed out to per-guest subscriber listeners
    #[clap(long, default_value_t = DEFAULT_VM_PORT_START)]
    vm_port_start: u16,
    /// Do not open per-guest ports at all; subscribers must attach
    /// through the admin protocol
    #[clap(long)]
    no_vm_ports: bool,
    /// Seconds an unreferenced guest is kept before eviction
    #[clap(long, default_value_t = DEFAULT_EXPIRE_SECS)]
    expire: u64,
    /// Persistence backend
    #[clap(long, value_enum, default_value = "memory")]
    backend: BackendKind,
    /// State directory for the file backend
    #[clap(long, default_value = "vspc-data")]
    file_dir: PathBuf,
    /// PEM certificate chain; enables TLS on the hypervisor listener
    #[clap(long, requires = "ssl_key")]
    ssl_cert: Option<PathBuf>,
    /// PEM private key for --ssl-cert
    #[clap(long, requires = "ssl_cert")]
    ssl_key: Option<PathBuf>,
    /// Force debug-level logging (RUST_LOG still wins when set)
    #[clap(short = 'd', long)]
    debug: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendKind {
    /// Keep observed guests and replay seed in memory only
    Memory,
    /// Persist the guest table and per-guest serial logs to disk
    File,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let backend: Arc<dyn Backend> = match args.backend {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::File => Arc::new(
            FileBackend::new(&args.file_dir)
                .with_context(|| format!("opening state dir {}", args.file_dir.display()))?,
        ),
    };

    let tls = match (args.ssl_cert, args.ssl_key) {
        (Some(cert), Some(key)) => Some(TlsConfig { cert, key }),
        _ => None,
    };
    let cfg = Config {
        listen_addr: args.listen,
        proxy_port: args.proxy_port,
        admin_port: args.admin_port,
        vm_port_start: (!args.no_vm_ports).then_some(args.vm_port_start),
        vm_expire_secs: args.expire,
        tls,
    };

    let server = Server::bind(&cfg, backend).await?;
    info!(
        "starting vSPC on proxy port {}, admin port {}",
        args.proxy_port, args.admin_port
    );
    if let Some(start) = cfg.vm_port_start {
        info!("allocating VM ports starting at {start}");
    }

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
