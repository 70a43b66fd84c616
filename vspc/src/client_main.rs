use anyhow::{bail, Result};
use clap::Parser;

use vspc::client::{self, ClientOpts};
use vspc::config::DEFAULT_ADMIN_PORT;
use vspc::registry::LockMode;

#[derive(Parser, Debug)]
#[clap(
    name = "vspc-client",
    version,
    about = "Attach to a guest's serial console through a vSPC concentrator"
)]
struct Args {
    /// Concentrator host
    #[clap(long, default_value = "127.0.0.1")]
    host: String,
    /// Concentrator admin port
    #[clap(short = 'p', long, default_value_t = DEFAULT_ADMIN_PORT)]
    port: u16,
    /// Lock mode to request (exclusive, write, ffa, ffar)
    #[clap(long, default_value = "ffar")]
    lock: String,
    /// Guest to attach to (name or UUID); omit to list known guests
    vm_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let Ok(lock_mode) = args.lock.parse::<LockMode>() else {
        bail!("unknown lock mode '{}'; use exclusive, write, ffa or ffar", args.lock);
    };

    client::run(ClientOpts {
        host: args.host,
        port: args.port,
        vm_name: args.vm_name,
        lock_mode,
    })
    .await
}
