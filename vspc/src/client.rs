//! Admin client: list guests, or attach to one and bridge the serial
//! channel to stdin/stdout.
//!
//! The attach path is a plain passthrough — bytes typed locally go to the
//! concentrator (IAC-escaped), serial output is printed with telnet
//! framing stripped. Terminal raw-mode handling is deliberately left to
//! the operator's own tooling (`stty`, `socat`, an expect harness).

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::admin::{self, read_frame, write_frame, Request, Response};
use crate::registry::{LockMode, VmEntry};
use crate::telnet::{escape_iac, opt, Endpoint, EndpointEvent};

#[derive(Debug, Clone)]
pub struct ClientOpts {
    pub host: String,
    pub port: u16,
    /// `None` lists the known guests instead of attaching.
    pub vm_name: Option<String>,
    pub lock_mode: LockMode,
}

/// Run one admin session to completion (listing printed, or interactive
/// attach until either end closes).
pub async fn run(opts: ClientOpts) -> Result<()> {
    let mut sock = TcpStream::connect((opts.host.as_str(), opts.port))
        .await
        .with_context(|| format!("connecting to {}:{}", opts.host, opts.port))?;

    write_frame(&mut sock, &admin::PROTOCOL_VERSION).await?;
    let server_vers: u32 = read_frame(&mut sock).await?;
    if server_vers != admin::PROTOCOL_VERSION {
        return Err(admin::AdminError::VersionMismatch(server_vers).into());
    }

    write_frame(
        &mut sock,
        &Request {
            vm_name: opts.vm_name.clone(),
            lock_mode: opts.lock_mode.to_string(),
        },
    )
    .await?;

    match read_frame::<Response, _>(&mut sock).await? {
        Response::VmNotFound { vms } => {
            if let Some(name) = &opts.vm_name {
                eprintln!("no guest named '{name}'; the concentrator knows about:");
            }
            print_listing(&vms);
            Ok(())
        }
        Response::LockBad => bail!("server does not understand lock mode {}", opts.lock_mode),
        Response::LockFailed => bail!("someone else holds a conflicting lock on the guest"),
        Response::Ok { applied, seed_len } => {
            if applied == LockMode::Ffar {
                eprintln!("someone else has an exclusive write lock; operating read-only");
            }
            let mut seed = vec![0u8; seed_len as usize];
            sock.read_exact(&mut seed).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&seed).await?;
            stdout.flush().await?;
            passthrough(sock).await
        }
    }
}

/// Print the `name:uuid[:port]` listing, sorted by name.
fn print_listing(vms: &[VmEntry]) {
    let mut vms = vms.to_vec();
    vms.sort_by(|a, b| a.name.cmp(&b.name));
    for vm in vms {
        let name = vm.name.as_deref().unwrap_or("-");
        match vm.port {
            Some(p) => println!("{name}:{}:{p}", vm.uuid),
            None => println!("{name}:{}", vm.uuid),
        }
    }
}

/// Bridge the attached socket to stdin/stdout until either side closes.
async fn passthrough(sock: TcpStream) -> Result<()> {
    let (mut sock_r, mut sock_w) = sock.into_split();
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    // Passive endpoint: the server drives the negotiation.
    let mut ep = Endpoint::new(&[opt::BINARY, opt::SGA], &[opt::BINARY, opt::SGA, opt::ECHO]);

    let mut net_buf = [0u8; 4096];
    let mut in_buf = [0u8; 4096];
    loop {
        tokio::select! {
            read = sock_r.read(&mut net_buf) => {
                let n = read?;
                if n == 0 {
                    break; // concentrator closed the channel
                }
                let (events, reply) = ep.process(&net_buf[..n]);
                if !reply.is_empty() {
                    sock_w.write_all(&reply).await?;
                }
                for ev in events {
                    if let EndpointEvent::Data(d) = ev {
                        stdout.write_all(&d).await?;
                    }
                }
                stdout.flush().await?;
            }
            read = stdin.read(&mut in_buf) => {
                let n = read?;
                if n == 0 {
                    break; // local EOF
                }
                sock_w.write_all(&escape_iac(&in_buf[..n])).await?;
            }
        }
    }
    Ok(())
}
