//! Socket layer: listeners and per-connection tasks.
//!
//! ## Architecture
//!
//! Every accepted socket is split; a spawned writer task drains that
//! connection's unbounded byte channel into the write half, and the
//! accepting task becomes the connection's read loop. All policy lives in
//! [`Mux`] — the read loops only decode telnet, relay extension events,
//! and push payload into the core:
//!
//! ```text
//!   hypervisor TCP ──► run_hypervisor_link ──► Mux ──► subscriber channels
//!   subscriber TCP ──► run_subscriber ──────► Mux ──► link channels
//!   admin TCP ──────► admin_connection ─(attach)─► run_subscriber
//! ```
//!
//! A slow or dead peer never stalls anyone else: broadcasts only enqueue,
//! and a connection whose channel is gone is detached by the core.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_rustls::TlsAcceptor;

use crate::admin::{self, read_frame, write_frame, AdminError, Request, Response};
use crate::backend::Backend;
use crate::config::Config;
use crate::mux::{AdminAttach, Mux, PortBind};
use crate::registry::{ConnId, LockMode, Sender};
use crate::telnet::{opt, Endpoint, EndpointEvent};
use crate::tls;
use crate::vmware::{self, VmwEvent, VmwareExt, VMWARE_EXT};

const READ_BUF: usize = 8192;

/// Enqueue bytes on a connection's outbound channel. Empty chunks are
/// skipped; a closed channel means the connection is already on its way
/// down, which the read loop will notice shortly.
fn send(tx: &Sender, bytes: Vec<u8>) {
    if !bytes.is_empty() {
        let _ = tx.send(bytes);
    }
}

/// Drain a connection's outbound channel into its write half.
async fn writer_task<W>(mut w: W, mut rx: UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        if w.write_all(&chunk).await.is_err() {
            break;
        }
        if w.flush().await.is_err() {
            break;
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────

/// Bound listeners plus the shared core. Constructed with
/// [`Server::bind`], driven by [`Server::run`].
pub struct Server {
    mux: Arc<Mux>,
    proxy: TcpListener,
    admin: TcpListener,
    tls: Option<TlsAcceptor>,
    listen_addr: IpAddr,
    expire: Duration,
}

impl Server {
    /// Bind the proxy and admin listeners. Failure here is the one fatal
    /// error class the concentrator has.
    pub async fn bind(cfg: &Config, backend: Arc<dyn Backend>) -> Result<Self> {
        let expire = Duration::from_secs(cfg.vm_expire_secs);
        let mux = Arc::new(Mux::new(cfg.vm_port_start, expire, backend));

        let proxy = TcpListener::bind((cfg.listen_addr, cfg.proxy_port))
            .await
            .with_context(|| format!("cannot bind proxy port {}", cfg.proxy_port))?;
        let admin = TcpListener::bind((cfg.listen_addr, cfg.admin_port))
            .await
            .with_context(|| format!("cannot bind admin port {}", cfg.admin_port))?;
        let tls = cfg
            .tls
            .as_ref()
            .map(tls::acceptor)
            .transpose()
            .context("cannot load TLS material")?;

        Ok(Self {
            mux,
            proxy,
            admin,
            tls,
            listen_addr: cfg.listen_addr,
            expire,
        })
    }

    pub fn proxy_addr(&self) -> std::io::Result<SocketAddr> {
        self.proxy.local_addr()
    }

    pub fn admin_addr(&self) -> std::io::Result<SocketAddr> {
        self.admin.local_addr()
    }

    pub fn mux(&self) -> Arc<Mux> {
        Arc::clone(&self.mux)
    }

    /// Accept loop. Runs until the process is shut down.
    pub async fn run(self) -> Result<()> {
        // Reconstitute guests the backend knew about before a restart.
        for bind in self.mux.restore_observed() {
            bind_vm_port(&self.mux, self.listen_addr, bind).await;
        }

        // Orphans are also collected on admin activity; the timer bounds
        // the wait when nobody is asking.
        let sweep = Duration::from_secs((self.expire.as_secs() / 4).clamp(1, 60));
        let sweeper_mux = Arc::clone(&self.mux);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep);
            loop {
                tick.tick().await;
                sweeper_mux.collect_orphans();
            }
        });

        loop {
            tokio::select! {
                accepted = self.proxy.accept() => match accepted {
                    Ok((stream, peer)) => self.accept_hypervisor(stream, peer),
                    Err(e) => warn!("proxy accept: {e}"),
                },
                accepted = self.admin.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("admin connection from {peer}");
                        let mux = Arc::clone(&self.mux);
                        tokio::spawn(async move {
                            if let Err(e) = admin_connection(mux, stream).await {
                                debug!("admin session from {peer}: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("admin accept: {e}"),
                },
            }
        }
    }

    fn accept_hypervisor(&self, stream: TcpStream, peer: SocketAddr) {
        debug!("hypervisor connection from {peer}");
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay for {peer}: {e}");
        }
        let mux = Arc::clone(&self.mux);
        let listen_addr = self.listen_addr;
        match self.tls.clone() {
            Some(acceptor) => {
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            run_hypervisor_link(mux, listen_addr, tls_stream).await;
                        }
                        Err(e) => debug!("TLS handshake with {peer} failed: {e}"),
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    run_hypervisor_link(mux, listen_addr, stream).await;
                });
            }
        }
    }
}

// ── Hypervisor links ──────────────────────────────────────────────────────

/// Read loop for one hypervisor connection, from accept to detach.
async fn run_hypervisor_link<S>(mux: Arc<Mux>, listen_addr: IpAddr, stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut r, w) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(writer_task(w, rx));

    let id = mux.register_link(tx.clone());
    let mut ep = Endpoint::new(
        &[opt::BINARY, opt::SGA, opt::ECHO],
        &[opt::BINARY, opt::SGA, VMWARE_EXT],
    );
    let mut ext = VmwareExt::new();
    send(&tx, ep.start_negotiation());

    let mut buf = [0u8; READ_BUF];
    'conn: loop {
        let n = match r.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("link {id} read: {e}");
                break;
            }
        };
        let (events, reply) = ep.process(&buf[..n]);
        send(&tx, reply);

        for ev in events {
            match ev {
                EndpointEvent::Data(d) => mux.link_payload(id, &d),
                EndpointEvent::RemoteEnabled(VMWARE_EXT) => {
                    send(&tx, VmwareExt::hello());
                }
                EndpointEvent::RemoteEnabled(_) => {}
                EndpointEvent::Subneg(VMWARE_EXT, data) => {
                    let (event, reply) = ext.on_suboption(&data);
                    send(&tx, reply);
                    if let Some(event) = event {
                        handle_vmw_event(&mux, listen_addr, id, &tx, event).await;
                    }
                }
                EndpointEvent::Subneg(o, _) => {
                    debug!("link {id}: ignoring subnegotiation for option {o}");
                }
                EndpointEvent::ProtocolViolation => {
                    // Malformed framing: drop this connection, leave the
                    // guest intact.
                    debug!("link {id}: malformed telnet framing, dropping");
                    break 'conn;
                }
            }
        }
    }

    mux.detach_link(id);
}

/// Act on one decoded VMware extension event.
async fn handle_vmw_event(
    mux: &Arc<Mux>,
    listen_addr: IpAddr,
    id: ConnId,
    tx: &Sender,
    event: VmwEvent,
) {
    match event {
        VmwEvent::VcUuid(uuid) => {
            if let Some(bind) = mux.handle_vc_uuid(id, &uuid) {
                bind_vm_port(mux, listen_addr, bind).await;
            }
        }
        VmwEvent::VmName(name) => {
            if let Some(bind) = mux.handle_vm_name(id, &name) {
                bind_vm_port(mux, listen_addr, bind).await;
            }
        }
        VmwEvent::VmotionBegin(nonce) => {
            let cookie = vmware::make_cookie(&nonce);
            if mux.handle_vmotion_begin(id, cookie.clone()) {
                send(tx, vmware::goahead(&cookie));
            } else {
                send(tx, vmware::notnow(&nonce));
            }
        }
        VmwEvent::VmotionPeer(cookie) => {
            if mux.handle_vmotion_peer(id, &cookie) {
                send(tx, vmware::peer_ok(&cookie));
            }
        }
        VmwEvent::VmotionComplete => mux.handle_vmotion_complete(id),
        VmwEvent::VmotionAbort => mux.handle_vmotion_abort(id),
        VmwEvent::ProxyWill => debug!("link {id}: proxy accepted"),
        VmwEvent::ProxyWont => debug!("link {id}: proxy refused"),
    }
}

// ── Per-guest subscriber ports ────────────────────────────────────────────

/// Bind a freshly allocated per-guest port and start its accept loop. A
/// bind failure is not fatal to the guest — it stays reachable through
/// the admin path.
pub(crate) async fn bind_vm_port(mux: &Arc<Mux>, listen_addr: IpAddr, bind: PortBind) {
    match TcpListener::bind((listen_addr, bind.port)).await {
        Ok(listener) => {
            info!("uuid {} listening on port {}", bind.uuid, bind.port);
            let mux2 = Arc::clone(mux);
            let uuid = bind.uuid.clone();
            let handle = tokio::spawn(port_accept_loop(mux2, uuid, listener));
            mux.set_listener(&bind.uuid, handle);
        }
        Err(e) => {
            warn!("uuid {}: cannot bind port {}: {e}", bind.uuid, bind.port);
            mux.port_bind_failed(&bind.uuid);
        }
    }
}

async fn port_accept_loop(mux: Arc<Mux>, uuid: String, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("uuid {uuid}: subscriber from {peer}");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay for {peer}: {e}");
                }
                let (tx, rx) = mpsc::unbounded_channel();
                let Some(id) = mux.register_port_subscriber(&uuid, tx.clone()) else {
                    // Guest vanished between bind and accept.
                    continue;
                };
                let mux2 = Arc::clone(&mux);
                tokio::spawn(run_subscriber(mux2, stream, id, tx, rx, false));
            }
            Err(e) => {
                warn!("uuid {uuid}: accept: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Read loop for one subscriber (per-guest port or post-handshake admin
/// socket). Read-only subscribers still get their telnet negotiation and
/// EOF detection; their payload just never reaches the core.
async fn run_subscriber<S>(
    mux: Arc<Mux>,
    stream: S,
    id: ConnId,
    tx: Sender,
    rx: UnboundedReceiver<Vec<u8>>,
    read_only: bool,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut r, w) = tokio::io::split(stream);
    tokio::spawn(writer_task(w, rx));

    let mut ep = Endpoint::new(&[opt::BINARY, opt::SGA, opt::ECHO], &[opt::BINARY, opt::SGA]);
    send(&tx, ep.start_negotiation());

    let mut buf = [0u8; READ_BUF];
    'conn: loop {
        let n = match r.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("subscriber {id} read: {e}");
                break;
            }
        };
        let (events, reply) = ep.process(&buf[..n]);
        send(&tx, reply);
        for ev in events {
            match ev {
                EndpointEvent::Data(d) => {
                    if !read_only {
                        mux.sub_payload(id, &d);
                    }
                }
                EndpointEvent::ProtocolViolation => {
                    debug!("subscriber {id}: malformed telnet framing, dropping");
                    break 'conn;
                }
                _ => {}
            }
        }
    }

    mux.detach_subscriber(id);
}

// ── Admin sessions ────────────────────────────────────────────────────────

/// One admin protocol session: version exchange, request, verdict, and —
/// on success — hand-off of the socket into a subscriber loop.
async fn admin_connection(mux: Arc<Mux>, mut stream: TcpStream) -> Result<(), AdminError> {
    // Admin activity is an expiry checkpoint.
    mux.collect_orphans();

    let client_vers: u32 = read_frame(&mut stream).await?;
    debug!("admin client speaks version {client_vers}");
    write_frame(&mut stream, &admin::PROTOCOL_VERSION).await?;

    let req: Request = read_frame(&mut stream).await?;
    let Ok(mode) = req.lock_mode.parse::<LockMode>() else {
        write_frame(&mut stream, &Response::LockBad).await?;
        return Ok(());
    };
    let Some(name) = req.vm_name else {
        let vms = mux.list_vms();
        write_frame(&mut stream, &Response::VmNotFound { vms }).await?;
        return Ok(());
    };

    let (tx, rx) = mpsc::unbounded_channel();
    match mux.admin_attach(&name, mode, tx.clone()) {
        AdminAttach::NotFound => {
            let vms = mux.list_vms();
            write_frame(&mut stream, &Response::VmNotFound { vms }).await?;
            Ok(())
        }
        AdminAttach::LockFailed => {
            write_frame(&mut stream, &Response::LockFailed).await?;
            Ok(())
        }
        AdminAttach::Attached {
            id,
            uuid,
            applied,
            read_only,
        } => {
            let seed = mux.seed_data(&uuid);
            let handshake: Result<(), AdminError> = async {
                write_frame(
                    &mut stream,
                    &Response::Ok {
                        applied,
                        seed_len: seed.len() as u32,
                    },
                )
                .await?;
                stream.write_all(&seed).await?;
                Ok(())
            }
            .await;
            if let Err(e) = handshake {
                mux.detach_subscriber(id);
                return Err(e);
            }
            // The socket is a plain telnet serial channel from here on.
            run_subscriber(mux, stream, id, tx, rx, read_only).await;
            Ok(())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
