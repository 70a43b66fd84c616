//! The concentrator core: fan-in/fan-out between hypervisor links and
//! subscribers, guest identity hooks, and the live-migration coordinator.
//!
//! [`Mux`] wraps the [`Registry`] in one coarse lock and exposes purely
//! synchronous hooks; the socket layer in [`crate::server`] calls them
//! from its per-connection tasks. Bytes leave the core by being pushed
//! onto a connection's outbound channel, so every hook is cheap and
//! non-blocking and the whole data path is testable without sockets.
//!
//! ## Migration quiesce
//!
//! While a guest carries a vmotion cookie, serial payload from any of its
//! links (and from its subscribers) is parked in per-connection pending
//! buffers instead of delivered; extension control frames keep flowing.
//! COMPLETE/ABORT — or the departure of the link that began the migration
//! — clears the cookie and flushes the buffers in attach order, so the
//! splice is invisible to subscribers: no byte is lost, duplicated, or
//! reordered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backend::Backend;
use crate::registry::{ConnId, LockMode, Registry, Sender, SubRecord, VmEntry};
use crate::telnet::escape_iac;

/// A freshly created guest whose per-guest listener still needs binding.
#[derive(Debug, PartialEq, Eq)]
pub struct PortBind {
    pub uuid: String,
    pub port: u16,
}

/// Outcome of an admin attach attempt.
#[derive(Debug)]
pub enum AdminAttach {
    Attached {
        id: ConnId,
        uuid: String,
        applied: LockMode,
        read_only: bool,
    },
    NotFound,
    LockFailed,
}

pub struct Mux {
    reg: Mutex<Registry>,
    backend: Arc<dyn Backend>,
    next_id: AtomicU64,
}

impl Mux {
    pub fn new(
        vm_port_start: Option<u16>,
        expire: Duration,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            reg: Mutex::new(Registry::new(vm_port_start, expire)),
            backend,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        match self.reg.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn alloc_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── startup ───────────────────────────────────────────────────────────

    /// Reconstitute guests the backend observed before a restart. Returns
    /// the listeners that need binding. Backend failure is treated as an
    /// empty history.
    pub fn restore_observed(&self) -> Vec<PortBind> {
        let observed = self.backend.get_observed_vms();
        let now = Instant::now();
        let mut reg = self.lock();
        let mut binds = Vec::new();
        for vm in observed {
            match reg.restore_guest(&vm.uuid, vm.name.as_deref(), vm.port, now) {
                Ok(Some(port)) => binds.push(PortBind {
                    uuid: vm.uuid,
                    port,
                }),
                Ok(None) => {}
                Err(e) => warn!("uuid {}: not restored: {e}", vm.uuid),
            }
        }
        binds
    }

    // ── hypervisor links ──────────────────────────────────────────────────

    /// Register a new hypervisor connection; identity arrives later over
    /// the wire.
    pub fn register_link(&self, tx: Sender) -> ConnId {
        let id = self.alloc_id();
        self.lock().insert_link(id, tx);
        id
    }

    /// The link reported its VC UUID.
    pub fn handle_vc_uuid(&self, id: ConnId, uuid: &str) -> Option<PortBind> {
        let mut reg = self.lock();
        let rec = reg.link_mut(id)?;
        rec.uuid = Some(uuid.to_owned());
        let name = rec.name.clone();
        self.create_or_attach(&mut reg, id, uuid, name)
    }

    /// The link reported the guest's display name. Renames propagate to
    /// the backend; during migration whichever link reports last wins.
    pub fn handle_vm_name(&self, id: ConnId, name: &str) -> Option<PortBind> {
        let mut reg = self.lock();
        let rec = reg.link_mut(id)?;
        rec.name = Some(name.to_owned());
        let Some(uuid) = rec.uuid.clone() else {
            return None; // identity incomplete, nothing to do yet
        };

        if reg.guest(&uuid).is_some() {
            if reg.rename_guest(&uuid, name) {
                let port = reg.guest(&uuid).and_then(|g| g.port);
                self.backend.notify_vm(&uuid, Some(name), port);
                debug!("uuid {uuid} renamed to {name:?}");
            }
            return None;
        }
        self.create_or_attach(&mut reg, id, &uuid, Some(name.to_owned()))
    }

    /// Create-or-attach once a link is fully identified. Existing guests
    /// gain the link (reconnect / vmotion peer); otherwise a guest is born
    /// when both UUID and name are known.
    fn create_or_attach(
        &self,
        reg: &mut Registry,
        id: ConnId,
        uuid: &str,
        name: Option<String>,
    ) -> Option<PortBind> {
        let now = Instant::now();
        if reg.guest(uuid).is_some() {
            if let Ok((_, _)) = reg.ensure_guest(uuid, name.as_deref(), Some(id), now) {
                let active = reg.guest(uuid).map(|g| g.links.len()).unwrap_or(0);
                debug!("uuid {uuid} VM reconnect, {active} active");
            }
            return None;
        }
        // A guest is born only once both identity fields have arrived.
        let name = name?;

        // Free any expired ports before taking a new one.
        self.collect_locked(reg, now);

        match reg.ensure_guest(uuid, Some(&name), Some(id), now) {
            Ok((true, port)) => {
                self.backend.notify_vm(uuid, Some(&name), port);
                info!("uuid {uuid} ({name:?}) connected, port {port:?}");
                port.map(|p| PortBind {
                    uuid: uuid.to_owned(),
                    port: p,
                })
            }
            Ok((false, _)) => None,
            Err(e) => {
                warn!("uuid {uuid}: {e}");
                None
            }
        }
    }

    /// Serial payload arrived on a hypervisor link.
    pub fn link_payload(&self, id: ConnId, data: &[u8]) {
        let mut reg = self.lock();
        let Some(rec) = reg.link(id) else { return };
        let Some(uuid) = rec.uuid.clone() else {
            // Unidentified stream: nobody can be attached to it yet.
            return;
        };
        let Some(g) = reg.guest(&uuid) else { return };

        if g.vmotion.is_some() {
            if let Some(rec) = reg.link_mut(id) {
                rec.pending.extend_from_slice(data);
            }
            return;
        }
        self.deliver_to_subscribers(&mut reg, &uuid, data);
    }

    /// A hypervisor link died or hung up.
    pub fn detach_link(&self, id: ConnId) {
        let mut reg = self.lock();
        let Some((rec, aborted_vmotion)) = reg.remove_link(id, Instant::now()) else {
            return;
        };
        match &rec.uuid {
            Some(uuid) => {
                debug!("uuid {uuid} VM socket closed");
                if aborted_vmotion {
                    debug!("uuid {uuid} vmotion aborted by source hangup");
                    self.flush_pending(&mut reg, uuid);
                }
            }
            None => debug!("unidentified VM socket closed"),
        }
    }

    // ── vmotion coordination ──────────────────────────────────────────────

    /// VMOTION-BEGIN from `id` carrying the full cookie. True ⇒ answer
    /// GOAHEAD, false ⇒ NOTNOW.
    pub fn handle_vmotion_begin(&self, id: ConnId, cookie: Vec<u8>) -> bool {
        let mut reg = self.lock();
        let Some(uuid) = reg.link(id).and_then(|r| r.uuid.clone()) else {
            // No guest structure yet; refuse.
            return false;
        };
        let ok = reg.begin_vmotion(&uuid, cookie, id);
        if ok {
            debug!("uuid {uuid} vmotion begins");
        }
        ok
    }

    /// VMOTION-PEER from `id`: the migration target presenting a cookie.
    pub fn handle_vmotion_peer(&self, id: ConnId, cookie: &[u8]) -> bool {
        let mut reg = self.lock();
        let Some(uuid) = reg.vmotion_uuid(cookie).map(str::to_owned) else {
            debug!("vmotion peer presented an unknown cookie");
            return false;
        };

        let Some(rec) = reg.link_mut(id) else { return false };
        match rec.uuid.clone() {
            Some(existing) if existing != uuid => {
                debug!("vmotion peer uuid {existing} does not match cookie uuid {uuid}");
                false
            }
            Some(_) => true, // already attached to the right guest
            None => {
                rec.uuid = Some(uuid.clone());
                let _ = reg.ensure_guest(&uuid, None, Some(id), Instant::now());
                let active = reg.guest(&uuid).map(|g| g.links.len()).unwrap_or(0);
                debug!("uuid {uuid} vmotion peer attached, {active} links");
                true
            }
        }
    }

    /// VMOTION-COMPLETE: the target link now carries the stream.
    pub fn handle_vmotion_complete(&self, id: ConnId) {
        let mut reg = self.lock();
        let Some(uuid) = reg.link(id).and_then(|r| r.uuid.clone()) else {
            return;
        };
        if reg.end_vmotion(&uuid) {
            debug!("uuid {uuid} vmotion complete");
            self.flush_pending(&mut reg, &uuid);
        }
    }

    /// VMOTION-ABORT: migration rolled back, source link continues.
    pub fn handle_vmotion_abort(&self, id: ConnId) {
        let mut reg = self.lock();
        let Some(uuid) = reg.link(id).and_then(|r| r.uuid.clone()) else {
            return;
        };
        if reg.end_vmotion(&uuid) {
            debug!("uuid {uuid} vmotion abort");
            self.flush_pending(&mut reg, &uuid);
        }
    }

    // ── subscribers ───────────────────────────────────────────────────────

    /// Attach a per-guest-port subscriber (free-for-all writer).
    pub fn register_port_subscriber(&self, uuid: &str, tx: Sender) -> Option<ConnId> {
        let mut reg = self.lock();
        reg.guest(uuid)?;
        let id = self.alloc_id();
        reg.attach_subscriber(
            id,
            SubRecord {
                tx,
                uuid: uuid.to_owned(),
                mode: LockMode::Ffa,
                read_only: false,
                pending: Vec::new(),
            },
        );
        let active = reg.guest(uuid).map(|g| g.subscribers.len()).unwrap_or(0);
        debug!("uuid {uuid} new client, {active} active clients");
        Some(id)
    }

    /// Attach via the admin protocol, applying the lock policy.
    pub fn admin_attach(&self, vm_name: &str, mode: LockMode, tx: Sender) -> AdminAttach {
        let mut reg = self.lock();
        let Some(uuid) = reg.guest_by_name(vm_name).map(|g| g.uuid.clone()) else {
            return AdminAttach::NotFound;
        };
        let Some((applied, read_only)) = reg.admission(&uuid, mode) else {
            debug!("uuid {uuid} lock {mode} refused");
            return AdminAttach::LockFailed;
        };

        let id = self.alloc_id();
        reg.attach_subscriber(
            id,
            SubRecord {
                tx,
                uuid: uuid.clone(),
                mode: applied,
                read_only,
                pending: Vec::new(),
            },
        );
        let active = reg.guest(&uuid).map(|g| g.subscribers.len()).unwrap_or(0);
        debug!("uuid {uuid} new client ({applied}), {active} active clients");
        AdminAttach::Attached {
            id,
            uuid,
            applied,
            read_only,
        }
    }

    /// Payload typed by a subscriber, forwarded to every hypervisor link.
    pub fn sub_payload(&self, id: ConnId, data: &[u8]) {
        let mut reg = self.lock();
        let Some(rec) = reg.sub(id) else { return };
        if rec.read_only {
            return;
        }
        let uuid = rec.uuid.clone();
        let Some(g) = reg.guest(&uuid) else { return };

        if g.vmotion.is_some() {
            if let Some(rec) = reg.sub_mut(id) {
                rec.pending.extend_from_slice(data);
            }
            return;
        }
        Self::deliver_to_links(&reg, &uuid, data);
    }

    /// A subscriber hung up or its socket failed.
    pub fn detach_subscriber(&self, id: ConnId) {
        let mut reg = self.lock();
        Self::detach_subscriber_locked(&mut reg, id, &*self.backend);
    }

    fn detach_subscriber_locked(reg: &mut Registry, id: ConnId, backend: &dyn Backend) {
        if let Some(rec) = reg.remove_subscriber(id, Instant::now()) {
            let remaining = reg
                .guest(&rec.uuid)
                .map(|g| g.subscribers.len())
                .unwrap_or(0);
            debug!(
                "uuid {} client socket closed, {remaining} active clients",
                rec.uuid
            );
            backend.notify_client_del(&rec.uuid);
        }
    }

    // ── delivery ──────────────────────────────────────────────────────────

    /// Broadcast hypervisor payload to the backend and every subscriber.
    /// Subscribers whose channel is gone are detached on the spot.
    fn deliver_to_subscribers(&self, reg: &mut Registry, uuid: &str, data: &[u8]) {
        let Some(g) = reg.guest(uuid) else { return };
        let name = g.name.clone();
        let targets: Vec<ConnId> = g.subscribers.clone();

        self.backend.notify_vm_msg(uuid, name.as_deref(), data);

        let escaped = escape_iac(data);
        let mut dead = Vec::new();
        for sid in targets {
            let Some(sub) = reg.sub(sid) else { continue };
            if sub.tx.send(escaped.clone()).is_err() {
                dead.push(sid);
            }
        }
        for sid in dead {
            debug!("subscriber {sid} send failed, detaching");
            Self::detach_subscriber_locked(reg, sid, &*self.backend);
        }
    }

    /// Forward subscriber payload to every link (normally exactly one).
    fn deliver_to_links(reg: &Registry, uuid: &str, data: &[u8]) {
        let Some(g) = reg.guest(uuid) else { return };
        let escaped = escape_iac(data);
        for lid in &g.links {
            if let Some(link) = reg.link(*lid) {
                if link.tx.send(escaped.clone()).is_err() {
                    debug!("link {lid} send error");
                }
            }
        }
    }

    /// Drain payload parked during a migration, links first (attach
    /// order), then subscribers.
    fn flush_pending(&self, reg: &mut Registry, uuid: &str) {
        let link_ids: Vec<ConnId> = reg.guest(uuid).map(|g| g.links.clone()).unwrap_or_default();
        for lid in link_ids {
            let parked = match reg.link_mut(lid) {
                Some(rec) if !rec.pending.is_empty() => std::mem::take(&mut rec.pending),
                _ => continue,
            };
            self.deliver_to_subscribers(reg, uuid, &parked);
        }

        let sub_ids: Vec<ConnId> = reg
            .guest(uuid)
            .map(|g| g.subscribers.clone())
            .unwrap_or_default();
        for sid in sub_ids {
            let parked = match reg.sub_mut(sid) {
                Some(rec) if !rec.pending.is_empty() => std::mem::take(&mut rec.pending),
                _ => continue,
            };
            Self::deliver_to_links(reg, uuid, &parked);
        }
    }

    // ── queries & maintenance ─────────────────────────────────────────────

    pub fn list_vms(&self) -> Vec<VmEntry> {
        self.lock().list()
    }

    /// Replay seed for an admin subscriber, straight from the backend.
    pub fn seed_data(&self, uuid: &str) -> Vec<u8> {
        self.backend.seed_data(uuid)
    }

    pub fn guest_port(&self, uuid: &str) -> Option<u16> {
        self.lock().guest(uuid).and_then(|g| g.port)
    }

    pub fn guest_exists(&self, uuid: &str) -> bool {
        self.lock().guest(uuid).is_some()
    }

    pub fn link_count(&self, uuid: &str) -> usize {
        self.lock().guest(uuid).map(|g| g.links.len()).unwrap_or(0)
    }

    /// Store the accept-loop handle for a bound per-guest listener.
    pub fn set_listener(&self, uuid: &str, handle: tokio::task::JoinHandle<()>) {
        self.lock().set_listener(uuid, handle);
    }

    /// The per-guest listener could not be bound; the guest stays
    /// reachable through the admin path only.
    pub fn port_bind_failed(&self, uuid: &str) {
        self.lock().port_bind_failed(uuid);
    }

    /// Evict expired orphans and tell the backend about each.
    pub fn collect_orphans(&self) {
        let mut reg = self.lock();
        self.collect_locked(&mut reg, Instant::now());
    }

    fn collect_locked(&self, reg: &mut Registry, now: Instant) {
        for evicted in reg.collect_orphans(now) {
            info!("expired VM with uuid {}, port {:?}", evicted.uuid, evicted.port);
            self.backend.notify_vm_del(&evicted.uuid);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::telnet::IAC;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn mux() -> Mux {
        Mux::new(None, Duration::from_secs(60), Arc::new(MemoryBackend::new()))
    }

    fn channel() -> (Sender, UnboundedReceiver<Vec<u8>>) {
        mpsc::unbounded_channel()
    }

    /// Hypervisor link that has completed its identity exchange.
    fn identified_link(mux: &Mux, uuid: &str, name: &str) -> (ConnId, UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = channel();
        let id = mux.register_link(tx);
        mux.handle_vc_uuid(id, uuid);
        mux.handle_vm_name(id, name);
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn guest_born_after_both_identity_fields() {
        let m = mux();
        let (tx, _rx) = channel();
        let id = m.register_link(tx);
        m.handle_vc_uuid(id, "abc-123");
        assert!(!m.guest_exists("abc-123"));
        m.handle_vm_name(id, "db-01");
        assert!(m.guest_exists("abc-123"));
    }

    #[test]
    fn roundtrip_between_link_and_subscriber() {
        let m = mux();
        let (l1, mut l1_rx) = identified_link(&m, "abc-123", "db-01");

        let (stx, mut srx) = channel();
        let AdminAttach::Attached { id: sid, .. } = m.admin_attach("db-01", LockMode::Ffa, stx)
        else {
            panic!("attach failed");
        };

        m.sub_payload(sid, b"ping\n");
        assert_eq!(drain(&mut l1_rx), b"ping\n");

        m.link_payload(l1, b"pong\n");
        assert_eq!(drain(&mut srx), b"pong\n");
    }

    #[test]
    fn payload_is_iac_escaped_for_subscribers() {
        let m = mux();
        let (l1, _l1_rx) = identified_link(&m, "abc-123", "db-01");
        let (stx, mut srx) = channel();
        m.admin_attach("db-01", LockMode::Ffa, stx);

        m.link_payload(l1, &[1, IAC, 2]);
        assert_eq!(drain(&mut srx), vec![1, IAC, IAC, 2]);
    }

    #[test]
    fn read_only_subscriber_cannot_write() {
        let m = mux();
        let (_l1, mut l1_rx) = identified_link(&m, "abc-123", "db-01");

        // Exclusive writer first, then an FFAR that gets downgraded.
        let (etx, _erx) = channel();
        m.admin_attach("db-01", LockMode::Exclusive, etx);
        let (ftx, _frx) = channel();
        let AdminAttach::Attached {
            id: fid,
            applied,
            read_only,
            ..
        } = m.admin_attach("db-01", LockMode::Ffar, ftx)
        else {
            panic!("attach failed");
        };
        assert_eq!(applied, LockMode::Ffar);
        assert!(read_only);

        m.sub_payload(fid, b"typed");
        assert!(drain(&mut l1_rx).is_empty());
    }

    #[test]
    fn exclusive_conflict_reports_lock_failed() {
        let m = mux();
        identified_link(&m, "abc-123", "db-01");
        let (tx1, _rx1) = channel();
        m.admin_attach("db-01", LockMode::Exclusive, tx1);
        let (tx2, _rx2) = channel();
        assert!(matches!(
            m.admin_attach("db-01", LockMode::Exclusive, tx2),
            AdminAttach::LockFailed
        ));
    }

    #[test]
    fn unknown_guest_reports_not_found() {
        let m = mux();
        let (tx, _rx) = channel();
        assert!(matches!(
            m.admin_attach("ghost", LockMode::Ffa, tx),
            AdminAttach::NotFound
        ));
    }

    #[test]
    fn rename_propagates_to_listing() {
        let m = mux();
        let (l1, _rx) = identified_link(&m, "abc-123", "db-01");
        m.handle_vm_name(l1, "db-01-renamed");
        let vms = m.list_vms();
        assert_eq!(vms[0].name.as_deref(), Some("db-01-renamed"));
    }

    #[test]
    fn vmotion_quiesces_and_flushes_in_order() {
        // Scenario: source sends VMOTION-BEGIN, a byte in the window, the
        // peer joins, COMPLETE fires, the peer speaks. The subscriber must
        // see nothing during the window and "XY" in order afterwards.
        let m = mux();
        let (l1, _l1_rx) = identified_link(&m, "abc-123", "db-01");
        let (stx, mut srx) = channel();
        m.admin_attach("db-01", LockMode::Ffa, stx);

        let cookie = vec![0xDE, 0xAD, 1, 2, 3, 4];
        assert!(m.handle_vmotion_begin(l1, cookie.clone()));

        m.link_payload(l1, b"X");
        assert!(drain(&mut srx).is_empty(), "no bytes may leak mid-migration");

        let (tx2, _rx2) = channel();
        let l2 = m.register_link(tx2);
        assert!(m.handle_vmotion_peer(l2, &cookie));
        assert_eq!(m.link_count("abc-123"), 2);

        m.handle_vmotion_complete(l1);
        assert_eq!(drain(&mut srx), b"X");

        m.link_payload(l2, b"Y");
        assert_eq!(drain(&mut srx), b"Y");

        m.detach_link(l1);
        assert_eq!(m.link_count("abc-123"), 1);
        assert!(m.guest_exists("abc-123"));
    }

    #[test]
    fn subscriber_input_parked_during_migration() {
        let m = mux();
        let (l1, mut l1_rx) = identified_link(&m, "abc-123", "db-01");
        let (stx, _srx) = channel();
        let AdminAttach::Attached { id: sid, .. } = m.admin_attach("db-01", LockMode::Ffa, stx)
        else {
            panic!("attach failed");
        };

        assert!(m.handle_vmotion_begin(l1, vec![9, 9]));
        m.sub_payload(sid, b"typed");
        assert!(drain(&mut l1_rx).is_empty());

        m.handle_vmotion_abort(l1);
        assert_eq!(drain(&mut l1_rx), b"typed");
    }

    #[test]
    fn second_migration_refused_while_active() {
        let m = mux();
        let (l1, _rx) = identified_link(&m, "abc-123", "db-01");
        assert!(m.handle_vmotion_begin(l1, vec![1]));
        assert!(!m.handle_vmotion_begin(l1, vec![2]));
    }

    #[test]
    fn vmotion_begin_on_unidentified_link_refused() {
        let m = mux();
        let (tx, _rx) = channel();
        let id = m.register_link(tx);
        assert!(!m.handle_vmotion_begin(id, vec![1, 2]));
    }

    #[test]
    fn vmotion_peer_with_unknown_cookie_refused() {
        let m = mux();
        let (tx, _rx) = channel();
        let id = m.register_link(tx);
        assert!(!m.handle_vmotion_peer(id, &[7, 7]));
    }

    #[test]
    fn vmotion_peer_uuid_mismatch_refused() {
        let m = mux();
        let (l1, _r1) = identified_link(&m, "abc-123", "db-01");
        let (l2, _r2) = identified_link(&m, "other-9", "db-02");
        let cookie = vec![5, 5];
        assert!(m.handle_vmotion_begin(l1, cookie.clone()));
        assert!(!m.handle_vmotion_peer(l2, &cookie));
    }

    #[test]
    fn source_hangup_aborts_migration() {
        let m = mux();
        let (l1, _r1) = identified_link(&m, "abc-123", "db-01");
        let (stx, mut srx) = channel();
        m.admin_attach("db-01", LockMode::Ffa, stx);

        assert!(m.handle_vmotion_begin(l1, vec![3, 3]));
        m.link_payload(l1, b"lost?");
        m.detach_link(l1);

        // Cookie is gone: a peer presenting it now is refused, and the
        // guest accepts a fresh migration again.
        let (tx2, _r2) = channel();
        let l2 = m.register_link(tx2);
        assert!(!m.handle_vmotion_peer(l2, &[3, 3]));

        // The source's own parked bytes died with it; nothing leaked.
        assert!(drain(&mut srx).is_empty());
    }

    #[test]
    fn dead_subscriber_detached_on_broadcast() {
        let m = mux();
        let (l1, _r1) = identified_link(&m, "abc-123", "db-01");
        let (stx, srx) = channel();
        m.admin_attach("db-01", LockMode::Ffa, stx);
        drop(srx); // simulate a dead socket: the writer side is gone

        m.link_payload(l1, b"data");
        let vms = m.list_vms();
        assert_eq!(vms.len(), 1);
        // The guest survives; the dead subscriber is gone.
        let (stx2, mut srx2) = channel();
        assert!(matches!(
            m.admin_attach("db-01", LockMode::Exclusive, stx2),
            AdminAttach::Attached { .. }
        ));
        m.link_payload(l1, b"more");
        assert_eq!(drain(&mut srx2), b"more");
    }

    #[test]
    fn backend_sees_serial_and_serves_seed() {
        let backend = Arc::new(MemoryBackend::new());
        let m = Mux::new(None, Duration::from_secs(60), backend);
        let (l1, _r1) = identified_link(&m, "abc-123", "db-01");
        m.link_payload(l1, b"boot log");
        assert_eq!(m.seed_data("abc-123"), b"boot log");
    }

    #[test]
    fn restore_observed_reconstitutes_guests() {
        let backend = Arc::new(MemoryBackend::new());
        backend.notify_vm("abc-123", Some("db-01"), None);
        let m = Mux::new(None, Duration::from_secs(60), backend);
        let binds = m.restore_observed();
        assert!(binds.is_empty()); // ports disabled
        assert!(m.guest_exists("abc-123"));
    }
}
