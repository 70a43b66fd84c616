//! Guest registry: UUID-keyed guest records, the per-guest port allocator,
//! orphan bookkeeping, and the vmotion cookie table.
//!
//! The registry is a plain synchronous structure with no I/O of its own.
//! Connections are represented by opaque [`ConnId`]s plus the sending half
//! of their outbound byte channel; links and subscribers refer to their
//! guest by UUID (a key, not a reference), so detaching never leaves a
//! dangling owner. [`Mux`](crate::mux::Mux) wraps the registry in its lock
//! and layers the data path on top.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Identifier of one connection (hypervisor link or subscriber).
pub type ConnId = u64;

/// Sending half of a connection's outbound byte channel. Whatever is
/// pushed here is written to the socket verbatim by the connection's
/// writer task, so payload must already be IAC-escaped.
pub type Sender = UnboundedSender<Vec<u8>>;

// ── Lock modes ────────────────────────────────────────────────────────────

/// Subscriber admission policy requested on admin attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockMode {
    /// Writer; requires zero other subscribers.
    Exclusive,
    /// Writer; coexists with readers but not another WRITE or EXCLUSIVE.
    Write,
    /// Free-for-all writer.
    Ffa,
    /// Free-for-all, downgraded to read-only when an EXCLUSIVE holder
    /// exists.
    Ffar,
}

impl LockMode {
    /// Wire token, as carried by the admin protocol.
    pub fn as_str(self) -> &'static str {
        match self {
            LockMode::Exclusive => "EXCLUSIVE",
            LockMode::Write => "WRITE",
            LockMode::Ffa => "FFA",
            LockMode::Ffar => "FFAR",
        }
    }
}

impl std::str::FromStr for LockMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_uppercase().as_str() {
            "EXCLUSIVE" => Ok(LockMode::Exclusive),
            "WRITE" => Ok(LockMode::Write),
            "FFA" => Ok(LockMode::Ffa),
            "FFAR" => Ok(LockMode::Ffar),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Records ───────────────────────────────────────────────────────────────

/// One hypervisor connection. Identity arrives over the wire (VC-UUID /
/// VM-NAME suboptions), so both fields start out unset.
#[derive(Debug)]
pub struct LinkRecord {
    pub tx: Sender,
    pub uuid: Option<String>,
    pub name: Option<String>,
    /// Payload parked here while the guest is migrating.
    pub pending: Vec<u8>,
}

/// One attached viewer connection.
#[derive(Debug)]
pub struct SubRecord {
    pub tx: Sender,
    pub uuid: String,
    pub mode: LockMode,
    pub read_only: bool,
    /// Payload parked here while the guest is migrating.
    pub pending: Vec<u8>,
}

/// In-flight migration for one guest.
#[derive(Debug)]
pub struct Vmotion {
    pub cookie: Vec<u8>,
    /// The link that sent VMOTION-BEGIN; its departure aborts the
    /// migration.
    pub source: ConnId,
}

/// One guest, keyed by its virtual-center UUID.
pub struct Guest {
    pub uuid: String,
    pub name: Option<String>,
    pub port: Option<u16>,
    /// Accept-loop task for the per-guest port, aborted on eviction.
    pub listener: Option<JoinHandle<()>>,
    /// Live hypervisor links, in attach order (two during migration).
    pub links: Vec<ConnId>,
    pub subscribers: Vec<ConnId>,
    pub vmotion: Option<Vmotion>,
    /// Set the instant the guest loses its last link and subscriber.
    pub orphan_since: Option<Instant>,
}

impl Guest {
    fn new(uuid: String, name: Option<String>) -> Self {
        Self {
            uuid,
            name,
            port: None,
            listener: None,
            links: Vec::new(),
            subscribers: Vec::new(),
            vmotion: None,
            orphan_since: None,
        }
    }

    pub fn is_orphan(&self) -> bool {
        self.links.is_empty() && self.subscribers.is_empty()
    }
}

/// Listing entry handed to the admin protocol and the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmEntry {
    pub name: Option<String>,
    pub uuid: String,
    pub port: Option<u16>,
}

/// A guest removed by [`Registry::collect_orphans`].
#[derive(Debug)]
pub struct Evicted {
    pub uuid: String,
    pub port: Option<u16>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no free port at or above the configured start port")]
    PortsExhausted,
}

// ── Registry ──────────────────────────────────────────────────────────────

/// All shared concentrator state: guests, connections, ports, migrations.
pub struct Registry {
    vms: HashMap<String, Guest>,
    /// Port → UUID reverse index; exactly the bound per-guest ports.
    ports: HashMap<u16, String>,
    /// Vmotion cookie → UUID reverse index.
    vmotions: HashMap<Vec<u8>, String>,
    links: HashMap<ConnId, LinkRecord>,
    subs: HashMap<ConnId, SubRecord>,
    /// Allocation cursor; `None` disables per-guest ports entirely.
    next_port: Option<u16>,
    expire: Duration,
}

impl Registry {
    pub fn new(vm_port_start: Option<u16>, expire: Duration) -> Self {
        Self {
            vms: HashMap::new(),
            ports: HashMap::new(),
            vmotions: HashMap::new(),
            links: HashMap::new(),
            subs: HashMap::new(),
            next_port: vm_port_start,
            expire,
        }
    }

    // ── connections ───────────────────────────────────────────────────────

    pub fn insert_link(&mut self, id: ConnId, tx: Sender) {
        self.links.insert(
            id,
            LinkRecord {
                tx,
                uuid: None,
                name: None,
                pending: Vec::new(),
            },
        );
    }

    pub fn link(&self, id: ConnId) -> Option<&LinkRecord> {
        self.links.get(&id)
    }

    pub fn link_mut(&mut self, id: ConnId) -> Option<&mut LinkRecord> {
        self.links.get_mut(&id)
    }

    pub fn sub(&self, id: ConnId) -> Option<&SubRecord> {
        self.subs.get(&id)
    }

    pub fn sub_mut(&mut self, id: ConnId) -> Option<&mut SubRecord> {
        self.subs.get_mut(&id)
    }

    // ── guests ────────────────────────────────────────────────────────────

    pub fn guest(&self, uuid: &str) -> Option<&Guest> {
        self.vms.get(uuid)
    }

    pub fn guest_mut(&mut self, uuid: &str) -> Option<&mut Guest> {
        self.vms.get_mut(uuid)
    }

    /// Find by display name, falling back to UUID match.
    pub fn guest_by_name(&self, name: &str) -> Option<&Guest> {
        self.vms
            .values()
            .find(|g| g.name.as_deref() == Some(name))
            .or_else(|| self.vms.get(name))
    }

    pub fn list(&self) -> Vec<VmEntry> {
        let mut out: Vec<VmEntry> = self
            .vms
            .values()
            .map(|g| VmEntry {
                name: g.name.clone(),
                uuid: g.uuid.clone(),
                port: g.port,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Create-or-attach. An existing guest gains `link` (the reconnect and
    /// vmotion-peer path); a new guest is created, gets a port allocated
    /// when the allocator is enabled, and starts orphaned unless a live
    /// link created it.
    ///
    /// Returns `(created, port)`; a `Some` port on a created guest still
    /// needs its listener bound by the caller.
    pub fn ensure_guest(
        &mut self,
        uuid: &str,
        name: Option<&str>,
        link: Option<ConnId>,
        now: Instant,
    ) -> Result<(bool, Option<u16>), RegistryError> {
        if let Some(g) = self.vms.get_mut(uuid) {
            if let Some(id) = link {
                if !g.links.contains(&id) {
                    g.links.push(id);
                }
                g.orphan_since = None;
            }
            return Ok((false, g.port));
        }

        let mut guest = Guest::new(uuid.to_owned(), name.map(str::to_owned));
        guest.port = self.allocate_port(uuid)?;
        match link {
            Some(id) => guest.links.push(id),
            None => guest.orphan_since = Some(now),
        }
        let port = guest.port;
        self.vms.insert(uuid.to_owned(), guest);
        Ok((true, port))
    }

    /// Re-create a guest observed by the backend before a restart, keeping
    /// its old port when that port is still free.
    pub fn restore_guest(
        &mut self,
        uuid: &str,
        name: Option<&str>,
        port: Option<u16>,
        now: Instant,
    ) -> Result<Option<u16>, RegistryError> {
        if self.vms.contains_key(uuid) {
            return Ok(None);
        }
        let mut guest = Guest::new(uuid.to_owned(), name.map(str::to_owned));
        if self.next_port.is_some() {
            guest.port = match port {
                Some(p) if !self.ports.contains_key(&p) => {
                    self.ports.insert(p, uuid.to_owned());
                    Some(p)
                }
                _ => self.allocate_port(uuid)?,
            };
        }
        guest.orphan_since = Some(now);
        let assigned = guest.port;
        self.vms.insert(uuid.to_owned(), guest);
        Ok(assigned)
    }

    /// Update the display name. Returns true when it actually changed.
    pub fn rename_guest(&mut self, uuid: &str, name: &str) -> bool {
        match self.vms.get_mut(uuid) {
            Some(g) if g.name.as_deref() != Some(name) => {
                g.name = Some(name.to_owned());
                true
            }
            _ => false,
        }
    }

    // ── port allocator ────────────────────────────────────────────────────

    /// First unused port at or above the cursor; advances the cursor past
    /// the assignment. `None` when port allocation is disabled.
    fn allocate_port(&mut self, uuid: &str) -> Result<Option<u16>, RegistryError> {
        let Some(start) = self.next_port else {
            return Ok(None);
        };
        let mut p = start;
        while self.ports.contains_key(&p) {
            p = p.checked_add(1).ok_or(RegistryError::PortsExhausted)?;
        }
        self.next_port = Some(p.checked_add(1).ok_or(RegistryError::PortsExhausted)?);
        self.ports.insert(p, uuid.to_owned());
        Ok(Some(p))
    }

    /// Return a port to the allocator, rewinding the cursor so freed ports
    /// are promptly and deterministically reused.
    fn free_port(&mut self, port: u16) {
        self.ports.remove(&port);
        if let Some(next) = self.next_port {
            self.next_port = Some(next.min(port));
        }
    }

    /// The listener for a freshly allocated port could not be bound: drop
    /// the assignment so the guest is reachable via the admin path only.
    pub fn port_bind_failed(&mut self, uuid: &str) {
        if let Some(g) = self.vms.get_mut(uuid) {
            if let Some(p) = g.port.take() {
                self.free_port(p);
            }
        }
    }

    pub fn set_listener(&mut self, uuid: &str, handle: JoinHandle<()>) {
        if let Some(g) = self.vms.get_mut(uuid) {
            g.listener = Some(handle);
        }
    }

    /// UUID owning `port`, if any.
    pub fn port_owner(&self, port: u16) -> Option<&str> {
        self.ports.get(&port).map(String::as_str)
    }

    // ── detach & orphan lifecycle ─────────────────────────────────────────

    fn stamp_orphan(&mut self, uuid: &str, now: Instant) {
        if let Some(g) = self.vms.get_mut(uuid) {
            if g.is_orphan() {
                g.orphan_since = Some(now);
            }
        }
    }

    /// Remove a link record and drop it from its guest, stamping the
    /// orphan clock when the guest empties out. Returns the record and
    /// whether it aborted an in-flight migration it had initiated.
    pub fn remove_link(&mut self, id: ConnId, now: Instant) -> Option<(LinkRecord, bool)> {
        let rec = self.links.remove(&id)?;
        let mut aborted = false;
        if let Some(uuid) = rec.uuid.clone() {
            if let Some(g) = self.vms.get_mut(&uuid) {
                g.links.retain(|l| *l != id);
                if g.vmotion.as_ref().is_some_and(|v| v.source == id) {
                    if let Some(v) = g.vmotion.take() {
                        self.vmotions.remove(&v.cookie);
                        aborted = true;
                    }
                }
            }
            self.stamp_orphan(&uuid, now);
        }
        Some((rec, aborted))
    }

    pub fn attach_subscriber(&mut self, id: ConnId, rec: SubRecord) {
        let uuid = rec.uuid.clone();
        self.subs.insert(id, rec);
        if let Some(g) = self.vms.get_mut(&uuid) {
            g.subscribers.push(id);
            g.orphan_since = None;
        }
    }

    pub fn remove_subscriber(&mut self, id: ConnId, now: Instant) -> Option<SubRecord> {
        let rec = self.subs.remove(&id)?;
        if let Some(g) = self.vms.get_mut(&rec.uuid) {
            g.subscribers.retain(|s| *s != id);
        }
        self.stamp_orphan(&rec.uuid, now);
        Some(rec)
    }

    /// Evict every guest whose orphan stamp has aged past the expiry
    /// interval. Idempotent; safe to call at any admin boundary.
    pub fn collect_orphans(&mut self, now: Instant) -> Vec<Evicted> {
        let expired: Vec<String> = self
            .vms
            .values()
            .filter(|g| {
                g.is_orphan()
                    && g.orphan_since
                        .is_some_and(|t| t + self.expire <= now)
            })
            .map(|g| g.uuid.clone())
            .collect();

        let mut evicted = Vec::new();
        for uuid in expired {
            let Some(g) = self.vms.remove(&uuid) else {
                continue;
            };
            if let Some(handle) = g.listener {
                handle.abort();
            }
            if let Some(p) = g.port {
                self.free_port(p);
            }
            if let Some(v) = g.vmotion {
                self.vmotions.remove(&v.cookie);
            }
            evicted.push(Evicted {
                uuid: g.uuid,
                port: g.port,
            });
        }
        evicted
    }

    // ── vmotion table ─────────────────────────────────────────────────────

    /// Record a migration for the guest; fails when one is already in
    /// flight.
    pub fn begin_vmotion(&mut self, uuid: &str, cookie: Vec<u8>, source: ConnId) -> bool {
        let Some(g) = self.vms.get_mut(uuid) else {
            return false;
        };
        if g.vmotion.is_some() {
            return false;
        }
        g.vmotion = Some(Vmotion {
            cookie: cookie.clone(),
            source,
        });
        self.vmotions.insert(cookie, uuid.to_owned());
        true
    }

    pub fn vmotion_uuid(&self, cookie: &[u8]) -> Option<&str> {
        self.vmotions.get(cookie).map(String::as_str)
    }

    /// Clear the migration state for the guest, returning true if one was
    /// active.
    pub fn end_vmotion(&mut self, uuid: &str) -> bool {
        let Some(g) = self.vms.get_mut(uuid) else {
            return false;
        };
        match g.vmotion.take() {
            Some(v) => {
                self.vmotions.remove(&v.cookie);
                true
            }
            None => false,
        }
    }

    // ── admission policy ──────────────────────────────────────────────────

    /// Apply the lock policy matrix for a prospective subscriber of
    /// `uuid`. Returns the applied mode and the read-only flag, or `None`
    /// when an existing holder prevents the attach.
    pub fn admission(&self, uuid: &str, mode: LockMode) -> Option<(LockMode, bool)> {
        let g = self.vms.get(uuid)?;
        let holders: Vec<&SubRecord> = g
            .subscribers
            .iter()
            .filter_map(|id| self.subs.get(id))
            .collect();

        let exclusive = holders.iter().any(|s| s.mode == LockMode::Exclusive);
        match mode {
            LockMode::Exclusive => holders.is_empty().then_some((LockMode::Exclusive, false)),
            LockMode::Write => {
                let writer = holders
                    .iter()
                    .any(|s| matches!(s.mode, LockMode::Exclusive | LockMode::Write));
                (!writer).then_some((LockMode::Write, false))
            }
            LockMode::Ffa => (!exclusive).then_some((LockMode::Ffa, false)),
            LockMode::Ffar => {
                if exclusive {
                    Some((LockMode::Ffar, true))
                } else {
                    Some((LockMode::Ffa, false))
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sender() -> Sender {
        mpsc::unbounded_channel().0
    }

    fn registry() -> Registry {
        Registry::new(Some(50000), Duration::from_secs(10))
    }

    #[test]
    fn ports_allocated_sequentially() {
        let mut reg = registry();
        let now = Instant::now();
        let (_, p1) = reg.ensure_guest("uuid-1", Some("a"), None, now).unwrap();
        let (_, p2) = reg.ensure_guest("uuid-2", Some("b"), None, now).unwrap();
        assert_eq!(p1, Some(50000));
        assert_eq!(p2, Some(50001));
        assert_eq!(reg.port_owner(50000), Some("uuid-1"));
        assert_eq!(reg.port_owner(50001), Some("uuid-2"));
    }

    #[test]
    fn no_two_guests_share_a_port() {
        let mut reg = registry();
        let now = Instant::now();
        for i in 0..10 {
            reg.ensure_guest(&format!("uuid-{i}"), Some("x"), None, now)
                .unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        for e in reg.list() {
            assert!(seen.insert(e.port.unwrap()));
        }
    }

    #[test]
    fn freed_port_is_reused() {
        // An evicted guest's port goes to the next newcomer.
        let mut reg = registry();
        let t0 = Instant::now();
        reg.ensure_guest("uuid-1", Some("a"), None, t0).unwrap();
        reg.ensure_guest("uuid-2", Some("b"), None, t0).unwrap();

        let evicted = reg.collect_orphans(t0 + Duration::from_secs(11));
        assert_eq!(evicted.len(), 2);

        let (_, p) = reg
            .ensure_guest("uuid-3", Some("c"), None, t0 + Duration::from_secs(12))
            .unwrap();
        assert_eq!(p, Some(50000));
    }

    #[test]
    fn port_allocation_disabled() {
        let mut reg = Registry::new(None, Duration::from_secs(10));
        let (created, port) = reg
            .ensure_guest("uuid-1", Some("a"), None, Instant::now())
            .unwrap();
        assert!(created);
        assert_eq!(port, None);
    }

    #[test]
    fn bind_failure_releases_port() {
        let mut reg = registry();
        let now = Instant::now();
        reg.ensure_guest("uuid-1", Some("a"), None, now).unwrap();
        reg.port_bind_failed("uuid-1");
        assert_eq!(reg.guest("uuid-1").unwrap().port, None);
        // The number goes back to the pool.
        let (_, p) = reg.ensure_guest("uuid-2", Some("b"), None, now).unwrap();
        assert_eq!(p, Some(50000));
    }

    #[test]
    fn orphan_stamp_set_and_cleared() {
        let mut reg = registry();
        let now = Instant::now();
        reg.insert_link(1, sender());
        reg.link_mut(1).unwrap().uuid = Some("uuid-1".into());
        reg.ensure_guest("uuid-1", Some("a"), Some(1), now).unwrap();
        assert!(reg.guest("uuid-1").unwrap().orphan_since.is_none());

        reg.remove_link(1, now);
        assert_eq!(reg.guest("uuid-1").unwrap().orphan_since, Some(now));

        // Reattachment clears the stamp.
        reg.insert_link(2, sender());
        reg.link_mut(2).unwrap().uuid = Some("uuid-1".into());
        reg.ensure_guest("uuid-1", Some("a"), Some(2), now).unwrap();
        assert!(reg.guest("uuid-1").unwrap().orphan_since.is_none());
    }

    #[test]
    fn subscriber_holds_guest_alive() {
        let mut reg = registry();
        let now = Instant::now();
        reg.ensure_guest("uuid-1", Some("a"), None, now).unwrap();
        reg.attach_subscriber(
            7,
            SubRecord {
                tx: sender(),
                uuid: "uuid-1".into(),
                mode: LockMode::Ffa,
                read_only: false,
                pending: Vec::new(),
            },
        );
        assert!(reg.guest("uuid-1").unwrap().orphan_since.is_none());
        assert!(reg
            .collect_orphans(now + Duration::from_secs(100))
            .is_empty());

        reg.remove_subscriber(7, now + Duration::from_secs(100));
        let evicted = reg.collect_orphans(now + Duration::from_secs(111));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].uuid, "uuid-1");
    }

    #[test]
    fn expiry_bound_is_inclusive() {
        let mut reg = registry();
        let t0 = Instant::now();
        reg.ensure_guest("uuid-1", Some("a"), None, t0).unwrap();
        // One instant before the bound: kept.
        assert!(reg
            .collect_orphans(t0 + Duration::from_secs(10) - Duration::from_nanos(1))
            .is_empty());
        // At the bound: evicted.
        assert_eq!(reg.collect_orphans(t0 + Duration::from_secs(10)).len(), 1);
    }

    #[test]
    fn rename_reports_change() {
        let mut reg = registry();
        reg.ensure_guest("uuid-1", Some("old"), None, Instant::now())
            .unwrap();
        assert!(reg.rename_guest("uuid-1", "new"));
        assert!(!reg.rename_guest("uuid-1", "new"));
        assert_eq!(reg.guest("uuid-1").unwrap().name.as_deref(), Some("new"));
    }

    #[test]
    fn guest_by_name_falls_back_to_uuid() {
        let mut reg = registry();
        reg.ensure_guest("uuid-1", Some("db-01"), None, Instant::now())
            .unwrap();
        assert!(reg.guest_by_name("db-01").is_some());
        assert!(reg.guest_by_name("uuid-1").is_some());
        assert!(reg.guest_by_name("nope").is_none());
    }

    #[test]
    fn vmotion_table_lifecycle() {
        let mut reg = registry();
        let now = Instant::now();
        reg.ensure_guest("uuid-1", Some("a"), None, now).unwrap();

        assert!(reg.begin_vmotion("uuid-1", vec![0xDE, 0xAD], 1));
        assert_eq!(reg.vmotion_uuid(&[0xDE, 0xAD]), Some("uuid-1"));
        // Second migration refused while one is in flight.
        assert!(!reg.begin_vmotion("uuid-1", vec![0xBE, 0xEF], 1));

        assert!(reg.end_vmotion("uuid-1"));
        assert!(reg.vmotion_uuid(&[0xDE, 0xAD]).is_none());
        assert!(!reg.end_vmotion("uuid-1"));
    }

    #[test]
    fn eviction_drops_stale_cookie() {
        let mut reg = registry();
        let t0 = Instant::now();
        reg.ensure_guest("uuid-1", Some("a"), None, t0).unwrap();
        reg.begin_vmotion("uuid-1", vec![1, 2], 9);
        reg.collect_orphans(t0 + Duration::from_secs(11));
        assert!(reg.vmotion_uuid(&[1, 2]).is_none());
    }

    #[test]
    fn restore_keeps_free_port_or_reallocates() {
        let mut reg = registry();
        let now = Instant::now();
        let p = reg.restore_guest("uuid-1", Some("a"), Some(50005), now).unwrap();
        assert_eq!(p, Some(50005));
        // Clash with a taken port falls back to the cursor.
        let p = reg.restore_guest("uuid-2", Some("b"), Some(50005), now).unwrap();
        assert_eq!(p, Some(50000));
        // Restored guests start on the orphan clock.
        assert!(reg.guest("uuid-1").unwrap().orphan_since.is_some());
    }

    // ── admission matrix ──────────────────────────────────────────────────

    fn attach(reg: &mut Registry, id: ConnId, mode: LockMode, read_only: bool) {
        reg.attach_subscriber(
            id,
            SubRecord {
                tx: sender(),
                uuid: "uuid-1".into(),
                mode,
                read_only,
                pending: Vec::new(),
            },
        );
    }

    fn guested() -> Registry {
        let mut reg = registry();
        reg.ensure_guest("uuid-1", Some("a"), None, Instant::now())
            .unwrap();
        reg
    }

    #[test]
    fn exclusive_requires_empty() {
        let mut reg = guested();
        assert_eq!(
            reg.admission("uuid-1", LockMode::Exclusive),
            Some((LockMode::Exclusive, false))
        );
        attach(&mut reg, 1, LockMode::Ffa, false);
        assert_eq!(reg.admission("uuid-1", LockMode::Exclusive), None);
    }

    #[test]
    fn write_excluded_by_writers_only() {
        let mut reg = guested();
        attach(&mut reg, 1, LockMode::Ffa, false);
        assert!(reg.admission("uuid-1", LockMode::Write).is_some());
        attach(&mut reg, 2, LockMode::Write, false);
        assert_eq!(reg.admission("uuid-1", LockMode::Write), None);
    }

    #[test]
    fn ffar_downgrades_against_exclusive() {
        let mut reg = guested();
        attach(&mut reg, 1, LockMode::Exclusive, false);
        assert_eq!(
            reg.admission("uuid-1", LockMode::Ffar),
            Some((LockMode::Ffar, true))
        );
        assert_eq!(reg.admission("uuid-1", LockMode::Ffa), None);
        assert_eq!(reg.admission("uuid-1", LockMode::Write), None);
    }

    #[test]
    fn ffar_writes_when_no_exclusive() {
        let mut reg = guested();
        attach(&mut reg, 1, LockMode::Ffa, false);
        assert_eq!(
            reg.admission("uuid-1", LockMode::Ffar),
            Some((LockMode::Ffa, false))
        );
    }

    #[test]
    fn lock_mode_tokens_round_trip() {
        for mode in [
            LockMode::Exclusive,
            LockMode::Write,
            LockMode::Ffa,
            LockMode::Ffar,
        ] {
            assert_eq!(mode.as_str().parse::<LockMode>(), Ok(mode));
        }
        assert!("nope".parse::<LockMode>().is_err());
    }
}
