//! Persistence backends.
//!
//! The concentrator core treats persistence as an advisory collaborator: it
//! reports guest lifecycle and serial traffic through the [`Backend`] trait
//! and asks it for two things only — the set of guests observed before a
//! restart, and a replay seed handed to freshly attached admin subscribers.
//! Backend failures are logged and never propagate into the data path.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{debug, warn};

use crate::registry::VmEntry;

/// How much recent serial output is retained per guest as seed data.
const SEED_CAP: usize = 4096;

/// Callback interface the core drives. All methods have no-op defaults so
/// a backend implements only what it cares about.
pub trait Backend: Send + Sync {
    /// Guests observed before a restart; the registry is reconstituted
    /// from these at startup. Failure here is tolerated as "none".
    fn get_observed_vms(&self) -> Vec<VmEntry> {
        Vec::new()
    }

    /// A guest appeared or changed its display name.
    fn notify_vm(&self, _uuid: &str, _name: Option<&str>, _port: Option<u16>) {}

    /// One chunk of serial output from a hypervisor link.
    fn notify_vm_msg(&self, _uuid: &str, _name: Option<&str>, _data: &[u8]) {}

    /// A guest was evicted from the registry.
    fn notify_vm_del(&self, _uuid: &str) {}

    /// A subscriber detached.
    fn notify_client_del(&self, _uuid: &str) {}

    /// Recently observed serial output for a guest, replayed to admin
    /// subscribers right after attach.
    fn seed_data(&self, _uuid: &str) -> Vec<u8> {
        Vec::new()
    }
}

/// Backend that records nothing. Useful in tests and as the baseline for
/// deployments that only want live multiplexing.
#[derive(Debug, Default)]
pub struct NullBackend;

impl Backend for NullBackend {}

// ── MemoryBackend ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    vms: HashMap<String, VmEntry>,
    /// Ring of recent serial output per guest, capped at [`SEED_CAP`].
    logs: HashMap<String, VecDeque<u8>>,
}

/// In-memory backend: remembers observed guests for the lifetime of the
/// process and keeps a bounded ring of serial output as seed data.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl Backend for MemoryBackend {
    fn get_observed_vms(&self) -> Vec<VmEntry> {
        self.with_state(|s| s.vms.values().cloned().collect())
    }

    fn notify_vm(&self, uuid: &str, name: Option<&str>, port: Option<u16>) {
        self.with_state(|s| {
            s.vms.insert(
                uuid.to_owned(),
                VmEntry {
                    name: name.map(str::to_owned),
                    uuid: uuid.to_owned(),
                    port,
                },
            );
        });
    }

    fn notify_vm_msg(&self, uuid: &str, _name: Option<&str>, data: &[u8]) {
        self.with_state(|s| {
            let log = s.logs.entry(uuid.to_owned()).or_default();
            log.extend(data.iter().copied());
            while log.len() > SEED_CAP {
                log.pop_front();
            }
        });
    }

    fn notify_vm_del(&self, uuid: &str) {
        self.with_state(|s| {
            s.vms.remove(uuid);
            s.logs.remove(uuid);
        });
    }

    fn notify_client_del(&self, uuid: &str) {
        debug!("uuid {uuid} client departed");
    }

    fn seed_data(&self, uuid: &str) -> Vec<u8> {
        self.with_state(|s| {
            s.logs
                .get(uuid)
                .map(|l| l.iter().copied().collect())
                .unwrap_or_default()
        })
    }
}

// ── FileBackend ───────────────────────────────────────────────────────────

/// Disk-backed backend: the observed-guest table survives restarts as a
/// JSON file, and each guest's serial output is appended to its own log
/// file. Seed data still comes from the in-memory ring.
pub struct FileBackend {
    mem: MemoryBackend,
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            mem: MemoryBackend::new(),
            dir,
        })
    }

    fn vms_path(&self) -> PathBuf {
        self.dir.join("vms.json")
    }

    fn log_path(&self, uuid: &str) -> PathBuf {
        // Keep UUIDs from escaping the log directory.
        let safe: String = uuid
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.log"))
    }

    fn persist_vms(&self) {
        let vms = self.mem.get_observed_vms();
        let res = serde_json::to_vec_pretty(&vms)
            .map_err(std::io::Error::other)
            .and_then(|json| fs::write(self.vms_path(), json));
        if let Err(e) = res {
            warn!("failed to persist VM table: {e}");
        }
    }
}

impl Backend for FileBackend {
    fn get_observed_vms(&self) -> Vec<VmEntry> {
        let observed: Vec<VmEntry> = match fs::read(self.vms_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("ignoring corrupt VM table: {e}");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        // Prime the in-memory table so later persists don't lose entries.
        for vm in &observed {
            self.mem.notify_vm(&vm.uuid, vm.name.as_deref(), vm.port);
        }
        observed
    }

    fn notify_vm(&self, uuid: &str, name: Option<&str>, port: Option<u16>) {
        self.mem.notify_vm(uuid, name, port);
        self.persist_vms();
    }

    fn notify_vm_msg(&self, uuid: &str, name: Option<&str>, data: &[u8]) {
        self.mem.notify_vm_msg(uuid, name, data);
        let res = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(uuid))
            .and_then(|mut f| f.write_all(data));
        if let Err(e) = res {
            warn!("uuid {uuid}: failed to append serial log: {e}");
        }
    }

    fn notify_vm_del(&self, uuid: &str) {
        self.mem.notify_vm_del(uuid);
        self.persist_vms();
    }

    fn notify_client_del(&self, uuid: &str) {
        self.mem.notify_client_del(uuid);
    }

    fn seed_data(&self, uuid: &str) -> Vec<u8> {
        self.mem.seed_data(uuid)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
