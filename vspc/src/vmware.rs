//! VMware serial-port telnet extension (option 232).
//!
//! Hypervisors carry out-of-band metadata about the guest — identity,
//! display name, live-migration cookies, proxy orientation — in
//! subnegotiation frames under this option. [`VmwareExt`] decodes one
//! link's frames into [`VmwEvent`]s and produces the protocol replies that
//! do not need a policy decision; everything that does (the vmotion
//! handshake) is surfaced to the caller, which answers with the builder
//! functions below.

use log::{debug, warn};

use crate::telnet::build_subneg;

/// Telnet option number of the VMware extension.
pub const VMWARE_EXT: u8 = 232;

/// Subcommand codes carried inside option-232 subnegotiations.
pub mod sub {
    pub const KNOWN_SUBOPTIONS_1: u8 = 0;
    pub const KNOWN_SUBOPTIONS_2: u8 = 1;
    pub const UNKNOWN_SUBOPTION_RCVD_1: u8 = 2;
    pub const UNKNOWN_SUBOPTION_RCVD_2: u8 = 3;
    pub const VMOTION_BEGIN: u8 = 40;
    pub const VMOTION_GOAHEAD: u8 = 41;
    pub const VMOTION_NOTNOW: u8 = 43;
    pub const VMOTION_PEER: u8 = 44;
    pub const VMOTION_PEER_OK: u8 = 45;
    pub const VMOTION_COMPLETE: u8 = 46;
    pub const VMOTION_ABORT: u8 = 48;
    pub const DO_PROXY: u8 = 70;
    pub const WILL_PROXY: u8 = 71;
    pub const WONT_PROXY: u8 = 73;
    pub const VM_VC_UUID: u8 = 80;
    pub const GET_VM_VC_UUID: u8 = 81;
    pub const VM_NAME: u8 = 82;
    pub const GET_VM_NAME: u8 = 83;
}

/// Subcommands this implementation understands, announced in
/// KNOWN-SUBOPTIONS frames.
pub const SUPPORTED: &[u8] = &[
    sub::KNOWN_SUBOPTIONS_1,
    sub::KNOWN_SUBOPTIONS_2,
    sub::UNKNOWN_SUBOPTION_RCVD_1,
    sub::UNKNOWN_SUBOPTION_RCVD_2,
    sub::VMOTION_BEGIN,
    sub::VMOTION_GOAHEAD,
    sub::VMOTION_NOTNOW,
    sub::VMOTION_PEER,
    sub::VMOTION_PEER_OK,
    sub::VMOTION_COMPLETE,
    sub::VMOTION_ABORT,
    sub::DO_PROXY,
    sub::WILL_PROXY,
    sub::WONT_PROXY,
    sub::VM_VC_UUID,
    sub::GET_VM_VC_UUID,
    sub::VM_NAME,
    sub::GET_VM_NAME,
];

/// Proxy direction byte in DO-PROXY: the concentrator is the client end of
/// the virtual serial line.
pub const PROXY_DIR_CLIENT: u8 = b'C';

/// Length of the random secret appended to a vmotion nonce.
const VMOTION_SECRET_LEN: usize = 4;

// ── Events ────────────────────────────────────────────────────────────────

/// A decoded extension frame that needs handling by the concentrator core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmwEvent {
    /// Guest's virtual-center UUID (whitespace-trimmed ASCII).
    VcUuid(String),
    /// Guest's display name (whitespace-trimmed ASCII).
    VmName(String),
    /// Source hypervisor wants to start a migration; payload is the nonce.
    VmotionBegin(Vec<u8>),
    /// Migration target presenting the full cookie.
    VmotionPeer(Vec<u8>),
    /// Source hypervisor declares the handoff done.
    VmotionComplete,
    /// Migration abandoned.
    VmotionAbort,
    /// Hypervisor accepted our DO-PROXY.
    ProxyWill,
    /// Hypervisor rejected our DO-PROXY.
    ProxyWont,
}

// ── Extension handler ─────────────────────────────────────────────────────

/// Per-link state for the VMware extension.
#[derive(Debug, Default)]
pub struct VmwareExt {
    /// Subcommands the peer announced in KNOWN-SUBOPTIONS.
    peer_suboptions: Vec<u8>,
}

impl VmwareExt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opening burst, sent once the peer's WILL 232 has been accepted:
    /// announce our subcommand set, declare proxy orientation, and request
    /// the guest's identity.
    pub fn hello() -> Vec<u8> {
        let mut out = Vec::new();

        let mut known = vec![sub::KNOWN_SUBOPTIONS_1];
        known.extend_from_slice(SUPPORTED);
        out.extend_from_slice(&build_subneg(VMWARE_EXT, &known));

        // Direction byte plus (empty) service URI.
        out.extend_from_slice(&build_subneg(
            VMWARE_EXT,
            &[sub::DO_PROXY, PROXY_DIR_CLIENT],
        ));

        out.extend_from_slice(&build_subneg(VMWARE_EXT, &[sub::GET_VM_VC_UUID]));
        out.extend_from_slice(&build_subneg(VMWARE_EXT, &[sub::GET_VM_NAME]));
        out
    }

    /// Decode one option-232 subnegotiation payload.
    ///
    /// Returns the event the core must act on (if any) and bytes to write
    /// back to the peer (protocol-level replies that need no decision).
    pub fn on_suboption(&mut self, data: &[u8]) -> (Option<VmwEvent>, Vec<u8>) {
        let Some((&code, payload)) = data.split_first() else {
            debug!("empty VMware suboption frame");
            return (None, Vec::new());
        };

        match code {
            sub::KNOWN_SUBOPTIONS_1 => {
                self.peer_suboptions = payload.to_vec();
                let mut ack = vec![sub::KNOWN_SUBOPTIONS_2];
                ack.extend_from_slice(SUPPORTED);
                (None, build_subneg(VMWARE_EXT, &ack))
            }
            sub::KNOWN_SUBOPTIONS_2 => {
                self.peer_suboptions = payload.to_vec();
                debug!("peer supports {} VMware subcommands", payload.len());
                (None, Vec::new())
            }
            sub::UNKNOWN_SUBOPTION_RCVD_1 | sub::UNKNOWN_SUBOPTION_RCVD_2 => {
                warn!(
                    "peer did not recognize our suboption {:?}",
                    payload.first()
                );
                (None, Vec::new())
            }
            sub::VMOTION_BEGIN => (Some(VmwEvent::VmotionBegin(payload.to_vec())), Vec::new()),
            sub::VMOTION_PEER => (Some(VmwEvent::VmotionPeer(payload.to_vec())), Vec::new()),
            sub::VMOTION_COMPLETE => (Some(VmwEvent::VmotionComplete), Vec::new()),
            sub::VMOTION_ABORT => (Some(VmwEvent::VmotionAbort), Vec::new()),
            sub::WILL_PROXY => (Some(VmwEvent::ProxyWill), Vec::new()),
            sub::WONT_PROXY => (Some(VmwEvent::ProxyWont), Vec::new()),
            sub::VM_VC_UUID => (ascii_field(payload).map(VmwEvent::VcUuid), Vec::new()),
            sub::VM_NAME => (ascii_field(payload).map(VmwEvent::VmName), Vec::new()),
            other => {
                debug!("unknown VMware suboption {other}");
                (
                    None,
                    build_subneg(VMWARE_EXT, &[sub::UNKNOWN_SUBOPTION_RCVD_2, other]),
                )
            }
        }
    }

    /// Whether the peer announced support for `code`.
    pub fn peer_supports(&self, code: u8) -> bool {
        self.peer_suboptions.contains(&code)
    }
}

/// Interpret an identity payload as trimmed ASCII; empty fields are
/// ignored.
fn ascii_field(payload: &[u8]) -> Option<String> {
    let s = String::from_utf8_lossy(payload).trim().to_owned();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

// ── Vmotion builders ──────────────────────────────────────────────────────

/// Extend a VMOTION-BEGIN nonce into the full migration cookie by
/// appending a random secret.
pub fn make_cookie(nonce: &[u8]) -> Vec<u8> {
    let mut cookie = nonce.to_vec();
    let secret: [u8; VMOTION_SECRET_LEN] = rand::random();
    cookie.extend_from_slice(&secret);
    cookie
}

/// VMOTION-GOAHEAD: approval carrying the nonce plus the secret that the
/// migration target must present in VMOTION-PEER.
pub fn goahead(cookie: &[u8]) -> Vec<u8> {
    let mut data = vec![sub::VMOTION_GOAHEAD];
    data.extend_from_slice(cookie);
    build_subneg(VMWARE_EXT, &data)
}

/// VMOTION-NOTNOW: refusal, echoing the bare nonce.
pub fn notnow(nonce: &[u8]) -> Vec<u8> {
    let mut data = vec![sub::VMOTION_NOTNOW];
    data.extend_from_slice(nonce);
    build_subneg(VMWARE_EXT, &data)
}

/// VMOTION-PEER-OK: target accepted, echoing the full cookie.
pub fn peer_ok(cookie: &[u8]) -> Vec<u8> {
    let mut data = vec![sub::VMOTION_PEER_OK];
    data.extend_from_slice(cookie);
    build_subneg(VMWARE_EXT, &data)
}

// ── Tests ─────────────────────────────────────────────────────────────────
