//! Admin protocol: wire types and framing.
//!
//! Every message is a 4-byte big-endian length followed by one JSON
//! document. The session is:
//!
//! 1. client sends its protocol version (bare integer), server answers
//!    with the version it speaks ([`PROTOCOL_VERSION`]);
//! 2. client sends a [`Request`] — a guest name (or null for "just list")
//!    and a lock-mode token;
//! 3. server answers with a [`Response`]. On `OK` the frame carries the
//!    applied lock mode and `seed_len`; exactly that many raw seed bytes
//!    follow, after which the socket is an ordinary telnet subscriber
//!    channel.
//!
//! Only this client and server need to agree on the encoding; the
//! hypervisor wire protocol is untouched by it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::registry::{LockMode, VmEntry};

/// Version of the admin protocol spoken by this server.
pub const PROTOCOL_VERSION: u32 = 2;

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed admin frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("admin frame of {0} bytes exceeds the {MAX_FRAME} byte limit")]
    FrameTooLarge(u32),
    #[error("server speaks admin protocol version {0}, not {PROTOCOL_VERSION}")]
    VersionMismatch(u32),
}

// ── Wire types ────────────────────────────────────────────────────────────

/// Attach/list request.
///
/// `lock_mode` stays a free-form token here so an unknown mode can be
/// answered with `LOCK_BAD` instead of a framing error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub vm_name: Option<String>,
    pub lock_mode: String,
}

/// Server verdict on a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    /// Attached; `seed_len` raw bytes of replay seed follow this frame.
    #[serde(rename = "OK")]
    Ok { applied: LockMode, seed_len: u32 },
    /// Unknown guest (or no name given); carries the full listing.
    #[serde(rename = "VM_NOTFOUND")]
    VmNotFound { vms: Vec<VmEntry> },
    /// The requested lock-mode token is not understood.
    #[serde(rename = "LOCK_BAD")]
    LockBad,
    /// An existing holder prevents this lock mode.
    #[serde(rename = "LOCK_FAILED")]
    LockFailed,
}

// ── Framing ───────────────────────────────────────────────────────────────

/// Write one length-prefixed JSON frame.
pub async fn write_frame<T, W>(w: &mut W, value: &T) -> Result<(), AdminError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value)?;
    w.write_all(&(body.len() as u32).to_be_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<T, R>(r: &mut R) -> Result<T, AdminError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(AdminError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────
