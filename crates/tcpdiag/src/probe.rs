//! Kernel capability probe.
//!
//! The port equality bytecode ops (INET_DIAG_BC_S_EQ / D_EQ) only exist
//! in kernels 4.16 and later. The probe parses the running kernel's
//! release string once; on older kernels (or when the release cannot be
//! read) single-port alternatives compile to the ge&le range form, which
//! every kernel accepts.

use std::ffi::CStr;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Kernel filter capabilities, established once per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Port equality comparison ops are available.
    pub port_eq: bool,
}

impl Capability {
    /// The safe fallback: no equality ops, ranges only.
    pub const fn fallback() -> Self {
        Self { port_eq: false }
    }

    /// Probe the running kernel.
    ///
    /// Returns [`Error::VersionUnreadable`] if the release string cannot
    /// be read or does not start with three numeric components. That
    /// failure is non-fatal; callers degrade to [`Capability::fallback`].
    pub fn probe() -> Result<Self> {
        Self::from_release(&kernel_release()?)
    }

    /// Derive capabilities from a `major.minor.patch` release string.
    pub fn from_release(release: &str) -> Result<Self> {
        let (major, minor, _patch) = parse_release(release)
            .ok_or_else(|| Error::VersionUnreadable(format!("cannot parse {release:?}")))?;

        Ok(Self {
            port_eq: major > 4 || (major == 4 && minor >= 16),
        })
    }

    /// The process-wide capability, probed on first use.
    ///
    /// The probe runs exactly once; a failed probe is logged and pinned
    /// to the fallback for the life of the process.
    pub fn current() -> Self {
        static CURRENT: OnceLock<Capability> = OnceLock::new();
        *CURRENT.get_or_init(|| match Self::probe() {
            Ok(cap) => {
                tracing::debug!(
                    port_eq = cap.port_eq,
                    "port equality filter op {}",
                    if cap.port_eq {
                        "supported"
                    } else {
                        "not supported, using ge&le"
                    }
                );
                cap
            }
            Err(e) => {
                tracing::warn!("capability probe failed, using ge&le filter ops: {e}");
                Self::fallback()
            }
        })
    }
}

/// Parse the leading `major.minor.patch` of a kernel release string.
///
/// The patch component may carry a non-numeric suffix ("5.4.0-generic").
fn parse_release(release: &str) -> Option<(u32, u32, u32)> {
    let mut parts = release.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let rest = parts.next()?;
    let digits = rest.split(|c: char| !c.is_ascii_digit()).next()?;
    let patch = digits.parse().ok()?;
    Some((major, minor, patch))
}

/// Read the kernel release string via uname(2).
fn kernel_release() -> Result<String> {
    // SAFETY: utsname is plain bytes; uname fills it or fails.
    let mut un: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut un) } == -1 {
        return Err(Error::VersionUnreadable(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    // SAFETY: uname null-terminates release within its 65-byte array.
    let release = unsafe { CStr::from_ptr(un.release.as_ptr()) };
    Ok(release.to_string_lossy().into_owned())
}
