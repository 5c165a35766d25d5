//! Error types for diagnostics operations.

use std::collections::TryReserveError;
use std::io;

/// Result type for diagnostics operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during diagnostics operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations (create, option, send, receive).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error record in the reply stream.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value reported by the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error record too short to carry an error code.
    #[error("truncated error record: {len} bytes")]
    NoData {
        /// Total length of the truncated record.
        len: usize,
    },

    /// Allocation failure while building a filter or growing a sample buffer.
    #[error("allocation failed: {0}")]
    Alloc(#[from] TryReserveError),

    /// Kernel release string could not be read or parsed.
    ///
    /// Non-fatal: callers fall back to [`Capability::fallback`]
    /// (range comparisons only).
    ///
    /// [`Capability::fallback`]: crate::probe::Capability::fallback
    #[error("kernel version unreadable: {0}")]
    VersionUnreadable(String),
}

impl Error {
    /// Create a kernel error from a negated errno value, as carried by
    /// NLMSG_ERROR records.
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } => matches!(*errno, libc::EPERM | libc::EACCES),
            Self::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Check if this is a receive timeout (EAGAIN/EWOULDBLOCK from a
    /// blocking receive bounded by `SO_RCVTIMEO`).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}
