//! Netlink and inet_diag wire layout.
//!
//! Fixed-size headers mirror their kernel counterparts and are read and
//! written with zerocopy; everything is native byte order on the wire
//! except ports and addresses, which the kernel stores in network order.

use crate::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink message alignment.
pub const NLMSG_ALIGNTO: usize = 4;

/// Align a length to NLMSG_ALIGNTO boundary.
#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = nlmsg_align(std::mem::size_of::<NlMsgHdr>());

/// Netlink message header (mirrors struct nlmsghdr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Length of message including header.
    pub nlmsg_len: u32,
    /// Message type.
    pub nlmsg_type: u16,
    /// Additional flags.
    pub nlmsg_flags: u16,
    /// Sequence number.
    pub nlmsg_seq: u32,
    /// Sending process port ID.
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Parse a header from the front of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data).map(|(r, _)| r).map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short netlink header",
            ))
        })
    }

    /// Check if this is a terminal done message.
    pub fn is_done(&self) -> bool {
        self.nlmsg_type == NLMSG_DONE
    }

    /// Check if this is an error message.
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == NLMSG_ERROR
    }
}

/// Netlink attribute header (mirrors struct nlattr / struct rtattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header.
    pub nla_len: u16,
    /// Attribute type.
    pub nla_type: u16,
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4;

/// Iterator over netlink attributes in a buffer.
///
/// Yields `(attribute type, payload)` pairs and stops at the first
/// malformed length.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }

        let attr = NlAttr::ref_from_prefix(self.data).map(|(r, _)| r).ok()?;
        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN || len > self.data.len() {
            return None;
        }

        let payload = &self.data[NLA_HDRLEN..len];
        let aligned = nlmsg_align(len);

        if aligned >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned..];
        }

        Some((attr.nla_type, payload))
    }
}

// Netlink message types and flags.
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// Socket diagnostics constants (linux/sock_diag.h, linux/inet_diag.h).
pub const SOCK_DIAG_BY_FAMILY: u16 = 20;
pub const INET_DIAG_INFO: u16 = 2;
pub const INET_DIAG_REQ_BYTECODE: u16 = 1;

/// Size of struct inet_diag_req_v2 (1+1+1+1+4 + sockid).
pub const INET_DIAG_REQ_LEN: usize = 56;
/// Size of struct inet_diag_msg up to the attribute list (1+1+1+1 + sockid + 5*4).
pub const INET_DIAG_MSG_LEN: usize = 72;

/// TCP_ESTABLISHED from net/tcp_states.h.
pub const TCP_ESTABLISHED: u32 = 1;

/// Monotonic clock reading in nanoseconds.
///
/// Used to stamp every sample decoded from one received datagram with a
/// single receipt time.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC cannot fail on Linux.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}
