//! Sampling sessions over a NETLINK_SOCK_DIAG socket.
//!
//! A session owns one blocking socket configured at open time. Each
//! [`Session::sample`] call runs a complete dump exchange: send one
//! request for established IPv4 TCP sockets, then receive datagrams
//! until the kernel's done message.

use std::mem;
use std::os::fd::AsRawFd;
use std::time::Duration;

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};

use crate::error::{Error, Result};
use crate::filter::{self, PortRange};
use crate::parse::{self, DumpStatus};
use crate::probe::Capability;
use crate::sample::{SampleBuf, Stats};
use crate::wire::{
    INET_DIAG_INFO, INET_DIAG_REQ_BYTECODE, INET_DIAG_REQ_LEN, NLM_F_DUMP, NLM_F_REQUEST,
    NLMSG_HDRLEN, SOCK_DIAG_BY_FAMILY, TCP_ESTABLISHED, monotonic_ns,
};

/// Socket configuration for a sampling session.
///
/// Zero means kernel default for both receive buffer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Userspace receive buffer size per datagram.
    pub read_bufsize: usize,
    /// SO_RCVBUF to request, 0 to leave the kernel default.
    pub rcv_bufsize: u32,
    /// SO_RCVBUFFORCE to request (needs CAP_NET_ADMIN), 0 to skip.
    pub rcv_bufsize_force: u32,
    /// Receive timeout applied via SO_RCVTIMEO.
    pub rcv_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_bufsize: 32 * 1024,
            rcv_bufsize: 0,
            rcv_bufsize_force: 0,
            rcv_timeout: Duration::from_secs(1),
        }
    }
}

/// An open diagnostics socket plus the compiled port filter.
#[derive(Debug)]
pub struct Session {
    socket: Socket,
    read_bufsize: usize,
    rcv_bufsize: i32,
    filter: Option<Vec<u8>>,
}

impl Session {
    /// Open a session: create and bind the socket, apply `config`, and
    /// compile the port filter for the running kernel.
    ///
    /// Empty `local` and `remote` mean no filter; the dump returns every
    /// established IPv4 TCP socket. On error the partially configured
    /// socket is closed on drop.
    pub fn open(config: Config, local: &[PortRange], remote: &[PortRange]) -> Result<Self> {
        let mut socket = Socket::new(protocols::NETLINK_SOCK_DIAG)?;
        socket.bind(&SocketAddr::new(0, 0))?;

        set_rcv_timeout(&socket, config.rcv_timeout)?;
        if config.rcv_bufsize > 0 {
            set_sockopt_i32(&socket, libc::SO_RCVBUF, config.rcv_bufsize as i32)?;
        }
        if config.rcv_bufsize_force > 0 {
            set_sockopt_i32(&socket, libc::SO_RCVBUFFORCE, config.rcv_bufsize_force as i32)?;
        }
        let rcv_bufsize = get_sockopt_i32(&socket, libc::SO_RCVBUF)?;

        let filter = filter::compile(Capability::current(), local, remote)?;
        tracing::debug!(
            rcv_bufsize,
            filter_len = filter.as_ref().map_or(0, Vec::len),
            "session open"
        );

        Ok(Self {
            socket,
            read_bufsize: config.read_bufsize,
            rcv_bufsize,
            filter,
        })
    }

    /// Run one dump exchange, overwriting `samples` with this call's
    /// observations.
    ///
    /// Returns per-call counters. A receive timeout surfaces as an I/O
    /// error for which [`Error::is_timeout`] holds; the socket stays
    /// usable and the next call starts a fresh dump.
    pub fn sample(&mut self, samples: &mut SampleBuf) -> Result<Stats> {
        samples.clear();
        self.send_dump_request()?;

        let mut stats = Stats::default();
        let mut buf = BytesMut::with_capacity(self.read_bufsize);
        loop {
            buf.clear();
            self.socket.recv(&mut buf, 0)?;
            let tstamp_ns = monotonic_ns();
            if parse::decode_datagram(&buf, tstamp_ns, samples, &mut stats)? == DumpStatus::Done {
                tracing::trace!(
                    samples = stats.samples,
                    msgs = stats.msgs,
                    msgs_len = stats.msgs_len,
                    "dump complete"
                );
                return Ok(stats);
            }
        }
    }

    /// Effective SO_RCVBUF, as read back from the kernel (which doubles
    /// the requested value for bookkeeping).
    pub fn rcv_bufsize(&self) -> i32 {
        self.rcv_bufsize
    }

    /// Compiled filter program length in bytes, 0 when unfiltered.
    pub fn filter_len(&self) -> usize {
        self.filter.as_ref().map_or(0, Vec::len)
    }

    /// Close the socket, reporting any close error.
    ///
    /// Dropping a session also closes the socket, but silently.
    pub fn close(self) -> Result<()> {
        let Self { socket, .. } = self;
        let fd = socket.as_raw_fd();
        mem::forget(socket);
        // SAFETY: fd came from the forgotten socket, so this is the sole close.
        if unsafe { libc::close(fd) } == -1 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Build and send one inet_diag dump request.
    fn send_dump_request(&self) -> Result<()> {
        let filter_payload = self.filter.as_deref().unwrap_or(&[]);
        let mut msg_len = NLMSG_HDRLEN + INET_DIAG_REQ_LEN;
        if !filter_payload.is_empty() {
            msg_len += 4 + filter_payload.len();
        }

        let mut msg = Vec::with_capacity(msg_len);

        // struct nlmsghdr
        msg.extend_from_slice(&(msg_len as u32).to_ne_bytes());
        msg.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_ne_bytes());
        msg.extend_from_slice(&(NLM_F_REQUEST | NLM_F_DUMP).to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
        msg.extend_from_slice(&0u32.to_ne_bytes()); // pid

        // struct inet_diag_req_v2
        msg.push(libc::AF_INET as u8);
        msg.push(libc::IPPROTO_TCP as u8);
        msg.push(1 << (INET_DIAG_INFO - 1)); // idiag_ext
        msg.push(0); // pad
        msg.extend_from_slice(&(1u32 << TCP_ESTABLISHED).to_ne_bytes()); // idiag_states
        msg.extend_from_slice(&[0u8; 48]); // wildcard sockid

        if !filter_payload.is_empty() {
            // struct rtattr carrying the bytecode program
            msg.extend_from_slice(&((4 + filter_payload.len()) as u16).to_ne_bytes());
            msg.extend_from_slice(&INET_DIAG_REQ_BYTECODE.to_ne_bytes());
            msg.extend_from_slice(filter_payload);
        }

        self.socket.send(&msg, 0)?;
        Ok(())
    }
}

fn set_rcv_timeout(socket: &Socket, timeout: Duration) -> Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    // SAFETY: tv is a valid timeval for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            (&tv as *const libc::timeval).cast(),
            mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn set_sockopt_i32(socket: &Socket, opt: libc::c_int, value: i32) -> Result<()> {
    // SAFETY: value is a valid c_int for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            (&value as *const i32).cast(),
            mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn get_sockopt_i32(socket: &Socket, opt: libc::c_int) -> Result<i32> {
    let mut value: i32 = 0;
    let mut len = mem::size_of::<i32>() as libc::socklen_t;
    // SAFETY: value and len are valid out-pointers for the duration of the call.
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            opt,
            (&mut value as *mut i32).cast(),
            &mut len,
        )
    };
    if rc == -1 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(value)
}
