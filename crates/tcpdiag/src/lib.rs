//! TCP connection metrics sampling over netlink socket diagnostics.
//!
//! This crate takes point-in-time samples of established IPv4 TCP
//! connections using the kernel's NETLINK_SOCK_DIAG interface. Each
//! sampling call runs one inet_diag dump and decodes the per-connection
//! `tcp_info` payloads into [`Sample`] values: RTT, congestion window,
//! pacing rate, retransmits and bytes acked, stamped with a monotonic
//! receipt time.
//!
//! Connections can be restricted to local and remote port ranges with a
//! kernel-side bytecode filter, compiled to match what the running
//! kernel supports (port equality ops arrived in 4.16).
//!
//! # Example
//!
//! ```no_run
//! use tcpdiag::{Config, PortRange, SampleBuf, Session};
//!
//! # fn main() -> tcpdiag::Result<()> {
//! let mut session = Session::open(Config::default(), &[PortRange::single(5201)], &[])?;
//! let mut samples = SampleBuf::new();
//! let stats = session.sample(&mut samples)?;
//! for s in &samples {
//!     println!("{}:{} rtt={}us", s.sport, s.dport, s.rtt_us);
//! }
//! println!("{} samples in {} messages", stats.samples, stats.msgs);
//! session.close()
//! # }
//! ```

pub mod error;
pub mod filter;
pub mod probe;
pub mod sample;
pub mod session;
pub mod wire;

mod parse;

pub use error::{Error, Result};
pub use filter::PortRange;
pub use probe::Capability;
pub use sample::{GROW_INCREMENT, Sample, SampleBuf, Stats};
pub use session::{Config, Session};
