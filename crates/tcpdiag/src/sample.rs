//! Per-connection samples and the growable buffer they land in.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How many samples to add with each buffer growth.
pub const GROW_INCREMENT: usize = 4096;

/// One connection observation, decoded from an INET_DIAG_INFO attribute.
///
/// Immutable once created; ownership passes to the caller's
/// [`SampleBuf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Monotonic nanosecond timestamp on datagram receipt.
    pub tstamp_ns: u64,
    /// Local IP address, raw network-order bytes.
    pub saddr: [u8; 4],
    /// Local port (host order).
    pub sport: u16,
    /// Remote IP address, raw network-order bytes.
    pub daddr: [u8; 4],
    /// Remote port (host order).
    pub dport: u16,
    /// TCP options flags (TCPI_OPT_* in linux/tcp.h).
    pub options: u8,
    /// Round-trip time in microseconds.
    pub rtt_us: u32,
    /// Minimum round-trip time in microseconds.
    pub min_rtt_us: u32,
    /// Send congestion window in bytes (cwnd segments x mss).
    pub snd_cwnd_bytes: u32,
    /// Pacing rate in bytes per second.
    pub pacing_rate_bps: u64,
    /// Cumulative retransmit count.
    pub total_retrans: u32,
    /// Cumulative bytes acknowledged.
    pub bytes_acked: u64,
}

/// Per-call counters from one [`sample`] invocation. Not cumulative.
///
/// [`sample`]: crate::session::Session::sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Samples appended to the buffer.
    pub samples: usize,
    /// Kernel messages walked, the terminal done message included.
    pub msgs: usize,
    /// Summed byte length of those messages.
    pub msgs_len: usize,
}

/// Caller-owned growable sample storage.
///
/// Grows by exactly [`GROW_INCREMENT`] elements when full, preserving
/// contents; never shrinks. Reusing one buffer across many sampling
/// calls amortizes the growth.
#[derive(Debug, Default)]
pub struct SampleBuf {
    samples: Vec<Sample>,
}

impl SampleBuf {
    /// Create an empty buffer. The first push allocates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, growing the buffer first if it is full.
    ///
    /// Growth failure is reported as [`Error::Alloc`] and leaves the
    /// existing contents intact.
    ///
    /// [`Error::Alloc`]: crate::error::Error::Alloc
    pub fn push(&mut self, sample: Sample) -> Result<()> {
        if self.samples.len() == self.samples.capacity() {
            self.samples.try_reserve_exact(GROW_INCREMENT)?;
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Drop all samples, keeping the allocation for reuse.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Number of samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Check if the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Current capacity in samples.
    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    /// The samples as a slice.
    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    /// Iterate over the samples.
    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }
}

impl<'a> IntoIterator for &'a SampleBuf {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: u32) -> Sample {
        Sample {
            tstamp_ns: n as u64,
            saddr: [10, 0, 0, 1],
            sport: 5201,
            daddr: [10, 0, 0, 2],
            dport: 32768,
            options: 0,
            rtt_us: n,
            min_rtt_us: n,
            snd_cwnd_bytes: 10 * 1448,
            pacing_rate_bps: 12_500_000,
            total_retrans: 0,
            bytes_acked: 1,
        }
    }

    #[test]
    fn test_first_growth_is_one_increment() {
        let mut buf = SampleBuf::new();
        assert_eq!(buf.capacity(), 0);
        buf.push(sample(0)).unwrap();
        assert_eq!(buf.capacity(), GROW_INCREMENT);
    }

    #[test]
    fn test_growth_preserves_contents() {
        let mut buf = SampleBuf::new();
        for i in 0..(GROW_INCREMENT as u32 + 1) {
            buf.push(sample(i)).unwrap();
        }
        // One push past the increment triggers exactly one growth.
        assert_eq!(buf.len(), GROW_INCREMENT + 1);
        assert_eq!(buf.capacity(), 2 * GROW_INCREMENT);
        for (i, s) in buf.iter().enumerate() {
            assert_eq!(s.rtt_us, i as u32);
        }
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = SampleBuf::new();
        buf.push(sample(1)).unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), GROW_INCREMENT);
    }
}
