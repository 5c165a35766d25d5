//! Reply stream decoding.
//!
//! One diagnostics dump produces a stream of datagrams, each holding one
//! or more concatenated netlink messages: per-connection diagnostics
//! records, a terminal NLMSG_DONE, or an NLMSG_ERROR. Decoding is pure;
//! blocking happens only at the receive call in the session.

use crate::error::{Error, Result};
use crate::sample::{Sample, SampleBuf, Stats};
use crate::wire::{
    AttrIter, INET_DIAG_INFO, INET_DIAG_MSG_LEN, NLMSG_HDRLEN, NlMsgHdr, nlmsg_align,
};

/// Outcome of decoding one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DumpStatus {
    /// More messages expected; receive again.
    Pending,
    /// Terminal done message seen; the dump is complete.
    Done,
}

/// Bytes of tcp_info needed to reach every field a sample carries
/// (min_rtt ends at offset 152).
const TCP_INFO_MIN_LEN: usize = 152;

/// Decode one datagram's worth of concatenated kernel messages.
///
/// Appends one sample per INET_DIAG_INFO attribute found, all stamped
/// with `tstamp_ns`, and updates `stats` for every message walked. An
/// error record fails the call with the kernel's code, or with
/// [`Error::NoData`] when the record is too short to carry one.
pub(crate) fn decode_datagram(
    data: &[u8],
    tstamp_ns: u64,
    samples: &mut SampleBuf,
    stats: &mut Stats,
) -> Result<DumpStatus> {
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= data.len() {
        let hdr = NlMsgHdr::from_bytes(&data[offset..])?;
        let msg_len = hdr.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || offset + msg_len > data.len() {
            break;
        }

        stats.msgs += 1;
        stats.msgs_len += msg_len;

        if hdr.is_done() {
            return Ok(DumpStatus::Done);
        }

        let msg = &data[offset..offset + msg_len];
        if hdr.is_error() {
            return Err(decode_error(msg));
        }

        stats.samples += decode_diag_record(msg, tstamp_ns, samples)?;

        offset += nlmsg_align(msg_len);
    }

    Ok(DumpStatus::Pending)
}

/// Turn an NLMSG_ERROR record into the call's failure.
fn decode_error(msg: &[u8]) -> Error {
    // The body is struct nlmsgerr, which starts with the error code.
    if msg.len() < NLMSG_HDRLEN + 4 {
        return Error::NoData { len: msg.len() };
    }

    let code = i32::from_ne_bytes([
        msg[NLMSG_HDRLEN],
        msg[NLMSG_HDRLEN + 1],
        msg[NLMSG_HDRLEN + 2],
        msg[NLMSG_HDRLEN + 3],
    ]);
    Error::from_errno(code)
}

/// Decode one per-connection diagnostics record, appending a sample per
/// extended-info attribute. Returns how many samples were appended.
fn decode_diag_record(msg: &[u8], tstamp_ns: u64, samples: &mut SampleBuf) -> Result<usize> {
    if msg.len() < NLMSG_HDRLEN + INET_DIAG_MSG_LEN {
        return Ok(0);
    }

    // struct inet_diag_msg: family/state/timer/retrans, then the sockid
    // (ports in network order, addresses as raw bytes).
    let body = &msg[NLMSG_HDRLEN..];
    let sport = u16::from_be_bytes([body[4], body[5]]);
    let dport = u16::from_be_bytes([body[6], body[7]]);
    let saddr = [body[8], body[9], body[10], body[11]];
    let daddr = [body[24], body[25], body[26], body[27]];

    let mut appended = 0;
    for (attr_type, info) in AttrIter::new(&body[INET_DIAG_MSG_LEN..]) {
        if attr_type != INET_DIAG_INFO || info.len() < TCP_INFO_MIN_LEN {
            continue;
        }

        samples.push(decode_tcp_info(
            info, tstamp_ns, saddr, sport, daddr, dport,
        ))?;
        appended += 1;
    }

    Ok(appended)
}

/// Pull the sampled fields out of a struct tcp_info payload.
///
/// Offsets follow the kernel struct layout; the payload is host byte
/// order, read verbatim.
fn decode_tcp_info(
    info: &[u8],
    tstamp_ns: u64,
    saddr: [u8; 4],
    sport: u16,
    daddr: [u8; 4],
    dport: u16,
) -> Sample {
    let u32_at = |off: usize| u32::from_ne_bytes([info[off], info[off + 1], info[off + 2], info[off + 3]]);
    let u64_at = |off: usize| {
        u64::from_ne_bytes([
            info[off],
            info[off + 1],
            info[off + 2],
            info[off + 3],
            info[off + 4],
            info[off + 5],
            info[off + 6],
            info[off + 7],
        ])
    };

    let snd_mss = u32_at(16);
    let snd_cwnd = u32_at(80);

    Sample {
        tstamp_ns,
        saddr,
        sport,
        daddr,
        dport,
        options: info[5],
        rtt_us: u32_at(68),
        min_rtt_us: u32_at(148),
        snd_cwnd_bytes: snd_cwnd.saturating_mul(snd_mss),
        pacing_rate_bps: u64_at(104),
        total_retrans: u32_at(100),
        bytes_acked: u64_at(120),
    }
}
