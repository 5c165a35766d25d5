//! Kernel bytecode filter compiler.
//!
//! inet_diag requests may carry an INET_DIAG_REQ_BYTECODE attribute: a
//! small program of fixed-size compare/jump instructions the kernel runs
//! against every candidate socket. This module compiles two lists of
//! port ranges (local, then remote) into that program.
//!
//! Each range becomes one alternative: a single equality comparison when
//! the kernel supports it and the range is one port, otherwise a >= low
//! and <= high pair. Alternatives within a chain are OR'd together;
//! every interior alternative is followed by an unconditional jump to
//! the end of its chain. All offsets point strictly forward, and the
//! kernel treats running exactly off the end of the program as accept
//! and overshooting it as reject.
//!
//! Instructions are built as typed records with slot-indexed offsets and
//! only serialized to byte-offset `inet_diag_bc_op` form at the end.

use zerocopy::{Immutable, IntoBytes};

use crate::error::Result;
use crate::probe::Capability;

// Bytecode opcodes (linux/inet_diag.h).
pub const INET_DIAG_BC_JMP: u8 = 1;
pub const INET_DIAG_BC_S_GE: u8 = 2;
pub const INET_DIAG_BC_S_LE: u8 = 3;
pub const INET_DIAG_BC_D_GE: u8 = 4;
pub const INET_DIAG_BC_D_LE: u8 = 5;
pub const INET_DIAG_BC_S_EQ: u8 = 11;
pub const INET_DIAG_BC_D_EQ: u8 = 12;

/// One serialized bytecode instruction (mirrors struct inet_diag_bc_op).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, IntoBytes, Immutable)]
pub struct BcOp {
    /// Opcode, or zero for an operand slot.
    pub code: u8,
    /// Forward byte offset taken on match.
    pub yes: u8,
    /// Forward byte offset taken on no-match; doubles as the immediate
    /// operand in value slots.
    pub no: u16,
}

/// Size of one instruction slot in bytes.
pub const BC_OP_LEN: usize = std::mem::size_of::<BcOp>();

/// An inclusive port range. A single port is `lo == hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    /// Range covering `lo..=hi`.
    pub fn new(lo: u16, hi: u16) -> Self {
        Self { lo, hi }
    }

    /// Range covering exactly one port.
    pub fn single(port: u16) -> Self {
        Self { lo: port, hi: port }
    }

    /// Check if `port` falls within the range.
    pub fn contains(&self, port: u16) -> bool {
        self.lo <= port && port <= self.hi
    }
}

impl From<u16> for PortRange {
    fn from(port: u16) -> Self {
        Self::single(port)
    }
}

impl From<(u16, u16)> for PortRange {
    fn from((lo, hi): (u16, u16)) -> Self {
        Self::new(lo, hi)
    }
}

impl From<std::ops::RangeInclusive<u16>> for PortRange {
    fn from(r: std::ops::RangeInclusive<u16>) -> Self {
        Self::new(*r.start(), *r.end())
    }
}

/// Which port of the connection a chain compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

impl Side {
    fn eq_op(self) -> u8 {
        match self {
            Side::Local => INET_DIAG_BC_S_EQ,
            Side::Remote => INET_DIAG_BC_D_EQ,
        }
    }

    fn ge_op(self) -> u8 {
        match self {
            Side::Local => INET_DIAG_BC_S_GE,
            Side::Remote => INET_DIAG_BC_D_GE,
        }
    }

    fn le_op(self) -> u8 {
        match self {
            Side::Local => INET_DIAG_BC_S_LE,
            Side::Remote => INET_DIAG_BC_D_LE,
        }
    }
}

/// A typed instruction with offsets counted in slots, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Instr {
    /// Comparison against the immediate in the following operand slot.
    /// On match, advances past that slot; on no-match, skips `no_skip`
    /// slots forward.
    Cmp { code: u8, no_skip: usize },
    /// Operand slot carrying a port value.
    Imm(u16),
    /// Unconditional forward jump of `skip` slots.
    Jmp { skip: usize },
}

/// Number of instruction slots one chain compiles to.
///
/// Three per equality-optimized alternative, five per range alternative,
/// minus one because only interior alternatives carry a trailing jump.
fn chain_len(cap: Capability, ranges: &[PortRange]) -> usize {
    if ranges.is_empty() {
        return 0;
    }

    let slots: usize = ranges
        .iter()
        .map(|r| if cap.port_eq && r.lo == r.hi { 3 } else { 5 })
        .sum();
    slots - 1
}

/// Emit one OR chain of alternatives for `ranges`.
///
/// `rem` is the number of slots remaining after this chain; the last
/// alternative folds it into its failure offsets so that failing the
/// whole chain jumps past everything that follows.
fn emit_chain(prog: &mut Vec<Instr>, cap: Capability, ranges: &[PortRange], side: Side, rem: usize) {
    let end = prog.len() + chain_len(cap, ranges);

    for (i, range) in ranges.iter().enumerate() {
        let last = i == ranges.len() - 1;
        let tail = if last { rem } else { 0 };

        if cap.port_eq && range.lo == range.hi {
            prog.push(Instr::Cmp {
                code: side.eq_op(),
                no_skip: tail + 3,
            });
            prog.push(Instr::Imm(range.lo));
        } else {
            prog.push(Instr::Cmp {
                code: side.ge_op(),
                no_skip: tail + 5,
            });
            prog.push(Instr::Imm(range.lo));
            prog.push(Instr::Cmp {
                code: side.le_op(),
                no_skip: tail + 3,
            });
            prog.push(Instr::Imm(range.hi));
        }

        if !last {
            prog.push(Instr::Jmp {
                skip: end - prog.len(),
            });
        }
    }
}

/// Serialize the typed program, converting slot offsets to byte offsets.
fn serialize(prog: &[Instr]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.try_reserve_exact(prog.len() * BC_OP_LEN)?;

    for instr in prog {
        let op = match *instr {
            Instr::Cmp { code, no_skip } => BcOp {
                code,
                yes: (2 * BC_OP_LEN) as u8,
                no: (no_skip * BC_OP_LEN) as u16,
            },
            Instr::Imm(port) => BcOp {
                code: 0,
                yes: 0,
                no: port,
            },
            Instr::Jmp { skip } => BcOp {
                code: INET_DIAG_BC_JMP,
                yes: BC_OP_LEN as u8,
                no: (skip * BC_OP_LEN) as u16,
            },
        };
        out.extend_from_slice(op.as_bytes());
    }

    Ok(out)
}

/// Compile port-range lists into a kernel bytecode program.
///
/// The local-port chain is emitted first, then the remote-port chain.
/// Returns `None` when both lists are empty: no filter, the kernel dumps
/// every matching-state socket.
pub fn compile(
    cap: Capability,
    local: &[PortRange],
    remote: &[PortRange],
) -> Result<Option<Vec<u8>>> {
    if local.is_empty() && remote.is_empty() {
        return Ok(None);
    }

    let remote_len = chain_len(cap, remote);
    let mut prog = Vec::with_capacity(chain_len(cap, local) + remote_len);

    emit_chain(&mut prog, cap, local, Side::Local, remote_len);
    emit_chain(&mut prog, cap, remote, Side::Remote, 0);

    serialize(&prog).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EQ: Capability = Capability { port_eq: true };
    const NO_EQ: Capability = Capability::fallback();

    /// Minimal interpreter with the kernel's bytecode semantics
    /// (net/ipv4/inet_diag.c, inet_diag_bc_run): walk forward by the
    /// yes or no offset; ending exactly at the program end accepts,
    /// jumping past it rejects.
    fn run(prog: &[u8], sport: u16, dport: u16) -> bool {
        let mut off = 0usize;

        while off < prog.len() {
            let code = prog[off];
            let yes_off = prog[off + 1] as usize;
            let no_off = u16::from_ne_bytes([prog[off + 2], prog[off + 3]]) as usize;
            let imm = || u16::from_ne_bytes([prog[off + 6], prog[off + 7]]);

            let matched = match code {
                INET_DIAG_BC_JMP => false,
                INET_DIAG_BC_S_GE => sport >= imm(),
                INET_DIAG_BC_S_LE => sport <= imm(),
                INET_DIAG_BC_D_GE => dport >= imm(),
                INET_DIAG_BC_D_LE => dport <= imm(),
                INET_DIAG_BC_S_EQ => sport == imm(),
                INET_DIAG_BC_D_EQ => dport == imm(),
                other => panic!("unexpected opcode {other}"),
            };

            off += if matched { yes_off } else { no_off };
        }

        // Every offset is forward and a multiple of the op size, so a
        // terminating program lands exactly on the end iff it accepts.
        off == prog.len()
    }

    fn ranges(rs: &[(u16, u16)]) -> Vec<PortRange> {
        rs.iter().map(|&(lo, hi)| PortRange::new(lo, hi)).collect()
    }

    fn opcodes(prog: &[u8]) -> Vec<u8> {
        prog.chunks_exact(BC_OP_LEN).map(|op| op[0]).collect()
    }

    #[test]
    fn test_empty_inputs_yield_no_filter() {
        assert_eq!(compile(EQ, &[], &[]).unwrap(), None);
    }

    /// Independent slot count: three per equality alternative, five per
    /// range alternative, one fewer jump than alternatives.
    fn expected_slots(cap: Capability, rs: &[PortRange]) -> usize {
        if rs.is_empty() {
            return 0;
        }
        rs.iter()
            .map(|r| if cap.port_eq && r.lo == r.hi { 3 } else { 5 })
            .sum::<usize>()
            - 1
    }

    #[test]
    fn test_instruction_count_matches_formula() {
        for cap in [EQ, NO_EQ] {
            for local in [
                ranges(&[]),
                ranges(&[(80, 80)]),
                ranges(&[(80, 90), (443, 443)]),
                ranges(&[(1, 10), (20, 30), (40, 40)]),
            ] {
                for remote in [ranges(&[]), ranges(&[(5201, 5210)]), ranges(&[(22, 22)])] {
                    if local.is_empty() && remote.is_empty() {
                        continue;
                    }
                    let prog = compile(cap, &local, &remote).unwrap().unwrap();
                    let want = expected_slots(cap, &local) + expected_slots(cap, &remote);
                    assert_eq!(prog.len(), want * BC_OP_LEN);
                }
            }
        }
    }

    #[test]
    fn test_equality_form_requires_capability_and_single_port() {
        let prog = compile(EQ, &[PortRange::single(80)], &[]).unwrap().unwrap();
        assert_eq!(opcodes(&prog), vec![INET_DIAG_BC_S_EQ, 0]);

        // Same input without the capability compiles to the range form.
        let prog = compile(NO_EQ, &[PortRange::single(80)], &[])
            .unwrap()
            .unwrap();
        assert_eq!(
            opcodes(&prog),
            vec![INET_DIAG_BC_S_GE, 0, INET_DIAG_BC_S_LE, 0]
        );

        // A real range never uses the equality form.
        let prog = compile(EQ, &[PortRange::new(80, 90)], &[]).unwrap().unwrap();
        assert_eq!(
            opcodes(&prog),
            vec![INET_DIAG_BC_S_GE, 0, INET_DIAG_BC_S_LE, 0]
        );
    }

    #[test]
    fn test_remote_chain_uses_dst_ops() {
        let prog = compile(EQ, &[], &[PortRange::new(5201, 5210), PortRange::single(22)])
            .unwrap()
            .unwrap();
        assert_eq!(
            opcodes(&prog),
            vec![
                INET_DIAG_BC_D_GE,
                0,
                INET_DIAG_BC_D_LE,
                0,
                INET_DIAG_BC_JMP,
                INET_DIAG_BC_D_EQ,
                0,
            ]
        );
    }

    #[test]
    fn test_single_range_boundaries() {
        for cap in [EQ, NO_EQ] {
            let prog = compile(cap, &ranges(&[(1000, 2000)]), &[]).unwrap().unwrap();
            assert!(run(&prog, 1000, 0));
            assert!(run(&prog, 1500, 0));
            assert!(run(&prog, 2000, 0));
            assert!(!run(&prog, 999, 0));
            assert!(!run(&prog, 2001, 0));
        }
    }

    #[test]
    fn test_single_port_boundaries() {
        for cap in [EQ, NO_EQ] {
            let prog = compile(cap, &[PortRange::single(443)], &[]).unwrap().unwrap();
            assert!(run(&prog, 443, 0));
            assert!(!run(&prog, 442, 0));
            assert!(!run(&prog, 444, 0));
        }
    }

    #[test]
    fn test_multi_range_or_with_gaps() {
        for cap in [EQ, NO_EQ] {
            let rs = ranges(&[(10, 20), (80, 80), (100, 200)]);
            let prog = compile(cap, &rs, &[]).unwrap().unwrap();

            for port in [10, 15, 20, 80, 100, 150, 200] {
                assert!(run(&prog, port, 0), "port {port} should match");
            }
            for port in [9, 21, 50, 79, 81, 99, 201, 65535] {
                assert!(!run(&prog, port, 0), "port {port} should not match");
            }

            // Accept or reject is port-membership exactly, over the
            // whole space.
            for port in 0..=1000u16 {
                let want = rs.iter().any(|r| r.contains(port));
                assert_eq!(run(&prog, port, 0), want, "port {port}");
            }
        }
    }

    #[test]
    fn test_remote_only_chain() {
        let prog = compile(EQ, &[], &ranges(&[(5201, 5205), (22, 22)]))
            .unwrap()
            .unwrap();
        for port in [5201, 5203, 5205, 22] {
            assert!(run(&prog, 0, port));
        }
        for port in [21, 23, 5200, 5206] {
            assert!(!run(&prog, 0, port));
        }
    }

    #[test]
    fn test_mixed_equality_and_range_chain() {
        // One equality alternative followed by one range alternative,
        // and the reverse, under both capability settings.
        for cap in [EQ, NO_EQ] {
            for rs in [ranges(&[(443, 443), (8000, 8100)]), ranges(&[(8000, 8100), (443, 443)])] {
                let prog = compile(cap, &rs, &[]).unwrap().unwrap();
                for port in 0..=9000u16 {
                    let want = rs.iter().any(|r| r.contains(port));
                    assert_eq!(run(&prog, port, 0), want, "port {port}");
                }
            }
        }
    }

    #[test]
    fn test_both_chains_are_conjunctive() {
        // With both lists populated the kernel evaluates the remote
        // chain after a local match, so both sides must match. Callers
        // wanting "either port" pass one combined list per side.
        let prog = compile(EQ, &[PortRange::single(80)], &[PortRange::single(5201)])
            .unwrap()
            .unwrap();
        assert!(run(&prog, 80, 5201));
        assert!(!run(&prog, 80, 9999));
        assert!(!run(&prog, 81, 5201));
        assert!(!run(&prog, 81, 9999));
    }

    #[test]
    fn test_mixed_chains_both_sides() {
        for cap in [EQ, NO_EQ] {
            let local = ranges(&[(80, 80), (8000, 8010)]);
            let remote = ranges(&[(5201, 5203), (22, 22)]);
            let prog = compile(cap, &local, &remote).unwrap().unwrap();

            for sport in [79, 80, 81, 7999, 8000, 8010, 8011] {
                for dport in [21, 22, 23, 5200, 5201, 5203, 5204] {
                    let want = local.iter().any(|r| r.contains(sport))
                        && remote.iter().any(|r| r.contains(dport));
                    assert_eq!(run(&prog, sport, dport), want, "{sport} -> {dport}");
                }
            }
        }
    }

    #[test]
    fn test_offsets_are_forward_slot_multiples() {
        let prog = compile(NO_EQ, &ranges(&[(1, 2), (3, 4), (5, 6)]), &ranges(&[(7, 8)]))
            .unwrap()
            .unwrap();
        for (i, op) in prog.chunks_exact(BC_OP_LEN).enumerate() {
            let code = op[0];
            let yes = op[1] as usize;
            let no = u16::from_ne_bytes([op[2], op[3]]) as usize;
            if code == 0 {
                continue; // operand slot
            }
            assert_eq!(yes % BC_OP_LEN, 0, "op {i} yes offset");
            assert_eq!(no % BC_OP_LEN, 0, "op {i} no offset");
            assert!(yes > 0 || code == INET_DIAG_BC_JMP);
            assert!(no > 0);
        }
    }
}
