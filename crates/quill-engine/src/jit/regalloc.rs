//! Linear-scan register allocation
//!
//! Walks the trace in IR index order over two fixed physical banks (general
//! purpose and floating point). At each definition it frees registers whose
//! holder's last use precedes the index, assigns a free register, and when
//! the bank is exhausted spills the live vreg with the farthest next use to a
//! numbered spill slot. Spill slots live in the JIT's exit-state scratch
//! area, so the deopt handler can read them with the same indexing the
//! generated code uses.
//!
//! Vregs referenced by a guard's snapshot count as uses at the guard, which
//! keeps them readable at the exit that restores them.

use crate::jit::ir::{Imm, IrType, TraceBuffer, VReg};

/// Spill slots available in the exit-state scratch area.
pub const MAX_SPILL_SLOTS: u16 = 64;

/// Floating-point bank size (both architectures).
pub const NUM_FPR: u8 = 8;

/// Where a vreg lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// General-purpose register, by bank index.
    Gpr(u8),
    /// Floating-point register, by bank index.
    Fpr(u8),
    /// Spill slot in the exit-state scratch area.
    Spill(u16),
}

/// Allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegAllocError {
    /// More spill slots were needed than the scratch area holds.
    #[error("spill slots exhausted")]
    TooManySpills,
}

/// A mid-trace eviction: before the instruction at `at`, the value in `loc`
/// must be stored to spill slot `slot`.
#[derive(Debug, Clone, Copy)]
pub struct Eviction {
    /// IR index the eviction precedes.
    pub at: u32,
    /// The register being vacated.
    pub loc: Loc,
    /// Destination spill slot.
    pub slot: u16,
}

#[derive(Debug, Clone, Copy)]
struct VRegAlloc {
    loc: Loc,
    /// IR index from which the vreg lives in its spill slot instead.
    evicted_at: u32,
    spill: u16,
}

/// The computed allocation for one trace.
pub struct Allocation {
    vregs: Vec<VRegAlloc>,
    /// Eviction stores the code generator must materialize, in IR order.
    pub evictions: Vec<Eviction>,
    /// Number of spill slots used.
    pub spill_count: u16,
}

impl Allocation {
    /// Location of `v` as seen by the instruction at IR index `idx`.
    pub fn loc_at(&self, v: VReg, idx: u32) -> Loc {
        let a = &self.vregs[v.0 as usize];
        if idx >= a.evicted_at {
            Loc::Spill(a.spill)
        } else {
            a.loc
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Active {
    vreg: VReg,
    reg: u8,
}

struct Bank {
    free: Vec<u8>,
    active: Vec<Active>,
}

impl Bank {
    fn new(size: u8) -> Self {
        Bank {
            free: (0..size).rev().collect(),
            active: Vec::with_capacity(size as usize),
        }
    }
}

fn uses_of(buf: &TraceBuffer) -> Vec<Vec<u32>> {
    let mut uses: Vec<Vec<u32>> = vec![Vec::new(); buf.vreg_count()];
    for (idx, instr) in buf.instrs().iter().enumerate() {
        let idx = idx as u32;
        if instr.a.is_some() {
            uses[instr.a.0 as usize].push(idx);
        }
        if instr.b.is_some() {
            uses[instr.b.0 as usize].push(idx);
        }
        if let Imm::Snapshot(s) = instr.imm {
            for &(_, vreg, _) in &buf.snapshots()[s as usize].slots {
                uses[vreg.0 as usize].push(idx);
            }
        }
    }
    uses
}

fn next_use(uses: &[u32], after: u32) -> u32 {
    match uses.binary_search(&(after + 1)) {
        Ok(i) => uses[i],
        Err(i) => uses.get(i).copied().unwrap_or(u32::MAX),
    }
}

fn is_float(ty: IrType) -> bool {
    ty.is_float()
}

/// Allocate registers for a recorded trace with `num_gpr` general registers.
pub fn allocate(buf: &TraceBuffer, num_gpr: u8) -> Result<Allocation, RegAllocError> {
    let uses = uses_of(buf);
    let last_use: Vec<u32> = uses
        .iter()
        .map(|u| u.last().copied().unwrap_or(0))
        .collect();

    let mut vregs = vec![
        VRegAlloc {
            loc: Loc::Spill(0),
            evicted_at: u32::MAX,
            spill: 0,
        };
        buf.vreg_count()
    ];
    let mut gpr = Bank::new(num_gpr);
    let mut fpr = Bank::new(NUM_FPR);
    let mut evictions = Vec::new();
    let mut spill_count: u16 = 0;

    let take_spill = |spill_count: &mut u16| -> Result<u16, RegAllocError> {
        if *spill_count >= MAX_SPILL_SLOTS {
            return Err(RegAllocError::TooManySpills);
        }
        let s = *spill_count;
        *spill_count += 1;
        Ok(s)
    };

    for (idx, instr) in buf.instrs().iter().enumerate() {
        let idx = idx as u32;

        // Free registers whose holder's last use precedes this index.
        for bank in [&mut gpr, &mut fpr] {
            let mut i = 0;
            while i < bank.active.len() {
                let v = bank.active[i].vreg;
                if last_use[v.0 as usize] < idx {
                    bank.free.push(bank.active[i].reg);
                    bank.active.swap_remove(i);
                } else {
                    i += 1;
                }
            }
        }

        let dst = instr.dst;
        if !dst.is_some() {
            continue;
        }
        let ty = buf.vreg_type(dst);
        let float = is_float(ty);
        let bank = if float { &mut fpr } else { &mut gpr };

        if let Some(reg) = bank.free.pop() {
            vregs[dst.0 as usize] = VRegAlloc {
                loc: if float { Loc::Fpr(reg) } else { Loc::Gpr(reg) },
                evicted_at: u32::MAX,
                spill: 0,
            };
            bank.active.push(Active { vreg: dst, reg });
            continue;
        }

        // Bank exhausted: spill the candidate with the farthest next use.
        // Operands of this instruction (including vregs its snapshot needs)
        // are in use right now and cannot be victims.
        let used_now = |v: VReg| uses[v.0 as usize].binary_search(&idx).is_ok();
        let mut victim: Option<(usize, u32)> = None; // (active index, next use)
        for (i, act) in bank.active.iter().enumerate() {
            if used_now(act.vreg) {
                continue;
            }
            let nu = next_use(&uses[act.vreg.0 as usize], idx);
            if victim.map_or(true, |(_, best)| nu > best) {
                victim = Some((i, nu));
            }
        }

        let dst_next = next_use(&uses[dst.0 as usize], idx);

        match victim {
            Some((i, victim_next)) if victim_next > dst_next => {
                let act = bank.active[i];
                let slot = take_spill(&mut spill_count)?;
                let old = &mut vregs[act.vreg.0 as usize];
                evictions.push(Eviction {
                    at: idx,
                    loc: old.loc,
                    slot,
                });
                old.evicted_at = idx;
                old.spill = slot;

                vregs[dst.0 as usize] = VRegAlloc {
                    loc: if float { Loc::Fpr(act.reg) } else { Loc::Gpr(act.reg) },
                    evicted_at: u32::MAX,
                    spill: 0,
                };
                bank.active[i] = Active {
                    vreg: dst,
                    reg: act.reg,
                };
            }
            _ => {
                // The new vreg itself has the farthest next use: born spilled.
                let slot = take_spill(&mut spill_count)?;
                vregs[dst.0 as usize] = VRegAlloc {
                    loc: Loc::Spill(slot),
                    evicted_at: u32::MAX,
                    spill: slot,
                };
            }
        }
    }

    Ok(Allocation {
        vregs,
        evictions,
        spill_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{Imm, IrInstr, IrOp, Snapshot, TraceBuffer, VReg};

    fn const_int(buf: &mut TraceBuffer) -> VReg {
        let dst = buf.new_vreg(IrType::Int).unwrap();
        buf.emit(IrInstr {
            op: IrOp::ConstInt,
            ty: IrType::Int,
            dst,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: 0,
            imm: Imm::Int(1),
        })
        .unwrap();
        dst
    }

    fn add(buf: &mut TraceBuffer, a: VReg, b: VReg) -> VReg {
        let dst = buf.new_vreg(IrType::Int).unwrap();
        buf.emit(IrInstr {
            op: IrOp::AddInt,
            ty: IrType::Int,
            dst,
            a,
            b,
            aux: 0,
            imm: Imm::None,
        })
        .unwrap();
        dst
    }

    #[test]
    fn test_simple_allocation_no_spills() {
        let mut buf = TraceBuffer::new();
        let a = const_int(&mut buf);
        let b = const_int(&mut buf);
        let c = add(&mut buf, a, b);

        let alloc = allocate(&buf, 4).unwrap();
        assert_eq!(alloc.spill_count, 0);
        assert!(alloc.evictions.is_empty());
        assert!(matches!(alloc.loc_at(a, 0), Loc::Gpr(_)));
        assert!(matches!(alloc.loc_at(c, 2), Loc::Gpr(_)));
        // Distinct registers while all three overlap.
        let (la, lb) = (alloc.loc_at(a, 2), alloc.loc_at(b, 2));
        assert_ne!(la, lb);
    }

    #[test]
    fn test_register_reuse_after_last_use() {
        let mut buf = TraceBuffer::new();
        let a = const_int(&mut buf); // dies at idx 2
        let b = const_int(&mut buf); // dies at idx 2
        let c = add(&mut buf, a, b); // idx 2
        let d = const_int(&mut buf); // idx 3: a or b's register is free again
        let _e = add(&mut buf, c, d);

        let alloc = allocate(&buf, 2).unwrap();
        assert_eq!(alloc.spill_count, 0, "freed registers must be reused");
    }

    #[test]
    fn test_spill_under_pressure() {
        let mut buf = TraceBuffer::new();
        // Three overlapping live ranges in a two-register bank.
        let a = const_int(&mut buf);
        let b = const_int(&mut buf);
        let c = const_int(&mut buf);
        let ab = add(&mut buf, a, b);
        let _all = add(&mut buf, ab, c);

        let alloc = allocate(&buf, 2).unwrap();
        assert!(alloc.spill_count > 0, "two registers cannot hold three live vregs");
        // Something is readable from a spill slot when it is needed.
        let spilled = [a, b, c]
            .iter()
            .any(|&v| matches!(alloc.loc_at(v, 3), Loc::Spill(_)));
        assert!(spilled);
    }

    #[test]
    fn test_operands_never_evicted_at_their_use() {
        let mut buf = TraceBuffer::new();
        let a = const_int(&mut buf);
        let b = const_int(&mut buf);
        let c = add(&mut buf, a, b); // bank of 2 is full here; dst must not steal a or b
        let _d = add(&mut buf, c, c);

        let alloc = allocate(&buf, 2).unwrap();
        // At the add (idx 2), both operands must still be in registers.
        assert!(matches!(alloc.loc_at(a, 2), Loc::Gpr(_)));
        assert!(matches!(alloc.loc_at(b, 2), Loc::Gpr(_)));
    }

    #[test]
    fn test_snapshot_keeps_vreg_alive() {
        let mut buf = TraceBuffer::new();
        let kept = const_int(&mut buf); // idx 0; only "use" is via the snapshot
        let raw = buf.new_vreg(IrType::Raw).unwrap();
        buf.emit(IrInstr {
            op: IrOp::LoadLocal,
            ty: IrType::Raw,
            dst: raw,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: 0,
            imm: Imm::None,
        })
        .unwrap();
        let g = buf.new_vreg(IrType::Int).unwrap();
        buf.emit_guard(
            IrOp::GuardInt,
            IrType::Int,
            g,
            raw,
            Snapshot { pc: 0, slots: vec![(1, kept, IrType::Int)] },
            false,
        )
        .unwrap();

        let alloc = allocate(&buf, 4).unwrap();
        // `kept` must still be in its register at the guard (idx 2).
        assert!(matches!(alloc.loc_at(kept, 2), Loc::Gpr(_)));
    }

    #[test]
    fn test_double_bank_is_separate() {
        let mut buf = TraceBuffer::new();
        let i = const_int(&mut buf);
        let d = buf.new_vreg(IrType::Double).unwrap();
        buf.emit(IrInstr {
            op: IrOp::IntToDouble,
            ty: IrType::Double,
            dst: d,
            a: i,
            b: VReg::NONE,
            aux: 0,
            imm: Imm::None,
        })
        .unwrap();

        let alloc = allocate(&buf, 1).unwrap();
        assert!(matches!(alloc.loc_at(i, 1), Loc::Gpr(0)));
        assert!(matches!(alloc.loc_at(d, 1), Loc::Fpr(_)));
    }

    #[test]
    fn test_eviction_of_farthest_next_use() {
        let mut buf = TraceBuffer::new();
        // Defined early, used last: the farthest-next-use candidates.
        let c0 = const_int(&mut buf); // idx 0, used at idx 6
        let c1 = const_int(&mut buf); // idx 1, used at idx 5
        let c2 = const_int(&mut buf); // idx 2, used at idx 4
        let c3 = const_int(&mut buf); // idx 3, used at idx 4
        let s = add(&mut buf, c2, c3); // idx 4
        let s2 = add(&mut buf, s, c1); // idx 5
        let _s3 = add(&mut buf, s2, c0); // idx 6

        let alloc = allocate(&buf, 2).unwrap();
        assert!(!alloc.evictions.is_empty(), "pressure must evict someone");
        // Evictions are emitted in IR order for the code generator.
        for w in alloc.evictions.windows(2) {
            assert!(w[0].at <= w[1].at);
        }
        // The farthest user (c0) lost its register first and is read from
        // its spill slot at its use.
        assert!(matches!(alloc.loc_at(c0, 6), Loc::Spill(_)));
        // Before the eviction point it was still in a register.
        assert!(matches!(alloc.loc_at(c0, 1), Loc::Gpr(_)));
    }
}
