//! The trace buffer: flat, pre-sized storage for one trace
//!
//! Owns the instruction vector, vreg type descriptors, snapshot table, and
//! side-exit list for a single recording attempt. All emission is append-only
//! and bounded; exceeding any bound fails the emission, which the recorder
//! turns into an abort.

use super::instr::{Imm, IrInstr, IrOp, VReg};
use super::types::IrType;
use super::{MAX_SIDE_EXITS, MAX_SNAPSHOTS, MAX_TRACE_INSTRS, MAX_VREGS};

/// A trace capacity was exceeded during recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TraceLimitError {
    /// Instruction count hit [`MAX_TRACE_INSTRS`].
    #[error("trace too long")]
    Instrs,
    /// Virtual register count hit [`MAX_VREGS`].
    #[error("too many virtual registers")]
    VRegs,
    /// Snapshot count hit [`MAX_SNAPSHOTS`].
    #[error("too many snapshots")]
    Snapshots,
    /// Side-exit count hit [`MAX_SIDE_EXITS`].
    #[error("too many side exits")]
    SideExits,
}

/// Interpreter state recorded at one guard: the bytecode PC to resume at and
/// the slot/vreg/type triples sufficient to rebuild every local the
/// interpreter could read before the next bytecode.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Resume PC (the statement's sync point).
    pub pc: u32,
    /// (local slot, producing vreg, type) triples.
    pub slots: Vec<(u8, VReg, IrType)>,
}

/// A side exit: names its snapshot; the stub offset is filled in by the code
/// generator and the bridge link by the runtime when a bridge is installed.
#[derive(Debug, Clone)]
pub struct SideExit {
    /// Snapshot restored when this exit is taken.
    pub snapshot: u16,
    /// Whether this exit is the loop's normal completion path.
    pub is_loop_exit: bool,
}

/// Linear storage for one trace under construction.
#[derive(Debug)]
pub struct TraceBuffer {
    instrs: Vec<IrInstr>,
    vreg_types: Vec<IrType>,
    snapshots: Vec<Snapshot>,
    exits: Vec<SideExit>,
}

impl TraceBuffer {
    /// Create an empty buffer with all capacities reserved up front.
    pub fn new() -> Self {
        TraceBuffer {
            instrs: Vec::with_capacity(MAX_TRACE_INSTRS),
            vreg_types: Vec::with_capacity(MAX_VREGS),
            snapshots: Vec::with_capacity(MAX_SNAPSHOTS),
            exits: Vec::with_capacity(MAX_SIDE_EXITS),
        }
    }

    /// Allocate a fresh virtual register of the given type.
    pub fn new_vreg(&mut self, ty: IrType) -> Result<VReg, TraceLimitError> {
        if self.vreg_types.len() >= MAX_VREGS {
            return Err(TraceLimitError::VRegs);
        }
        let reg = VReg(self.vreg_types.len() as u16);
        self.vreg_types.push(ty);
        Ok(reg)
    }

    /// Append an instruction; returns its index.
    pub fn emit(&mut self, instr: IrInstr) -> Result<usize, TraceLimitError> {
        if self.instrs.len() >= MAX_TRACE_INSTRS {
            return Err(TraceLimitError::Instrs);
        }
        self.instrs.push(instr);
        Ok(self.instrs.len() - 1)
    }

    /// Append a snapshot; returns its index.
    pub fn add_snapshot(&mut self, snap: Snapshot) -> Result<u16, TraceLimitError> {
        if self.snapshots.len() >= MAX_SNAPSHOTS {
            return Err(TraceLimitError::Snapshots);
        }
        self.snapshots.push(snap);
        Ok((self.snapshots.len() - 1) as u16)
    }

    /// Append a side exit; returns its index.
    pub fn add_exit(&mut self, exit: SideExit) -> Result<u16, TraceLimitError> {
        if self.exits.len() >= MAX_SIDE_EXITS {
            return Err(TraceLimitError::SideExits);
        }
        self.exits.push(exit);
        Ok((self.exits.len() - 1) as u16)
    }

    /// Emit a guard: creates the snapshot and side exit, then the guard
    /// instruction referencing them. Returns the exit index.
    pub fn emit_guard(
        &mut self,
        op: IrOp,
        ty: IrType,
        dst: VReg,
        a: VReg,
        snap: Snapshot,
        is_loop_exit: bool,
    ) -> Result<u16, TraceLimitError> {
        debug_assert!(op.is_guard());
        let snap_idx = self.add_snapshot(snap)?;
        let exit_idx = self.add_exit(SideExit {
            snapshot: snap_idx,
            is_loop_exit,
        })?;
        self.emit(IrInstr {
            op,
            ty,
            dst,
            a,
            b: VReg::NONE,
            aux: 0,
            imm: Imm::Snapshot(snap_idx),
        })?;
        Ok(exit_idx)
    }

    /// Instructions emitted so far.
    pub fn instrs(&self) -> &[IrInstr] {
        &self.instrs
    }

    /// Number of virtual registers allocated.
    pub fn vreg_count(&self) -> usize {
        self.vreg_types.len()
    }

    /// Type of a virtual register.
    pub fn vreg_type(&self, reg: VReg) -> IrType {
        self.vreg_types[reg.0 as usize]
    }

    /// Snapshot table.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Side-exit list.
    pub fn exits(&self) -> &[SideExit] {
        &self.exits
    }
}

impl Default for TraceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_instr(dst: VReg, a: VReg, b: VReg) -> IrInstr {
        IrInstr {
            op: IrOp::AddInt,
            ty: IrType::Int,
            dst,
            a,
            b,
            aux: 0,
            imm: Imm::None,
        }
    }

    #[test]
    fn test_vreg_allocation() {
        let mut buf = TraceBuffer::new();
        let r0 = buf.new_vreg(IrType::Int).unwrap();
        let r1 = buf.new_vreg(IrType::Double).unwrap();
        assert_eq!(r0, VReg(0));
        assert_eq!(r1, VReg(1));
        assert_eq!(buf.vreg_type(r0), IrType::Int);
        assert_eq!(buf.vreg_type(r1), IrType::Double);
    }

    #[test]
    fn test_vreg_limit() {
        let mut buf = TraceBuffer::new();
        for _ in 0..MAX_VREGS {
            buf.new_vreg(IrType::Int).unwrap();
        }
        assert_eq!(buf.new_vreg(IrType::Int), Err(TraceLimitError::VRegs));
    }

    #[test]
    fn test_instr_limit() {
        let mut buf = TraceBuffer::new();
        let r = buf.new_vreg(IrType::Int).unwrap();
        for _ in 0..MAX_TRACE_INSTRS {
            buf.emit(add_instr(r, r, r)).unwrap();
        }
        assert_eq!(buf.emit(add_instr(r, r, r)), Err(TraceLimitError::Instrs));
    }

    #[test]
    fn test_emit_guard_creates_snapshot_and_exit() {
        let mut buf = TraceBuffer::new();
        let raw = buf.new_vreg(IrType::Raw).unwrap();
        let dst = buf.new_vreg(IrType::Int).unwrap();
        let exit = buf
            .emit_guard(
                IrOp::GuardInt,
                IrType::Int,
                dst,
                raw,
                Snapshot { pc: 12, slots: vec![(0, dst, IrType::Int)] },
                false,
            )
            .unwrap();
        assert_eq!(exit, 0);
        assert_eq!(buf.snapshots().len(), 1);
        assert_eq!(buf.exits().len(), 1);
        assert_eq!(buf.snapshots()[0].pc, 12);
        assert_eq!(buf.instrs()[0].snapshot(), Some(0));
        // One snapshot per guard, and the exit names it.
        assert_eq!(buf.exits()[0].snapshot, 0);
    }

    #[test]
    fn test_snapshot_limit() {
        let mut buf = TraceBuffer::new();
        let raw = buf.new_vreg(IrType::Raw).unwrap();
        for _ in 0..MAX_SIDE_EXITS {
            buf.emit_guard(
                IrOp::GuardNil,
                IrType::Nil,
                VReg::NONE,
                raw,
                Snapshot { pc: 0, slots: vec![] },
                false,
            )
            .unwrap();
        }
        let err = buf.emit_guard(
            IrOp::GuardNil,
            IrType::Nil,
            VReg::NONE,
            raw,
            Snapshot { pc: 0, slots: vec![] },
            false,
        );
        assert_eq!(err, Err(TraceLimitError::SideExits));
    }
}
