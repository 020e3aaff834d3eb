//! Trace IR pretty-printer, for the debug sink and tests.

use std::fmt;

use super::buffer::TraceBuffer;
use super::instr::{Imm, IrInstr};

fn fmt_instr(f: &mut fmt::Formatter<'_>, idx: usize, instr: &IrInstr) -> fmt::Result {
    write!(f, "{idx:4}  ")?;
    if instr.dst.is_some() {
        write!(f, "{}:{} = ", instr.dst, instr.ty)?;
    }
    write!(f, "{}", instr.op.name())?;
    if instr.a.is_some() {
        write!(f, " {}", instr.a)?;
    }
    if instr.b.is_some() {
        write!(f, " {}", instr.b)?;
    }
    match instr.op {
        super::instr::IrOp::LoadLocal
        | super::instr::IrOp::StoreLocal
        | super::instr::IrOp::LoadGlobal
        | super::instr::IrOp::StoreGlobal => write!(f, " [{}]", instr.aux)?,
        _ => {}
    }
    match instr.imm {
        Imm::None => {}
        Imm::Int(v) => write!(f, " #{v}")?,
        Imm::Double(v) => write!(f, " #{v}")?,
        Imm::Snapshot(s) => write!(f, " snap:{s}")?,
    }
    writeln!(f)
}

impl fmt::Display for TraceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, instr) in self.instrs().iter().enumerate() {
            fmt_instr(f, idx, instr)?;
        }
        for (i, snap) in self.snapshots().iter().enumerate() {
            write!(f, "snap:{i} pc={}", snap.pc)?;
            for (slot, reg, ty) in &snap.slots {
                write!(f, " [{slot}]={reg}:{ty}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::jit::ir::buffer::{Snapshot, TraceBuffer};
    use crate::jit::ir::instr::{Imm, IrInstr, IrOp, VReg};
    use crate::jit::ir::types::IrType;

    #[test]
    fn test_display_trace() {
        let mut buf = TraceBuffer::new();
        let raw = buf.new_vreg(IrType::Raw).unwrap();
        let val = buf.new_vreg(IrType::Int).unwrap();
        buf.emit(IrInstr {
            op: IrOp::LoadLocal,
            ty: IrType::Raw,
            dst: raw,
            a: VReg::NONE,
            b: VReg::NONE,
            aux: 2,
            imm: Imm::None,
        })
        .unwrap();
        buf.emit_guard(
            IrOp::GuardInt,
            IrType::Int,
            val,
            raw,
            Snapshot { pc: 7, slots: vec![(2, val, IrType::Int)] },
            false,
        )
        .unwrap();

        let text = format!("{buf}");
        assert!(text.contains("load_local"), "got: {text}");
        assert!(text.contains("guard.int"), "got: {text}");
        assert!(text.contains("snap:0 pc=7"), "got: {text}");
    }
}
