//! Compiled-trace records
//!
//! A compiled trace owns its IR, its executable region, and its side-exit
//! metadata. Parent/child links between a trace and its bridges are indices
//! into the trace array, never owning references; dropping a trace tears
//! down only its own executable pages.
//!
//! Lifecycle: Uncompiled → Recording → IR-complete → Installed(valid) →
//! Installed(invalid). The earlier states are transient (the recorder and
//! the compile pipeline); a `CompiledTrace` value exists only once
//! installed, and invalidation is a one-way flip of `valid`.

use quill_core::Value;

use crate::jit::backend::TraceCode;
use crate::jit::ir::{IrType, TraceBuffer};
use crate::jit::recorder::RecordedTrace;
use crate::jit::regalloc::Allocation;
use crate::jit::TraceId;

/// Runtime view of one side exit.
#[derive(Debug, Clone)]
pub struct SideExitRt {
    /// Snapshot restored when this exit fires.
    pub snapshot: u16,
    /// IR index of the guard owning this exit (locates vregs at deopt).
    pub guard_ir_idx: u32,
    /// Whether this exit is the loop's normal completion.
    pub is_loop_exit: bool,
    /// Native offset of the exit stub within the code region.
    pub stub_offset: u32,
    /// Bridge trace chained from this exit, once one is compiled.
    pub bridge: Option<TraceId>,
    /// Bridge recording from this exit failed hard; never retry it.
    pub no_bridge: bool,
    /// Times this exit has fired (drives bridge recording).
    pub fails: u32,
}

/// One installed trace.
pub struct CompiledTrace {
    /// Identity (index in the trace array).
    pub id: TraceId,
    /// Bytecode PC of the loop header (entry point).
    pub entry_pc: u32,
    /// Expected input types, re-checked before entering.
    pub entry_types: Vec<(u8, IrType)>,
    /// The owned IR (snapshots included).
    pub ir: TraceBuffer,
    /// The owned executable region and entry pointer.
    pub code: TraceCode,
    /// Register allocation, for deopt restore (None for fast-path traces,
    /// whose exits fire before any slot is written).
    pub alloc: Option<Allocation>,
    /// Side exits, in guard order.
    pub exits: Vec<SideExitRt>,
    /// Where the interpreter resumes after a clean return.
    pub clean_exit_pc: Option<u32>,
    /// Parent trace, for bridges.
    pub parent: Option<TraceId>,
    /// Bridges hanging off this trace's exits.
    pub children: Vec<TraceId>,
    /// Times the trace has been entered.
    pub executions: u64,
    /// Times a non-loop-exit guard fired (without a bridge taking over).
    pub bailouts: u64,
    /// Cleared on invalidation; the dispatcher stops entering the trace.
    pub valid: bool,
}

impl CompiledTrace {
    /// Assemble the runtime record from a recording and its compiled code.
    pub fn new(
        id: TraceId,
        recorded: RecordedTrace,
        code: TraceCode,
        alloc: Option<Allocation>,
        parent: Option<TraceId>,
    ) -> Self {
        // Locate each guard's IR index, in exit order.
        let mut guard_indices = Vec::with_capacity(recorded.buf.exits().len());
        for (idx, instr) in recorded.buf.instrs().iter().enumerate() {
            if instr.op.is_guard() {
                guard_indices.push(idx as u32);
            }
        }
        debug_assert_eq!(guard_indices.len(), recorded.buf.exits().len());

        let exits = recorded
            .buf
            .exits()
            .iter()
            .enumerate()
            .map(|(k, e)| SideExitRt {
                snapshot: e.snapshot,
                guard_ir_idx: guard_indices.get(k).copied().unwrap_or(0),
                is_loop_exit: e.is_loop_exit,
                stub_offset: code.stub_offsets.get(k).copied().unwrap_or(0),
                bridge: None,
                no_bridge: false,
                fails: 0,
            })
            .collect();

        CompiledTrace {
            id,
            entry_pc: recorded.header,
            entry_types: recorded.entry_types,
            ir: recorded.buf,
            code,
            alloc,
            exits,
            clean_exit_pc: recorded.clean_exit_pc,
            parent,
            children: Vec::new(),
            executions: 0,
            bailouts: 0,
            valid: true,
        }
    }

    /// Whether the live locals satisfy the trace's entry type signature.
    /// Entering with a mismatched signature would deoptimize immediately;
    /// the dispatcher interprets the iteration instead.
    pub fn signature_matches(&self, locals: &[Value]) -> bool {
        self.entry_types.iter().all(|&(slot, ty)| {
            locals
                .get(slot as usize)
                .and_then(|v| IrType::from_kind(v.kind()))
                .map_or(false, |live| live == ty)
        })
    }

    /// Flip the validity bit. The executable region is untouched (it stays
    /// byte-identical for the trace's lifetime); the dispatcher simply
    /// stops entering.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matching() {
        // Only the signature logic is exercised here; build the record by
        // hand without code.
        let types = vec![(0u8, IrType::Int), (2u8, IrType::Double)];
        let sig_ok = |locals: &[Value]| {
            types.iter().all(|&(slot, ty)| {
                locals
                    .get(slot as usize)
                    .and_then(|v| IrType::from_kind(v.kind()))
                    .map_or(false, |live| live == ty)
            })
        };

        assert!(sig_ok(&[Value::int(1), Value::nil(), Value::double(2.0)]));
        assert!(!sig_ok(&[Value::double(1.0), Value::nil(), Value::double(2.0)]));
        assert!(!sig_ok(&[Value::int(1)]));
    }
}
