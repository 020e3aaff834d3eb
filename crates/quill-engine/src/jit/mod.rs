//! Tracing just-in-time compiler
//!
//! The JIT watches the dispatcher's back edges, records hot loops into typed
//! SSA trace IR, compiles them to native code with inline type guards, and
//! runs the result until a guard fails and control deoptimizes back to the
//! bytecode. Pipeline, leaves first:
//!
//! - `profiling`: the hot-loop detector
//! - `recorder`: bytecode → trace IR, guards, snapshots
//! - `ir`: the linear SSA trace representation
//! - `regalloc`: linear-scan allocation over fixed register banks
//! - `backend`: micro-assemblers (x86-64, AArch64), lowering, fast path,
//!   executable memory
//! - `runtime`: installed traces, execution, deoptimization
//!
//! [`JitContext`] is the single owned value the interpreter threads through
//! its main loop; there is no global state. Recording, compilation, and
//! installation are synchronous at the back edge that crossed the
//! threshold.

pub mod backend;
pub mod ir;
pub mod profiling;
pub mod recorder;
pub mod regalloc;
pub mod runtime;

use quill_core::Value;

use crate::bytecode::Chunk;
use backend::CodegenError;
use profiling::HotLoopTable;
use recorder::{RecordedTrace, Step, StepCtx, TraceKind, TraceRecorder};
use runtime::{CompiledTrace, ExitState, RunOutcome};

/// Identity of an installed trace: an index into the trace array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(pub u16);

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Configuration for the JIT.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Master switch; disabled means every entry point is a no-op.
    pub enabled: bool,
    /// Print recording, compilation, and deopt events to stderr.
    pub debug_trace: bool,
    /// Back-edge count at which a loop header becomes hot (default: 50).
    pub hot_threshold: u32,
    /// Maximum installed traces (default: 128).
    pub max_traces: usize,
    /// Executions before the bailout ratio is consulted (default: 16).
    pub bailout_min_executions: u64,
    /// Invalidate a trace once bailouts exceed this percentage of its
    /// executions (default: 25).
    pub bailout_percent: u64,
    /// Failures at one side exit before a bridge is recorded (default: 16).
    pub exit_hot_threshold: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            enabled: true,
            debug_trace: false,
            hot_threshold: 50,
            max_traces: 128,
            bailout_min_executions: 16,
            bailout_percent: 25,
            exit_hot_threshold: 16,
        }
    }
}

/// Why the JIT could not come up.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// The platform refused writable-then-executable memory; the VM runs
    /// interpreter-only.
    #[error("JIT unavailable: {0}")]
    Unavailable(#[from] CodegenError),
}

/// What the dispatcher should do at a taken back edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackEdgeAction {
    /// Keep interpreting.
    Continue,
    /// Run the installed trace for this header.
    ExecuteTrace(TraceId),
    /// Recording has begun; feed `record_step` from here on.
    StartRecording,
}

/// Whether recording wants to keep receiving steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    /// Recording continues.
    Continue,
    /// Recording finished or aborted.
    Stop,
}

/// Result of running a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Executed {
    /// Clean completion; resume interpretation at this PC.
    Done(usize),
    /// A guard failed; interpreter state is restored, resume at this PC.
    DeoptTo(usize),
}

/// The process-wide JIT state, owned by the VM and passed by reference
/// through the dispatch loop.
pub struct JitContext {
    config: JitConfig,
    hot: HotLoopTable,
    traces: Vec<CompiledTrace>,
    recorder: Option<TraceRecorder>,
    exit_state: Box<ExitState>,
    chunk_id: Option<usize>,
}

impl JitContext {
    /// Bring up the JIT. Probes the platform for executable memory once;
    /// failure is fatal here and the caller falls back to interpretation.
    pub fn new(config: JitConfig) -> Result<Self, JitError> {
        if config.enabled {
            backend::codebuf::probe()?;
        }
        Ok(JitContext {
            config,
            hot: HotLoopTable::new(),
            traces: Vec::new(),
            recorder: None,
            exit_state: ExitState::new(),
            chunk_id: None,
        })
    }

    /// Current configuration.
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Whether a recording is in flight.
    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Number of installed traces (valid or not).
    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    /// An installed trace, for inspection.
    pub fn trace(&self, id: TraceId) -> Option<&CompiledTrace> {
        self.traces.get(id.0 as usize)
    }

    /// Bind the chunk about to execute. A different chunk than last time
    /// invalidates every installed trace and resets the detector: stale
    /// native code must never run against fresh bytecode.
    pub fn bind_chunk(&mut self, chunk: &Chunk) {
        let id = chunk as *const Chunk as usize;
        if self.chunk_id != Some(id) {
            if self.chunk_id.is_some() {
                self.log(format_args!("chunk reload: invalidating all traces"));
                self.invalidate_all();
            }
            self.chunk_id = Some(id);
        }
    }

    /// Invalidate every trace and forget every header.
    pub fn invalidate_all(&mut self) {
        for t in &mut self.traces {
            t.invalidate();
        }
        self.hot.clear();
        self.recorder = None;
    }

    /// Called by the dispatcher on every taken back edge, after it has
    /// moved the PC to the loop header.
    pub fn on_back_edge(&mut self, header: u32, locals: &[Value]) -> BackEdgeAction {
        if !self.config.enabled || self.recorder.is_some() {
            return BackEdgeAction::Continue;
        }

        if let Some(id) = self.hot.lookup(header) {
            let trace = &self.traces[id.0 as usize];
            if trace.valid && trace.signature_matches(locals) {
                return BackEdgeAction::ExecuteTrace(id);
            }
            return BackEdgeAction::Continue;
        }

        if self.traces.len() < self.config.max_traces
            && self.hot.count(header, self.config.hot_threshold)
        {
            self.log(format_args!("recording loop at pc {header}"));
            self.recorder = Some(TraceRecorder::start_loop(header));
            return BackEdgeAction::StartRecording;
        }
        BackEdgeAction::Continue
    }

    /// Called by the dispatcher before executing each opcode while a
    /// recording is active.
    pub fn record_step(&mut self, ctx: &StepCtx<'_>) -> RecordAction {
        let Some(rec) = self.recorder.as_mut() else {
            return RecordAction::Stop;
        };
        match rec.step(ctx) {
            Ok(Step::Continue) => RecordAction::Continue,
            Ok(Step::Finished) => {
                let rec = self.recorder.take().unwrap();
                let recorded = rec.into_trace();
                self.install(recorded);
                RecordAction::Stop
            }
            Err(reason) => {
                let rec = self.recorder.take().unwrap();
                let header = rec.header();
                match rec.kind() {
                    TraceKind::Loop => {
                        if reason.is_hard() {
                            self.hot.mark_uncompilable(header);
                        } else {
                            self.hot.reset(header);
                        }
                    }
                    // A failed bridge leaves its parent installed; only the
                    // exit is blocked (or left to retry on a soft abort).
                    TraceKind::Bridge { parent, exit } => {
                        let e = &mut self.traces[parent.0 as usize].exits[exit as usize];
                        if reason.is_hard() {
                            e.no_bridge = true;
                        } else {
                            e.fails = 0;
                        }
                    }
                }
                self.log(format_args!(
                    "recording aborted at pc {header}: {reason}"
                ));
                RecordAction::Stop
            }
        }
    }

    /// Compile a finished recording and install the result. All failures
    /// are local: the trace is dropped and the header marked uncompilable.
    fn install(&mut self, recorded: RecordedTrace) {
        let header = recorded.header;
        let kind = recorded.kind;
        if self.traces.len() >= self.config.max_traces {
            match kind {
                TraceKind::Loop => self.hot.mark_uncompilable(header),
                TraceKind::Bridge { parent, exit } => {
                    self.traces[parent.0 as usize].exits[exit as usize].no_bridge = true;
                }
            }
            return;
        }
        match backend::compile_trace(&recorded, self.exit_state.base_ptr()) {
            Ok((code, alloc)) => {
                let id = TraceId(self.traces.len() as u16);
                let parent = match kind {
                    TraceKind::Bridge { parent, .. } => Some(parent),
                    TraceKind::Loop => None,
                };
                self.log(format_args!(
                    "compiled {} for pc {header}: {} IR ops, {} bytes{}",
                    id,
                    recorded.buf.instrs().len(),
                    code.buf.len(),
                    if code.fast_path { " (direct loop)" } else { "" },
                ));
                let trace = CompiledTrace::new(id, recorded, code, alloc, parent);
                self.traces.push(trace);

                match kind {
                    TraceKind::Loop => self.hot.install(header, id),
                    TraceKind::Bridge { parent, exit } => {
                        let p = &mut self.traces[parent.0 as usize];
                        p.exits[exit as usize].bridge = Some(id);
                        p.children.push(id);
                    }
                }
            }
            Err(err) => {
                match kind {
                    TraceKind::Loop => self.hot.mark_uncompilable(header),
                    TraceKind::Bridge { parent, exit } => {
                        self.traces[parent.0 as usize].exits[exit as usize].no_bridge = true;
                    }
                }
                self.log(format_args!("compilation failed for pc {header}: {err}"));
            }
        }
    }

    /// Run an installed trace, chaining through bridges, and hand back the
    /// PC to resume interpretation at.
    ///
    /// # Safety
    ///
    /// The pointers must reference the live frame slots, globals values,
    /// and constants of the chunk the trace was recorded against.
    pub unsafe fn execute(
        &mut self,
        id: TraceId,
        locals: *mut Value,
        globals: *mut Value,
        consts: *const Value,
    ) -> Executed {
        let mut cur = id;
        loop {
            let outcome = {
                let trace = &mut self.traces[cur.0 as usize];
                trace.executions += 1;
                runtime::executor::run(trace, locals, globals, consts)
            };

            match outcome {
                RunOutcome::Clean => {
                    let trace = &self.traces[cur.0 as usize];
                    let pc = trace.clean_exit_pc.unwrap_or(trace.entry_pc);
                    return Executed::Done(pc as usize);
                }
                RunOutcome::Exit(k) => {
                    // Chain into an installed bridge without re-entering the
                    // interpreter; slots are current (stores write through).
                    let bridge = self.traces[cur.0 as usize].exits[k as usize]
                        .bridge
                        .filter(|b| self.traces[b.0 as usize].valid);
                    if let Some(b) = bridge {
                        cur = b;
                        continue;
                    }

                    let pc = self.deopt(cur, k, locals);
                    return Executed::DeoptTo(pc as usize);
                }
            }
        }
    }

    /// Handle a guard failure on `trace`: account it, possibly begin bridge
    /// recording, restore interpreter state, and apply the bailout policy.
    unsafe fn deopt(&mut self, id: TraceId, exit: u16, locals: *mut Value) -> u32 {
        let can_record_bridge = self.recorder.is_none()
            && self.traces.len() < self.config.max_traces;
        let exit_hot_threshold = self.config.exit_hot_threshold;

        let trace = &mut self.traces[id.0 as usize];
        let is_loop_exit = trace.exits[exit as usize].is_loop_exit;
        if !is_loop_exit {
            trace.bailouts += 1;
            trace.exits[exit as usize].fails += 1;
        }

        let pc = runtime::restore_snapshot(
            &self.traces[id.0 as usize],
            exit,
            &self.exit_state,
            locals,
        );

        let trace = &self.traces[id.0 as usize];
        if !is_loop_exit {
            self.log(format_args!("{} deopt at exit {exit} -> pc {pc}", trace.id));
        }

        // A side exit that keeps firing becomes the entry of a bridge.
        if !is_loop_exit
            && can_record_bridge
            && trace.exits[exit as usize].bridge.is_none()
            && !trace.exits[exit as usize].no_bridge
            && trace.exits[exit as usize].fails >= exit_hot_threshold
        {
            let header = trace.entry_pc;
            self.log(format_args!(
                "recording bridge from {} exit {exit} at pc {pc}",
                trace.id
            ));
            self.recorder = Some(TraceRecorder::start_bridge(id, exit, header, pc));
            return pc;
        }

        // Repeated guard failure: invalidate past the configured ratio.
        let trace = &self.traces[id.0 as usize];
        if trace.executions >= self.config.bailout_min_executions
            && trace.bailouts * 100 > trace.executions * self.config.bailout_percent
        {
            let header = trace.entry_pc;
            self.log(format_args!(
                "{} exceeds bailout ratio ({}/{}); invalidating",
                trace.id, trace.bailouts, trace.executions
            ));
            self.invalidate_tree(id);
            self.hot.mark_uncompilable(header);
        }
        pc
    }

    /// Invalidate a trace and every bridge hanging off it.
    fn invalidate_tree(&mut self, id: TraceId) {
        let mut stack = vec![id];
        while let Some(t) = stack.pop() {
            let trace = &mut self.traces[t.0 as usize];
            if trace.valid {
                trace.invalidate();
                stack.extend(trace.children.iter().copied());
            }
        }
    }

    fn log(&self, args: std::fmt::Arguments<'_>) {
        if self.config.debug_trace {
            eprintln!("[jit] {args}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_creation() {
        let jit = JitContext::new(JitConfig::default());
        // On supported hosts the probe succeeds; elsewhere the JIT reports
        // itself unavailable rather than failing later.
        #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
        assert!(jit.is_ok());
        if let Ok(jit) = jit {
            assert_eq!(jit.trace_count(), 0);
            assert!(!jit.is_recording());
        }
    }

    #[test]
    fn test_disabled_jit_never_reacts() {
        let config = JitConfig {
            enabled: false,
            hot_threshold: 1,
            ..Default::default()
        };
        let mut jit = JitContext::new(config).unwrap();
        for _ in 0..100 {
            assert_eq!(jit.on_back_edge(0, &[]), BackEdgeAction::Continue);
        }
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_threshold_triggers_recording() {
        let config = JitConfig {
            hot_threshold: 3,
            ..Default::default()
        };
        let mut jit = JitContext::new(config).unwrap();
        assert_eq!(jit.on_back_edge(10, &[]), BackEdgeAction::Continue);
        assert_eq!(jit.on_back_edge(10, &[]), BackEdgeAction::Continue);
        assert_eq!(jit.on_back_edge(10, &[]), BackEdgeAction::StartRecording);
        assert!(jit.is_recording());
        // While recording, other back edges are ignored.
        assert_eq!(jit.on_back_edge(20, &[]), BackEdgeAction::Continue);
    }
}
