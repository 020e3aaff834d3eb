//! Profiling: hot-loop detection and bailout accounting
//!
//! The interpreter reports every taken back edge; the detector decides when a
//! loop header is hot enough to record. Bailout counters live on the compiled
//! traces themselves (see `jit::runtime`).

pub mod hotloop;

pub use hotloop::{HotLoopTable, SlotState};
