//! Hot-loop detector
//!
//! A fixed-capacity open-addressed table keyed by the loop header's byte
//! offset in the chunk. Each slot is an iteration counter until the header
//! either gets a trace installed or is marked permanently uncompilable.
//! The table size is a power of two so the hash folds with a bitmask; on a
//! full table the detector degrades gracefully and never signals.

use crate::jit::TraceId;

/// State of one tracked loop header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Still counting back edges toward the threshold.
    Counting(u32),
    /// A compiled trace is installed for this header.
    Compiled(TraceId),
    /// Recording or compilation failed in a way that will not change;
    /// never try this header again.
    Uncompilable,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Header byte offset + 1, so 0 means empty.
    key: u32,
    state: SlotState,
}

/// Open-addressed hot-loop table.
pub struct HotLoopTable {
    slots: Vec<Option<Slot>>,
    mask: usize,
    live: usize,
}

/// 64-bit integer mixer (splitmix64 finalizer).
#[inline]
fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

impl HotLoopTable {
    /// Default number of slots. Sized for the working set of loop headers in
    /// a single chunk; collisions degrade to interpretation, never to errors.
    pub const DEFAULT_CAPACITY: usize = 512;

    /// Create a table with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a table with `capacity` slots (rounded up to a power of two).
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.next_power_of_two().max(8);
        HotLoopTable {
            slots: vec![None; cap],
            mask: cap - 1,
            live: 0,
        }
    }

    fn probe(&self, header: u32) -> Option<usize> {
        let key = header + 1;
        let mut idx = (mix64(key as u64) as usize) & self.mask;
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Some(slot) if slot.key == key => return Some(idx),
                Some(_) => idx = (idx + 1) & self.mask,
                None => return Some(idx),
            }
        }
        None
    }

    /// Record a taken back edge for `header`. Returns `true` exactly when the
    /// counter crosses `threshold` and recording should start.
    pub fn count(&mut self, header: u32, threshold: u32) -> bool {
        let Some(idx) = self.probe(header) else {
            return false; // table full: stay in the interpreter
        };
        let key = header + 1;
        match &mut self.slots[idx] {
            None => {
                if self.live == self.slots.len() {
                    return false;
                }
                self.slots[idx] = Some(Slot {
                    key,
                    state: SlotState::Counting(1),
                });
                self.live += 1;
                threshold <= 1
            }
            Some(slot) => match &mut slot.state {
                SlotState::Counting(n) => {
                    *n += 1;
                    *n == threshold
                }
                // Installed traces are entered via lookup(); uncompilable
                // headers are silently ignored.
                SlotState::Compiled(_) | SlotState::Uncompilable => false,
            },
        }
    }

    /// The installed trace for `header`, if any.
    pub fn lookup(&self, header: u32) -> Option<TraceId> {
        let idx = self.probe(header)?;
        match self.slots[idx] {
            Some(Slot {
                state: SlotState::Compiled(id),
                ..
            }) => Some(id),
            _ => None,
        }
    }

    /// Current state of `header`, if tracked.
    pub fn state(&self, header: u32) -> Option<SlotState> {
        let idx = self.probe(header)?;
        match &self.slots[idx] {
            Some(slot) if slot.key == header + 1 => Some(slot.state),
            _ => None,
        }
    }

    fn set_state(&mut self, header: u32, state: SlotState) {
        let Some(idx) = self.probe(header) else {
            return;
        };
        let key = header + 1;
        let len = self.slots.len();
        match &mut self.slots[idx] {
            Some(slot) if slot.key == key => slot.state = state,
            None if self.live < len => {
                self.slots[idx] = Some(Slot { key, state });
                self.live += 1;
            }
            _ => {}
        }
    }

    /// Install a compiled trace for `header`.
    pub fn install(&mut self, header: u32, id: TraceId) {
        self.set_state(header, SlotState::Compiled(id));
    }

    /// Mark `header` permanently uncompilable.
    pub fn mark_uncompilable(&mut self, header: u32) {
        self.set_state(header, SlotState::Uncompilable);
    }

    /// Reset `header` to a fresh counter (transient recording abort).
    pub fn reset(&mut self, header: u32) {
        self.set_state(header, SlotState::Counting(0));
    }

    /// Forget everything (chunk reload).
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.live = 0;
    }
}

impl Default for HotLoopTable {
    fn default() -> Self {
        Self::new()
    }
}
