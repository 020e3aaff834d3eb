//! Bytecode dispatcher
//!
//! A straight dispatch loop over the chunk: an operand stack whose low slots
//! are the current frame's locals, call frames, name-resolved globals, and a
//! capturable print sink. Three JIT hooks are threaded through the loop:
//! `bind_chunk` when a run starts, `record_step` before each opcode while a
//! recording is active, and `on_back_edge` at every taken `Loop` edge, which
//! may hand control to a compiled trace until it completes or deoptimizes.

use quill_core::Value;
use rustc_hash::FxHashMap;

use crate::bytecode::opcode::intrinsic;
use crate::bytecode::{Chunk, Opcode};
use crate::jit::recorder::StepCtx;
use crate::jit::{BackEdgeAction, Executed, JitConfig, JitContext};
use crate::vm::object::{Heap, Obj, ObjBody};
use crate::vm::{VmError, VmResult};

/// Global bindings: names resolve to stable indices into a values array, so
/// compiled traces can address globals by slot.
pub struct Globals {
    names: FxHashMap<Box<str>, u16>,
    /// The values array; traces receive its base pointer.
    pub values: Vec<Value>,
}

impl Globals {
    /// Empty bindings.
    pub fn new() -> Self {
        Globals {
            names: FxHashMap::default(),
            values: Vec::new(),
        }
    }

    /// Slot of a defined global.
    pub fn resolve(&self, name: &str) -> Option<u16> {
        self.names.get(name).copied()
    }

    /// Slot of `name`, defining it (as nil) on first sight.
    pub fn define(&mut self, name: &str) -> u16 {
        if let Some(&slot) = self.names.get(name) {
            return slot;
        }
        let slot = self.values.len() as u16;
        self.names.insert(name.into(), slot);
        self.values.push(Value::nil());
        slot
    }

    /// Value of a defined global.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.resolve(name).map(|s| self.values[s as usize])
    }
}

impl Default for Globals {
    fn default() -> Self {
        Self::new()
    }
}

/// VM tuning knobs.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Echo `Print` output to stdout in addition to capturing it.
    pub echo_output: bool,
    /// Operand stack depth limit.
    pub stack_limit: usize,
    /// Call depth limit.
    pub frame_limit: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions {
            echo_output: false,
            stack_limit: 4096,
            frame_limit: 256,
        }
    }
}

struct Frame {
    return_pc: usize,
    base: usize,
}

/// The virtual machine.
pub struct Vm {
    options: VmOptions,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    globals: Globals,
    heap: Heap,
    printed: Vec<String>,
    jit: Option<JitContext>,
}

impl Vm {
    /// Interpreter-only VM with default options.
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    /// Interpreter-only VM.
    pub fn with_options(options: VmOptions) -> Self {
        Vm {
            options,
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals: Globals::new(),
            heap: Heap::new(),
            printed: Vec::new(),
            jit: None,
        }
    }

    /// VM with the tracing JIT enabled. If the platform refuses executable
    /// memory the JIT reports itself unavailable and the VM silently runs
    /// interpreter-only.
    pub fn with_jit(config: JitConfig) -> Self {
        let mut vm = Self::new();
        vm.jit = JitContext::new(config).ok();
        vm
    }

    /// The JIT, when available.
    pub fn jit(&self) -> Option<&JitContext> {
        self.jit.as_ref()
    }

    /// Captured `Print` output.
    pub fn printed(&self) -> &[String] {
        &self.printed
    }

    /// Take the captured output, clearing the log.
    pub fn take_printed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.printed)
    }

    /// Value of a global, for inspection after a run.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name)
    }

    /// The operand stack, for inspection after a run.
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    fn base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.base)
    }

    fn push(&mut self, v: Value) -> VmResult<()> {
        if self.stack.len() >= self.options.stack_limit {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }

    fn peek(&self, depth: usize) -> VmResult<Value> {
        let n = self.stack.len();
        if depth >= n {
            return Err(VmError::StackUnderflow);
        }
        Ok(self.stack[n - 1 - depth])
    }

    fn slot_index(&self, slot: u8) -> VmResult<usize> {
        let idx = self.base() + slot as usize;
        if idx >= self.stack.len() {
            return Err(VmError::StackUnderflow);
        }
        Ok(idx)
    }

    fn constant_str<'a>(&self, chunk: &'a Chunk, idx: u8) -> VmResult<&'a str> {
        let v = chunk
            .constants
            .get(idx as usize)
            .copied()
            .ok_or(VmError::InvalidOpcode(0))?;
        obj_str(v).ok_or_else(|| VmError::TypeError("expected a string constant".into()))
    }

    /// Execute a chunk from its first byte.
    pub fn run(&mut self, chunk: &Chunk) -> VmResult<()> {
        self.stack.clear();
        self.frames.clear();
        if let Some(jit) = &mut self.jit {
            jit.bind_chunk(chunk);
        }

        let mut pc = 0usize;
        while pc < chunk.len() {
            if self.jit.as_ref().is_some_and(|j| j.is_recording()) {
                let base = self.base();
                let ctx = StepCtx {
                    pc,
                    chunk,
                    frame: &self.stack[base..],
                    globals: &self.globals,
                };
                self.jit.as_mut().unwrap().record_step(&ctx);
            }

            let op = chunk
                .op_at(pc)
                .ok_or(VmError::InvalidOpcode(chunk.code[pc]))?;
            match op {
                Opcode::Nop => pc += 1,
                Opcode::Pop => {
                    self.pop()?;
                    pc += 1;
                }
                Opcode::Dup => {
                    let top = self.peek(0)?;
                    self.push(top)?;
                    pc += 1;
                }
                Opcode::Nil => {
                    self.push(Value::nil())?;
                    pc += 1;
                }
                Opcode::True => {
                    self.push(Value::bool(true))?;
                    pc += 1;
                }
                Opcode::False => {
                    self.push(Value::bool(false))?;
                    pc += 1;
                }
                Opcode::Constant => {
                    let idx = chunk.read_u8(pc + 1) as usize;
                    let v = *chunk
                        .constants
                        .get(idx)
                        .ok_or(VmError::InvalidOpcode(op.to_u8()))?;
                    self.push(v)?;
                    pc += 2;
                }

                Opcode::GetLocal => {
                    let idx = self.slot_index(chunk.read_u8(pc + 1))?;
                    self.push(self.stack[idx])?;
                    pc += 2;
                }
                Opcode::SetLocal => {
                    let idx = self.slot_index(chunk.read_u8(pc + 1))?;
                    let v = self.pop()?;
                    self.stack[idx] = v;
                    pc += 2;
                }
                Opcode::GetGlobal => {
                    let name = self.constant_str(chunk, chunk.read_u8(pc + 1))?;
                    let slot = self
                        .globals
                        .resolve(name)
                        .ok_or_else(|| VmError::UndefinedGlobal(name.to_string()))?;
                    self.push(self.globals.values[slot as usize])?;
                    pc += 2;
                }
                Opcode::SetGlobal => {
                    let name = self.constant_str(chunk, chunk.read_u8(pc + 1))?.to_string();
                    let slot = self.globals.define(&name);
                    let v = self.pop()?;
                    self.globals.values[slot as usize] = v;
                    pc += 2;
                }

                Opcode::Add => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let r = self.add_values(a, b)?;
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::Sub => {
                    let r = self.numeric_binop(|x, y| x.wrapping_sub(y), |x, y| x - y)?;
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::Mul => {
                    let r = self.numeric_binop(|x, y| x.wrapping_mul(y), |x, y| x * y)?;
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::Div => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let r = match (a.as_int(), b.as_int()) {
                        (Some(x), Some(y)) => {
                            if y == 0 {
                                return Err(VmError::DivisionByZero);
                            }
                            Value::int(x.wrapping_div(y))
                        }
                        _ => {
                            let (x, y) = numbers(a, b)?;
                            Value::double(x / y)
                        }
                    };
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::Mod => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let r = match (a.as_int(), b.as_int()) {
                        (Some(x), Some(y)) => {
                            if y == 0 {
                                return Err(VmError::DivisionByZero);
                            }
                            Value::int(x.wrapping_rem(y))
                        }
                        _ => {
                            let (x, y) = numbers(a, b)?;
                            Value::double(x % y)
                        }
                    };
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::Negate => {
                    let a = self.pop()?;
                    let r = if let Some(n) = a.as_int() {
                        Value::int(n.wrapping_neg())
                    } else if let Some(d) = a.as_double() {
                        Value::double(-d)
                    } else {
                        return Err(VmError::TypeError("cannot negate this value".into()));
                    };
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::AddInt => {
                    let r = self.int_binop(|x, y| x.wrapping_add(y))?;
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::SubInt => {
                    let r = self.int_binop(|x, y| x.wrapping_sub(y))?;
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::MulInt => {
                    let r = self.int_binop(|x, y| x.wrapping_mul(y))?;
                    self.push(r)?;
                    pc += 1;
                }

                Opcode::Not => {
                    let a = self.pop()?;
                    self.push(Value::bool(!a.is_truthy()))?;
                    pc += 1;
                }
                Opcode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::bool(values_equal(a, b)))?;
                    pc += 1;
                }
                Opcode::NotEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::bool(!values_equal(a, b)))?;
                    pc += 1;
                }
                Opcode::Less => {
                    let r = self.compare(|x, y| x < y)?;
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::LessEqual => {
                    let r = self.compare(|x, y| x <= y)?;
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::Greater => {
                    let r = self.compare(|x, y| x > y)?;
                    self.push(r)?;
                    pc += 1;
                }
                Opcode::GreaterEqual => {
                    let r = self.compare(|x, y| x >= y)?;
                    self.push(r)?;
                    pc += 1;
                }

                Opcode::Jmp => {
                    pc = pc + 3 + chunk.read_u16(pc + 1) as usize;
                }
                Opcode::JmpFalse => {
                    let cond = self.pop()?;
                    if cond.is_truthy() {
                        pc += 3;
                    } else {
                        pc = pc + 3 + chunk.read_u16(pc + 1) as usize;
                    }
                }
                Opcode::JmpIfGe => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let (x, y) = numbers(a, b)?;
                    if x < y {
                        pc += 3;
                    } else {
                        pc = pc + 3 + chunk.read_u16(pc + 1) as usize;
                    }
                }
                Opcode::JmpIfNe => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    if values_equal(a, b) {
                        pc += 3;
                    } else {
                        pc = pc + 3 + chunk.read_u16(pc + 1) as usize;
                    }
                }

                Opcode::Loop => {
                    let off = chunk.read_u16(pc + 1) as usize;
                    let target = pc + 3 - off;
                    // Counted loops increment their counter at the back edge.
                    if chunk.op_at(target) == Some(Opcode::ForCount) {
                        let idx = self.slot_index(chunk.read_u8(target + 1))?;
                        let c = self.stack[idx]
                            .as_int()
                            .ok_or_else(|| VmError::TypeError("loop counter must be an integer".into()))?;
                        self.stack[idx] = Value::int(c.wrapping_add(1));
                    }
                    pc = target;

                    if let Some(jit) = &mut self.jit {
                        let base = self.frames.last().map_or(0, |f| f.base);
                        let action = jit.on_back_edge(target as u32, &self.stack[base..]);
                        if let BackEdgeAction::ExecuteTrace(id) = action {
                            let locals = self.stack[base..].as_mut_ptr();
                            let globals = self.globals.values.as_mut_ptr();
                            let consts = chunk.constants.as_ptr();
                            // Safety: the pointers reference this frame's
                            // slots and this chunk's pools; the stack cannot
                            // reallocate while native code runs.
                            let executed = unsafe { jit.execute(id, locals, globals, consts) };
                            match executed {
                                Executed::Done(p) | Executed::DeoptTo(p) => pc = p,
                            }
                        }
                    }
                }
                Opcode::ForCount => {
                    let c_idx = self.slot_index(chunk.read_u8(pc + 1))?;
                    let e_idx = self.slot_index(chunk.read_u8(pc + 2))?;
                    let i_idx = self.slot_index(chunk.read_u8(pc + 3))?;
                    let exit = chunk.read_u16(pc + 4) as usize;
                    let (Some(c), Some(e)) =
                        (self.stack[c_idx].as_int(), self.stack[e_idx].as_int())
                    else {
                        return Err(VmError::TypeError(
                            "counted loop bounds must be integers".into(),
                        ));
                    };
                    if c < e {
                        self.stack[i_idx] = Value::int(c);
                        pc += 6;
                    } else {
                        pc = pc + 6 + exit;
                    }
                }
                Opcode::ForIter => {
                    let idx = self.slot_index(chunk.read_u8(pc + 1))?;
                    let exit = chunk.read_u16(pc + 2) as usize;
                    let v = self.stack[idx];
                    let obj = obj_mut(v)
                        .ok_or_else(|| VmError::TypeError("for-in needs a range".into()))?;
                    match &mut obj.body {
                        ObjBody::Range(r) if r.cur < r.end => {
                            let cur = r.cur;
                            r.cur += 1;
                            self.push(Value::int(cur))?;
                            pc += 4;
                        }
                        ObjBody::Range(_) => pc = pc + 4 + exit,
                        _ => {
                            return Err(VmError::TypeError("for-in needs a range".into()));
                        }
                    }
                }

                Opcode::Call => {
                    let argc = chunk.read_u8(pc + 1);
                    pc = self.call(chunk, pc + 2, argc)?;
                }
                Opcode::TailCall => {
                    let argc = chunk.read_u8(pc + 1);
                    pc = self.tail_call(chunk, pc + 2, argc)?;
                }
                Opcode::Invoke => {
                    let name = self
                        .constant_str(chunk, chunk.read_u8(pc + 1))?
                        .to_string();
                    let argc = chunk.read_u8(pc + 2);
                    let receiver = self.peek(argc as usize)?;
                    let method = match obj_ref(receiver).map(|o| &o.body) {
                        Some(ObjBody::Dict(d)) => d.get(name.as_str()).copied(),
                        _ => None,
                    }
                    .ok_or_else(|| VmError::TypeError(format!("no method '{name}'")))?;
                    let n = self.stack.len();
                    self.stack[n - 1 - argc as usize] = method;
                    pc = self.call(chunk, pc + 3, argc)?;
                }
                Opcode::Ret => {
                    let rv = self.pop()?;
                    match self.frames.pop() {
                        Some(frame) => {
                            self.stack.truncate(frame.base - 1);
                            self.push(rv)?;
                            pc = frame.return_pc;
                        }
                        None => return Ok(()),
                    }
                }

                Opcode::Intrinsic => {
                    let id = chunk.read_u8(pc + 1);
                    let v = self.pop()?;
                    let r = self.intrinsic(id, v)?;
                    self.push(r)?;
                    pc += 2;
                }
                Opcode::Print => {
                    let v = self.pop()?;
                    let line = match obj_str(v) {
                        Some(s) => s.to_string(),
                        None => format!("{v}"),
                    };
                    if self.options.echo_output {
                        println!("{line}");
                    }
                    self.printed.push(line);
                    pc += 1;
                }
                Opcode::Halt => return Ok(()),
            }
        }
        Ok(())
    }

    fn call(&mut self, _chunk: &Chunk, return_pc: usize, argc: u8) -> VmResult<usize> {
        if self.frames.len() >= self.options.frame_limit {
            return Err(VmError::CallDepthExceeded);
        }
        let callee = self.peek(argc as usize)?;
        let func = callable(callee).ok_or(VmError::NotCallable)?;
        if func.arity != argc {
            return Err(VmError::ArityMismatch {
                expected: func.arity,
                got: argc,
            });
        }
        let base = self.stack.len() - argc as usize;
        self.frames.push(Frame { return_pc, base });
        Ok(func.start)
    }

    fn tail_call(&mut self, chunk: &Chunk, return_pc: usize, argc: u8) -> VmResult<usize> {
        let Some(frame) = self.frames.last() else {
            // Top level has no frame to replace; degrade to a plain call.
            return self.call(chunk, return_pc, argc);
        };
        let callee = self.peek(argc as usize)?;
        let func = callable(callee).ok_or(VmError::NotCallable)?;
        if func.arity != argc {
            return Err(VmError::ArityMismatch {
                expected: func.arity,
                got: argc,
            });
        }
        let base = frame.base;
        let src = self.stack.len() - argc as usize - 1;
        // Slide callee and arguments over the current frame.
        for i in 0..=argc as usize {
            self.stack[base - 1 + i] = self.stack[src + i];
        }
        self.stack.truncate(base + argc as usize);
        Ok(func.start)
    }

    fn intrinsic(&mut self, id: u8, v: Value) -> VmResult<Value> {
        match id {
            intrinsic::ABS => {
                if let Some(n) = v.as_int() {
                    Ok(Value::int(n.wrapping_abs()))
                } else if let Some(d) = v.as_double() {
                    Ok(Value::double(d.abs()))
                } else {
                    Err(VmError::TypeError("abs needs a number".into()))
                }
            }
            intrinsic::SQRT => {
                let x = v
                    .as_number()
                    .ok_or_else(|| VmError::TypeError("sqrt needs a number".into()))?;
                Ok(Value::double(x.sqrt()))
            }
            intrinsic::FLOOR => {
                if v.is_int() {
                    Ok(v)
                } else if let Some(d) = v.as_double() {
                    Ok(Value::double(d.floor()))
                } else {
                    Err(VmError::TypeError("floor needs a number".into()))
                }
            }
            intrinsic::LEN => {
                let len = obj_ref(v)
                    .and_then(|o| o.len())
                    .ok_or_else(|| VmError::TypeError("len needs a container".into()))?;
                Ok(Value::int(len as i32))
            }
            _ => Err(VmError::InvalidOpcode(id)),
        }
    }

    fn add_values(&mut self, a: Value, b: Value) -> VmResult<Value> {
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            return Ok(Value::int(x.wrapping_add(y)));
        }
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(Value::double(x + y));
        }
        if let (Some(x), Some(y)) = (obj_str(a), obj_str(b)) {
            let joined = format!("{x}{y}");
            return Ok(self.heap.alloc(Obj::string(&joined)));
        }
        Err(VmError::TypeError("cannot add these values".into()))
    }

    fn numeric_binop(
        &mut self,
        int_op: impl Fn(i32, i32) -> i32,
        dbl_op: impl Fn(f64, f64) -> f64,
    ) -> VmResult<Value> {
        let b = self.pop()?;
        let a = self.pop()?;
        if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
            return Ok(Value::int(int_op(x, y)));
        }
        let (x, y) = numbers(a, b)?;
        Ok(Value::double(dbl_op(x, y)))
    }

    fn int_binop(&mut self, op: impl Fn(i32, i32) -> i32) -> VmResult<Value> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a.as_int(), b.as_int()) {
            (Some(x), Some(y)) => Ok(Value::int(op(x, y))),
            _ => Err(VmError::TypeError(
                "integer-specialized opcode on non-integers".into(),
            )),
        }
    }

    fn compare(&mut self, op: impl Fn(f64, f64) -> bool) -> VmResult<Value> {
        let b = self.pop()?;
        let a = self.pop()?;
        let (x, y) = numbers(a, b)?;
        Ok(Value::bool(op(x, y)))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn numbers(a: Value, b: Value) -> VmResult<(f64, f64)> {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(VmError::TypeError("expected numbers".into())),
    }
}

fn values_equal(a: Value, b: Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (obj_str(a), obj_str(b)) {
        return x == y;
    }
    a == b
}

fn obj_ref<'a>(v: Value) -> Option<&'a Obj> {
    // Safety: object values only ever point at chunk- or heap-owned nodes
    // that outlive the dispatch loop.
    unsafe { v.as_obj::<Obj>().map(|p| &*p.as_ptr()) }
}

fn obj_mut<'a>(v: Value) -> Option<&'a mut Obj> {
    // Safety: as above; the single-threaded VM holds no other reference
    // while mutating.
    unsafe { v.as_obj::<Obj>().map(|p| &mut *p.as_ptr()) }
}

fn obj_str<'a>(v: Value) -> Option<&'a str> {
    obj_ref(v).and_then(|o| o.as_str())
}

fn callable<'a>(v: Value) -> Option<&'a crate::vm::object::Function> {
    match &obj_ref(v)?.body {
        ObjBody::Function(f) => Some(f),
        ObjBody::Closure(c) => match &obj_ref(c.function)?.body {
            ObjBody::Function(f) => Some(f),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_const(c: &mut Chunk, v: i32) -> u8 {
        c.add_constant(Value::int(v))
    }

    fn push_locals(c: &mut Chunk, n: usize) {
        for _ in 0..n {
            c.push_op(Opcode::Nil, 0);
        }
    }

    #[test]
    fn test_arithmetic_and_print() {
        let mut c = Chunk::new();
        let three = int_const(&mut c, 3);
        let four = int_const(&mut c, 4);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(three);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(four);
        c.push_op(Opcode::Add, 1);
        c.push_op(Opcode::Print, 1);
        c.push_op(Opcode::Halt, 1);

        let mut vm = Vm::new();
        vm.run(&c).unwrap();
        assert_eq!(vm.printed(), &["7".to_string()]);
    }

    #[test]
    fn test_wrapping_integer_semantics() {
        let mut c = Chunk::new();
        let max = int_const(&mut c, i32::MAX);
        let one = int_const(&mut c, 1);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(max);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(one);
        c.push_op(Opcode::Add, 1);
        c.push_op(Opcode::Print, 1);
        c.push_op(Opcode::Halt, 1);

        let mut vm = Vm::new();
        vm.run(&c).unwrap();
        assert_eq!(vm.printed(), &[i32::MIN.to_string()]);
    }

    #[test]
    fn test_mixed_arithmetic_widens() {
        let mut c = Chunk::new();
        let two = int_const(&mut c, 2);
        let half = c.add_constant(Value::double(0.5));
        c.push_op(Opcode::Constant, 1);
        c.push_u8(two);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(half);
        c.push_op(Opcode::Add, 1);
        c.push_op(Opcode::Print, 1);
        c.push_op(Opcode::Halt, 1);

        let mut vm = Vm::new();
        vm.run(&c).unwrap();
        assert_eq!(vm.printed(), &["2.5".to_string()]);
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        let mut c = Chunk::new();
        let ten = int_const(&mut c, 10);
        let zero = int_const(&mut c, 0);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(ten);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(zero);
        c.push_op(Opcode::Div, 1);
        c.push_op(Opcode::Halt, 1);

        let mut vm = Vm::new();
        assert!(matches!(vm.run(&c), Err(VmError::DivisionByZero)));
    }

    #[test]
    fn test_modulo_sign_follows_dividend() {
        for (a, b, expect) in [(7, 3, 1), (-7, 3, -1), (7, -3, 1), (-7, -3, -1)] {
            let mut c = Chunk::new();
            let ka = int_const(&mut c, a);
            let kb = int_const(&mut c, b);
            c.push_op(Opcode::Constant, 1);
            c.push_u8(ka);
            c.push_op(Opcode::Constant, 1);
            c.push_u8(kb);
            c.push_op(Opcode::Mod, 1);
            c.push_op(Opcode::Print, 1);
            c.push_op(Opcode::Halt, 1);

            let mut vm = Vm::new();
            vm.run(&c).unwrap();
            assert_eq!(vm.printed(), &[expect.to_string()], "{a} % {b}");
        }
    }

    /// locals: 0=c, 1=e, 2=i, 3=x; for i in 0..n { x = x + 1 }; print x
    fn counted_loop_chunk(n: i32) -> Chunk {
        let mut c = Chunk::new();
        let zero = int_const(&mut c, 0);
        let end = int_const(&mut c, n);
        let one = int_const(&mut c, 1);
        c.push_op(Opcode::Constant, 1); // c = 0
        c.push_u8(zero);
        c.push_op(Opcode::Constant, 1); // e = n
        c.push_u8(end);
        c.push_op(Opcode::Nil, 1); // i
        c.push_op(Opcode::Constant, 1); // x = 0
        c.push_u8(zero);
        let header = c.len(); // 8
        c.push_op(Opcode::ForCount, 2);
        c.push_u8(0);
        c.push_u8(1);
        c.push_u8(2);
        let exit_patch = c.len();
        c.push_u16(0);
        c.push_op(Opcode::GetLocal, 3);
        c.push_u8(3);
        c.push_op(Opcode::Constant, 3);
        c.push_u8(one);
        c.push_op(Opcode::Add, 3);
        c.push_op(Opcode::SetLocal, 3);
        c.push_u8(3);
        let loop_at = c.len();
        c.push_op(Opcode::Loop, 4);
        c.push_u16((loop_at + 3 - header) as u16);
        let after = c.len();
        c.patch_u16(exit_patch, (after - (header + 6)) as u16);
        c.push_op(Opcode::GetLocal, 5);
        c.push_u8(3);
        c.push_op(Opcode::Print, 5);
        c.push_op(Opcode::Halt, 5);
        c
    }

    #[test]
    fn test_counted_loop_interpreted() {
        let mut vm = Vm::new();
        vm.run(&counted_loop_chunk(1000)).unwrap();
        assert_eq!(vm.printed(), &["1000".to_string()]);
    }

    #[test]
    fn test_globals() {
        let mut c = Chunk::new();
        let name = c.add_string("answer");
        let v = int_const(&mut c, 42);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(v);
        c.push_op(Opcode::SetGlobal, 1);
        c.push_u8(name);
        c.push_op(Opcode::GetGlobal, 2);
        c.push_u8(name);
        c.push_op(Opcode::Print, 2);
        c.push_op(Opcode::Halt, 2);

        let mut vm = Vm::new();
        vm.run(&c).unwrap();
        assert_eq!(vm.printed(), &["42".to_string()]);
        assert_eq!(vm.global("answer").unwrap().as_int(), Some(42));
    }

    #[test]
    fn test_undefined_global_errors() {
        let mut c = Chunk::new();
        let name = c.add_string("missing");
        c.push_op(Opcode::GetGlobal, 1);
        c.push_u8(name);
        c.push_op(Opcode::Halt, 1);

        let mut vm = Vm::new();
        assert!(matches!(vm.run(&c), Err(VmError::UndefinedGlobal(_))));
    }

    #[test]
    fn test_string_concat() {
        let mut c = Chunk::new();
        let hello = c.add_string("hello ");
        let world = c.add_string("world");
        c.push_op(Opcode::Constant, 1);
        c.push_u8(hello);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(world);
        c.push_op(Opcode::Add, 1);
        c.push_op(Opcode::Print, 1);
        c.push_op(Opcode::Halt, 1);

        let mut vm = Vm::new();
        vm.run(&c).unwrap();
        assert_eq!(vm.printed(), &["hello world".to_string()]);
    }

    #[test]
    fn test_function_call_and_return() {
        // fn double(a) { return a + a }  then print double(21)
        let mut c = Chunk::new();
        // Jump over the function body.
        c.push_op(Opcode::Jmp, 1);
        let over = c.len();
        c.push_u16(0);
        let fstart = c.len();
        c.push_op(Opcode::GetLocal, 2);
        c.push_u8(0);
        c.push_op(Opcode::GetLocal, 2);
        c.push_u8(0);
        c.push_op(Opcode::Add, 2);
        c.push_op(Opcode::Ret, 2);
        let fend = c.len();
        c.patch_u16(over, (fend - (over + 2)) as u16);
        let func = c.add_function("double", 1, fstart, fend);
        let arg = int_const(&mut c, 21);
        c.push_op(Opcode::Constant, 3);
        c.push_u8(func);
        c.push_op(Opcode::Constant, 3);
        c.push_u8(arg);
        c.push_op(Opcode::Call, 3);
        c.push_u8(1);
        c.push_op(Opcode::Print, 3);
        c.push_op(Opcode::Halt, 3);

        let mut vm = Vm::new();
        vm.run(&c).unwrap();
        assert_eq!(vm.printed(), &["42".to_string()]);
    }

    #[test]
    fn test_arity_mismatch() {
        let mut c = Chunk::new();
        c.push_op(Opcode::Jmp, 1);
        let over = c.len();
        c.push_u16(0);
        let fstart = c.len();
        c.push_op(Opcode::Nil, 1);
        c.push_op(Opcode::Ret, 1);
        let fend = c.len();
        c.patch_u16(over, (fend - (over + 2)) as u16);
        let func = c.add_function("f", 2, fstart, fend);
        c.push_op(Opcode::Constant, 2);
        c.push_u8(func);
        c.push_op(Opcode::Call, 2);
        c.push_u8(0);
        c.push_op(Opcode::Halt, 2);

        let mut vm = Vm::new();
        assert!(matches!(
            vm.run(&c),
            Err(VmError::ArityMismatch { expected: 2, got: 0 })
        ));
    }

    #[test]
    fn test_for_iter_over_range() {
        let mut c = Chunk::new();
        push_locals(&mut c, 1); // slot 0: the range
        let header;
        {
            // locals[0] = range(0, 4) — materialized through the pool.
            let range = c.own_object(Obj::range(0, 4));
            let idx = c.add_constant(range);
            c.push_op(Opcode::Constant, 1);
            c.push_u8(idx);
            c.push_op(Opcode::SetLocal, 1);
            c.push_u8(0);
            header = c.len();
        }
        c.push_op(Opcode::ForIter, 2);
        c.push_u8(0);
        let exit_patch = c.len();
        c.push_u16(0);
        c.push_op(Opcode::Print, 2);
        let loop_at = c.len();
        c.push_op(Opcode::Loop, 2);
        c.push_u16((loop_at + 3 - header) as u16);
        let after = c.len();
        c.patch_u16(exit_patch, (after - (header + 4)) as u16);
        c.push_op(Opcode::Halt, 3);

        let mut vm = Vm::new();
        vm.run(&c).unwrap();
        assert_eq!(vm.printed(), &["0", "1", "2", "3"]);
    }

    #[test]
    fn test_fused_compare_jump() {
        // while x < 5 { x = x + 1 } with JmpIfGe; locals: 0=x
        let mut c = Chunk::new();
        let zero = int_const(&mut c, 0);
        let five = int_const(&mut c, 5);
        let one = int_const(&mut c, 1);
        c.push_op(Opcode::Constant, 1);
        c.push_u8(zero);
        let header = c.len();
        c.push_op(Opcode::GetLocal, 2);
        c.push_u8(0);
        c.push_op(Opcode::Constant, 2);
        c.push_u8(five);
        c.push_op(Opcode::JmpIfGe, 2);
        let exit_patch = c.len();
        c.push_u16(0);
        c.push_op(Opcode::GetLocal, 3);
        c.push_u8(0);
        c.push_op(Opcode::Constant, 3);
        c.push_u8(one);
        c.push_op(Opcode::Add, 3);
        c.push_op(Opcode::SetLocal, 3);
        c.push_u8(0);
        let loop_at = c.len();
        c.push_op(Opcode::Loop, 4);
        c.push_u16((loop_at + 3 - header) as u16);
        let after = c.len();
        c.patch_u16(exit_patch, (after - (exit_patch + 2)) as u16);
        c.push_op(Opcode::GetLocal, 5);
        c.push_u8(0);
        c.push_op(Opcode::Print, 5);
        c.push_op(Opcode::Halt, 5);

        let mut vm = Vm::new();
        vm.run(&c).unwrap();
        assert_eq!(vm.printed(), &["5".to_string()]);
    }
}
