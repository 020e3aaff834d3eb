//! Hot-loop microbenchmark: interpreter vs tracing JIT on the canonical
//! counted accumulator loop.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quill_core::Value;
use quill_engine::{Chunk, JitConfig, Opcode, Vm};

/// for i in 0..n { x = x + 1 }; print x
fn accumulator_chunk(n: i32) -> Chunk {
    let mut c = Chunk::new();
    let zero = c.add_constant(Value::int(0));
    let end = c.add_constant(Value::int(n));
    let one = c.add_constant(Value::int(1));
    c.push_op(Opcode::Constant, 1);
    c.push_u8(zero);
    c.push_op(Opcode::Constant, 1);
    c.push_u8(end);
    c.push_op(Opcode::Nil, 1);
    c.push_op(Opcode::Constant, 1);
    c.push_u8(zero);
    let header = c.len();
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
    c.push_op(Opcode::Halt, 5);
    c
}

fn bench_hot_loop(c: &mut Criterion) {
    let chunk = accumulator_chunk(1_000_000);

    let mut group = c.benchmark_group("counted_loop_1m");
    group.sample_size(10);

    group.bench_function("interpreter", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.run(black_box(&chunk)).unwrap();
        })
    });

    group.bench_function("jit", |b| {
        b.iter(|| {
            let mut vm = Vm::with_jit(JitConfig {
                hot_threshold: 10,
                ..Default::default()
            });
            vm.run(black_box(&chunk)).unwrap();
        })
    });

    group.finish();
}

criterion_group!(benches, bench_hot_loop);
criterion_main!(benches);
