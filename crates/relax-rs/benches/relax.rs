//! Performance benchmarks for `relax_rs`.
//!
//! Measures:
//! - Layout of jump-free sections (offset assignment only)
//! - All-short and all-long jump chains
//! - Cascading expansion (each promotion pushes the next jump over)
//!
//! Run with: `cargo bench`

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use relax_rs::{layout, Contents, Diagnostics, JumpForm, Object, SectionId, Value};

fn jmp(target: Value) -> Contents {
    Contents::Jump {
        target,
        short: JumpForm::new(vec![0xEB], 1),
        long: JumpForm::new(vec![0xE9], 4),
        is_long: false,
    }
}

/// `n` jumps, each targeting the label right after the following `spacing`
/// gap bytes.  Small spacings stay short; spacings past 127 all go long.
fn jump_chain(n: usize, spacing: u64) -> (Object, SectionId) {
    let mut obj = Object::new();
    let text = obj.add_section(".text");
    for i in 0..n {
        let sym = obj.use_symbol(&format!("L{i}"), i as u32 + 1);
        obj.append(text, jmp(Value::from_sym(sym, 8)), i as u32 + 1);
        obj.append_gap(text, spacing, 0, i as u32 + 1);
        obj.define_label(&format!("L{i}"), text, i as u32 + 1).unwrap();
    }
    (obj, text)
}

/// Worst-case ripple: `n` backward jumps all sitting exactly at the short
/// threshold, with one far forward jump in the middle of every span.  Its
/// promotion pushes every backward jump over at once, and each of those
/// promotions ripples through all the later ones.  Requires `n <= 60`.
fn cascade(n: usize) -> (Object, SectionId) {
    assert!(n <= 60);
    let mut obj = Object::new();
    let text = obj.add_section(".text");
    for k in 0..n {
        obj.define_label(&format!("b{k}"), text, k as u32 + 1).unwrap();
        obj.append_gap(text, 2, 0, k as u32 + 1);
    }
    let far = obj.use_symbol("far", 100);
    obj.append(text, jmp(Value::from_sym(far, 8)), 100);
    obj.append_gap(text, 122 - 2 * n as u64, 0, 101);
    for j in 0..n {
        let sym = obj.use_symbol(&format!("b{j}"), j as u32 + 102);
        obj.append(text, jmp(Value::from_sym(sym, 8)), j as u32 + 102);
    }
    obj.append_gap(text, 10, 0, 200);
    obj.define_label("far", text, 200).unwrap();
    (obj, text)
}

fn data_only(n: usize) -> (Object, SectionId) {
    let mut obj = Object::new();
    let text = obj.add_section(".text");
    for i in 0..n {
        obj.append_data(text, &[0x90; 4], i as u32 + 1);
    }
    (obj, text)
}

fn run(mut pair: (Object, SectionId)) -> usize {
    let mut diag = Diagnostics::new();
    assert!(layout(&mut pair.0, &mut diag));
    pair.0.emit_section(pair.1).map(|b| b.len()).unwrap_or(0)
}

fn bench_layout(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout");

    group.throughput(Throughput::Elements(1000));
    group.bench_function("data_only_1000", |b| {
        b.iter_batched(|| data_only(1000), run, BatchSize::SmallInput)
    });

    group.bench_function("short_jumps_1000", |b| {
        b.iter_batched(|| jump_chain(1000, 10), run, BatchSize::SmallInput)
    });

    group.bench_function("long_jumps_1000", |b| {
        b.iter_batched(|| jump_chain(1000, 130), run, BatchSize::SmallInput)
    });

    group.throughput(Throughput::Elements(48));
    group.bench_function("cascade_48", |b| {
        b.iter_batched(|| cascade(48), run, BatchSize::SmallInput)
    });

    group.finish();
}

criterion_group!(benches, bench_layout);
criterion_main!(benches);
