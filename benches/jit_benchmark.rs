//! Backend comparison benchmarks: interpreter vs JIT on the same
//! bytecode programs, driven through the binary the way a user runs it.

use std::path::PathBuf;
use std::process::Command;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use basalt::fixtures;

fn temp_program(name: &str, image: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("basalt_bench_{}_{}.byte", name, std::process::id()));
    std::fs::write(&path, image).unwrap();
    path
}

fn run_backend(backend: &str, file: &PathBuf) {
    let output = Command::new(env!("CARGO_BIN_EXE_basalt"))
        .arg(backend)
        .arg(file)
        .output()
        .expect("failed to execute basalt");
    assert!(
        output.status.code().is_some(),
        "benchmark run died: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn backend_comparison(c: &mut Criterion) {
    let programs = [
        ("loop_sum", fixtures::loop_sum()),
        ("call_chain", fixtures::call_chain()),
        ("spill_pressure", fixtures::spill_pressure()),
    ];

    let mut group = c.benchmark_group("backends");
    for (name, image) in &programs {
        let file = temp_program(name, image);
        for backend in ["interpreter", "jit"] {
            group.bench_with_input(
                BenchmarkId::new(backend, name),
                &file,
                |b, file| b.iter(|| run_backend(backend, file)),
            );
        }
        std::fs::remove_file(&file).ok();
    }
    group.finish();
}

criterion_group!(benches, backend_comparison);
criterion_main!(benches);
