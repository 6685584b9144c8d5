//! VM performance benchmarks: recursion-heavy calls, tight loops, and
//! allocation churn through the collector.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::process::Command;
use std::time::Duration;

/// Run lox on the given source and return the wall-clock time.
fn run_lox_timed(source: &str) -> Duration {
    let temp_dir = std::env::temp_dir();
    let temp_file = temp_dir.join(format!("lox_bench_{}.lox", std::process::id()));
    std::fs::write(&temp_file, source).unwrap();

    let start = std::time::Instant::now();

    let output = Command::new(env!("CARGO_BIN_EXE_lox"))
        .arg(temp_file.to_str().unwrap())
        .output()
        .expect("failed to execute lox");

    let elapsed = start.elapsed();

    assert!(
        output.status.success(),
        "benchmark should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    std::fs::remove_file(&temp_file).ok();

    elapsed
}

/// Fibonacci benchmark - stresses call frames and recursion.
fn fibonacci_source(n: u32) -> String {
    format!(
        r#"
fun fib(n) {{
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}}

print fib({});
"#,
        n
    )
}

/// Sum loop benchmark - stresses the dispatch loop and arithmetic.
fn sum_loop_source(n: u32) -> String {
    format!(
        r#"
fun sum_to(n) {{
    var total = 0;
    for (var i = 1; i <= n; i = i + 1) {{
        total = total + i;
    }}
    return total;
}}

print sum_to({});
"#,
        n
    )
}

/// Closure churn benchmark - stresses allocation and the collector.
fn closure_churn_source(n: u32) -> String {
    format!(
        r#"
fun make(x) {{
    fun inner() {{ return x; }}
    return inner;
}}

var last = 0;
for (var i = 0; i < {}; i = i + 1) {{
    var f = make(i);
    last = f();
}}
print last;
"#,
        n
    )
}

fn bench_fibonacci(c: &mut Criterion) {
    let mut group = c.benchmark_group("fibonacci");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    for n in [20, 25] {
        let source = fibonacci_source(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &source, |b, s| {
            b.iter(|| run_lox_timed(black_box(s)))
        });
    }

    group.finish();
}

fn bench_sum_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum_loop");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    let source = sum_loop_source(1_000_000);
    group.bench_function("1000000", |b| b.iter(|| run_lox_timed(black_box(&source))));

    group.finish();
}

fn bench_closure_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("closure_churn");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    let source = closure_churn_source(200_000);
    group.bench_function("200000", |b| b.iter(|| run_lox_timed(black_box(&source))));

    group.finish();
}

criterion_group!(benches, bench_fibonacci, bench_sum_loop, bench_closure_churn);
criterion_main!(benches);
