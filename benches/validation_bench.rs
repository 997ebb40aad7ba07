//! Execution Kernel benchmarks
//!
//! Run with: cargo bench

use std::collections::HashMap;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use execution_kernel::{ExecutionContext, ExecutionKernel, InMemoryAuditSink, KernelConfig};
use tokio::runtime::Runtime;

fn echo_callable() -> execution_kernel::OperationCallable {
    Box::new(|params: HashMap<String, serde_json::Value>| {
        Box::pin(async move { Ok(serde_json::Value::Object(params.into_iter().collect())) })
    })
}

fn build_kernel() -> ExecutionKernel {
    let mut config = KernelConfig::default();
    config.manifest_dir = "/nonexistent/manifests".to_string();
    let kernel = ExecutionKernel::new(config, Arc::new(InMemoryAuditSink::new(10_000)));
    kernel.register_operation("echo", "echoes input", echo_callable()).unwrap();
    kernel
}

fn benchmark_validate(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let kernel = build_kernel();
    let mut group = c.benchmark_group("validate");

    let payloads = vec![
        ("empty", HashMap::new()),
        (
            "small",
            [("path".to_string(), serde_json::json!("/tmp/a.txt"))]
                .into_iter()
                .collect::<HashMap<_, _>>(),
        ),
    ];

    for (name, params) in payloads {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(name), &params, |b, params| {
            b.to_async(&rt).iter(|| async {
                let ctx = ExecutionContext::new("bench-agent", "echo", params.clone());
                black_box(kernel.validate(&ctx).await)
            });
        });
    }

    group.finish();
}

fn benchmark_execute(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let kernel = build_kernel();

    c.bench_function("execute_echo", |b| {
        b.to_async(&rt).iter(|| async {
            let ctx = ExecutionContext::new("bench-agent", "echo", HashMap::new());
            black_box(kernel.execute(ctx).await)
        });
    });
}

fn benchmark_fingerprint(c: &mut Criterion) {
    c.bench_function("execution_context_fingerprint", |b| {
        b.iter(|| {
            black_box(ExecutionContext::new(
                "agent-1",
                "read_file",
                HashMap::new(),
            ))
        });
    });
}

criterion_group!(benches, benchmark_validate, benchmark_execute, benchmark_fingerprint);
criterion_main!(benches);
