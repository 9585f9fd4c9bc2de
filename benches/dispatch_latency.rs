//! Dispatch latency benchmarks.
//!
//! Measures request validation, graph construction and synchronous execution
//! on the reference executor.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use nnrt_core::compile::NetworkCreator;
use nnrt_core::config::RuntimeConfig;
use nnrt_core::execution::{validate_request, Request, RequestArgument};
use nnrt_core::memory::HostMemory;
use nnrt_core::model::{Model, ModelBuilder, Operand, OperandType, OperationKind};
use nnrt_core::translate::TranslatorRegistry;
use nnrt_core::Driver;

/// `relu(x + x)` over `len` FP32 elements.
fn add_relu_model(len: u32) -> Model {
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[len]));
    let act = b.operand(Operand::scalar_i32(0));
    let sum = b.operand(Operand::tensor(OperandType::TensorFloat32, &[len]));
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[len]));
    b.operation(OperationKind::Add, &[x, x, act], &[sum]);
    b.operation(OperationKind::Relu, &[sum], &[out]);
    b.build().expect("model")
}

fn conv_model() -> Model {
    let mut b = ModelBuilder::new();
    let x = b.input(Operand::tensor(OperandType::TensorFloat32, &[1, 16, 16, 8]));
    let w = b.operand(Operand::const_f32(&[8, 3, 3, 8], &[0.5; 576]));
    let bias = b.operand(Operand::const_f32(&[8], &[0.0; 8]));
    let mut args = vec![x, w, bias];
    for v in [1, 1, 1, 1, 1, 1, 1] {
        args.push(b.operand(Operand::scalar_i32(v)));
    }
    let out = b.output(Operand::tensor(OperandType::TensorFloat32, &[1, 16, 16, 8]));
    b.operation(OperationKind::Conv2d, &args, &[out]);
    b.build().expect("model")
}

fn request(len: u32) -> Request {
    let bytes = len * 4;
    Request::new(
        vec![RequestArgument::new(0, 0, bytes)],
        vec![RequestArgument::new(0, bytes, bytes)],
    )
    .with_pool(Arc::new(HostMemory::new(2 * bytes as usize)))
}

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_validation");
    let model = add_relu_model(256);
    let req = request(256);

    group.bench_function("add_relu", |b| b.iter(|| validate_request(black_box(&req), &model)));

    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("network_build");
    let registry = TranslatorRegistry::standard();

    for (name, model) in [("add_relu", add_relu_model(1024)), ("conv_16x16x8", conv_model())] {
        group.bench_with_input(BenchmarkId::new("build", name), &model, |b, m| {
            b.iter(|| NetworkCreator::new(m, &registry).build())
        });
    }

    group.finish();
}

fn bench_execute_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute_sync_latency");
    let mut config = RuntimeConfig::default();
    config.worker_pool.num_threads = 1;
    let driver = Driver::new(&config).expect("driver");

    for len in [16u32, 1024, 65536] {
        let prepared = driver
            .prepare_model(Arc::new(add_relu_model(len)))
            .expect("prepare");

        group.throughput(Throughput::Bytes(u64::from(len) * 4));
        group.bench_with_input(BenchmarkId::new("add_relu", len), &len, |b, &n| {
            b.iter(|| prepared.execute_sync(request(n)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_validation, bench_build, bench_execute_sync);
criterion_main!(benches);
