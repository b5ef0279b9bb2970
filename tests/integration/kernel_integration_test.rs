//! Integration test for kernel execution through offload-core's linalg ops

use offload_backends::{BackendKind, Kernel, MatrixShape, MemoryHandle};
use offload_core::ops::linalg;
use offload_core::{Dispatcher, DispatcherConfig, KernelProfiler, RunConfig};
use std::sync::Arc;

const CONFIG_JSON: &str = r#"{
    "defaults": { "backend": "auto", "parallel_threshold": 1000 },
    "worker_threads": 2,
    "chunk_size": 256,
    "device": {
        "name": "integration-device",
        "memory_bytes": 4194304,
        "compute_units": 2,
        "max_lanes_per_block": 128
    }
}"#;

fn dispatcher() -> Dispatcher {
    offload_tracing::init_for_tests();
    let config = DispatcherConfig::from_json(CONFIG_JSON).unwrap();
    Dispatcher::new(config).unwrap()
}

#[test]
fn test_daxpy_with_json_config() {
    let exec = dispatcher();
    assert_eq!(exec.registry().kinds(), BackendKind::ALL.to_vec());

    let mut x = MemoryHandle::create(10).unwrap();
    let mut y = MemoryHandle::create(10).unwrap();
    x.fill(1.0).unwrap();
    y.fill(0.5).unwrap();

    linalg::axpy(&exec, 0.5, &mut x, &mut y, exec.defaults()).unwrap();

    let result = y.to_vec().unwrap();
    assert_eq!(result, vec![1.0; 10]);
    println!("✅ daxpy integration test passed: {:?}", result);
}

/// Power iteration on a diagonal matrix: matvec, dot and scal chained on
/// the same handles, with each step free to land on a different backend.
#[test]
fn test_power_iteration_across_backends() {
    let exec = dispatcher();
    let n = 1200;
    let shape = MatrixShape::new(n, n);

    let mut diagonal = vec![0.0; n * n];
    for i in 0..n {
        diagonal[i * n + i] = if i == 7 { 4.0 } else { 1.0 };
    }
    let mut a = MemoryHandle::from_vec(diagonal);
    let mut v = MemoryHandle::from_vec(vec![1.0; n]);
    let mut w = MemoryHandle::create(n).unwrap();

    let mut eigenvalue = 0.0;
    for _ in 0..40 {
        linalg::matvec(&exec, &mut a, shape, &mut v, &mut w, exec.defaults()).unwrap();
        let norm = linalg::nrm2(&exec, &mut w, exec.defaults()).unwrap();
        let vw = linalg::dot(&exec, &mut v, &mut w, exec.defaults()).unwrap();
        let vv = exec.run_default(Kernel::dot_self(&mut v)).unwrap().scalar().unwrap();
        eigenvalue = vw / vv;
        linalg::scal(&exec, 1.0 / norm, &mut w, exec.defaults()).unwrap();
        std::mem::swap(&mut v, &mut w);
    }

    assert!((eigenvalue - 4.0).abs() < 1e-6, "eigenvalue = {eigenvalue}");
}

#[test]
fn test_profiler_sees_every_backend() {
    let profiler = Arc::new(KernelProfiler::new());
    let exec = dispatcher().with_profiler(Arc::clone(&profiler));

    for kind in BackendKind::ALL {
        let mut x = MemoryHandle::from_vec(vec![2.0; 64]);
        let mut y = MemoryHandle::from_vec(vec![1.0; 64]);
        let config = RunConfig::with_backend(kind);
        linalg::axpy(&exec, 1.0, &mut x, &mut y, &config).unwrap();
        assert_eq!(linalg::dot(&exec, &mut x, &mut y, &config).unwrap(), 384.0);
    }

    assert_eq!(profiler.dispatch_count(), 6);
    let summary = profiler.summary();
    assert_eq!(summary.len(), 6);
    assert!(summary.iter().all(|stats| stats.count == 1));
    profiler.log_summary();
}
