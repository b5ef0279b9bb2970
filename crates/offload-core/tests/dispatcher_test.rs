//! End-to-end dispatcher behaviour across all three backends.

use offload_backends::{BackendError, BackendKind, DeviceConfig, Kernel, KernelOutput, MatrixShape, MemoryHandle, Residency};
use offload_core::{
    BackendChoice, BackendRegistry, Diagnostic, Dispatcher, DispatcherConfig, Error, RecordingSink, RunConfig,
    RunOutcome,
};
use std::sync::Arc;
use std::time::Duration;

fn device_config(memory_bytes: usize) -> DeviceConfig {
    DeviceConfig {
        name: "it-device".to_string(),
        memory_bytes,
        compute_units: 2,
        max_lanes_per_block: 256,
    }
}

fn full_dispatcher() -> (Dispatcher, Arc<RecordingSink>) {
    offload_tracing::init_for_tests();
    let sink = Arc::new(RecordingSink::new());
    let dispatcher = Dispatcher::new(DispatcherConfig::with_device(device_config(1 << 22)))
        .unwrap()
        .with_sink(sink.clone());
    (dispatcher, sink)
}

fn explicit(kind: BackendKind) -> RunConfig {
    RunConfig::with_backend(kind)
}

#[test]
fn daxpy_reference_case_on_every_backend() {
    let (dispatcher, sink) = full_dispatcher();

    for kind in BackendKind::ALL {
        let mut x = MemoryHandle::create(10).unwrap();
        let mut y = MemoryHandle::create(10).unwrap();
        x.fill(1.0).unwrap();
        y.fill(0.5).unwrap();

        let output = dispatcher.run(Kernel::axpy(0.5, &mut x, &mut y), &explicit(kind)).unwrap();
        assert_eq!(output, KernelOutput::Updated);
        assert_eq!(y.residency(), Residency::Host, "{kind}");
        for i in 0..10 {
            assert_eq!(y.get(i).unwrap(), 1.0, "{kind} index {i}");
        }
        assert_eq!(x.to_vec().unwrap(), vec![1.0; 10], "{kind} must not modify x");
    }
    assert!(sink.is_empty());
}

#[test]
fn out_of_range_after_every_backend() {
    let (dispatcher, _sink) = full_dispatcher();
    for kind in BackendKind::ALL {
        let n = 16;
        let mut x = MemoryHandle::from_vec(vec![1.0; n]);
        let mut y = MemoryHandle::from_vec(vec![2.0; n]);
        dispatcher.run(Kernel::axpy(1.0, &mut x, &mut y), &explicit(kind)).unwrap();

        assert_eq!(y.get(n), Err(BackendError::OutOfRange { index: n, len: n }), "{kind}");
        assert!(y.get(n - 1).is_ok());
        assert!(matches!(y.set(n, 0.0), Err(BackendError::OutOfRange { .. })));
    }
}

#[test]
fn auto_selection_without_device_stays_on_host() {
    offload_tracing::init_for_tests();
    let dispatcher = Dispatcher::host_only().unwrap();
    let config = RunConfig::default().parallel_threshold(1000);

    let mut x = MemoryHandle::from_vec(vec![1.0; 10]);
    let mut y = MemoryHandle::from_vec(vec![0.5; 10]);
    let chosen = dispatcher.select_backend(&Kernel::axpy(0.5, &mut x, &mut y), &config).unwrap();
    assert_eq!(chosen, BackendKind::HostSequential);

    dispatcher.run(Kernel::axpy(0.5, &mut x, &mut y), &config).unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![1.0; 10]);

    let mut big_x = MemoryHandle::from_vec(vec![1.0; 5000]);
    let mut big_y = MemoryHandle::from_vec(vec![1.0; 5000]);
    let chosen = dispatcher
        .select_backend(&Kernel::axpy(1.0, &mut big_x, &mut big_y), &config)
        .unwrap();
    assert_eq!(chosen, BackendKind::HostParallel);
}

#[test]
fn auto_selection_never_picks_device_for_small_kernels() {
    let (dispatcher, _sink) = full_dispatcher();
    let config = RunConfig::default().parallel_threshold(1000);
    let mut x = MemoryHandle::from_vec(vec![1.0; 10]);
    let mut y = MemoryHandle::from_vec(vec![0.5; 10]);
    assert_ne!(
        dispatcher.select_backend(&Kernel::axpy(0.5, &mut x, &mut y), &config).unwrap(),
        BackendKind::DeviceOffload
    );
    dispatcher.run(Kernel::axpy(0.5, &mut x, &mut y), &config).unwrap();
    assert_eq!(x.residency(), Residency::Host);
}

#[test]
fn auto_selection_offloads_large_kernels() {
    let (dispatcher, _sink) = full_dispatcher();
    let config = RunConfig::default().parallel_threshold(1000);
    let mut x = MemoryHandle::from_vec(vec![2.0; 4096]);
    let mut y = MemoryHandle::from_vec(vec![1.0; 4096]);

    dispatcher.run(Kernel::axpy(0.25, &mut x, &mut y), &config).unwrap();
    assert_eq!(y.residency(), Residency::Host);
    assert_eq!(y.to_vec().unwrap(), vec![1.5; 4096]);
    // inputs stay mirrored so a following device kernel skips the upload
    assert_eq!(x.residency(), Residency::Mirrored);
}

#[test]
fn unavailable_backend_without_fallback_fails() {
    offload_tracing::init_for_tests();
    let sink = Arc::new(RecordingSink::new());
    let dispatcher = Dispatcher::host_only().unwrap().with_sink(sink.clone());
    let mut x = MemoryHandle::from_vec(vec![1.0; 4]);
    let mut y = MemoryHandle::from_vec(vec![1.0; 4]);

    let err = dispatcher
        .run(Kernel::axpy(1.0, &mut x, &mut y), &explicit(BackendKind::DeviceOffload))
        .unwrap_err();
    assert_eq!(
        err,
        Error::BackendUnavailable {
            requested: BackendKind::DeviceOffload
        }
    );
    assert_eq!(y.to_vec().unwrap(), vec![1.0; 4]);
}

#[test]
fn fallback_runs_sequential_and_reports() {
    offload_tracing::init_for_tests();
    let sink = Arc::new(RecordingSink::new());
    let dispatcher = Dispatcher::with_registry(BackendRegistry::sequential_only(), DispatcherConfig::default())
        .unwrap()
        .with_sink(sink.clone());
    let mut x = MemoryHandle::from_vec(vec![1.0; 10]);
    let mut y = MemoryHandle::from_vec(vec![0.5; 10]);

    let config = explicit(BackendKind::HostParallel).allow_fallback(true);
    dispatcher.run(Kernel::axpy(0.5, &mut x, &mut y), &config).unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![1.0; 10]);

    assert_eq!(
        sink.take(),
        vec![Diagnostic::Fallback {
            kernel: "axpy",
            requested: BackendKind::HostParallel,
            used: BackendKind::HostSequential,
        }]
    );
}

#[test]
fn shape_mismatch_leaves_output_unchanged() {
    let (dispatcher, sink) = full_dispatcher();
    for kind in BackendKind::ALL {
        let mut x = MemoryHandle::from_vec(vec![1.0; 3]);
        let mut y = MemoryHandle::from_vec(vec![4.0, 5.0, 6.0, 7.0]);
        let generation = y.generation();

        let err = dispatcher
            .run(Kernel::axpy(2.0, &mut x, &mut y), &explicit(kind))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Backend(BackendError::ShapeMismatch { operation: "axpy", .. })
        ));
        assert_eq!(y.residency(), Residency::Host);
        assert_eq!(y.generation(), generation);
        assert_eq!(y.to_vec().unwrap(), vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(x.residency(), Residency::Host, "validation must precede migration");
    }
    let diagnostics = sink.take();
    assert_eq!(diagnostics.len(), 3);
    assert!(diagnostics
        .iter()
        .all(|d| matches!(d, Diagnostic::ShapeRejected { kernel: "axpy", .. })));
}

#[test]
fn sequential_dot_is_bit_identical() {
    let (dispatcher, _sink) = full_dispatcher();
    let values: Vec<f64> = (0..10_000).map(|i| 1.0 / (i as f64 + 1.0)).collect();
    let mut x = MemoryHandle::from_vec(values.clone());
    let mut y = MemoryHandle::from_vec(values.into_iter().rev().collect());
    let config = explicit(BackendKind::HostSequential);

    let first = dispatcher.run(Kernel::dot(&mut x, &mut y), &config).unwrap();
    for _ in 0..10 {
        let again = dispatcher.run(Kernel::dot(&mut x, &mut y), &config).unwrap();
        assert_eq!(
            first.scalar().map(f64::to_bits),
            again.scalar().map(f64::to_bits)
        );
    }
}

#[test]
fn backends_agree_on_dot_and_matvec() {
    let (dispatcher, _sink) = full_dispatcher();
    let (rows, cols) = (64, 48);
    let a_values: Vec<f64> = (0..rows * cols).map(|i| ((i % 17) as f64 - 8.0) * 0.125).collect();
    let x_values: Vec<f64> = (0..cols).map(|i| (i as f64).cos()).collect();

    let mut results = Vec::new();
    for kind in BackendKind::ALL {
        let mut a = MemoryHandle::from_vec(a_values.clone());
        let mut x = MemoryHandle::from_vec(x_values.clone());
        let mut y = MemoryHandle::create(rows).unwrap();
        dispatcher
            .run(Kernel::matvec(&mut a, MatrixShape::new(rows, cols), &mut x, &mut y), &explicit(kind))
            .unwrap();
        let mut ones = MemoryHandle::from_vec(vec![1.0; rows]);
        let sum = dispatcher
            .run(Kernel::dot(&mut y, &mut ones), &explicit(kind))
            .unwrap()
            .scalar()
            .unwrap();
        results.push((y.to_vec().unwrap(), sum));
    }

    let (reference_y, reference_sum) = &results[0];
    for (y, sum) in &results[1..] {
        assert_eq!(y, reference_y, "matvec rows use the same per-row order everywhere");
        assert!((sum - reference_sum).abs() <= 1e-9 * reference_sum.abs().max(1.0));
    }
}

#[test]
fn device_launch_failure_leaves_output_untouched() {
    let (dispatcher, sink) = full_dispatcher();
    let mut x = MemoryHandle::from_vec(vec![1.0; 32]);
    let mut y = MemoryHandle::from_vec(vec![3.0; 32]);

    for block_size in [0, 100_000] {
        let config = explicit(BackendKind::DeviceOffload).device_block_size(block_size);
        let err = dispatcher.run(Kernel::axpy(1.0, &mut x, &mut y), &config).unwrap_err();
        assert!(matches!(
            err,
            Error::Backend(BackendError::Execution {
                backend: BackendKind::DeviceOffload,
                ..
            })
        ));
        assert_eq!(y.residency(), Residency::Host);
        assert_eq!(y.to_vec().unwrap(), vec![3.0; 32]);
    }

    let diagnostics = sink.take();
    assert_eq!(diagnostics.len(), 2);
    assert!(diagnostics.iter().all(|d| matches!(
        d,
        Diagnostic::ExecutionFailed {
            backend: BackendKind::DeviceOffload,
            ..
        }
    )));
}

#[test]
fn lost_device_reports_execution_error() {
    let (dispatcher, _sink) = full_dispatcher();
    let mut x = MemoryHandle::from_vec(vec![1.0; 8]);
    let mut y = MemoryHandle::from_vec(vec![1.0; 8]);
    dispatcher.device().unwrap().mark_lost();

    let err = dispatcher
        .run(Kernel::axpy(1.0, &mut x, &mut y), &explicit(BackendKind::DeviceOffload))
        .unwrap_err();
    assert!(matches!(err, Error::Backend(BackendError::Execution { .. })));
    assert_eq!(y.to_vec().unwrap(), vec![1.0; 8]);

    // auto no longer considers the lost device
    let mut big_x = MemoryHandle::create(50_000).unwrap();
    let mut big_y = MemoryHandle::create(50_000).unwrap();
    assert_eq!(
        dispatcher
            .select_backend(&Kernel::axpy(1.0, &mut big_x, &mut big_y), &RunConfig::default())
            .unwrap(),
        BackendKind::HostParallel
    );
}

#[test]
fn device_memory_exhaustion_is_an_allocation_error() {
    offload_tracing::init_for_tests();
    let dispatcher = Dispatcher::new(DispatcherConfig::with_device(device_config(64))).unwrap();
    let mut x = MemoryHandle::from_vec(vec![1.0; 16]);
    let mut y = MemoryHandle::from_vec(vec![1.0; 16]);

    let err = dispatcher
        .run(Kernel::axpy(1.0, &mut x, &mut y), &explicit(BackendKind::DeviceOffload))
        .unwrap_err();
    assert!(matches!(err, Error::Backend(BackendError::Allocation { .. })));
    assert_eq!(y.residency(), Residency::Host);
    assert_eq!(y.to_vec().unwrap(), vec![1.0; 16]);
    assert_eq!(dispatcher.device().unwrap().allocated_bytes(), 0);
}

#[test]
fn failed_staging_releases_inputs_already_on_device() {
    offload_tracing::init_for_tests();
    // room for x but not for x and y together
    let dispatcher = Dispatcher::new(DispatcherConfig::with_device(device_config(96))).unwrap();
    let device = Arc::clone(dispatcher.device().unwrap());
    let mut x = MemoryHandle::from_vec(vec![1.0; 8]);
    let mut y = MemoryHandle::from_vec(vec![2.0; 8]);

    let err = dispatcher
        .run(Kernel::axpy(1.0, &mut x, &mut y), &explicit(BackendKind::DeviceOffload))
        .unwrap_err();
    assert!(matches!(err, Error::Backend(BackendError::Allocation { .. })));

    assert_eq!(x.residency(), Residency::Host);
    assert_eq!(y.residency(), Residency::Host);
    assert_eq!(device.allocated_bytes(), 0);
    assert_eq!(x.to_vec().unwrap(), vec![1.0; 8]);
    assert_eq!(y.to_vec().unwrap(), vec![2.0; 8]);

    // the freed arena is usable by the next call
    let mut small_x = MemoryHandle::from_vec(vec![1.0; 4]);
    let mut small_y = MemoryHandle::from_vec(vec![1.0; 4]);
    dispatcher
        .run(
            Kernel::axpy(1.0, &mut small_x, &mut small_y),
            &explicit(BackendKind::DeviceOffload),
        )
        .unwrap();
    assert_eq!(small_y.to_vec().unwrap(), vec![2.0; 4]);
}

#[test]
fn self_operand_kernels_on_every_backend() {
    let (dispatcher, _sink) = full_dispatcher();
    for kind in BackendKind::ALL {
        let mut x = MemoryHandle::from_vec(vec![3.0, 4.0]);
        let norm_sq = dispatcher.run(Kernel::dot_self(&mut x), &explicit(kind)).unwrap();
        assert_eq!(norm_sq.scalar(), Some(25.0), "{kind}");

        dispatcher.run(Kernel::axpy_self(1.0, &mut x), &explicit(kind)).unwrap();
        assert_eq!(x.residency(), Residency::Host);
        assert_eq!(x.to_vec().unwrap(), vec![6.0, 8.0], "{kind}");
    }
}

#[test]
fn async_wait_is_idempotent() {
    let (dispatcher, _sink) = full_dispatcher();
    let mut x = MemoryHandle::from_vec(vec![1.0; 1000]);
    let mut y = MemoryHandle::from_vec(vec![0.5; 1000]);
    {
        let mut pending = dispatcher
            .run_async(
                Kernel::axpy(0.5, &mut x, &mut y),
                &explicit(BackendKind::DeviceOffload),
            )
            .unwrap();
        assert_eq!(pending.backend(), BackendKind::DeviceOffload);
        assert_eq!(pending.wait(), Ok(KernelOutput::Updated));
        assert_eq!(pending.wait(), Ok(KernelOutput::Updated));
        assert!(pending.is_complete());
        assert!(!pending.cancel());
    }
    assert_eq!(y.residency(), Residency::Host);
    assert_eq!(y.to_vec().unwrap(), vec![1.0; 1000]);
}

#[test]
fn async_dot_returns_scalar() {
    let (dispatcher, _sink) = full_dispatcher();
    let mut x = MemoryHandle::from_vec(vec![2.0; 500]);
    let mut y = MemoryHandle::from_vec(vec![3.0; 500]);
    let mut pending = dispatcher
        .run_async(Kernel::dot(&mut x, &mut y), &explicit(BackendKind::DeviceOffload))
        .unwrap();
    let result = pending
        .wait_timeout(Duration::from_secs(10))
        .expect("device dot finishes well within the timeout");
    assert_eq!(result.unwrap().scalar(), Some(3000.0));
}

#[test]
fn dispatch_follows_async_mode() {
    let (dispatcher, _sink) = full_dispatcher();
    let mut x = MemoryHandle::from_vec(vec![1.0; 64]);
    let mut y = MemoryHandle::from_vec(vec![1.0; 64]);

    // RunOutcome may own a PendingRun, whose Drop keeps the handles borrowed
    // until the outcome goes out of scope.
    {
        let sync = dispatcher
            .dispatch(Kernel::axpy(1.0, &mut x, &mut y), &explicit(BackendKind::DeviceOffload))
            .unwrap();
        assert!(matches!(sync, RunOutcome::Done(KernelOutput::Updated)));
    }
    assert_eq!(y.to_vec().unwrap(), vec![2.0; 64]);

    {
        let config = explicit(BackendKind::DeviceOffload).async_mode(true);
        let outcome = dispatcher.dispatch(Kernel::axpy(1.0, &mut x, &mut y), &config).unwrap();
        assert!(matches!(outcome, RunOutcome::Pending(_)));
        assert_eq!(outcome.wait(), Ok(KernelOutput::Updated));
    }
    assert_eq!(y.to_vec().unwrap(), vec![3.0; 64]);
}

#[test]
fn cancelled_run_keeps_pre_or_post_state() {
    let (dispatcher, _sink) = full_dispatcher();
    let mut x = MemoryHandle::from_vec(vec![1.0; 100_000]);
    let mut y = MemoryHandle::from_vec(vec![1.0; 100_000]);
    {
        let mut pending = dispatcher
            .run_async(
                Kernel::axpy(1.0, &mut x, &mut y),
                &explicit(BackendKind::DeviceOffload),
            )
            .unwrap();
        pending.cancel();
        match pending.wait() {
            Ok(output) => assert_eq!(output, KernelOutput::Updated),
            Err(err) => assert_eq!(err, Error::Backend(BackendError::Cancelled { kernel: "axpy" })),
        }
    }
    // Either the launch completed before the cancel or nothing was written.
    assert_eq!(y.residency(), Residency::Host);
    let values = y.to_vec().unwrap();
    assert!(values.iter().all(|v| *v == 1.0) || values.iter().all(|v| *v == 2.0));
}

#[test]
fn dropping_pending_run_marks_output_indeterminate() {
    let (dispatcher, sink) = full_dispatcher();
    let mut x = MemoryHandle::from_vec(vec![1.0; 10_000]);
    let mut y = MemoryHandle::from_vec(vec![1.0; 10_000]);

    let pending = dispatcher
        .run_async(
            Kernel::axpy(1.0, &mut x, &mut y),
            &explicit(BackendKind::DeviceOffload),
        )
        .unwrap();
    drop(pending);

    assert_eq!(y.residency(), Residency::Indeterminate);
    assert!(matches!(y.get(0), Err(BackendError::Indeterminate { .. })));

    // Re-using the handle without revalidating is rejected before anything runs.
    let err = dispatcher
        .run(Kernel::axpy(1.0, &mut x, &mut y), &explicit(BackendKind::HostSequential))
        .unwrap_err();
    assert!(matches!(err, Error::Backend(BackendError::Indeterminate { .. })));

    assert!(sink
        .snapshot()
        .iter()
        .any(|d| matches!(d, Diagnostic::Abandoned { kernel: "axpy", .. })));

    assert_eq!(y.revalidate().unwrap(), Residency::Host);
    let values = y.to_vec().unwrap();
    assert!(values.iter().all(|v| *v == 1.0) || values.iter().all(|v| *v == 2.0));
}

#[test]
fn async_on_host_backend_completes_immediately() {
    let (dispatcher, _sink) = full_dispatcher();
    let mut x = MemoryHandle::from_vec(vec![1.0; 10]);
    let mut y = MemoryHandle::from_vec(vec![0.5; 10]);
    let config = RunConfig {
        backend: BackendChoice::HostParallel,
        async_mode: true,
        ..RunConfig::default()
    };
    {
        let outcome = dispatcher.dispatch(Kernel::axpy(0.5, &mut x, &mut y), &config).unwrap();
        match outcome {
            RunOutcome::Pending(pending) => {
                assert!(pending.is_complete());
                drop(pending);
            }
            RunOutcome::Done(_) => panic!("async_mode must return a pending run"),
        }
    }
    assert_eq!(y.residency(), Residency::Host);
    assert_eq!(y.to_vec().unwrap(), vec![1.0; 10]);
}

#[test]
fn migrate_is_idempotent_through_the_dispatcher_device() {
    let (dispatcher, _sink) = full_dispatcher();
    let device = Arc::clone(dispatcher.device().unwrap());
    let mut handle = MemoryHandle::from_vec(vec![4.0; 8]);

    handle.migrate(Residency::Device, Some(&device)).unwrap();
    let allocated = device.allocated_bytes();
    handle.migrate(Residency::Device, Some(&device)).unwrap();
    assert_eq!(device.allocated_bytes(), allocated);

    handle.migrate(Residency::Host, None).unwrap();
    handle.migrate(Residency::Host, None).unwrap();
    assert_eq!(handle.to_vec().unwrap(), vec![4.0; 8]);
}

#[test]
fn global_dispatcher_installs_once() {
    offload_tracing::init_for_tests();
    let installed = offload_core::install_global(Dispatcher::host_only().unwrap()).unwrap();
    assert!(std::ptr::eq(installed, offload_core::global().unwrap()));
    assert!(matches!(
        offload_core::install_global(Dispatcher::host_only().unwrap()),
        Err(Error::InvalidConfig(_))
    ));

    let mut x = MemoryHandle::from_vec(vec![1.0; 10]);
    let mut y = MemoryHandle::from_vec(vec![0.5; 10]);
    offload_core::global()
        .unwrap()
        .run_default(Kernel::axpy(0.5, &mut x, &mut y))
        .unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![1.0; 10]);
}
