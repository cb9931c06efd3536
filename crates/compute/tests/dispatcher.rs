//! Full dispatch cycles against the simulated CPU device.

#![cfg(feature = "cpu")]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use compute::kernels::{CpuKernel, Invocation};
use compute::layout::{self, BindingDecl, SLOT_INPUT_A, SLOT_INPUT_B, SLOT_RESULT};
use compute::{
    ComputeError, CpuDevice, DispatchConfig, DispatchGeometry, Dispatcher, Element, ElementType,
    ErrorPhase, ExecutionQueue, KernelProgram, MemoryRegion, RegionState,
};

fn dispatcher(device: &Arc<CpuDevice>, config: DispatchConfig) -> Dispatcher<CpuDevice> {
    Dispatcher::with_config(Arc::clone(device), config).unwrap()
}

fn f32_config(element_count: usize) -> DispatchConfig {
    DispatchConfig::default().with_element_count(element_count)
}

#[test]
fn default_config_matches_sample() {
    let config = DispatchConfig::default();
    assert_eq!(config.kernel, "add");
    assert_eq!(config.element_count, 1 << 24);
    assert_eq!(config.element_type, ElementType::F32);
    assert_eq!(config.timeout, None);
    assert_eq!(config.max_group_size, None);
}

#[test]
fn adds_f32_for_assorted_sizes() {
    let device = Arc::new(CpuDevice::builder().max_group_size(256).build());
    for n in [1, 3, 64, 1000, 4097] {
        let a: Vec<f32> = (0..n).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..n).map(|i| 100.0 - i as f32).collect();
        let mut dispatcher = dispatcher(&device, f32_config(n));
        let out = dispatcher.run(&a, &b).unwrap();
        let expected: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        assert_eq!(out, expected, "n = {n}");
        assert_eq!(dispatcher.read_result::<f32>().unwrap(), expected);
        assert_eq!(dispatcher.result_state(), RegionState::Ready);
    }
}

#[test]
fn integer_addition_wraps() {
    let device = Arc::new(CpuDevice::new());

    let mut signed = dispatcher(&device, f32_config(3).with_element_type(ElementType::I32));
    let out = signed.run(&[i32::MAX, -5, 7], &[1, 5, -10]).unwrap();
    assert_eq!(out, vec![i32::MIN, 0, -3]);

    let mut unsigned = dispatcher(&device, f32_config(2).with_element_type(ElementType::U32));
    let out = unsigned.run(&[u32::MAX, 40], &[2, 2]).unwrap();
    assert_eq!(out, vec![1, 42]);
}

#[test]
fn zero_length_is_a_no_op() {
    let device = Arc::new(CpuDevice::builder().record_batches(true).build());
    let mut dispatcher = dispatcher(&device, f32_config(0));
    assert_eq!(dispatcher.geometry(), None);
    assert_eq!(dispatcher.group_size(), None);
    assert!(dispatcher.run::<f32>(&[], &[]).unwrap().is_empty());
    assert_eq!(dispatcher.queue().submitted(), 0);
    assert!(device.records().is_empty());
}

#[test]
fn partial_last_group_stays_in_bounds() {
    let device = Arc::new(CpuDevice::builder().max_group_size(4).guard_bytes(64).build());
    let mut dispatcher = dispatcher(&device, f32_config(10));
    assert_eq!(
        dispatcher.geometry(),
        Some(DispatchGeometry {
            groups: 3,
            group_size: 4,
        })
    );

    let a: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let b = vec![1.0f32; 10];
    let out = dispatcher.run(&a, &b).unwrap();
    assert_eq!(out, (1..=10).map(|i| i as f32).collect::<Vec<_>>());
    assert!(dispatcher.result().device_buffer().guard_intact());
}

fn add_unchecked(invocation: &mut Invocation<'_>) {
    let index = invocation.global_id;
    let a: f32 = invocation.load(SLOT_INPUT_A, index);
    let b: f32 = invocation.load(SLOT_INPUT_B, index);
    invocation.store(index, Element::add(a, b));
}

#[test]
fn unchecked_kernel_writes_into_guard() {
    let bindings =
        layout::contract(ElementType::F32).map(|decl| BindingDecl { element: None, ..decl });
    let device = Arc::new(
        CpuDevice::builder()
            .max_group_size(4)
            .guard_bytes(64)
            .kernel(CpuKernel::new("add_unchecked", bindings, add_unchecked))
            .build(),
    );
    let mut dispatcher = dispatcher(&device, f32_config(10).with_kernel("add_unchecked"));
    dispatcher.run(&[1.0f32; 10], &[2.0f32; 10]).unwrap();
    assert!(!dispatcher.result().device_buffer().guard_intact());
}

#[test]
fn group_size_follows_the_smaller_cap() {
    let device = Arc::new(CpuDevice::builder().max_group_size(64).build());
    let capped = dispatcher(&device, f32_config(100).with_max_group_size(16));
    assert_eq!(capped.group_size(), Some(16));
    assert_eq!(capped.geometry().unwrap().groups, 7);

    let uncapped = dispatcher(&device, f32_config(100).with_max_group_size(1024));
    assert_eq!(uncapped.group_size(), Some(64));

    let small = dispatcher(&device, f32_config(5));
    assert_eq!(
        small.geometry(),
        Some(DispatchGeometry {
            groups: 1,
            group_size: 5,
        })
    );
}

#[test]
fn consecutive_runs_see_their_own_inputs() {
    let device = Arc::new(
        CpuDevice::builder()
            .record_batches(true)
            .completion_delay(Duration::from_millis(30))
            .build(),
    );
    let mut dispatcher = dispatcher(&device, f32_config(4).with_element_type(ElementType::U32));

    let first = dispatcher.run(&[1u32, 2, 3, 4], &[10, 20, 30, 40]).unwrap();
    assert_eq!(dispatcher.input_a().read_all::<u32>().unwrap(), vec![1, 2, 3, 4]);
    let second = dispatcher.run(&[5u32, 6, 7, 8], &[50, 60, 70, 80]).unwrap();

    assert_eq!(first, vec![11, 22, 33, 44]);
    assert_eq!(second, vec![55, 66, 77, 88]);

    let records = device.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].input_a_as::<u32>(), vec![1, 2, 3, 4]);
    assert_eq!(records[1].input_b_as::<u32>(), vec![50, 60, 70, 80]);
    assert!(records[1].started >= records[0].finished);
    assert_eq!(dispatcher.queue().submitted(), 2);
}

#[test]
fn queued_batches_complete_in_submission_order() {
    let device = Arc::new(
        CpuDevice::builder()
            .record_batches(true)
            .completion_delay(Duration::from_millis(20))
            .build(),
    );
    let program = KernelProgram::load(&device, "add", ElementType::I32).unwrap();
    let mut sets: Vec<Vec<MemoryRegion<CpuDevice>>> = (0..2)
        .map(|_| {
            (0..3)
                .map(|slot| {
                    let label = layout::slot_label(slot);
                    MemoryRegion::allocate(&device, label, 3, ElementType::I32).unwrap()
                })
                .collect()
        })
        .collect();
    for (value, set) in (1i32..).zip(sets.iter_mut()) {
        set[0].write(0, &[value; 3]).unwrap();
        set[1].write(0, &[value * 100; 3]).unwrap();
    }

    let mut queue = ExecutionQueue::new(&device, "ordered").unwrap();
    let geometry = DispatchGeometry::for_elements(3, 64).unwrap();
    let mut submissions = Vec::new();
    for set in &sets {
        let mut encoder = queue.encoder();
        encoder
            .set_program(&program)
            .bind(SLOT_INPUT_A, &set[0])
            .bind(SLOT_INPUT_B, &set[1])
            .bind(SLOT_RESULT, &set[2])
            .dispatch(geometry);
        submissions.push(encoder.commit().unwrap());
    }

    submissions[1].wait().unwrap();
    assert!(submissions[0].is_complete());
    assert_eq!(queue.submitted(), 2);
    assert_eq!(sets[0][2].read_all::<i32>().unwrap(), vec![101; 3]);
    assert_eq!(sets[1][2].read_all::<i32>().unwrap(), vec![202; 3]);

    let records = device.records();
    assert_eq!(records.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2]);
    assert!(records.iter().all(|r| r.queue == "ordered"));
}

#[test]
fn device_lost_mid_dispatch_leaves_result_undefined() {
    let device = Arc::new(CpuDevice::new());
    let mut dispatcher = dispatcher(&device, f32_config(8));
    dispatcher.run(&[1.0f32; 8], &[1.0f32; 8]).unwrap();

    device.lose_during_next_batch();
    let err = dispatcher.run(&[2.0f32; 8], &[2.0f32; 8]).unwrap_err();
    assert!(matches!(err, ComputeError::DeviceLost(_)), "{err:?}");
    assert_eq!(err.phase(), ErrorPhase::Run);
    assert_eq!(dispatcher.result_state(), RegionState::Undefined);
    assert!(matches!(
        dispatcher.read_result::<f32>(),
        Err(ComputeError::UndefinedContents(_))
    ));

    let err = dispatcher.run(&[3.0f32; 8], &[3.0f32; 8]).unwrap_err();
    assert!(matches!(err, ComputeError::Submission(_)), "{err:?}");
    assert_eq!(dispatcher.queue().submitted(), 2);
}

#[test]
fn rejected_submission_is_reported_once_and_not_retried() {
    let device = Arc::new(CpuDevice::builder().record_batches(true).build());
    let mut dispatcher = dispatcher(&device, f32_config(4));
    assert_eq!(dispatcher.run(&[1.0f32; 4], &[1.0f32; 4]).unwrap(), vec![2.0; 4]);
    assert_eq!(dispatcher.result_state(), RegionState::Ready);
    assert_eq!(device.records().len(), 1);

    device.reject_submissions(true);
    let err = dispatcher.run(&[3.0f32; 4], &[3.0f32; 4]).unwrap_err();
    assert!(matches!(err, ComputeError::Submission(_)), "{err:?}");
    assert_eq!(err.phase(), ErrorPhase::Run);
    assert_eq!(dispatcher.queue().submitted(), 1);
    assert_eq!(device.records().len(), 1);
    assert_eq!(dispatcher.result_state(), RegionState::Undefined);
    assert!(matches!(
        dispatcher.read_result::<f32>(),
        Err(ComputeError::UndefinedContents(_))
    ));

    device.reject_submissions(false);
    assert_eq!(dispatcher.run(&[4.0f32; 4], &[1.0f32; 4]).unwrap(), vec![5.0; 4]);
    assert_eq!(dispatcher.queue().submitted(), 2);
    assert_eq!(device.records().len(), 2);
}

#[test]
fn dispatchers_on_one_device_do_not_alias() {
    let device = Arc::new(CpuDevice::new());
    let mut first = dispatcher(&device, f32_config(16));
    let mut second = dispatcher(&device, f32_config(16));

    let ids: Vec<u64> = [&first, &second]
        .iter()
        .flat_map(|d| [d.input_a(), d.input_b(), d.result()])
        .map(|region| region.device_buffer().id())
        .collect();
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());

    assert_eq!(first.run(&[1.0f32; 16], &[1.0f32; 16]).unwrap(), vec![2.0; 16]);
    assert_eq!(second.run(&[5.0f32; 16], &[5.0f32; 16]).unwrap(), vec![10.0; 16]);
    assert_eq!(first.read_result::<f32>().unwrap(), vec![2.0; 16]);
    assert!(first.program().is_prepared(16));
}

#[test]
fn bounded_wait_expires_then_settles() {
    let device = Arc::new(
        CpuDevice::builder()
            .completion_delay(Duration::from_millis(200))
            .build(),
    );
    let config = f32_config(4).with_timeout(Duration::from_millis(10));
    let mut dispatcher = dispatcher(&device, config);

    let err = dispatcher.run(&[1.0f32, 2.0, 3.0, 4.0], &[1.0f32; 4]).unwrap_err();
    assert_eq!(err, ComputeError::DispatchTimeout(Duration::from_millis(10)));
    assert!(dispatcher.has_pending());
    assert_eq!(dispatcher.result_state(), RegionState::InFlight);
    assert!(matches!(
        dispatcher.read_result::<f32>(),
        Err(ComputeError::RegionInFlight(_))
    ));

    thread::sleep(Duration::from_millis(400));
    dispatcher.settle().unwrap();
    assert!(!dispatcher.has_pending());
    assert_eq!(dispatcher.read_result::<f32>().unwrap(), vec![2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn run_refuses_new_inputs_while_a_batch_is_pending() {
    let device = Arc::new(
        CpuDevice::builder()
            .completion_delay(Duration::from_millis(300))
            .build(),
    );
    let timeout = Duration::from_millis(10);
    let mut dispatcher = dispatcher(&device, f32_config(2).with_timeout(timeout));

    let err = dispatcher.run(&[1.0f32; 2], &[1.0f32; 2]).unwrap_err();
    assert_eq!(err, ComputeError::DispatchTimeout(timeout));

    let err = dispatcher.run(&[100.0f32; 2], &[100.0f32; 2]).unwrap_err();
    assert_eq!(err, ComputeError::RegionInFlight("result".into()));
    assert_eq!(err.phase(), ErrorPhase::Usage);
    assert_eq!(dispatcher.queue().submitted(), 1);
    assert!(dispatcher.has_pending());
    assert_eq!(dispatcher.result_state(), RegionState::InFlight);

    thread::sleep(Duration::from_millis(500));
    dispatcher.settle().unwrap();
    assert_eq!(dispatcher.read_result::<f32>().unwrap(), vec![2.0; 2]);

    let err = dispatcher.run(&[100.0f32; 2], &[100.0f32; 2]).unwrap_err();
    assert_eq!(err, ComputeError::DispatchTimeout(timeout));
    assert_eq!(dispatcher.queue().submitted(), 2);

    thread::sleep(Duration::from_millis(500));
    dispatcher.settle().unwrap();
    assert_eq!(dispatcher.read_result::<f32>().unwrap(), vec![200.0; 2]);
}

#[test]
fn bad_inputs_are_usage_errors() {
    let device = Arc::new(CpuDevice::new());
    let mut dispatcher = dispatcher(&device, f32_config(4));

    let err = dispatcher.run(&[1.0f32; 3], &[1.0f32; 4]).unwrap_err();
    assert!(
        matches!(
            err,
            ComputeError::LengthMismatch { expected: 4, actual: 3, ref label } if label == "input_a"
        ),
        "{err:?}"
    );
    assert_eq!(err.phase(), ErrorPhase::Usage);

    let err = dispatcher.run(&[1u32; 4], &[1u32; 4]).unwrap_err();
    assert_eq!(
        err,
        ComputeError::ElementTypeMismatch {
            expected: ElementType::F32,
            actual: ElementType::U32,
        }
    );
    assert_eq!(dispatcher.queue().submitted(), 0);
}

#[test]
fn setup_failures_are_fatal() {
    let cases: Vec<(CpuDevice, DispatchConfig)> = vec![
        (CpuDevice::new(), f32_config(4).with_kernel("mul")),
        (CpuDevice::builder().supports_compute(false).build(), f32_config(4)),
        (CpuDevice::builder().max_buffer_bytes(8).build(), f32_config(4)),
        (CpuDevice::new(), f32_config(4).with_max_group_size(0)),
        (
            CpuDevice::builder().max_group_size(4).max_groups_per_dimension(2).build(),
            f32_config(9),
        ),
    ];
    for (device, config) in cases {
        let err = Dispatcher::with_config(Arc::new(device), config.clone()).unwrap_err();
        assert_eq!(err.phase(), ErrorPhase::Setup, "{config:?}: {err}");
    }
}

#[test]
fn kernel_with_foreign_bindings_is_refused() {
    let decl = |slot, access| BindingDecl {
        slot,
        access,
        element: None,
    };
    let bindings = [
        decl(0, layout::Access::ReadOnly),
        decl(1, layout::Access::ReadOnly),
        decl(3, layout::Access::ReadWrite),
    ];
    let device = Arc::new(
        CpuDevice::builder()
            .kernel(CpuKernel::new("add_misbound", bindings, |_| {}))
            .build(),
    );
    let config = f32_config(4).with_kernel("add_misbound");
    let err = Dispatcher::with_config(device, config).unwrap_err();
    assert!(matches!(err, ComputeError::BindingContract { .. }), "{err:?}");
}
