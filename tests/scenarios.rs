//! End-to-end scenarios against `FakeBackend`, exercising the adapter,
//! cohort manager, and stage pipeline together rather than in isolation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

use gpu_vmm::adapter::{current_adapter, pop_adapter, push_adapter};
use gpu_vmm::backends::{FakeBackend, FaultSpec};
use gpu_vmm::{
    AdapterConfiguration, AllocatorAdapter, BackupMode, CohortManager, DriverBackend,
    MemoryCounters, PhysicalHandle, Producer, Stage, Status, Stream, VmmError,
};

// `push_adapter`/`pop_adapter` operate on a process-wide stack; serialize
// every test in this binary that touches it.
static STACK_LOCK: Mutex<()> = Mutex::new(());

static TRACING_INIT: Once = Once::new();

// `release_by_tag`/`materialize_by_tag` log quarantine events through
// `tracing`; route them to stderr (set `RUST_LOG=gpu_vmm=debug` to see them)
// instead of letting the default no-op subscriber swallow them.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn harness() -> (Arc<FakeBackend>, AllocatorAdapter, Arc<CohortManager>) {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    let driver: Arc<dyn DriverBackend> = backend.clone();
    let counters = Arc::new(MemoryCounters::new());
    let manager = Arc::new(CohortManager::new());
    let adapter = AllocatorAdapter::new(Arc::clone(&driver), counters);
    (backend, adapter, manager)
}

#[test]
fn happy_path_round_trips_contents_through_release_and_materialize() {
    let _guard = STACK_LOCK.lock().unwrap();
    let (backend, adapter, manager) = harness();

    push_adapter(AdapterConfiguration::new(
        Arc::clone(&manager),
        "A",
        BackupMode::Host,
        Stream(7),
        4096,
    ));

    let ptr = adapter.allocate(4096, 0).unwrap();
    backend.write(ptr, &[0xab; 4096]);

    assert_eq!(manager.release_by_tag("A").unwrap(), 1);
    assert_eq!(manager.materialize_by_tag("A").unwrap(), 1);

    assert_eq!(backend.read(ptr, 1), vec![0xab]);

    adapter.deallocate(ptr, 4096).unwrap();
    assert!(manager.take_bad_handles().is_empty());

    pop_adapter().unwrap();
}

#[test]
fn materialize_by_tag_rolls_back_the_survivor_and_quarantines_the_failure() {
    let _guard = STACK_LOCK.lock().unwrap();
    let (backend, adapter, manager) = harness();

    push_adapter(AdapterConfiguration::new(
        Arc::clone(&manager),
        "B",
        BackupMode::None,
        Stream(0),
        4096,
    ));

    // Two initial allocations each issue one "map" call (#1, #2); release
    // issues "unmap", not "map". The next materialize_by_tag issues "map"
    // again for each entry in registration order (#3, #4) — fail the second.
    let ptr1 = adapter.allocate(4096, 0).unwrap();
    let ptr2 = adapter.allocate(4096, 0).unwrap();

    assert_eq!(manager.release_by_tag("B").unwrap(), 2);

    backend.inject_fault(FaultSpec::new(
        "map",
        4,
        VmmError::StageSetupFailure {
            stage_index: 0,
            message: "injected".into(),
        },
    ));

    let err = manager.materialize_by_tag("B");
    assert!(err.is_err());

    assert!(manager.contains(ptr1));
    assert!(!manager.contains(ptr2));
    assert_eq!(manager.take_bad_handles(), vec![ptr2]);

    pop_adapter().unwrap();
}

struct RecordingStage {
    name: &'static str,
    fail_teardown: Arc<AtomicBool>,
}

impl Stage for RecordingStage {
    fn setup(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
        Ok(())
    }

    fn teardown(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
        if self.fail_teardown.load(Ordering::SeqCst) {
            Err(VmmError::StageTeardownFailure {
                stage_index: 0,
                message: "injected".into(),
            })
        } else {
            Ok(())
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

struct CountingProducer {
    backend: Arc<FakeBackend>,
}

impl Producer for CountingProducer {
    fn produce(&mut self) -> Result<PhysicalHandle, VmmError> {
        use gpu_vmm::{AllocationProperties, Location};
        self.backend
            .create_physical(AllocationProperties { location: Location::Device(0) }, 64)
    }

    fn dispose(&mut self, handle: PhysicalHandle) -> Result<(), VmmError> {
        self.backend.release_physical(handle);
        Ok(())
    }
}

#[test]
fn best_effort_release_completes_every_stage_past_a_middle_failure() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    let manager = CohortManager::new();

    let fail_middle = Arc::new(AtomicBool::new(true));
    let producer = Box::new(CountingProducer { backend: Arc::clone(&backend) });
    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(RecordingStage { name: "a", fail_teardown: Arc::new(AtomicBool::new(false)) }),
        Box::new(RecordingStage { name: "b", fail_teardown: Arc::clone(&fail_middle) }),
        Box::new(RecordingStage { name: "c", fail_teardown: Arc::new(AtomicBool::new(false)) }),
    ];
    manager.add_and_materialize(1, "C", producer, stages).unwrap();

    let err = manager.release_by_tag("C");
    assert!(err.is_err());
    // the middle stage's teardown failure doesn't stop "a"'s teardown or the
    // producer's dispose from running; the entry is quarantined regardless.
    assert!(!manager.contains(1));
    assert_eq!(manager.take_bad_handles(), vec![1]);
}

#[test]
fn zero_fill_is_skipped_on_first_materialize_but_runs_on_the_second() {
    let _guard = STACK_LOCK.lock().unwrap();
    let (backend, adapter, manager) = harness();

    // memset_async would hit this fault on its first real call; if it fires
    // during the initial allocate, first_time-skipping is broken.
    backend.inject_fault(FaultSpec::new(
        "memset_async",
        1,
        VmmError::StageSetupFailure {
            stage_index: 1,
            message: "memset should not have run yet".into(),
        },
    ));

    push_adapter(AdapterConfiguration::new(
        Arc::clone(&manager),
        "D",
        BackupMode::Memset,
        Stream(0),
        4096,
    ));

    let ptr = adapter.allocate(64, 0).unwrap();

    manager.release_by_tag("D").unwrap();
    let err = manager.materialize_by_tag("D");
    assert!(err.is_err(), "second materialize should hit the injected memset fault");
    let _ = ptr;

    pop_adapter().unwrap();
}

#[test]
fn on_demand_backup_frees_its_host_buffer_after_restore() {
    let _guard = STACK_LOCK.lock().unwrap();
    let (backend, adapter, manager) = harness();

    push_adapter(AdapterConfiguration::new(
        Arc::clone(&manager),
        "E",
        BackupMode::HostPinned,
        Stream(0),
        4096,
    ));

    let ptr = adapter.allocate(64, 0).unwrap();
    backend.write(ptr, &[3; 64]);

    manager.release_by_tag("E").unwrap();
    manager.materialize_by_tag("E").unwrap();

    // Contents made it back across the on-demand pinned-host round trip.
    assert_eq!(backend.read(ptr, 64), vec![3; 64]);

    adapter.deallocate(ptr, 64).unwrap();
    pop_adapter().unwrap();
}

#[test]
fn moving_a_materialized_allocation_leaves_the_source_inert() {
    init_tracing();
    let backend = Arc::new(FakeBackend::new());
    let manager = CohortManager::new();

    let producer = Box::new(CountingProducer { backend: Arc::clone(&backend) });
    let stages: Vec<Box<dyn Stage>> =
        vec![Box::new(RecordingStage { name: "a", fail_teardown: Arc::new(AtomicBool::new(false)) })];
    manager.add_and_materialize(1, "F", producer, stages).unwrap();

    let a1 = manager.remove(1);
    assert_eq!(a1.status(), Status::Materialized);

    // `let a2 = a1;` moves ownership; the compiler statically forbids using
    // `a1` again, which is this crate's answer to "destructing a moved-from
    // object does nothing" — there is no `a1` left to destruct.
    let a2 = a1;
    assert_eq!(a2.status(), Status::Materialized);
    drop(a2);
}

#[test]
fn empty_adapter_stack_and_unbalanced_pop_are_reported() {
    let _guard = STACK_LOCK.lock().unwrap();
    assert!(matches!(current_adapter().unwrap_err(), VmmError::EmptyAdapterStack));
    assert!(matches!(pop_adapter().unwrap_err(), VmmError::UnknownAdapterPop));
}
