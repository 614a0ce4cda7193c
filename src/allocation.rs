use crate::capability::{Producer, Stage};
use crate::error::VmmError;
use crate::handle::PhysicalHandle;

/// Derived view of a `ManagedAllocation`'s state.
///
/// There is no `Invalid` variant here: the source design used a sentinel to
/// describe a moved-from-but-still-alive object, a state Rust's ownership
/// model doesn't permit — a moved-from `ManagedAllocation` binding simply
/// cannot be named or dropped again. See `DESIGN.md` for the full resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `handle` is null and `progress == 0`: no physical backing outstanding.
    Released,
    /// `handle` is non-null and every stage has completed setup.
    Materialized,
    /// Neither of the above: a partial pipeline left behind by a failed
    /// `materialize` or `release` call that was not fully rolled forward.
    Errored,
}

struct NullProducer;

impl Producer for NullProducer {
    fn produce(&mut self) -> Result<PhysicalHandle, VmmError> {
        Err(VmmError::Unsupported("this allocation has no producer"))
    }

    fn dispose(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
        Ok(())
    }
}

/// A single virtual-address reservation's staged materialize/release state
/// machine.
///
/// State is fully described by two fields: `handle` (the physical handle, or
/// `PhysicalHandle::NULL` when none is outstanding) and `progress` (how many
/// of `stages` have completed setup without a matching teardown). Everything
/// else — `status()`, invariants, the asymmetric fail-fast/best-effort
/// behavior of `materialize`/`release` — is derived from those two fields.
pub struct ManagedAllocation {
    producer: Box<dyn Producer>,
    stages: Vec<Box<dyn Stage>>,
    handle: PhysicalHandle,
    progress: u32,
}

impl ManagedAllocation {
    pub fn new(producer: Box<dyn Producer>, stages: Vec<Box<dyn Stage>>) -> Self {
        Self {
            producer,
            stages,
            handle: PhysicalHandle::NULL,
            progress: 0,
        }
    }

    /// A released allocation with no producer or stages; used as the result
    /// of looking up a handle key the cohort manager has no entry for.
    pub fn empty() -> Self {
        Self::new(Box::new(NullProducer), Vec::new())
    }

    pub fn handle(&self) -> PhysicalHandle {
        self.handle
    }

    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn status(&self) -> Status {
        if self.progress as usize == self.stages.len() && !self.handle.is_null() {
            Status::Materialized
        } else if self.progress == 0 && self.handle.is_null() {
            Status::Released
        } else {
            Status::Errored
        }
    }

    /// Produces a physical handle and runs every stage's `setup` in order.
    ///
    /// Fails fast: the first stage failure (or a producer failure) is
    /// returned immediately, with no attempt to roll back what already
    /// succeeded. `status()` becomes `Errored` unless the failure happened in
    /// `produce` itself, in which case the allocation is untouched.
    ///
    /// Precondition: `status() == Released`.
    pub fn materialize(&mut self) -> Result<(), VmmError> {
        debug_assert_eq!(
            self.status(),
            Status::Released,
            "materialize() requires a released allocation"
        );
        let handle = self.producer.produce()?;
        self.handle = handle;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            if let Err(error) = stage.setup(handle) {
                tracing::warn!(
                    stage = stage.name(),
                    index,
                    %error,
                    "stage setup failed; allocation is now errored"
                );
                return Err(error);
            }
            self.progress = index as u32 + 1;
        }
        Ok(())
    }

    /// Tears down every completed stage in reverse order, then disposes of
    /// the physical handle.
    ///
    /// Best-effort: a failure never stops the loop early. Each stage's
    /// teardown runs regardless of whether an earlier one failed, `progress`
    /// is decremented either way, and the handle is always cleared to null
    /// once the loop completes. The most recently observed error is
    /// returned; earlier ones are logged and discarded.
    pub fn release(&mut self) -> Result<(), VmmError> {
        let mut last_error = None;
        while self.progress > 0 {
            let index = (self.progress - 1) as usize;
            if let Err(error) = self.stages[index].teardown(self.handle) {
                tracing::warn!(
                    stage = self.stages[index].name(),
                    index,
                    %error,
                    "stage teardown failed; continuing best-effort release"
                );
                last_error = Some(error);
            }
            self.progress -= 1;
        }
        if !self.handle.is_null() {
            let handle = self.handle;
            self.handle = PhysicalHandle::NULL;
            if let Err(error) = self.producer.dispose(handle) {
                tracing::warn!(%error, "producer dispose failed during release");
                last_error = Some(error);
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Consumes the allocation and releases it, surfacing any failure to the
    /// caller. `Drop::drop` can't return a `Result`, so it logs and swallows
    /// release errors instead; call this explicitly when a caller needs to
    /// observe them.
    pub fn close(mut self) -> Result<(), VmmError> {
        self.release()
    }
}

impl Drop for ManagedAllocation {
    fn drop(&mut self) {
        if self.handle.is_null() && self.progress == 0 {
            return;
        }
        if let Err(error) = self.release() {
            tracing::error!(%error, "allocation released with error while being dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingProducer {
        log: Arc<Mutex<Vec<&'static str>>>,
        next_handle: u64,
        fail_produce: bool,
        fail_dispose: bool,
    }

    impl Producer for RecordingProducer {
        fn produce(&mut self) -> Result<PhysicalHandle, VmmError> {
            self.log.lock().unwrap().push("produce");
            if self.fail_produce {
                return Err(VmmError::ProducerFailure("injected".into()));
            }
            self.next_handle += 1;
            Ok(PhysicalHandle::new(self.next_handle))
        }

        fn dispose(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
            self.log.lock().unwrap().push("dispose");
            if self.fail_dispose {
                return Err(VmmError::ProducerFailure("dispose injected".into()));
            }
            Ok(())
        }
    }

    struct RecordingStage {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_setup: bool,
        fail_teardown: bool,
    }

    impl Stage for RecordingStage {
        fn setup(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail_setup {
                return Err(VmmError::StageSetupFailure {
                    stage_index: 0,
                    message: "injected".into(),
                });
            }
            Ok(())
        }

        fn teardown(&mut self, _handle: PhysicalHandle) -> Result<(), VmmError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail_teardown {
                return Err(VmmError::StageTeardownFailure {
                    stage_index: 0,
                    message: "injected".into(),
                });
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    fn stage(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        fail_setup: bool,
        fail_teardown: bool,
    ) -> Box<dyn Stage> {
        Box::new(RecordingStage {
            name,
            log: Arc::clone(log),
            fail_setup,
            fail_teardown,
        })
    }

    #[test]
    fn fresh_allocation_is_released() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(RecordingProducer {
            log: Arc::clone(&log),
            next_handle: 0,
            fail_produce: false,
            fail_dispose: false,
        });
        let allocation = ManagedAllocation::new(producer, Vec::new());
        assert_eq!(allocation.status(), Status::Released);
        assert!(allocation.handle().is_null());
    }

    #[test]
    fn materialize_then_release_is_symmetric() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(RecordingProducer {
            log: Arc::clone(&log),
            next_handle: 0,
            fail_produce: false,
            fail_dispose: false,
        });
        let stages = vec![
            stage("a", &log, false, false),
            stage("b", &log, false, false),
        ];
        let mut allocation = ManagedAllocation::new(producer, stages);

        allocation.materialize().unwrap();
        assert_eq!(allocation.status(), Status::Materialized);
        assert_eq!(allocation.progress(), 2);

        allocation.release().unwrap();
        assert_eq!(allocation.status(), Status::Released);
        assert_eq!(allocation.progress(), 0);
        assert!(allocation.handle().is_null());

        assert_eq!(
            &*log.lock().unwrap(),
            &["produce", "a", "b", "b", "a", "dispose"]
        );
    }

    #[test]
    fn materialize_fails_fast_without_rollback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(RecordingProducer {
            log: Arc::clone(&log),
            next_handle: 0,
            fail_produce: false,
            fail_dispose: false,
        });
        let stages = vec![
            stage("a", &log, false, false),
            stage("b", &log, true, false),
            stage("c", &log, false, false),
        ];
        let mut allocation = ManagedAllocation::new(producer, stages);

        let err = allocation.materialize().unwrap_err();
        assert!(matches!(err, VmmError::StageSetupFailure { .. }));
        assert_eq!(allocation.status(), Status::Errored);
        assert_eq!(allocation.progress(), 1);
        assert!(!allocation.handle().is_null());
        // "c" never ran; fail-fast does not attempt the remaining stages.
        assert_eq!(&*log.lock().unwrap(), &["produce", "a", "b"]);
    }

    #[test]
    fn release_completes_every_stage_despite_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(RecordingProducer {
            log: Arc::clone(&log),
            next_handle: 0,
            fail_produce: false,
            fail_dispose: false,
        });
        let stages = vec![
            stage("a", &log, false, true),
            stage("b", &log, false, false),
            stage("c", &log, false, true),
        ];
        let mut allocation = ManagedAllocation::new(producer, stages);
        allocation.materialize().unwrap();
        log.lock().unwrap().clear();

        let err = allocation.release().unwrap_err();
        assert!(matches!(err, VmmError::StageTeardownFailure { .. }));
        // every stage tore down despite "a" and "c" failing; order is reverse.
        assert_eq!(&*log.lock().unwrap(), &["c", "b", "a", "dispose"]);
        assert_eq!(allocation.status(), Status::Released);
        assert_eq!(allocation.progress(), 0);
    }

    #[test]
    fn producer_failure_never_touches_progress() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(RecordingProducer {
            log: Arc::clone(&log),
            next_handle: 0,
            fail_produce: true,
            fail_dispose: false,
        });
        let stages = vec![stage("a", &log, false, false)];
        let mut allocation = ManagedAllocation::new(producer, stages);

        let err = allocation.materialize().unwrap_err();
        assert!(matches!(err, VmmError::ProducerFailure(_)));
        assert_eq!(allocation.status(), Status::Released);
        assert_eq!(allocation.progress(), 0);
        assert!(allocation.handle().is_null());
    }

    #[test]
    fn close_surfaces_the_release_error_the_destructor_would_have_swallowed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(RecordingProducer {
            log: Arc::clone(&log),
            next_handle: 0,
            fail_produce: false,
            fail_dispose: true,
        });
        let mut allocation = ManagedAllocation::new(producer, Vec::new());
        allocation.materialize().unwrap();

        let err = allocation.close().unwrap_err();
        assert!(matches!(err, VmmError::ProducerFailure(_)));
    }

    #[test]
    fn drop_while_materialized_runs_teardown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(RecordingProducer {
            log: Arc::clone(&log),
            next_handle: 0,
            fail_produce: false,
            fail_dispose: false,
        });
        let stages = vec![stage("a", &log, false, false)];
        let mut allocation = ManagedAllocation::new(producer, stages);
        allocation.materialize().unwrap();
        log.lock().unwrap().clear();

        drop(allocation);
        assert_eq!(&*log.lock().unwrap(), &["a", "dispose"]);
    }

    #[test]
    fn drop_while_released_makes_no_driver_calls() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(RecordingProducer {
            log: Arc::clone(&log),
            next_handle: 0,
            fail_produce: false,
            fail_dispose: false,
        });
        let allocation = ManagedAllocation::new(producer, Vec::new());
        drop(allocation);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn move_leaves_no_trace_on_the_source() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = Box::new(RecordingProducer {
            log: Arc::clone(&log),
            next_handle: 0,
            fail_produce: false,
            fail_dispose: false,
        });
        let mut a1 = ManagedAllocation::new(producer, Vec::new());
        a1.materialize().unwrap();
        log.lock().unwrap().clear();

        // Moving out of an `Option` slot is the idiomatic way to express
        // "transfer ownership, leave nothing behind to drop": the slot left
        // in place is `None`, and dropping `None` makes no driver calls.
        let mut slot = Some(a1);
        let a2 = slot.take().unwrap();
        drop(slot);
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(a2.status(), Status::Materialized);
        drop(a2);
        assert_eq!(&*log.lock().unwrap(), &["dispose"]);
    }
}
