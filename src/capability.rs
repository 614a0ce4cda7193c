use crate::error::VmmError;
use crate::handle::PhysicalHandle;

/// Produces and disposes of the physical backing for one allocation.
///
/// `produce` is called at most once before a matching `dispose`; `dispose` is
/// called at most once per successful `produce`. Implementations do not need
/// to be reentrant — `ManagedAllocation` only ever calls these from behind
/// whatever external synchronization owns it.
pub trait Producer: Send {
    fn produce(&mut self) -> Result<PhysicalHandle, VmmError>;

    /// Releases the physical backing `handle` refers to. Expected to complete
    /// even after a partial pipeline failure; implementations that can fail
    /// should still release what they can before returning `Err`.
    fn dispose(&mut self, handle: PhysicalHandle) -> Result<(), VmmError>;
}

/// One step of a materialize/release pipeline.
///
/// `setup` is called with the handle freshly produced for this allocation;
/// `teardown` is called with the same handle, in reverse stage order, and
/// must run even when an earlier stage's teardown already failed.
pub trait Stage: Send {
    fn setup(&mut self, handle: PhysicalHandle) -> Result<(), VmmError>;
    fn teardown(&mut self, handle: PhysicalHandle) -> Result<(), VmmError>;

    /// Short, stable identifier used in log messages; not for display to end users.
    fn name(&self) -> &'static str;
}
