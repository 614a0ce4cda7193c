/// Opaque driver-owned token for a physical GPU (or pinned host) memory allocation.
///
/// Valid (non-zero) only while produced and not yet disposed; see `ManagedAllocation`'s
/// invariants for how the zero value doubles as "no physical backing outstanding."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PhysicalHandle(u64);

impl PhysicalHandle {
    pub const NULL: PhysicalHandle = PhysicalHandle(0);

    /// Wraps a non-zero driver-assigned token.
    pub fn new(raw: u64) -> Self {
        debug_assert_ne!(raw, 0, "a produced handle must be non-zero");
        PhysicalHandle(raw)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PhysicalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
