use crate::heap::allocator::{Allocator, DEFAULT_GC_GROW_FACTOR, DEFAULT_GC_THRESHOLD};

/// Tuning knobs for a [`crate::vm::Vm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Bytes allocated before the first collection.
    pub gc_threshold: usize,
    /// Multiplier applied to the surviving bytes after each collection.
    pub gc_grow_factor: usize,
    /// Collect before every allocation.
    pub gc_stress: bool,
    /// Seed for the random natives; the clock is used when absent.
    pub seed: Option<u64>,
}

impl VmConfig {
    pub fn allocator(&self) -> Allocator {
        Allocator::new(self.gc_threshold, self.gc_grow_factor, self.gc_stress)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            gc_grow_factor: DEFAULT_GC_GROW_FACTOR,
            gc_stress: false,
            seed: None,
        }
    }
}
