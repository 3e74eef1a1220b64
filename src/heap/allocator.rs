use log::trace;

pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;
pub const DEFAULT_GC_GROW_FACTOR: usize = 2;

/// Byte accounting for the managed heap. Decides when the collector runs.
#[derive(Debug, Clone)]
pub struct Allocator {
    allocated: usize,
    next_gc: usize,
    initial_threshold: usize,
    grow_factor: usize,
    stress: bool,
}

impl Allocator {
    pub fn new(initial_threshold: usize, grow_factor: usize, stress: bool) -> Self {
        Self {
            allocated: 0,
            next_gc: initial_threshold,
            initial_threshold,
            grow_factor: grow_factor.max(1),
            stress,
        }
    }

    pub fn record_allocation(&mut self, size: usize) {
        self.allocated += size;
        trace!(
            "Allocated {} bytes for a new total of {}",
            size,
            self.allocated
        );
    }

    pub fn record_free(&mut self, size: usize) {
        self.allocated = self.allocated.saturating_sub(size);
        trace!(
            "Deallocated {} bytes for a new total of {}",
            size,
            self.allocated
        );
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.allocated > self.next_gc
    }

    /// Grows the threshold relative to what survived the collection, never
    /// dropping below the initial threshold.
    pub fn finish_collection(&mut self) {
        self.next_gc = self
            .allocated
            .saturating_mul(self.grow_factor)
            .max(self.initial_threshold);
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(DEFAULT_GC_THRESHOLD, DEFAULT_GC_GROW_FACTOR, false)
    }
}
