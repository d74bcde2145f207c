//! Calculate the heap-allocated size of values at runtime.
//!
//! This is how the tracer answers "how big is the thing this function returned?".
//! The numbers are estimates: they are based on capacities and `size_of`,
//! not on what the allocator actually handed out.

mod std_sizes;

/// Approximations of stack and heap size for both internal and external types.
///
/// Implement this for any type that a traced function returns.
pub trait SizeBytes {
    /// Returns the total size of `self` in bytes, accounting for both stack and heap space.
    #[inline]
    fn total_size_bytes(&self) -> u64 {
        self.stack_size_bytes() + self.heap_size_bytes()
    }

    /// Returns the total size of `self` on the stack, in bytes.
    ///
    /// Defaults to `std::mem::size_of_val(self)`.
    #[inline]
    fn stack_size_bytes(&self) -> u64 {
        std::mem::size_of_val(self) as _
    }

    /// Returns how many bytes `self` uses on the heap.
    ///
    /// In some cases `self` may be just a slice of a larger buffer.
    /// This will in that case only return the memory used by that smaller slice.
    fn heap_size_bytes(&self) -> u64;
}

/// Sum the heap sizes of all items, plus the unused-but-allocated capacity.
pub(crate) fn heap_of_items<'a, T: SizeBytes + 'a>(
    items: impl Iterator<Item = &'a T>,
    capacity: usize,
) -> u64 {
    let item_heap: u64 = items.map(SizeBytes::heap_size_bytes).sum();
    (capacity * std::mem::size_of::<T>()) as u64 + item_heap
}
