//! Buffer allocators with a hard byte ceiling.

use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering::{AcqRel, Acquire},
        },
        Arc,
    },
};

use tracing::{debug, error};

/// An allocation would have exceeded a memory limit.
///
/// This is returned as a value, rather than as a formatted message, so that callers can inspect exactly how far over
/// the limit the allocation would have gone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LimitError {
    /// Number of bytes requested.
    pub requested: usize,

    /// Number of bytes in use at the time of the request.
    pub in_use: usize,

    /// The memory limit, in bytes.
    pub limit: usize,
}

impl fmt::Display for LimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "memory limit exceeded: requested {} bytes with {} of {} bytes already in use",
            self.requested, self.in_use, self.limit
        )
    }
}

impl Error for LimitError {}

/// A byte buffer allocator.
///
/// Implementations must hand out buffers whose length is exactly the requested size, as the length of a buffer is
/// what gets accounted for when it is freed.
pub trait BufferAllocator: Send + Sync {
    /// The buffer type handed out by this allocator.
    type Buffer: AsRef<[u8]> + AsMut<[u8]>;

    /// Allocates a buffer of `size` bytes.
    ///
    /// ## Errors
    ///
    /// If the allocation would exceed a memory limit, an error is returned.
    fn allocate(&self, size: usize) -> Result<Self::Buffer, LimitError>;

    /// Resizes `buffer` to `new_size` bytes, preserving its contents up to the smaller of the two sizes.
    ///
    /// ## Errors
    ///
    /// If the resize would exceed a memory limit, an error is returned and `buffer` is left untouched.
    fn reallocate(&self, buffer: &mut Self::Buffer, new_size: usize) -> Result<(), LimitError>;

    /// Frees `buffer`.
    fn free(&self, buffer: Self::Buffer);
}

impl<A> BufferAllocator for &A
where
    A: BufferAllocator + ?Sized,
{
    type Buffer = A::Buffer;

    fn allocate(&self, size: usize) -> Result<Self::Buffer, LimitError> {
        (**self).allocate(size)
    }

    fn reallocate(&self, buffer: &mut Self::Buffer, new_size: usize) -> Result<(), LimitError> {
        (**self).reallocate(buffer, new_size)
    }

    fn free(&self, buffer: Self::Buffer) {
        (**self).free(buffer)
    }
}

impl<A> BufferAllocator for Arc<A>
where
    A: BufferAllocator + ?Sized,
{
    type Buffer = A::Buffer;

    fn allocate(&self, size: usize) -> Result<Self::Buffer, LimitError> {
        (**self).allocate(size)
    }

    fn reallocate(&self, buffer: &mut Self::Buffer, new_size: usize) -> Result<(), LimitError> {
        (**self).reallocate(buffer, new_size)
    }

    fn free(&self, buffer: Self::Buffer) {
        (**self).free(buffer)
    }
}

/// An unbounded allocator backed by the heap.
///
/// Buffers are zero-initialized.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    type Buffer = Vec<u8>;

    fn allocate(&self, size: usize) -> Result<Self::Buffer, LimitError> {
        Ok(vec![0; size])
    }

    fn reallocate(&self, buffer: &mut Self::Buffer, new_size: usize) -> Result<(), LimitError> {
        buffer.resize(new_size, 0);
        if new_size < buffer.capacity() / 2 {
            buffer.shrink_to_fit();
        }
        Ok(())
    }

    fn free(&self, buffer: Self::Buffer) {
        drop(buffer);
    }
}

/// An allocator that enforces a hard limit on the number of bytes allocated through it.
///
/// `BoundedAllocator` wraps another [`BufferAllocator`] and tracks the total size of all outstanding buffers. Any
/// allocation that would take the total over the limit fails with [`LimitError`] before the wrapped allocator is ever
/// called, so the number of bytes in use never exceeds the limit, even transiently.
///
/// Reallocations are accounted for as a single delta between the old and new size, so growing a buffer only requires
/// headroom for the growth itself.
#[derive(Debug)]
pub struct BoundedAllocator<A = HeapAllocator> {
    delegate: A,
    limit: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

impl BoundedAllocator<HeapAllocator> {
    /// Creates a new `BoundedAllocator` backed by the heap, with the given limit in bytes.
    pub const fn heap(limit: usize) -> Self {
        Self::new(HeapAllocator, limit)
    }
}

impl<A> BoundedAllocator<A> {
    /// Creates a new `BoundedAllocator` wrapping `delegate`, with the given limit in bytes.
    pub const fn new(delegate: A, limit: usize) -> Self {
        Self {
            delegate,
            limit,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Returns the limit, in bytes.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the number of bytes currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Acquire)
    }

    /// Returns the number of bytes that can still be allocated.
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.in_use())
    }

    /// Returns the highest number of bytes that have been allocated at once.
    pub fn peak_in_use(&self) -> usize {
        self.peak.load(Acquire)
    }

    fn reserve(&self, size: usize) -> Result<(), LimitError> {
        match self.in_use.fetch_update(AcqRel, Acquire, |in_use| {
            in_use.checked_add(size).filter(|total| *total <= self.limit)
        }) {
            Ok(previous) => {
                self.peak.fetch_max(previous + size, AcqRel);
                Ok(())
            }
            Err(in_use) => Err(LimitError {
                requested: size,
                in_use,
                limit: self.limit,
            }),
        }
    }

    fn unreserve(&self, size: usize) {
        let in_use = self
            .in_use
            .fetch_update(AcqRel, Acquire, |in_use| Some(in_use.saturating_sub(size)))
            .unwrap_or_else(|in_use| in_use);
        if size > in_use {
            error!(
                freed = size,
                in_use, "Freed more bytes than are allocated. Buffer was resized outside of the allocator."
            );
        }
    }
}

impl<A> BufferAllocator for BoundedAllocator<A>
where
    A: BufferAllocator,
{
    type Buffer = A::Buffer;

    fn allocate(&self, size: usize) -> Result<Self::Buffer, LimitError> {
        if let Err(e) = self.reserve(size) {
            debug!(requested = size, in_use = e.in_use, limit = e.limit, "Allocation refused.");
            return Err(e);
        }

        self.delegate.allocate(size).inspect_err(|_| self.unreserve(size))
    }

    fn reallocate(&self, buffer: &mut Self::Buffer, new_size: usize) -> Result<(), LimitError> {
        let old_size = buffer.as_ref().len();
        if new_size > old_size {
            let growth = new_size - old_size;
            if let Err(e) = self.reserve(growth) {
                // Report the failure as if the old buffer had been freed first.
                let e = LimitError {
                    requested: new_size,
                    in_use: e.in_use.saturating_sub(old_size),
                    limit: self.limit,
                };
                debug!(requested = e.requested, in_use = e.in_use, limit = e.limit, "Reallocation refused.");
                return Err(e);
            }

            self.delegate
                .reallocate(buffer, new_size)
                .inspect_err(|_| self.unreserve(growth))
        } else {
            self.delegate.reallocate(buffer, new_size)?;
            self.unreserve(old_size - new_size);
            Ok(())
        }
    }

    fn free(&self, buffer: Self::Buffer) {
        let size = buffer.as_ref().len();
        self.delegate.free(buffer);
        self.unreserve(size);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Delegate that fails every allocation, as if it were itself bounded at zero bytes.
    struct ExhaustedAllocator;

    impl BufferAllocator for ExhaustedAllocator {
        type Buffer = Vec<u8>;

        fn allocate(&self, size: usize) -> Result<Self::Buffer, LimitError> {
            Err(LimitError {
                requested: size,
                in_use: 0,
                limit: 0,
            })
        }

        fn reallocate(&self, _: &mut Self::Buffer, new_size: usize) -> Result<(), LimitError> {
            self.allocate(new_size).map(|_| ())
        }

        fn free(&self, _: Self::Buffer) {}
    }

    #[test]
    fn allocate_up_to_limit() {
        const LIMIT: usize = 4096;
        let allocator = BoundedAllocator::heap(LIMIT);

        let buffer = allocator.allocate(LIMIT).expect("should allocate");
        assert_eq!(buffer.len(), LIMIT);
        assert_eq!(allocator.in_use(), LIMIT);
        assert_eq!(allocator.available(), 0);

        let error = allocator.allocate(1).unwrap_err();
        assert_eq!(
            error,
            LimitError {
                requested: 1,
                in_use: LIMIT,
                limit: LIMIT
            }
        );
        assert_eq!(allocator.in_use(), LIMIT);

        allocator.free(buffer);
        assert_eq!(allocator.in_use(), 0);

        let buffer = allocator.allocate(LIMIT).expect("should allocate after free");
        allocator.free(buffer);
        assert_eq!(allocator.peak_in_use(), LIMIT);
    }

    #[test]
    fn reallocate_accounts_for_delta() {
        let allocator = BoundedAllocator::heap(100);

        let mut buffer = allocator.allocate(40).expect("should allocate");
        buffer[..4].copy_from_slice(b"abcd");

        allocator.reallocate(&mut buffer, 100).expect("should grow to limit");
        assert_eq!(allocator.in_use(), 100);
        assert_eq!(&buffer[..4], b"abcd");

        let error = allocator.reallocate(&mut buffer, 101).unwrap_err();
        assert_eq!(
            error,
            LimitError {
                requested: 101,
                in_use: 0,
                limit: 100
            }
        );
        assert_eq!(buffer.len(), 100);
        assert_eq!(allocator.in_use(), 100);

        allocator.reallocate(&mut buffer, 10).expect("should shrink");
        assert_eq!(allocator.in_use(), 10);
        assert_eq!(&buffer[..4], b"abcd");

        allocator.free(buffer);
        assert_eq!(allocator.in_use(), 0);
        assert_eq!(allocator.peak_in_use(), 100);
    }

    #[test]
    fn delegate_failure_rolls_back_reservation() {
        let allocator = BoundedAllocator::new(ExhaustedAllocator, 100);

        assert!(allocator.allocate(10).is_err());
        assert_eq!(allocator.in_use(), 0);

        let mut buffer = Vec::new();
        assert!(allocator.reallocate(&mut buffer, 10).is_err());
        assert_eq!(allocator.in_use(), 0);
    }

    #[test]
    fn oversized_request_is_refused_when_not_empty() {
        let allocator = BoundedAllocator::heap(100);
        let mut buffer = allocator.allocate(1).expect("should allocate");

        let error = allocator.allocate(usize::MAX).unwrap_err();
        assert_eq!(
            error,
            LimitError {
                requested: usize::MAX,
                in_use: 1,
                limit: 100
            }
        );

        assert!(allocator.reallocate(&mut buffer, usize::MAX).is_err());
        assert_eq!(buffer.len(), 1);
        assert_eq!(allocator.in_use(), 1);

        allocator.free(buffer);
        assert_eq!(allocator.in_use(), 0);
    }

    #[test]
    fn free_of_externally_grown_buffer_saturates() {
        let allocator = BoundedAllocator::heap(100);

        let mut buffer = allocator.allocate(10).expect("should allocate");
        buffer.push(0);
        allocator.free(buffer);
        assert_eq!(allocator.in_use(), 0);

        // A foreign buffer only takes the count down to zero.
        let held = allocator.allocate(5).expect("should allocate");
        allocator.free(vec![0; 50]);
        assert_eq!(allocator.in_use(), 0);
        drop(held);

        let buffer = allocator.allocate(100).expect("full budget should still be available");
        allocator.free(buffer);
        assert_eq!(allocator.in_use(), 0);
    }

    #[test]
    fn shared_across_threads() {
        const LIMIT: usize = 1024;
        let allocator = Arc::new(BoundedAllocator::heap(LIMIT));

        std::thread::scope(|s| {
            for _ in 0..8 {
                let allocator = Arc::clone(&allocator);
                s.spawn(move || {
                    for size in 1..200 {
                        if let Ok(buffer) = allocator.allocate(size) {
                            assert!(allocator.in_use() <= LIMIT);
                            allocator.free(buffer);
                        }
                    }
                });
            }
        });

        assert_eq!(allocator.in_use(), 0);
        assert!(allocator.peak_in_use() <= LIMIT);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Allocate(usize),
        Reallocate(usize, usize),
        Free(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..=300).prop_map(Op::Allocate),
            (any::<usize>(), 0usize..=300).prop_map(|(idx, size)| Op::Reallocate(idx, size)),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn property_test_in_use_matches_live_buffers(ops in prop::collection::vec(arb_op(), 0..64)) {
            const LIMIT: usize = 512;
            let allocator = BoundedAllocator::heap(LIMIT);
            let mut buffers = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate(size) => {
                        if let Ok(buffer) = allocator.allocate(size) {
                            buffers.push(buffer);
                        }
                    }
                    Op::Reallocate(idx, size) => {
                        if !buffers.is_empty() {
                            let idx = idx % buffers.len();
                            let _ = allocator.reallocate(&mut buffers[idx], size);
                        }
                    }
                    Op::Free(idx) => {
                        if !buffers.is_empty() {
                            let buffer = buffers.swap_remove(idx % buffers.len());
                            allocator.free(buffer);
                        }
                    }
                }

                let live = buffers.iter().map(|b| b.len()).sum::<usize>();
                prop_assert_eq!(allocator.in_use(), live);
                prop_assert!(allocator.in_use() <= LIMIT);
            }
        }
    }
}
