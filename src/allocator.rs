use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{header::WORD_SIZE, heap::Heap};

/// The one heap of the process. Lazily initialized under the lock on first
/// use; free blocks point into it, so it must never move, which a static
/// guarantees.
static HEAP: Mutex<Heap> = Mutex::new(Heap::new());

/// Handle to the process wide heap, in the style of [`std::alloc::System`]:
/// the struct itself holds no state, every instance reaches the same
/// allocator.
///
/// # Examples
///
/// ## Direct use
///
/// ```rust
/// use segalloc::Segalloc;
///
/// let heap = Segalloc::new();
///
/// let address = heap.alloc(128);
/// assert!(!address.is_null());
/// assert_eq!(address as usize % 8, 0);
///
/// heap.free(address);
/// assert!(heap.verify());
/// ```
///
/// ## Global allocator
///
/// The handle implements [`GlobalAlloc`], so it can back every Rust
/// allocation of a program. Alignments above the word size are a
/// deliberate non-goal and make `alloc` return null, so this is only
/// suitable for programs whose allocations stay word aligned.
///
/// ```rust,no_run
/// use segalloc::Segalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Segalloc = Segalloc::new();
///
/// fn main() {
///     let boxed = Box::new(42);
///     assert_eq!(*boxed, 42);
/// }
/// ```
///
/// # Logging
///
/// Region acquisition and verifier failures are traced through [`log`].
/// When the handle is installed as the global allocator, any logger that
/// allocates would re-enter the heap while its lock is held; leave logging
/// disabled in that configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct Segalloc;

impl Segalloc {
    pub const fn new() -> Self {
        Segalloc
    }

    /// Returns a pointer to at least `size` bytes of writable, word
    /// aligned memory, or null when `size` is zero or the kernel refuses
    /// to extend the heap.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        match HEAP.lock() {
            Ok(mut heap) => unsafe {
                if !heap.ensure_init() {
                    return ptr::null_mut();
                }
                heap.allocate(size)
                    .map_or(ptr::null_mut(), |address| address.as_ptr())
            },
            Err(_) => ptr::null_mut(),
        }
    }

    /// Releases a pointer previously returned by [`Segalloc::alloc`],
    /// [`Segalloc::calloc`] or [`Segalloc::realloc`]. Null is a no-op.
    /// Freeing the same pointer twice writes a diagnostic to stderr and
    /// terminates the process with exit status 1; passing any pointer this
    /// allocator never returned is undefined behaviour.
    pub fn free(&self, address: *mut u8) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        if let Ok(mut heap) = HEAP.lock() {
            if heap.is_initialized() {
                unsafe { heap.deallocate(address) };
            }
        }
    }

    /// Allocates `count * size` bytes and zero-fills them. Returns null
    /// when the product overflows or the allocation fails.
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };

        let address = self.alloc(total);
        if !address.is_null() {
            unsafe { address.write_bytes(0, total) };
        }

        address
    }

    /// Always-moving reallocation: allocates a fresh block, copies the
    /// smaller of the old payload and `new_size` bytes, and frees the old
    /// block. A null `address` behaves like [`Segalloc::alloc`]; a zero
    /// `new_size` frees the block and returns null. On allocation failure
    /// the old block is left untouched and null is returned.
    pub fn realloc(&self, address: *mut u8, new_size: usize) -> *mut u8 {
        let Some(address) = NonNull::new(address) else {
            return self.alloc(new_size);
        };

        match HEAP.lock() {
            Ok(mut heap) => unsafe {
                if !heap.is_initialized() {
                    return ptr::null_mut();
                }
                heap.reallocate(address, new_size)
                    .map_or(ptr::null_mut(), |new_address| new_address.as_ptr())
            },
            Err(_) => ptr::null_mut(),
        }
    }

    /// Returns `true` when every structural invariant of the heap holds:
    /// free lists are consistent circular lists without cycles, every
    /// registered region is fenced, and each block's size reappears as its
    /// right neighbor's left tag.
    pub fn verify(&self) -> bool {
        match HEAP.lock() {
            Ok(mut heap) => unsafe { heap.verify() },
            Err(_) => false,
        }
    }
}

unsafe impl GlobalAlloc for Segalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Alignment above the word size is out of scope for this heap.
        if layout.align() > WORD_SIZE {
            return ptr::null_mut();
        }

        self.alloc(layout.size())
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        self.free(address);
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > WORD_SIZE {
            return ptr::null_mut();
        }

        self.realloc(address, new_size)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;

    #[test]
    fn handle_allocates_and_frees() {
        let heap = Segalloc::new();

        let address = heap.alloc(64);
        assert!(!address.is_null());
        assert_eq!(address as usize % WORD_SIZE, 0);

        unsafe {
            address.write_bytes(0xab, 64);
            assert_eq!(*address.add(63), 0xab);
        }

        heap.free(address);
        assert!(heap.verify());
    }

    #[test]
    fn zero_sized_allocations_return_null() {
        assert!(Segalloc::new().alloc(0).is_null());
    }

    #[test]
    fn freeing_null_is_a_no_op() {
        Segalloc::new().free(ptr::null_mut());
    }

    #[test]
    fn calloc_zero_fills() {
        let heap = Segalloc::new();

        let address = heap.calloc(4, 8);
        assert!(!address.is_null());

        unsafe {
            for offset in 0..32 {
                assert_eq!(*address.add(offset), 0);
            }
        }

        heap.free(address);
    }

    #[test]
    fn calloc_rejects_overflow() {
        assert!(Segalloc::new().calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn realloc_preserves_the_prefix() {
        let heap = Segalloc::new();

        let p = heap.alloc(16);
        assert!(!p.is_null());
        unsafe {
            for offset in 0..16 {
                *p.add(offset) = offset as u8;
            }
        }

        let q = heap.realloc(p, 64);
        assert!(!q.is_null());
        unsafe {
            for offset in 0..16 {
                assert_eq!(*q.add(offset), offset as u8);
            }
        }

        let r = heap.realloc(q, 8);
        assert!(!r.is_null());
        unsafe {
            for offset in 0..8 {
                assert_eq!(*r.add(offset), offset as u8);
            }
        }

        heap.free(r);
        assert!(heap.verify());
    }

    #[test]
    fn realloc_of_null_allocates() {
        let heap = Segalloc::new();

        let address = heap.realloc(ptr::null_mut(), 24);
        assert!(!address.is_null());
        heap.free(address);
    }

    #[test]
    fn global_alloc_respects_the_word_alignment_limit() {
        let heap = Segalloc::new();

        unsafe {
            let fits = Layout::from_size_align(64, WORD_SIZE).unwrap();
            let address = GlobalAlloc::alloc(&heap, fits);
            assert!(!address.is_null());
            GlobalAlloc::dealloc(&heap, address, fits);

            let too_strict = Layout::from_size_align(64, 2 * WORD_SIZE).unwrap();
            assert!(GlobalAlloc::alloc(&heap, too_strict).is_null());
        }
    }

    #[test]
    fn concurrent_churn_keeps_the_heap_consistent() {
        let heap = Segalloc::new();
        let threads = 8;
        let barrier = Barrier::new(threads);

        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    barrier.wait();

                    for round in 0..200usize {
                        let size = 16 + (round % 7) * 48;
                        let address = heap.alloc(size);
                        assert!(!address.is_null());

                        unsafe {
                            address.write_bytes(round as u8, size);
                            for offset in 0..size {
                                assert_eq!(*address.add(offset), round as u8);
                            }
                        }

                        heap.free(address);
                    }
                });
            }
        });

        assert!(heap.verify());
    }
}
