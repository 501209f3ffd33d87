use crate::Pointer;

/// Abstraction for the platform primitive that hands the allocator more
/// memory. The engine only ever asks the kernel to extend the heap; memory
/// is never given back.
trait PlatformSpecificMemory {
    /// Extends the process data segment by `length` bytes and returns a
    /// pointer to the first new byte, or `None` if the kernel refuses. The
    /// break only moves up, so two back to back extensions return
    /// physically contiguous memory unless something else moved the break
    /// in between. The engine detects that case by address comparison and
    /// treats the new memory as an independent region.
    unsafe fn extend_heap(length: usize) -> Pointer<u8>;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] per target.
pub(crate) struct Platform;

/// Convenience wrapper for [`PlatformSpecificMemory::extend_heap`].
#[inline]
pub(crate) unsafe fn extend_heap(length: usize) -> Pointer<u8> {
    Platform::extend_heap(length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::NonNull;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn extend_heap(length: usize) -> Pointer<u8> {
            // sbrk(2) returns the previous break on success and -1 on
            // failure. See https://man7.org/linux/man-pages/man2/sbrk.2.html
            let address = libc::sbrk(length as libc::intptr_t);

            if address as isize == -1 {
                return None;
            }

            NonNull::new(address.cast())
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI support, so the data segment is simulated with one
    //! large slab taken from the global allocator and a bump offset. The
    //! bump preserves the contract that successive extensions are
    //! physically contiguous. The slab is deliberately leaked: the real
    //! data segment never shrinks either.

    use std::{alloc, ptr, ptr::NonNull, sync::Mutex};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    const SEGMENT_SIZE: usize = 1 << 22;

    struct Segment {
        base: *mut u8,
        brk: usize,
    }

    unsafe impl Send for Segment {}

    static SEGMENT: Mutex<Segment> = Mutex::new(Segment {
        base: ptr::null_mut(),
        brk: 0,
    });

    impl PlatformSpecificMemory for Platform {
        unsafe fn extend_heap(length: usize) -> Pointer<u8> {
            let mut segment = SEGMENT.lock().unwrap();

            if segment.base.is_null() {
                let layout = alloc::Layout::from_size_align(SEGMENT_SIZE, 16).unwrap();
                segment.base = alloc::alloc(layout);
                if segment.base.is_null() {
                    return None;
                }
            }

            if SEGMENT_SIZE - segment.brk < length {
                return None;
            }

            let address = segment.base.add(segment.brk);
            segment.brk += length;

            NonNull::new(address)
        }
    }
}
