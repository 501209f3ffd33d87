use std::{
    cmp,
    ptr::{self, NonNull},
};

use crate::{
    diag,
    freelist::{FreeLists, NUM_LISTS},
    header::{Header, State, ALLOC_HEADER_SIZE, UNALLOC_HEADER_SIZE, WORD_SIZE},
    region::{self, RegionRegistry, ARENA_SIZE},
    Pointer,
};

/// The allocator engine. Owns the free list index, the region registry and
/// the bookkeeping needed to stitch physically adjacent regions together.
///
/// ```text
///                 classes
///              +-----------+
/// freelists -> | 0 | 1 |...| ---> free blocks, linked across regions
///              +-----------+
///
///              +-----------+---------------------+-----------+
/// regions ---> | FENCEPOST | blocks ...          | FENCEPOST | <- last_fencepost
///              +-----------+---------------------+-----------+
/// ```
///
/// A `Heap` must not move after [`Heap::ensure_init`] has run: free blocks
/// hold the addresses of the sentinels stored inside it. The public handle
/// keeps the one real instance in a process-global static; tests pin
/// throwaway instances behind a `Box`.
///
/// Nothing in here locks. Callers serialize access through the single
/// process wide mutex in [`crate::allocator`].
pub(crate) struct Heap {
    pub(crate) freelists: FreeLists,
    pub(crate) regions: RegionRegistry,
    /// Right fencepost of the most recently acquired region. When the next
    /// region lands immediately after it, the two are merged.
    last_fencepost: Pointer<Header>,
    /// Left fencepost of the very first region. Diagnostics report block
    /// positions as offsets from this address.
    base: Pointer<u8>,
    pub(crate) initialized: bool,
}

// The engine is full of raw pointers into heap memory. It is only ever
// reached through the global mutex, which provides the synchronization the
// compiler cannot see.
unsafe impl Send for Heap {}

impl Heap {
    pub const fn new() -> Self {
        Self {
            freelists: FreeLists::new(),
            regions: RegionRegistry::new(),
            last_fencepost: None,
            base: None,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// One-time setup: self-links every sentinel, acquires the first region
    /// and places its interior into the catch-all class. Returns `false` if
    /// the kernel refused to extend the heap, in which case a later call
    /// retries from scratch.
    ///
    /// # Safety
    ///
    /// The heap must already sit at its final address, see [`Heap`].
    pub unsafe fn ensure_init(&mut self) -> bool {
        if self.initialized {
            return true;
        }

        self.freelists.init();

        let Some(block) = region::request_region(ARENA_SIZE) else {
            return false;
        };

        let left_fencepost = Header::at_offset(block, -(ALLOC_HEADER_SIZE as isize));
        self.regions.register(left_fencepost);
        self.last_fencepost = Some(Header::right_neighbor(block));
        self.base = Some(left_fencepost.cast());
        self.freelists.insert(block);

        self.initialized = true;
        true
    }

    /// Total block size needed to serve a request of `raw_size` bytes: the
    /// request rounded up to the word size, plus the surviving header, with
    /// [`UNALLOC_HEADER_SIZE`] as the floor so the block can become a valid
    /// free block again later. `None` on arithmetic overflow.
    fn actual_size(raw_size: usize) -> Option<usize> {
        let rounded = raw_size.checked_add(WORD_SIZE - 1)? & !(WORD_SIZE - 1);
        Some(cmp::max(
            rounded.checked_add(ALLOC_HEADER_SIZE)?,
            UNALLOC_HEADER_SIZE,
        ))
    }

    /// Serves an allocation request of `raw_size` bytes. Returns `None` for
    /// zero sized requests and when the kernel refuses to grow the heap.
    ///
    /// # Safety
    ///
    /// [`Heap::ensure_init`] must have succeeded.
    pub unsafe fn allocate(&mut self, raw_size: usize) -> Pointer<u8> {
        if raw_size == 0 {
            return None;
        }

        let actual_size = Self::actual_size(raw_size)?;
        let start_class = FreeLists::class_of(actual_size);

        loop {
            if let Some(address) = self.allocate_in_class(start_class, actual_size) {
                return Some(address);
            }

            // Nothing fit anywhere. Grow the heap and search again from
            // the original class.
            self.grow_heap()?;
        }
    }

    /// First-fit search from `start_class` upward. Exact classes hold a
    /// single size each, so an empty one is skipped outright; the catch-all
    /// mixes every large size and is always walked.
    unsafe fn allocate_in_class(&mut self, start_class: usize, actual_size: usize) -> Pointer<u8> {
        for class in start_class..NUM_LISTS {
            if class != NUM_LISTS - 1 && self.freelists.is_empty(class) {
                continue;
            }

            let sentinel = self.freelists.sentinel(class);
            let mut current = sentinel.as_ref().next.unwrap();

            while current != sentinel {
                let size = current.as_ref().size();

                if size < actual_size {
                    // Only possible in the catch-all, whose members are
                    // heterogeneous.
                    current = current.as_ref().next.unwrap();
                    continue;
                }

                if size - actual_size < UNALLOC_HEADER_SIZE {
                    // The remainder could never stand alone as a free
                    // block, so the whole candidate is handed out. The
                    // caller gets up to UNALLOC_HEADER_SIZE - 1 extra
                    // bytes.
                    current.as_mut().set_state(State::Allocated);
                    self.freelists.remove(current);
                    return Some(Header::user_address_of(current));
                }

                return Some(self.split_block(current, class, actual_size));
            }
        }

        None
    }

    /// Splits `block`, which stays free, shrinks in place and keeps its
    /// address, while the carved tail at its new right edge is handed out.
    /// Keeping the free part at the original address means its list links
    /// survive untouched unless its class changes.
    unsafe fn split_block(
        &mut self,
        mut block: NonNull<Header>,
        class: usize,
        actual_size: usize,
    ) -> NonNull<u8> {
        let remainder = block.as_ref().size() - actual_size;
        block.as_mut().set_size(remainder);

        let mut carved = Header::right_neighbor(block);
        carved.as_mut().set_size_and_state(actual_size, State::Allocated);
        carved.as_mut().left_size = remainder;

        let mut beyond = Header::right_neighbor(carved);
        beyond.as_mut().left_size = actual_size;

        if FreeLists::class_of(remainder) != class {
            self.freelists.reclassify(block);
        }

        Header::user_address_of(carved)
    }

    /// Acquires one more [`ARENA_SIZE`] region. If it lands immediately
    /// after the previously acquired region the two are stitched into one
    /// contiguous span; otherwise it is registered as an independent
    /// region and its interior joins the free index. `None` if the kernel
    /// refused.
    unsafe fn grow_heap(&mut self) -> Option<()> {
        let block = region::request_region(ARENA_SIZE)?;

        let left_fencepost = Header::at_offset(block, -(ALLOC_HEADER_SIZE as isize));
        let right_fencepost = Header::right_neighbor(block);

        // Where the previous region's right fencepost would sit if the two
        // regions were physically contiguous.
        let previous_fencepost = Header::at_offset(left_fencepost, -(ALLOC_HEADER_SIZE as isize));

        if self.last_fencepost == Some(previous_fencepost) {
            log::debug!("stitching new region onto {:p}", previous_fencepost.as_ptr());
            self.stitch_regions(previous_fencepost, block);
        } else {
            self.regions.register(left_fencepost);
            self.freelists.insert(block);
        }

        self.last_fencepost = Some(right_fencepost);
        Some(())
    }

    /// Merges a freshly acquired region with the one physically preceding
    /// it. `fencepost` is the previous region's right fencepost and `block`
    /// the new region's interior; the two fenceposts between them are
    /// swallowed by the merge.
    ///
    /// ```text
    ///  previous region                new region
    ///  ...-------+-----------+ +-----------+----------+-----------+
    ///      ... P | FENCEPOST | | FENCEPOST | interior | FENCEPOST |
    ///  ...-------+-----------+ +-----------+----------+-----------+
    ///        ^         ^________________________^
    ///        |    absorbed into P if P is free, otherwise the left
    ///        |    fencepost becomes the header of a new free block
    /// ```
    unsafe fn stitch_regions(&mut self, mut fencepost: NonNull<Header>, block: NonNull<Header>) {
        let mut right_fencepost = Header::right_neighbor(block);
        let mut left_block = Header::left_neighbor(fencepost);

        let merged_size;
        if left_block.as_ref().state() == State::Unallocated {
            // The block before the junction is free: extend it over both
            // fenceposts and the new interior.
            let class = FreeLists::class_of(left_block.as_ref().size());
            merged_size =
                left_block.as_ref().size() + block.as_ref().size() + 2 * ALLOC_HEADER_SIZE;
            left_block.as_mut().set_size(merged_size);

            if FreeLists::class_of(merged_size) != class {
                self.freelists.reclassify(left_block);
            }
        } else {
            // The old right fencepost turns into the header of a fresh
            // free block covering itself, the new left fencepost and the
            // new interior. Its left_size is already correct.
            merged_size = block.as_ref().size() + 2 * ALLOC_HEADER_SIZE;
            fencepost
                .as_mut()
                .set_size_and_state(merged_size, State::Unallocated);
            self.freelists.insert(fencepost);
        }

        right_fencepost.as_mut().left_size = merged_size;
    }

    /// Releases the block behind a pointer previously returned by
    /// [`Heap::allocate`]. Merges with whichever in-memory neighbors are
    /// free so that two free blocks are never adjacent. Fenceposts count as
    /// occupied here; regions are only merged across them in
    /// [`Heap::grow_heap`].
    ///
    /// # Safety
    ///
    /// `address` must come from this heap and must not have been freed
    /// already. A repeated free is the one misuse that is detected: it
    /// terminates the process.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>) {
        let mut block = Header::from_user_address(address);

        if block.as_ref().state() == State::Unallocated {
            diag::fatal("Double Free Detected\nAssertion Failed!\n");
        }

        let mut left = Header::left_neighbor(block);
        let mut right = Header::right_neighbor(block);
        let left_free = left.as_ref().state() == State::Unallocated;
        let right_free = right.as_ref().state() == State::Unallocated;

        block.as_mut().set_state(State::Unallocated);

        match (left_free, right_free) {
            (true, true) => {
                // Both neighbors merge into the left one, which keeps its
                // place in the lists unless the merged size changes class.
                let class = FreeLists::class_of(left.as_ref().size());
                let merged_size =
                    left.as_ref().size() + block.as_ref().size() + right.as_ref().size();

                self.freelists.remove(right);
                left.as_mut().set_size(merged_size);

                let mut beyond = Header::right_neighbor(right);
                beyond.as_mut().left_size = merged_size;

                if FreeLists::class_of(merged_size) != class {
                    self.freelists.reclassify(left);
                }
            }
            (true, false) => {
                let class = FreeLists::class_of(left.as_ref().size());
                let merged_size = left.as_ref().size() + block.as_ref().size();

                left.as_mut().set_size(merged_size);
                right.as_mut().left_size = merged_size;

                if FreeLists::class_of(merged_size) != class {
                    self.freelists.reclassify(left);
                }
            }
            (false, true) => {
                // The freed block absorbs its right neighbor and takes its
                // place in the index under the block's own address.
                let merged_size = block.as_ref().size() + right.as_ref().size();

                self.freelists.remove(right);
                block.as_mut().set_size(merged_size);

                let mut beyond = Header::right_neighbor(right);
                beyond.as_mut().left_size = merged_size;

                self.freelists.insert(block);
            }
            (false, false) => {
                self.freelists.insert(block);
            }
        }
    }

    /// Moving reallocation: allocates a fresh block, copies the smaller of
    /// the old payload and `new_size`, then frees the old block. A zero
    /// `new_size` frees the block and returns `None`, like the C library
    /// tradition.
    ///
    /// # Safety
    ///
    /// Same requirements on `address` as [`Heap::deallocate`].
    pub unsafe fn reallocate(&mut self, address: NonNull<u8>, new_size: usize) -> Pointer<u8> {
        if new_size == 0 {
            self.deallocate(address);
            return None;
        }

        let new_address = self.allocate(new_size)?;

        // The exact original request size is gone, the header only keeps
        // the rounded block size, so the copy is bounded by the payload.
        let old_header = Header::from_user_address(address);
        let count = cmp::min(old_header.as_ref().size() - ALLOC_HEADER_SIZE, new_size);
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), count);

        self.deallocate(address);
        Some(new_address)
    }
}

#[cfg(test)]
impl Heap {
    pub(crate) fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Sizes of every free block, across all classes.
    pub(crate) unsafe fn free_block_sizes(&mut self) -> Vec<usize> {
        let mut sizes = Vec::new();
        for class in 0..NUM_LISTS {
            let sentinel = self.freelists.sentinel(class);
            let mut current = sentinel.as_ref().next.unwrap();
            while current != sentinel {
                sizes.push(current.as_ref().size());
                current = current.as_ref().next.unwrap();
            }
        }
        sizes
    }
}
