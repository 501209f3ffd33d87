use std::ptr::NonNull;

use crate::{
    header::{Header, State, ALLOC_HEADER_SIZE, UNALLOC_HEADER_SIZE},
    platform, Pointer,
};

/// Size in bytes of every region requested from the operating system.
pub const ARENA_SIZE: usize = 4096;

/// Upper bound on the number of regions the registry remembers for the
/// verifier. Regions acquired past this bound still work, they are just
/// invisible to [`crate::Segalloc::verify`].
pub const MAX_NUM_CHUNKS: usize = 1024;

// A region must at least fit its two fenceposts plus one minimal block.
const _: () = assert!(ARENA_SIZE >= 2 * ALLOC_HEADER_SIZE + UNALLOC_HEADER_SIZE);

/// Marks `fencepost` as a region boundary. Fenceposts have the fixed
/// minimal size of [`ALLOC_HEADER_SIZE`] and carry a `left_size` so that
/// leftward navigation across them stays possible.
unsafe fn install_fencepost(mut fencepost: NonNull<Header>, left_size: usize) {
    fencepost.as_mut().set_size_and_state(ALLOC_HEADER_SIZE, State::Fencepost);
    fencepost.as_mut().left_size = left_size;
}

/// Requests a `size` byte region from the operating system and prepares it
/// for use: a fencepost at each edge and a single free block spanning the
/// interior.
///
/// ```text
/// +-----------+----------------------------------+-----------+
/// | FENCEPOST | free block (size - 2 fenceposts) | FENCEPOST |
/// +-----------+----------------------------------+-----------+
/// ```
///
/// Returns the interior block, or `None` if the kernel refused to extend
/// the heap.
pub(crate) unsafe fn request_region(size: usize) -> Pointer<Header> {
    let address = platform::extend_heap(size)?;

    let left_fencepost: NonNull<Header> = address.cast();
    install_fencepost(left_fencepost, ALLOC_HEADER_SIZE);

    let right_fencepost = Header::at_offset(left_fencepost, (size - ALLOC_HEADER_SIZE) as isize);
    install_fencepost(right_fencepost, size - 2 * ALLOC_HEADER_SIZE);

    let mut block = Header::at_offset(left_fencepost, ALLOC_HEADER_SIZE as isize);
    block
        .as_mut()
        .set_size_and_state(size - 2 * ALLOC_HEADER_SIZE, State::Unallocated);
    block.as_mut().left_size = ALLOC_HEADER_SIZE;

    log::debug!("acquired {size} byte region at {:p}", address.as_ptr());

    Some(block)
}

/// Append-only record of every independent region, by left fencepost. The
/// verifier walks these to check boundary tags; allocation never reads it.
pub(crate) struct RegionRegistry {
    regions: [Pointer<Header>; MAX_NUM_CHUNKS],
    len: usize,
}

impl RegionRegistry {
    pub const fn new() -> Self {
        Self {
            regions: [None; MAX_NUM_CHUNKS],
            len: 0,
        }
    }

    /// Remembers a region by its left fencepost. Overflow is silent: the
    /// verifier loses sight of later regions but allocation is unaffected.
    pub fn register(&mut self, left_fencepost: NonNull<Header>) {
        if self.len < MAX_NUM_CHUNKS {
            self.regions[self.len] = Some(left_fencepost);
            self.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = NonNull<Header>> + '_ {
        self.regions[..self.len].iter().map(|region| region.unwrap())
    }
}
