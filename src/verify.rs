//! Structural verification of the heap's data structures. This answers one
//! question: do all the invariants hold right now? It never repairs
//! anything, it only reports the first violation it finds.

use std::ptr::NonNull;

use crate::{
    freelist::NUM_LISTS,
    header::{Header, State},
    heap::Heap,
};

impl Heap {
    /// Checks every free list for cycles and link consistency, then walks
    /// every registered region checking boundary tags. Returns `true` when
    /// all invariants hold. Failures are reported through [`log::error!`].
    ///
    /// # Safety
    ///
    /// The caller must hold the heap exclusively. A heap corrupted by a
    /// misbehaving user (writes past an allocation, use after free) may
    /// contain wild pointers; the verifier reads through them like every
    /// other part of the allocator does.
    pub(crate) unsafe fn verify(&mut self) -> bool {
        if !self.initialized {
            return true;
        }

        self.verify_freelists() && self.verify_tags()
    }

    unsafe fn verify_freelists(&mut self) -> bool {
        if let Some((class, node)) = self.detect_cycle() {
            log::error!(
                "free list class {class} contains a cycle through {:p}",
                node.as_ptr()
            );
            return false;
        }

        if let Some((class, node)) = self.inconsistent_links() {
            log::error!(
                "free list class {class} has inconsistent links at {:p}",
                node.as_ptr()
            );
            return false;
        }

        true
    }

    /// Floyd's tortoise and hare, run from every sentinel. In a healthy
    /// circular list the hare lands back on the sentinel; if the two ever
    /// meet before that, some link loops back into the list.
    unsafe fn detect_cycle(&mut self) -> Option<(usize, NonNull<Header>)> {
        for class in 0..NUM_LISTS {
            let sentinel = self.freelists.sentinel(class);
            let mut slow = sentinel.as_ref().next.unwrap();
            let mut fast = slow.as_ref().next.unwrap();

            while fast != sentinel {
                if slow == fast {
                    return Some((class, slow));
                }
                slow = slow.as_ref().next.unwrap();
                fast = fast.as_ref().next.unwrap().as_ref().next.unwrap();
            }
        }

        None
    }

    /// Every node must be pointed back at by both of its neighbors. Runs
    /// after cycle detection, otherwise the walk might not terminate.
    unsafe fn inconsistent_links(&mut self) -> Option<(usize, NonNull<Header>)> {
        for class in 0..NUM_LISTS {
            let sentinel = self.freelists.sentinel(class);
            let mut current = sentinel.as_ref().next.unwrap();

            while current != sentinel {
                let next = current.as_ref().next.unwrap();
                let prev = current.as_ref().prev.unwrap();

                if next.as_ref().prev != Some(current) || prev.as_ref().next != Some(current) {
                    return Some((class, current));
                }

                current = next;
            }
        }

        None
    }

    /// Walks every registered region from its left fencepost to its right
    /// one, checking that each block's size reappears as its right
    /// neighbor's `left_size`.
    unsafe fn verify_tags(&mut self) -> bool {
        for left_fencepost in self.regions.iter() {
            if left_fencepost.as_ref().state() != State::Fencepost {
                log::error!(
                    "region at {:p} does not begin with a fencepost",
                    left_fencepost.as_ptr()
                );
                return false;
            }

            let mut block = left_fencepost;
            loop {
                if block.as_ref().size() == 0 {
                    // A zero size would make the walk spin in place.
                    log::error!("zero sized block at {:p}", block.as_ptr());
                    return false;
                }

                let right = Header::right_neighbor(block);
                if right.as_ref().left_size != block.as_ref().size() {
                    log::error!(
                        "boundary tag mismatch between {:p} and {:p}",
                        block.as_ptr(),
                        right.as_ptr()
                    );
                    return false;
                }

                block = right;
                if block.as_ref().state() == State::Fencepost {
                    break;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_heap() -> Box<Heap> {
        let mut heap = Box::new(Heap::new());
        assert!(unsafe { heap.ensure_init() });
        heap
    }

    #[test]
    fn a_clean_heap_verifies() {
        let mut heap = new_heap();
        unsafe {
            assert!(heap.verify());

            let p = heap.allocate(64).unwrap();
            assert!(heap.verify());
            heap.deallocate(p);
            assert!(heap.verify());
        }
    }

    #[test]
    fn an_uninitialized_heap_verifies_trivially() {
        let mut heap = Box::new(Heap::new());
        unsafe {
            assert!(heap.verify());
        }
    }

    #[test]
    fn detects_boundary_tag_mismatch() {
        let mut heap = new_heap();
        unsafe {
            let p = heap.allocate(64).unwrap();
            let mut header = Header::from_user_address(p);

            // Smashing the left tag breaks the pairing with the block on
            // the left.
            header.as_mut().left_size += 8;
            assert!(!heap.verify());
        }
    }

    #[test]
    fn detects_free_list_cycles() {
        let mut heap = new_heap();
        unsafe {
            let p = heap.allocate(48).unwrap();
            let _guard = heap.allocate(8).unwrap();
            heap.deallocate(p);

            // Point the freed block's link back at itself.
            let mut block = Header::from_user_address(p);
            block.as_mut().next = Some(block);
            assert!(!heap.verify());
        }
    }

    #[test]
    fn detects_inconsistent_links() {
        let mut heap = new_heap();
        unsafe {
            let p = heap.allocate(48).unwrap();
            let _g1 = heap.allocate(8).unwrap();
            let q = heap.allocate(48).unwrap();
            let _g2 = heap.allocate(8).unwrap();
            heap.deallocate(p);
            heap.deallocate(q);

            // Both freed blocks share a class. Rewire one block's prev to
            // itself: its neighbors no longer agree with it.
            let mut block = Header::from_user_address(p);
            block.as_mut().prev = Some(block);
            assert!(!heap.verify());
        }
    }
}
