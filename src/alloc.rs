//! Block allocator (spec §4.2): lock-free size-class free lists for small
//! extents, an address-sorted coalescing free list for large ones.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{RegionError, Result};
use crate::offset::{state_clear, untag_aba, AbaTag, Off, NIL};

/// Extents up to this size are served by a size class; above it, the large
/// allocator takes over.
pub const LARGE_THRESHOLD: usize = 2048;

/// Bytes at the head of a large extent reserved for its own link/size
/// bookkeeping (`[next: u64 LE][size: u64 LE]`), skipped by the
/// double-free/use-after-free poison pattern so the pattern check never
/// fights the free-list machinery itself.
const LARGE_HEADER: usize = 16;
/// Same, for a small-class extent (`[next: u64 LE]` only).
const SMALL_HEADER: usize = 8;

/// Fixed byte a freed extent's body (everything past its link header) is
/// stamped with when the `debug-mcheck` feature is enabled. `alloc` checks
/// it's still intact when a block is handed back out, catching a write that
/// landed on memory after it was freed but before it was reallocated.
#[cfg(feature = "debug-mcheck")]
const POISON_BYTE: u8 = 0xFE;

/// 8, 16, 24, ..., 256 (step 8), then 384, 512, ..., 2048 (power-of-two-ish
/// step doubling from 256), mirroring the original's class table shape.
fn size_classes() -> Vec<usize> {
    let mut classes: Vec<usize> = (1..=32).map(|i| i * 8).collect();
    let mut size = 384;
    while size <= 2048 {
        classes.push(size);
        size *= 2;
    }
    classes
}

/// Smallest class size that fits `len`, or `None` if `len` exceeds
/// [`LARGE_THRESHOLD`].
fn class_for(len: usize) -> Option<usize> {
    if len == 0 || len > LARGE_THRESHOLD {
        return None;
    }
    size_classes().into_iter().find(|&c| c >= len)
}

/// One lock-free LIFO free list for a single size class. The head word
/// carries an ABA tag in its upper 16 bits so a pop racing a push-pop-push
/// of the same node can't be fooled by a recycled offset.
struct FreeList {
    head: AtomicU64,
    tag: AbaTag,
    class_size: usize,
}

impl FreeList {
    fn new(class_size: usize) -> Self {
        Self { head: AtomicU64::new(NIL), tag: AbaTag::new(), class_size }
    }

    /// Push `off` (an extent of exactly `class_size` bytes) onto the list.
    /// `read_link`/`write_link` access the 8-byte next-pointer stored at the
    /// head of the freed extent itself.
    fn push(&self, off: Off, write_link: impl Fn(Off, Off)) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            write_link(off, untag_aba(head));
            let tagged = self.tag.tag(off);
            match self.head.compare_exchange_weak(
                head,
                tagged,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Pop an extent off the list, or `None` if empty.
    fn pop(&self, read_link: impl Fn(Off) -> Off) -> Option<Off> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let off = untag_aba(head);
            if off == NIL {
                return None;
            }
            let next = read_link(off);
            let tagged_next = self.tag.tag(next);
            match self.head.compare_exchange_weak(
                head,
                tagged_next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(off),
                Err(actual) => head = actual,
            }
        }
    }
}

/// Large (> [`LARGE_THRESHOLD`]) extent allocator: a single address-sorted
/// singly-linked free list, protected by a coarse lock since large
/// allocations are rare enough that lock-free CAS chains aren't worth the
/// complexity (matches the original's `alloc_page.c` design). Keeping the
/// list in address order lets neighboring frees coalesce into one extent
/// instead of fragmenting into same-sized holes forever.
struct LargeAllocator {
    head: Mutex<Off>,
}

impl LargeAllocator {
    fn new() -> Self {
        Self { head: Mutex::new(NIL) }
    }
}

/// A per-thread-identity allocation shard, reducing CAS contention on the
/// small free lists by giving each hashed thread id its own set of class
/// lists that only fall back to a shared pool when locally empty.
pub(crate) struct Area {
    classes: Vec<FreeList>,
}

impl Area {
    fn new() -> Self {
        Self { classes: size_classes().into_iter().map(FreeList::new).collect() }
    }
}

pub(crate) struct Allocator {
    areas: Vec<Area>,
    /// Shared fallback class lists, used when an area's local list is empty
    /// and as the target for frees from a thread that didn't originally
    /// allocate the extent.
    shared: Area,
    large: LargeAllocator,
}

impl Allocator {
    /// `num_areas` is the caller's `RegionOptions::alloc_areas` (at least 1);
    /// more areas cut CAS contention under heavy concurrent alloc/free at
    /// the cost of more idle free-list memory.
    pub fn new(num_areas: usize) -> Self {
        let num_areas = num_areas.max(1);
        Self {
            areas: (0..num_areas).map(|_| Area::new()).collect(),
            shared: Area::new(),
            large: LargeAllocator::new(),
        }
    }

    fn area_for_thread(&self) -> &Area {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.areas.len();
        &self.areas[idx]
    }

    /// Allocate `len` bytes, calling back into the mapping/journal layer to
    /// read/write 8-byte link words and to extend the region when every
    /// free list and the large allocator are exhausted. `check_poison` is
    /// only consulted when `debug-mcheck` is enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &self,
        len: usize,
        read_link: impl Fn(Off) -> Off + Copy,
        write_link: impl Fn(Off, Off) + Copy,
        read_size: impl Fn(Off) -> u64,
        write_size: impl Fn(Off, u64),
        mut grow_for: impl FnMut(usize) -> Result<Off>,
        check_poison: impl Fn(Off, usize) -> bool,
    ) -> Result<Off> {
        if len == 0 {
            return Err(RegionError::InvalidArgument("alloc: zero length"));
        }

        if let Some(class_size) = class_for(len) {
            let class_idx = size_classes().iter().position(|&c| c == class_size).unwrap();
            if let Some(off) = self.area_for_thread().classes[class_idx].pop(read_link) {
                Self::verify_poison(off, class_size, SMALL_HEADER, &check_poison);
                return Ok(off);
            }
            if let Some(off) = self.shared.classes[class_idx].pop(read_link) {
                Self::verify_poison(off, class_size, SMALL_HEADER, &check_poison);
                return Ok(off);
            }
            return grow_for(class_size);
        }

        // Large allocation: address-sorted first-fit under the coarse lock.
        let mut head = self.large.head.lock().unwrap();
        let mut prev: Option<Off> = None;
        let mut cur = *head;
        while cur != NIL {
            let size = read_size(cur);
            if size >= len as u64 {
                let next = read_link(cur);
                match prev {
                    Some(p) => write_link(p, next),
                    None => *head = next,
                }
                let remainder = size - len as u64;
                if remainder > LARGE_THRESHOLD as u64 {
                    let tail = cur + len as u64;
                    write_size(tail, remainder);
                    // Splice the remainder back in at cur's old slot so the
                    // list stays address-sorted (it sits strictly between
                    // `prev` and `next`), instead of pushing it onto head.
                    write_link(tail, next);
                    match prev {
                        Some(p) => write_link(p, tail),
                        None => *head = tail,
                    }
                }
                Self::verify_poison(cur, len, LARGE_HEADER, &check_poison);
                return Ok(cur);
            }
            prev = Some(cur);
            cur = read_link(cur);
        }
        drop(head);
        grow_for(len)
    }

    #[cfg_attr(not(feature = "debug-mcheck"), allow(unused_variables))]
    fn verify_poison(off: Off, len: usize, header: usize, check_poison: &impl Fn(Off, usize) -> bool) {
        #[cfg(feature = "debug-mcheck")]
        if len > header && !check_poison(off + header as u64, len - header) {
            log::warn!("mcheck: corrupted free-list extent at offset {off:#x} (write-after-free?)");
        }
    }

    /// Return `off` (an extent of `len` bytes) to the appropriate free
    /// list. Called only once it's safe to reuse the memory — i.e. after
    /// epoch reclamation has confirmed no reader can still observe it.
    /// `poison` is only consulted when `debug-mcheck` is enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn free(
        &self,
        off: Off,
        len: usize,
        read_link: impl Fn(Off) -> Off + Copy,
        write_link: impl Fn(Off, Off) + Copy,
        read_size: impl Fn(Off) -> u64,
        write_size: impl Fn(Off, u64),
        is_edge: impl Fn(Off) -> bool,
        poison: impl Fn(Off, usize),
    ) {
        let off = state_clear(off);

        if let Some(class_size) = class_for(len) {
            Self::stamp_poison(off, class_size, SMALL_HEADER, &poison);
            let class_idx = size_classes().iter().position(|&c| c == class_size).unwrap();
            self.area_for_thread().classes[class_idx].push(off, write_link);
            return;
        }

        if is_edge(off + len as u64) {
            // Freeing right at the current grow boundary: don't bother
            // threading it onto the large list, a future grow will just
            // reuse the space contiguously. Matches the original's
            // edge-aware coalescing to avoid list churn at the hot edge.
            return;
        }

        Self::stamp_poison(off, len, LARGE_HEADER, &poison);

        let mut head = self.large.head.lock().unwrap();

        // Find the node immediately before the insertion point (`prev`) and
        // the node immediately after it (`next`), keeping the list sorted by
        // address so adjacent extents can coalesce.
        let mut prev: Option<Off> = None;
        let mut next = *head;
        while next != NIL && next < off {
            prev = Some(next);
            next = read_link(next);
        }

        let mut merged_off = off;
        let mut merged_len = len as u64;

        // Merge backward into `prev` if they're touching: the merged block
        // keeps occupying prev's slot in the list.
        let mut absorbed_prev = false;
        if let Some(p) = prev {
            let p_size = read_size(p);
            if p + p_size == merged_off {
                merged_off = p;
                merged_len = p_size + merged_len;
                absorbed_prev = true;
            }
        }

        // Merge forward into `next` if they're touching: `next` is dropped
        // from the list, replaced by whatever it pointed to.
        if next != NIL && merged_off + merged_len == next {
            merged_len += read_size(next);
            next = read_link(next);
        }

        write_size(merged_off, merged_len);
        write_link(merged_off, next);
        if !absorbed_prev {
            match prev {
                Some(p) => write_link(p, merged_off),
                None => *head = merged_off,
            }
        }
        // absorbed_prev: merged_off == prev's own offset, already correctly
        // linked from whatever preceded it — only its size/link needed the
        // update just written above.
    }

    #[cfg_attr(not(feature = "debug-mcheck"), allow(unused_variables))]
    fn stamp_poison(off: Off, len: usize, header: usize, poison: &impl Fn(Off, usize)) {
        #[cfg(feature = "debug-mcheck")]
        if len > header {
            poison(off + header as u64, len - header);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[test]
    fn class_for_rounds_up() {
        assert_eq!(class_for(1), Some(8));
        assert_eq!(class_for(8), Some(8));
        assert_eq!(class_for(9), Some(16));
        assert_eq!(class_for(256), Some(256));
        assert_eq!(class_for(257), Some(384));
        assert_eq!(class_for(2048), Some(2048));
        assert_eq!(class_for(2049), None);
        assert_eq!(class_for(0), None);
    }

    #[test]
    fn free_list_push_pop_roundtrip() {
        let list = FreeList::new(64);
        let links: RefCell<HashMap<Off, Off>> = RefCell::new(HashMap::new());

        let write = |off: Off, next: Off| {
            links.borrow_mut().insert(off, next);
        };
        let read = |off: Off| *links.borrow().get(&off).unwrap_or(&NIL);

        list.push(64, write);
        list.push(128, write);
        list.push(192, write);

        assert_eq!(list.pop(read), Some(192));
        assert_eq!(list.pop(read), Some(128));
        assert_eq!(list.pop(read), Some(64));
        assert_eq!(list.pop(read), None);
    }

    /// A tiny in-memory "region" standing in for the real mapping, so
    /// address-sorted coalescing can be exercised without a `Region`.
    struct FakeLarge {
        sizes: RefCell<HashMap<Off, u64>>,
        links: RefCell<HashMap<Off, Off>>,
    }

    impl FakeLarge {
        fn new() -> Self {
            Self { sizes: RefCell::new(HashMap::new()), links: RefCell::new(HashMap::new()) }
        }
    }

    #[test]
    fn large_free_coalesces_both_neighbors() {
        let alloc = Allocator::new(1);
        let fake = FakeLarge::new();
        let read_link = |off: Off| *fake.links.borrow().get(&off).unwrap_or(&NIL);
        let write_link = |off: Off, next: Off| {
            fake.links.borrow_mut().insert(off, next);
        };
        let read_size = |off: Off| *fake.sizes.borrow().get(&off).unwrap_or(&0);
        let write_size = |off: Off, size: u64| {
            fake.sizes.borrow_mut().insert(off, size);
        };
        let is_edge = |_off: Off| false;
        let poison = |_off: Off, _len: usize| {};

        // Three large extents, laid out contiguously: [0,4096) [4096,8192)
        // [8192,12288). Free the two ends first, then the middle, and expect
        // a single coalesced [0,12288) block afterward.
        alloc.free(0, 4096, read_link, write_link, read_size, write_size, is_edge, poison);
        alloc.free(8192, 4096, read_link, write_link, read_size, write_size, is_edge, poison);
        assert_eq!(*alloc.large.head.lock().unwrap(), 0);
        assert_eq!(read_size(0), 4096);
        assert_eq!(read_size(8192), 4096);

        alloc.free(4096, 4096, read_link, write_link, read_size, write_size, is_edge, poison);

        let head = *alloc.large.head.lock().unwrap();
        assert_eq!(head, 0);
        assert_eq!(read_size(0), 12288);
        assert_eq!(read_link(0), NIL);
    }

    #[test]
    fn large_alloc_first_fit_keeps_order() {
        let alloc = Allocator::new(1);
        let fake = FakeLarge::new();
        let read_link = |off: Off| *fake.links.borrow().get(&off).unwrap_or(&NIL);
        let write_link = |off: Off, next: Off| {
            fake.links.borrow_mut().insert(off, next);
        };
        let read_size = |off: Off| *fake.sizes.borrow().get(&off).unwrap_or(&0);
        let write_size = |off: Off, size: u64| {
            fake.sizes.borrow_mut().insert(off, size);
        };
        let is_edge = |_off: Off| false;
        let poison = |_off: Off, _len: usize| {};
        let check_poison = |_off: Off, _len: usize| true;

        alloc.free(0, 4096, read_link, write_link, read_size, write_size, is_edge, poison);
        alloc.free(8192, 8192, read_link, write_link, read_size, write_size, is_edge, poison);

        let grow_for = |_need: usize| -> Result<Off> { panic!("should not need to grow") };
        let off =
            alloc.alloc(4096, read_link, write_link, read_size, write_size, grow_for, check_poison).unwrap();
        assert_eq!(off, 0);
        // Remaining entries still address-ordered.
        assert_eq!(*alloc.large.head.lock().unwrap(), 8192);
    }
}
