//! File & mapping layer (spec §4.1).
//!
//! Owns the backing file (or an anonymous mapping for the in-memory variant)
//! and exposes it as an append-only chain of mapped VMA nodes, so that a
//! [`grow`](Mapping::grow) never invalidates a pointer handed out by an
//! earlier [`access`](Mapping::access). Nodes are appended under the
//! region's coarse lock; [`access`] itself takes no lock and only does
//! relaxed atomic loads, so readers never block behind a writer that's
//! mid-grow.
//!
//! Each node reserves `reserved` bytes of address space beyond its live
//! length up front, by mapping `len + reserved` bytes in one call instead of
//! just `len`. Growing within that reservation is then just a matter of
//! extending the backing file (if any) and publishing a larger logical
//! length — no remap, no address-space race against another allocation
//! landing in the gap. Only once a node's reservation is exhausted does grow
//! fall back to appending a brand new node with its own reservation.

use std::fs::File;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Mutex;

use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::error::{RegionError, Result};
use crate::offset::Off;

/// Hard cap on the number of VMA nodes before a caller must `coalesce()`.
/// `coalesce` folds the chain back down to one node, so this only bounds
/// how many grows can happen between world-stops.
const MAX_VMA_NODES: usize = 256;

struct VmaNode {
    /// Offset into the logical region where this node's bytes begin.
    base: u64,
    /// Stable pointer to the first byte of this node. Stable for the node's
    /// entire lifetime: growth within `capacity` only changes `len`, never
    /// `ptr`, and a node is never relocated outside `coalesce`.
    ptr: *mut u8,
    /// Bytes currently readable/writable at `ptr`. Grows in place, up to
    /// `capacity`, as the file backing it is extended; read with relaxed
    /// ordering by [`Mapping::access`] so a concurrent grow is safe.
    len: AtomicUsize,
    /// Total bytes actually mapped at `ptr` (`len`'s committed + the
    /// reserved guard tail). Touching bytes past `len` before it catches up
    /// would read unbacked pages for a file-backed mapping (SIGBUS) — only
    /// `grow_locked` is allowed to advance `len` towards this bound.
    capacity: usize,
    /// Keeps the OS mapping alive. Only ever touched again (to extend the
    /// file and bump `len`) by the single grow-lock holder; readers never
    /// reach into it.
    map: std::cell::UnsafeCell<MmapRaw>,
}

// SAFETY: `map` is only mutated by the grow-lock holder; `ptr`/`len`/`base`/
// `capacity` are read-only or atomic from every other thread.
unsafe impl Sync for VmaNode {}
unsafe impl Send for VmaNode {}

/// Owns the backing file and the chain of VMA nodes mapping it into this
/// process. One `Mapping` per open region.
pub(crate) struct Mapping {
    file: Option<File>,
    writable: bool,
    /// Size of the guard reservation requested alongside each new node,
    /// consumed in place as the node's logical length grows before a brand
    /// new node is needed.
    reserved: usize,
    nodes: Box<[AtomicPtr<VmaNode>; MAX_VMA_NODES]>,
    count: AtomicUsize,
    /// Serializes `grow`/`coalesce` against each other. `access` never takes
    /// this lock.
    grow_lock: Mutex<()>,
}

fn map_node(file: Option<&File>, file_offset: u64, capacity: usize) -> Result<MmapRaw> {
    match file {
        Some(f) => MmapOptions::new()
            .offset(file_offset)
            .len(capacity)
            .map_raw(f)
            .map_err(|e| RegionError::OutOfRegion { requested: capacity, source: Some(e) }),
        None => MmapMut::map_anon(capacity)
            .map(MmapRaw::from)
            .map_err(|e| RegionError::OutOfRegion { requested: capacity, source: Some(e) }),
    }
}

impl Mapping {
    /// Map `len` bytes of `file` (or an anonymous region if `file` is
    /// `None`) starting at offset 0, reserving an additional `reserved`
    /// bytes of guard address space up front so in-place grows need no
    /// remap until that reservation is exhausted.
    pub fn init(file: Option<File>, len: usize, writable: bool, reserved: usize) -> Result<Self> {
        let capacity = len + reserved;
        let map = map_node(file.as_ref(), 0, capacity)?;

        let node = Box::leak(Box::new(VmaNode {
            base: 0,
            ptr: map.as_ptr() as *mut u8,
            len: AtomicUsize::new(len),
            capacity,
            map: std::cell::UnsafeCell::new(map),
        }));

        let nodes: Box<[AtomicPtr<VmaNode>; MAX_VMA_NODES]> =
            Box::new(std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())));
        nodes[0].store(node, Ordering::Release);

        Ok(Self {
            file,
            writable,
            reserved,
            nodes,
            count: AtomicUsize::new(1),
            grow_lock: Mutex::new(()),
        })
    }

    /// Total mapped length across every node.
    pub fn len(&self) -> usize {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return 0;
        }
        // SAFETY: nodes[0..count] are published with Release and never
        // retracted except under a world-stopped `coalesce`.
        let last = unsafe { &*self.nodes[count - 1].load(Ordering::Acquire) };
        last.base + last.len.load(Ordering::Relaxed) as u64
    }

    /// True if `off` is exactly the current end of the mapping. Used by the
    /// allocator to avoid coalescing a freed block across a grow boundary
    /// that a racing grow might be about to fill.
    pub fn is_edge(&self, off: Off) -> bool {
        off == self.len() as u64
    }

    /// Resolve `[off, off+len)` to a raw pointer into the mapping. Fails if
    /// the range isn't fully contained in a single node, which the design
    /// treats as fatal (it means a caller is dereferencing an offset that
    /// was never validly allocated).
    pub fn access(&self, off: Off, len: usize) -> Result<*mut u8> {
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            let node = unsafe { &*self.nodes[i].load(Ordering::Acquire) };
            let node_len = node.len.load(Ordering::Relaxed) as u64;
            if off < node.base || off >= node.base + node_len {
                continue;
            }
            let end = off + len as u64;
            if end > node.base + node_len {
                return Err(RegionError::InvalidAccess { offset: off, len });
            }
            let rel = (off - node.base) as usize;
            return Ok(unsafe { node.ptr.add(rel) });
        }
        Err(RegionError::InvalidAccess { offset: off, len })
    }

    /// Extend the backing file (if any) by `additional` bytes and make the
    /// new bytes reachable through the chain, either by extending the last
    /// node in place (within its existing reservation) or by appending a new
    /// node. Returns the new total length.
    pub fn grow(&mut self, additional: usize) -> Result<usize> {
        let _guard = self.grow_lock.lock().unwrap();
        self.grow_locked(additional)
    }

    fn grow_locked(&self, additional: usize) -> Result<usize> {
        let current_total = self.len();

        let count = self.count.load(Ordering::Acquire);
        let last = unsafe { &*self.nodes[count - 1].load(Ordering::Acquire) };
        let old_len = last.len.load(Ordering::Relaxed);
        let new_len = old_len + additional;

        if new_len <= last.capacity {
            // Still within the reservation this node was created with: the
            // address range is already mapped, so growing is just extending
            // the backing file (if any) to cover it and publishing the new
            // length. No remap, nothing else can have raced this address
            // range since it was never released.
            if let Some(file) = &self.file {
                file.set_len(current_total as u64 + additional as u64).map_err(|e| {
                    RegionError::ResizeFailed {
                        current: current_total,
                        requested: current_total + additional,
                        source: e,
                    }
                })?;
                file.sync_all().map_err(RegionError::Sync)?;
            }
            last.len.store(new_len, Ordering::Release);
            return Ok(current_total + additional);
        }

        // Reservation exhausted: append a brand new node with its own fresh
        // reservation (at least `additional` bytes, plus the configured
        // guard size so the next grow can stay in-place too).
        if count >= MAX_VMA_NODES {
            return Err(RegionError::OutOfRegion { requested: additional, source: None });
        }

        let node_capacity = additional + self.reserved;

        if let Some(file) = &self.file {
            file.set_len(current_total as u64 + additional as u64).map_err(|e| {
                RegionError::ResizeFailed {
                    current: current_total,
                    requested: current_total + additional,
                    source: e,
                }
            })?;
            file.sync_all().map_err(RegionError::Sync)?;
        }

        let map = map_node(self.file.as_ref(), current_total as u64, node_capacity)?;

        let node = Box::leak(Box::new(VmaNode {
            base: current_total as u64,
            ptr: map.as_ptr() as *mut u8,
            len: AtomicUsize::new(additional),
            capacity: node_capacity,
            map: std::cell::UnsafeCell::new(map),
        }));

        self.nodes[count].store(node, Ordering::Release);
        self.count.store(count + 1, Ordering::Release);

        Ok(current_total + additional)
    }

    /// Relocate every VMA into one contiguous mapping, with a fresh
    /// reservation tail of its own. Only safe to call inside a world-stop:
    /// every outstanding pointer handed out by `access` is invalidated once
    /// this returns.
    ///
    /// # Safety
    ///
    /// The caller must hold the region's world-stop for the duration of
    /// this call.
    pub unsafe fn coalesce(&mut self) -> Result<()> {
        let _guard = self.grow_lock.lock().unwrap();
        let total = self.len();
        if total == 0 {
            return Ok(());
        }
        let count = self.count.load(Ordering::Acquire);
        if count <= 1 {
            return Ok(());
        }

        let capacity = total + self.reserved;
        let new_map = match &self.file {
            Some(file) => map_node(Some(file), 0, capacity)?,
            None => {
                let mut m = MmapMut::map_anon(capacity)
                    .map_err(|e| RegionError::OutOfRegion { requested: capacity, source: Some(e) })?;
                for i in 0..count {
                    let node = &*self.nodes[i].load(Ordering::Acquire);
                    let node_len = node.len.load(Ordering::Relaxed);
                    let src = std::slice::from_raw_parts(node.ptr, node_len);
                    let dst_off = node.base as usize;
                    m[dst_off..dst_off + node_len].copy_from_slice(src);
                }
                MmapRaw::from(m)
            }
        };

        let new_node = Box::leak(Box::new(VmaNode {
            base: 0,
            ptr: new_map.as_ptr() as *mut u8,
            len: AtomicUsize::new(total),
            capacity,
            map: std::cell::UnsafeCell::new(new_map),
        }));

        let old_nodes: Vec<*mut VmaNode> = (0..count)
            .map(|i| self.nodes[i].swap(std::ptr::null_mut(), Ordering::AcqRel))
            .collect();

        self.nodes[0].store(new_node, Ordering::Release);
        self.count.store(1, Ordering::Release);

        for old in old_nodes {
            if !old.is_null() {
                drop(Box::from_raw(old));
            }
        }

        Ok(())
    }

    /// Flush every dirty page of the mapping to the backing file. No-op for
    /// anonymous regions.
    #[cfg(not(windows))]
    pub fn flush(&self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            let node = unsafe { &*self.nodes[i].load(Ordering::Acquire) };
            unsafe { (*node.map.get()).flush() }.map_err(RegionError::Sync)?;
        }
        Ok(())
    }

    #[cfg(windows)]
    pub fn flush(&self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count.saturating_sub(1) {
            let node = unsafe { &*self.nodes[i].load(Ordering::Acquire) };
            unsafe { (*node.map.get()).flush_async() }.map_err(RegionError::Sync)?;
        }
        let last = unsafe { &*self.nodes[count - 1].load(Ordering::Acquire) };
        unsafe { (*last.map.get()).flush() }.map_err(RegionError::Sync)?;
        Ok(())
    }

    /// Flush `[off, off+len)`. Errors if the range crosses a node boundary.
    pub fn flush_range(&self, off: Off, len: usize) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            let node = unsafe { &*self.nodes[i].load(Ordering::Acquire) };
            let node_len = node.len.load(Ordering::Relaxed) as u64;
            if off < node.base || off >= node.base + node_len {
                continue;
            }
            if off + len as u64 > node.base + node_len {
                return Err(RegionError::InvalidAccess { offset: off, len });
            }
            let rel = (off - node.base) as usize;
            unsafe { (*node.map.get()).flush_range(rel, len) }.map_err(RegionError::Sync)?;
            return Ok(());
        }
        Err(RegionError::InvalidAccess { offset: off, len })
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Size of the guard reservation each node is created with. Exercised
    /// directly by `grow_locked`/`coalesce`/`init` above; exposed so callers
    /// (and tests) can reason about how much headroom a fresh node has.
    pub fn reserved(&self) -> usize {
        self.reserved
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let count = self.count.load(Ordering::Acquire);
        for i in 0..count {
            let ptr = self.nodes[i].swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_access_roundtrip() {
        let mut mapping = Mapping::init(None, 4096, true, 4096).unwrap();
        let ptr = mapping.access(0, 64).unwrap();
        unsafe { std::slice::from_raw_parts_mut(ptr, 64).fill(0xAB) };
        let ptr2 = mapping.access(0, 64).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(ptr2, 64) };
        assert!(slice.iter().all(|&b| b == 0xAB));

        assert!(mapping.is_edge(4096));
        assert!(!mapping.is_edge(0));

        let new_len = mapping.grow(4096).unwrap();
        assert_eq!(new_len, 8192);
        assert!(mapping.is_edge(8192));

        // earlier pointer is still valid: grow never relocates, and this
        // grow stayed within the initial 4096-byte reservation.
        let slice = unsafe { std::slice::from_raw_parts(ptr2, 64) };
        assert!(slice.iter().all(|&b| b == 0xAB));
        assert_eq!(mapping.reserved(), 4096);
    }

    #[test]
    fn grow_past_reservation_appends_new_node() {
        let mut mapping = Mapping::init(None, 64, true, 64).unwrap();
        // First grow exhausts the 64-byte reservation exactly.
        mapping.grow(64).unwrap();
        // Second grow must fall back to a brand new node.
        let new_len = mapping.grow(64).unwrap();
        assert_eq!(new_len, 192);
        let ptr = mapping.access(160, 32).unwrap();
        unsafe { std::slice::from_raw_parts_mut(ptr, 32).fill(0xCD) };
    }

    #[test]
    fn out_of_bounds_access_fails() {
        let mapping = Mapping::init(None, 4096, true, 4096).unwrap();
        assert!(mapping.access(4000, 200).is_err());
    }
}
