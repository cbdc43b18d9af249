//! The region façade (spec §4.5/§6): the single entry point tying the
//! mapping, allocator, epoch reclamation, and journal together, and the
//! only part of this crate application code is meant to call directly.

use std::fs::OpenOptions as FsOpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use bytemuck::{Pod, Zeroable};
use fs4::fs_std::FileExt;
use xxhash_rust::xxh3::xxh3_64;

use crate::alloc::Allocator;
use crate::epoch::{Epoch, SLOT_SIZE};
use crate::error::{RegionError, Result};
use crate::journal::{DirtyMarks, Journal};
use crate::mapping::Mapping;
use crate::offset::{Off, NIL};

/// Magic stamped at offset 0 of every region file, identifying the format
/// and catching an attempt to open a file this crate didn't create.
pub const META_MAGIC: u64 = 0x3190_6C0F_FC1F_C856;
pub const META_VERSION: u32 = 1;

/// Default reservation size: how much guard address space `Mapping`
/// requests alongside each new VMA so that an in-place grow has somewhere
/// to extend into before falling back to a brand new node.
const DEFAULT_VMA_RESERVED: usize = 64 * 1024 * 1024;
const DEFAULT_EPOCH_SLOTS: usize = 256;
const DEFAULT_META_SIZE: usize = 4096;

/// Fixed byte pattern a freed extent's body is stamped with under the
/// `debug-mcheck` feature.
#[cfg(feature = "debug-mcheck")]
const POISON_BYTE: u8 = 0xFE;

/// On-disk/in-mapping header living at offset 0. `Pod`/`Zeroable` so it can
/// be read and written with a single `bytemuck` cast, same as the teacher's
/// `RootHeader`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct MetaHeader {
    magic: u64,
    version: u32,
    _pad: u32,
    /// Offset of the allocator's persistent bookkeeping (currently unused —
    /// free lists are rebuilt implicitly by never persisting anything
    /// outside allocated extents; reserved for a future on-disk free-list
    /// snapshot).
    alloc_root: u64,
    /// Offset of the in-region epoch reservation slot table. Only
    /// meaningful for the shared variant; `NIL` for a private region.
    epoch_root: u64,
    /// Caller-assigned root offset, set via `Region::set_root`.
    user_root: u64,
    checksum: u64,
}

/// Which kind of epoch reservation table backs this region: process-local
/// (cheaper, but invisible to other processes) or resident in the mapped
/// region itself (lets a second process attaching to the same file
/// participate in reclamation, per spec.md §9's private/shared split).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Private,
    Shared,
}

/// Builder for [`Region::open`], mirroring the teacher's `OpenOptions`.
#[derive(Debug, Clone)]
pub struct RegionOptions {
    open: bool,
    create: bool,
    read_only: bool,
    truncate: bool,
    populate: bool,
    huge_tlb: bool,
    vma_reserved: usize,
    epoch_slots: usize,
    alloc_areas: usize,
    initial_len: usize,
    kind: RegionKind,
    mode: u32,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            open: true,
            create: false,
            read_only: false,
            truncate: false,
            populate: false,
            huge_tlb: false,
            vma_reserved: DEFAULT_VMA_RESERVED,
            epoch_slots: DEFAULT_EPOCH_SLOTS,
            alloc_areas: 16,
            initial_len: DEFAULT_META_SIZE,
            kind: RegionKind::Private,
            mode: 0o644,
        }
    }
}

impl RegionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(mut self, v: bool) -> Self {
        self.open = v;
        self
    }

    pub fn create(mut self, v: bool) -> Self {
        self.create = v;
        self
    }

    pub fn read_only(mut self, v: bool) -> Self {
        self.read_only = v;
        self
    }

    pub fn truncate(mut self, v: bool) -> Self {
        self.truncate = v;
        self
    }

    pub fn populate(mut self, v: bool) -> Self {
        self.populate = v;
        self
    }

    pub fn huge_tlb(mut self, v: bool) -> Self {
        self.huge_tlb = v;
        self
    }

    pub fn vma_reserved(mut self, bytes: usize) -> Self {
        self.vma_reserved = bytes;
        self
    }

    pub fn epoch_slots(mut self, n: usize) -> Self {
        self.epoch_slots = n;
        self
    }

    pub fn alloc_areas(mut self, n: usize) -> Self {
        self.alloc_areas = n;
        self
    }

    pub fn kind(mut self, kind: RegionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.open && !self.create {
            return Err(RegionError::InvalidArgument(
                "RegionOptions: at least one of open/create must be set",
            ));
        }
        if self.truncate && self.read_only {
            return Err(RegionError::InvalidArgument(
                "RegionOptions: truncate is incompatible with read_only",
            ));
        }
        Ok(())
    }

    /// Bytes needed for the epoch slot table when `kind == Shared`: laid out
    /// right after the meta header.
    fn epoch_region_bytes(&self) -> usize {
        self.epoch_slots * SLOT_SIZE
    }
}

thread_local! {
    /// Per-thread last-error slot (spec: "context attached to a per-thread
    /// last-error slot"). `Region::record_error` stashes a clone here before
    /// converting to the boundary-facing error; `Region::last_error` reads
    /// and clears it.
    static LAST_ERROR: std::cell::RefCell<Option<String>> = const { std::cell::RefCell::new(None) };
    static SLOT_ID: std::cell::OnceCell<usize> = const { std::cell::OnceCell::new() };
}

/// The persistent region: a memory-mapped heap with crash-atomic save,
/// lock-free allocation, and epoch-reclaimed frees.
pub struct Region {
    /// `access` only needs a shared read lock (it does relaxed atomic loads
    /// and pointer arithmetic, no mutation of `Mapping` itself); `grow` and
    /// `coalesce` take the write lock since they mutate the node chain.
    mapping: RwLock<Mapping>,
    marks: std::sync::Mutex<DirtyMarks>,
    journal: Option<Journal>,
    alloc: Allocator,
    epoch: Epoch,
    kind: RegionKind,
    path: Option<PathBuf>,
    next_slot: AtomicU64,
}

impl Region {
    /// Open or create a region backed by `path` on disk. An anonymous,
    /// process-local region (no persistence) is obtained by using
    /// [`Region::open_anon`] instead.
    pub fn open(path: impl AsRef<Path>, opts: &RegionOptions) -> Result<Self> {
        opts.validate()?;
        let path = path.as_ref().to_path_buf();

        let mut fs_opts = FsOpenOptions::new();
        fs_opts.read(true).write(!opts.read_only).create(opts.create).truncate(opts.truncate);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            fs_opts.mode(opts.mode);
        }
        let file = fs_opts.open(&path).map_err(RegionError::Open)?;

        file.try_lock_exclusive().map_err(RegionError::Lock)?;

        let existing_len = file.metadata().map_err(RegionError::Open)?.len();
        let is_new = existing_len == 0;
        let initial_len = DEFAULT_META_SIZE + opts.epoch_region_bytes();
        if is_new {
            file.set_len(initial_len as u64).map_err(|e| RegionError::ResizeFailed {
                current: 0,
                requested: initial_len,
                source: e,
            })?;
        }
        let total_len = file.metadata().map_err(RegionError::Open)?.len() as usize;

        let mapping = Mapping::init(Some(file), total_len, !opts.read_only, opts.vma_reserved)?;
        let marks = DirtyMarks::new(total_len);
        let journal = Journal::new(&path);

        let epoch_root = if opts.kind == RegionKind::Shared { DEFAULT_META_SIZE as u64 } else { NIL };
        let epoch = Self::build_epoch(&mapping, opts, epoch_root, is_new)?;

        let region = Self {
            mapping: RwLock::new(mapping),
            marks: std::sync::Mutex::new(marks),
            journal: Some(journal),
            alloc: Allocator::new(opts.alloc_areas),
            epoch,
            kind: opts.kind,
            path: Some(path),
            next_slot: AtomicU64::new(0),
        };

        if is_new {
            region.write_meta(&MetaHeader {
                magic: META_MAGIC,
                version: META_VERSION,
                _pad: 0,
                alloc_root: NIL,
                epoch_root,
                user_root: NIL,
                checksum: 0,
            })?;
        } else {
            region.replay_journal()?;
            region.validate_meta()?;
            if region.kind == RegionKind::Shared {
                region.reset_shared_epoch_counters()?;
            }
        }

        Ok(region)
    }

    /// Open a purely in-memory region backed by an anonymous mapping. No
    /// journal, no crash recovery — frees on process exit. Always private:
    /// there is no second process to share reservation slots with.
    pub fn open_anon(opts: &RegionOptions) -> Result<Self> {
        let mapping = Mapping::init(None, DEFAULT_META_SIZE, true, opts.vma_reserved)?;
        let marks = DirtyMarks::new(DEFAULT_META_SIZE);
        let epoch = Epoch::new_private(opts.epoch_slots);

        let region = Self {
            mapping: RwLock::new(mapping),
            marks: std::sync::Mutex::new(marks),
            journal: None,
            alloc: Allocator::new(opts.alloc_areas),
            epoch,
            kind: RegionKind::Private,
            path: None,
            next_slot: AtomicU64::new(0),
        };
        region.write_meta(&MetaHeader {
            magic: META_MAGIC,
            version: META_VERSION,
            _pad: 0,
            alloc_root: NIL,
            epoch_root: NIL,
            user_root: NIL,
            checksum: 0,
        })?;
        Ok(region)
    }

    /// Build the epoch reclamation state for `open`: a process-heap table
    /// for the private variant, or a table resident at `epoch_root` inside
    /// `mapping` for the shared variant (initialized fresh if this is a
    /// brand new region; reset happens separately on reopen, see
    /// [`Region::reset_shared_epoch_counters`]).
    fn build_epoch(mapping: &Mapping, opts: &RegionOptions, epoch_root: Off, is_new: bool) -> Result<Epoch> {
        if opts.kind != RegionKind::Shared {
            return Ok(Epoch::new_private(opts.epoch_slots));
        }
        let ptr = mapping.access(epoch_root, opts.epoch_region_bytes())?;
        if is_new {
            unsafe { Epoch::init_shared_slots(ptr, opts.epoch_slots) };
        }
        Ok(unsafe { Epoch::new_shared(ptr, opts.epoch_slots) })
    }

    /// Checksum covers every header field except `checksum` itself, so it's
    /// always computed over a copy with that field zeroed.
    fn meta_checksum(meta: &MetaHeader) -> u64 {
        let mut copy = *meta;
        copy.checksum = 0;
        xxh3_64(bytemuck::bytes_of(&copy))
    }

    fn write_meta(&self, meta: &MetaHeader) -> Result<()> {
        let mut meta = *meta;
        meta.checksum = Self::meta_checksum(&meta);
        let mapping = self.mapping.read().unwrap();
        let ptr = mapping.access(0, std::mem::size_of::<MetaHeader>())?;
        let bytes = bytemuck::bytes_of(&meta);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        drop(mapping);
        self.mark(0, std::mem::size_of::<MetaHeader>());
        Ok(())
    }

    fn read_meta(&self) -> Result<MetaHeader> {
        let mapping = self.mapping.read().unwrap();
        let ptr = mapping.access(0, std::mem::size_of::<MetaHeader>())?;
        let slice = unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<MetaHeader>()) };
        Ok(*bytemuck::from_bytes::<MetaHeader>(slice))
    }

    fn validate_meta(&self) -> Result<()> {
        let meta = self.read_meta()?;
        if meta.magic != META_MAGIC {
            return Err(RegionError::Corruption("meta header magic mismatch"));
        }
        if meta.version != META_VERSION {
            return Err(RegionError::Corruption("meta header version mismatch"));
        }
        if meta.checksum != Self::meta_checksum(&meta) {
            return Err(RegionError::Corruption("meta header checksum mismatch"));
        }
        Ok(())
    }

    fn replay_journal(&self) -> Result<()> {
        let Some(journal) = &self.journal else { return Ok(()) };
        let mapping = self.mapping.read().unwrap();
        journal.recover(|off, buf| {
            let ptr = mapping.access(off, buf.len())?;
            unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, buf.len()) };
            Ok(())
        })?;
        mapping.flush()
    }

    /// Zero the in-region epoch reservation counters. Only meaningful for
    /// the shared variant; safe because the exclusive file lock taken in
    /// `open` guarantees no other writer is attached yet, so any slot still
    /// parked at a non-sentinel epoch belongs to a process that crashed
    /// without clearing it.
    fn reset_shared_epoch_counters(&self) -> Result<()> {
        if self.kind != RegionKind::Shared {
            return Ok(());
        }
        let meta = self.read_meta()?;
        if meta.epoch_root == NIL {
            return Ok(());
        }
        let n = self.epoch.num_slots();
        let mapping = self.mapping.read().unwrap();
        let ptr = mapping.access(meta.epoch_root, n * SLOT_SIZE)?;
        unsafe { crate::epoch::Epoch::init_shared_slots(ptr, n) };
        Ok(())
    }

    /// Current total mapped length, in bytes.
    pub fn len(&self) -> usize {
        self.mapping.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow the region by at least `additional` bytes.
    pub fn grow(&self, additional: usize) -> Result<usize> {
        let mut mapping = self.mapping.write().unwrap();
        let new_len = mapping.grow(additional)?;
        drop(mapping);
        self.marks.lock().unwrap().grow(new_len);
        Ok(new_len)
    }

    /// Read `len` bytes at `off` into a fresh `Vec`.
    pub fn read(&self, off: Off, len: usize) -> Result<Vec<u8>> {
        let mapping = self.mapping.read().unwrap();
        let ptr = mapping.access(off, len)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
    }

    /// Write `buf` at `off` and mark the range dirty for the next `save`.
    pub fn write(&self, off: Off, buf: &[u8]) -> Result<()> {
        let mapping = self.mapping.read().unwrap();
        let ptr = mapping.access(off, buf.len())?;
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, buf.len()) };
        drop(mapping);
        self.mark(off, buf.len());
        Ok(())
    }

    /// Resolve `[off, off+len)` to a raw pointer into the mapping, for
    /// callers (namely [`crate::hash::HashTable`]) that need to perform
    /// their own atomic operations directly on region memory rather than go
    /// through `read`/`write`'s copying interface. Takes only the shared
    /// read lock: the returned pointer is stable until the next `grow` past
    /// this node's reservation or a `coalesce`.
    pub(crate) fn raw_ptr(&self, off: Off, len: usize) -> Result<*mut u8> {
        self.mapping.read().unwrap().access(off, len)
    }

    fn mark(&self, off: Off, len: usize) {
        self.marks.lock().unwrap().mark(off, len);
    }

    /// Allocate `len` bytes, growing the region if every free list and the
    /// large allocator came up empty.
    pub fn alloc(&self, len: usize) -> Result<Off> {
        let region_self = self;
        self.alloc.alloc(
            len,
            |off| region_self.read_link(off),
            |off, next| region_self.write_link(off, next),
            |off| region_self.read_size(off),
            |off, size| region_self.write_size(off, size),
            |need| {
                let total = region_self.len();
                region_self.grow(need.max(4096))?;
                Ok(total as Off)
            },
            |off, len| region_self.check_poison(off, len),
        )
    }

    /// Immediately return `off`/`len` to a free list without waiting for
    /// epoch reclamation. Only safe when the caller can prove no concurrent
    /// reader can observe `off` (e.g. it was never published).
    pub fn free(&self, off: Off, len: usize) {
        let region_self = self;
        self.alloc.free(
            off,
            len,
            |o| region_self.read_link(o),
            |o, next| region_self.write_link(o, next),
            |o| region_self.read_size(o),
            |o, size| region_self.write_size(o, size),
            |edge_off| region_self.mapping.read().unwrap().is_edge(edge_off),
            |off, len| region_self.poison_extent(off, len),
        );
    }

    /// Defer `off`/`len` for reclamation once every reader that entered
    /// before now has exited.
    pub fn defer_free(&self, off: Off, len: usize) {
        self.epoch.defer(off, len);
    }

    /// Defer an arbitrary one-shot callback for the same epoch-drained
    /// moment `defer_free` frees are reaped at. Useful for cleanup that
    /// isn't a plain extent free, e.g. releasing a retired hash table.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        self.epoch.defer_fn(f);
    }

    /// Stamp `[off, off+len)` with the debug poison pattern. Only has any
    /// effect (and is only ever invoked by [`crate::alloc::Allocator`])
    /// under the `debug-mcheck` feature.
    #[cfg(feature = "debug-mcheck")]
    fn poison_extent(&self, off: Off, len: usize) {
        let pattern = vec![POISON_BYTE; len];
        let _ = self.write(off, &pattern);
    }

    #[cfg(not(feature = "debug-mcheck"))]
    fn poison_extent(&self, _off: Off, _len: usize) {}

    /// True if `[off, off+len)` is still entirely the poison pattern. Only
    /// meaningful (and only ever invoked) under `debug-mcheck`.
    #[cfg(feature = "debug-mcheck")]
    fn check_poison(&self, off: Off, len: usize) -> bool {
        match self.read(off, len) {
            Ok(bytes) => bytes.iter().all(|&b| b == POISON_BYTE),
            Err(_) => true,
        }
    }

    #[cfg(not(feature = "debug-mcheck"))]
    fn check_poison(&self, _off: Off, _len: usize) -> bool {
        true
    }

    fn read_link(&self, off: Off) -> Off {
        self.read(off, 8).map(|b| u64::from_le_bytes(b.try_into().unwrap())).unwrap_or(NIL)
    }

    fn write_link(&self, off: Off, next: Off) {
        let _ = self.write(off, &next.to_le_bytes());
    }

    fn read_size(&self, off: Off) -> u64 {
        self.read(off + 8, 8).map(|b| u64::from_le_bytes(b.try_into().unwrap())).unwrap_or(0)
    }

    fn write_size(&self, off: Off, size: u64) {
        let _ = self.write(off + 8, &size.to_le_bytes());
    }

    fn slot_id(&self) -> usize {
        SLOT_ID.with(|cell| {
            *cell.get_or_init(|| {
                self.next_slot.fetch_add(1, Ordering::Relaxed) as usize % self.epoch.num_slots()
            })
        })
    }

    /// Enter an epoch critical section. Every access into the mapping
    /// outside of `read`/`write`/`alloc` (i.e. raw pointer use through
    /// [`crate::hash::HashTable`]) must happen between `enter` and `exit`.
    pub fn enter(&self) -> u64 {
        self.epoch.enter(self.slot_id())
    }

    pub fn exit(&self) {
        self.epoch.exit(self.slot_id())
    }

    /// Run one epoch advance/reap pass. Applications call this periodically
    /// from a background thread (or per-operation, as the original's
    /// sampling GC does); this crate never spawns threads of its own.
    pub fn gc_tick(&self) {
        let region_self = self;
        self.epoch.try_advance(|off, len| region_self.free(off, len));
    }

    pub fn get_root(&self) -> Result<Off> {
        Ok(self.read_meta()?.user_root)
    }

    pub fn set_root(&self, off: Off) -> Result<()> {
        let mut meta = self.read_meta()?;
        meta.user_root = off;
        self.write_meta(&meta)
    }

    /// Stop every thread's epoch reservation and block until any in-flight
    /// reservation drains. Pairs with [`Region::world_resume`]; used
    /// internally by `save`/`coalesce`, exposed for callers that need to
    /// bracket their own world-stop-sensitive operation (e.g. inspecting
    /// every table in a [`crate::hash::HashTable`] chain without a live
    /// resize racing them).
    pub fn world_stop(&self) {
        self.epoch.stop();
    }

    pub fn world_resume(&self) {
        self.epoch.resume();
    }

    /// Stop every thread's epoch reservation, flush the dirty set to the
    /// journal and apply it, then resume. No-op (beyond the epoch
    /// stop/resume bracket) for anonymous regions, which have no journal.
    pub fn save(&self) -> Result<()> {
        self.epoch.stop();
        let result = self.save_locked();
        self.epoch.resume();
        if let Err(err) = &result {
            self.record_error(err);
            if err.is_fatal() {
                log::error!("unrecoverable failure during save, aborting process");
                std::process::abort();
            }
        }
        result
    }

    fn save_locked(&self) -> Result<()> {
        let Some(journal) = &self.journal else { return Ok(()) };
        let mapping = self.mapping.read().unwrap();
        let marks = self.marks.lock().unwrap();
        journal.save(
            &marks,
            |off, len| {
                mapping.access(off, len).map(|p| unsafe { std::slice::from_raw_parts(p, len).to_vec() })
            },
            |off, buf| {
                let ptr = mapping.access(off, buf.len())?;
                unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, buf.len()) };
                Ok(())
            },
        )?;
        mapping.flush()
    }

    /// Relocate every VMA node into one contiguous mapping. Must be called
    /// with no other thread holding a pointer derived from an earlier
    /// `read`/`write`/`access` call; the epoch world-stop bracket this
    /// method takes internally only protects against *new* entrants, not
    /// pointers a caller is still holding outside an epoch section.
    pub fn coalesce(&self) -> Result<()> {
        self.epoch.stop();
        let mut mapping = self.mapping.write().unwrap();
        let result = unsafe { mapping.coalesce() };
        drop(mapping);
        self.epoch.resume();
        result
    }

    /// Save and consume this region, matching the "close implicitly saves"
    /// lifecycle: after `close` returns there's nothing left to flush, so
    /// the implicit save in `Drop` is a harmless no-op.
    pub fn close(self) -> Result<()> {
        self.save()
    }

    /// Take the calling thread's last-recorded error message, if any.
    pub fn last_error() -> Option<String> {
        LAST_ERROR.with(|cell| cell.borrow_mut().take())
    }

    /// Stash `err`'s message in the calling thread's last-error slot and log
    /// it. Used on the unrecoverable paths noted in each module before the
    /// caller is handed back a generic error (or, for fatal conditions, the
    /// process aborts after this runs).
    fn record_error(&self, err: &RegionError) {
        let rendered = err.to_string();
        log::error!("region error: {rendered}");
        LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(rendered));
    }
}

impl Drop for Region {
    /// "Close implicitly saves": a `Region` dropped without an explicit
    /// `close()` still flushes its dirty set rather than silently losing
    /// unsaved writes. Errors can't propagate out of `Drop`, so they're
    /// logged through the same path a fatal `save()` failure already uses.
    fn drop(&mut self) {
        if self.journal.is_some() {
            if let Err(err) = self.save_locked() {
                log::error!("region dropped with unsaved writes that failed to flush: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_open_alloc_write_read() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let off = region.alloc(32).unwrap();
        region.write(off, b"hello region").unwrap();
        let back = region.read(off, 12).unwrap();
        assert_eq!(&back, b"hello region");
    }

    #[test]
    fn set_get_root_roundtrip() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let off = region.alloc(8).unwrap();
        region.set_root(off).unwrap();
        assert_eq!(region.get_root().unwrap(), off);
    }

    #[test]
    fn file_backed_open_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.db");

        let opts = RegionOptions::new().create(true);
        let region = Region::open(&path, &opts).unwrap();
        let off = region.alloc(16).unwrap();
        region.write(off, b"persisted data!!").unwrap();
        region.save().unwrap();
        drop(region);

        let reopened = Region::open(&path, &RegionOptions::new()).unwrap();
        let back = reopened.read(off, 16).unwrap();
        assert_eq!(&back, b"persisted data!!");
    }

    #[test]
    fn drop_without_explicit_save_still_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.db");

        let opts = RegionOptions::new().create(true);
        let region = Region::open(&path, &opts).unwrap();
        let off = region.alloc(16).unwrap();
        region.write(off, b"dropped, no save").unwrap();
        drop(region);

        let reopened = Region::open(&path, &RegionOptions::new()).unwrap();
        let back = reopened.read(off, 16).unwrap();
        assert_eq!(&back, b"dropped, no save");
    }

    #[test]
    fn close_consumes_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.db");

        let opts = RegionOptions::new().create(true);
        let region = Region::open(&path, &opts).unwrap();
        let off = region.alloc(16).unwrap();
        region.write(off, b"closed explicitly").unwrap();
        region.close().unwrap();

        let reopened = Region::open(&path, &RegionOptions::new()).unwrap();
        let back = reopened.read(off, 16).unwrap();
        assert_eq!(&back, b"closed explicitly");
    }

    #[test]
    fn shared_region_gets_in_region_epoch_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let opts = RegionOptions::new().create(true).kind(RegionKind::Shared).epoch_slots(4);
        let region = Region::open(&path, &opts).unwrap();
        assert_eq!(region.epoch.num_slots(), 4);
        let e = region.enter();
        assert_eq!(e, 0);
        region.exit();
        drop(region);

        // Reopening must reset stale reservation counters rather than wedge.
        let reopened = Region::open(&path, &opts).unwrap();
        let e = reopened.enter();
        assert_eq!(e, 0);
        reopened.exit();
    }

    #[test]
    fn invalid_options_rejected() {
        let opts = RegionOptions::new().open(false).create(false);
        let dir = tempfile::tempdir().unwrap();
        let err = Region::open(dir.path().join("x.db"), &opts).unwrap_err();
        assert!(matches!(err, RegionError::InvalidArgument(_)));
    }
}
