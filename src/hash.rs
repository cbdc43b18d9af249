//! Lock-free open-addressed hash table (spec §4.6), resident entirely in
//! region memory: a table is a header plus a fixed-capacity bucket array,
//! both allocated through [`Region::alloc`]; a small [`HashMeta`] block
//! tracks which table is newest. Growing allocates a new, larger table,
//! migrates every live bucket into it under a world-stop, then frees the
//! old table's storage — so in steady state there is exactly one table, and
//! every mutator still walks the full oldest-to-newest chain the way `get`
//! does, so a key briefly split across two tables (mid-grow, or readers
//! still holding an older chain snapshot) is never duplicated or
//! resurrected after a tombstone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytemuck::{Pod, Zeroable};
use siphasher::sip::SipHasher13;

use crate::error::{HashCode, HashRet, RegionError, Result};
use crate::offset::{state_clear, state_trans, state_word, BucketState, Off, NIL};
use crate::region::Region;

/// Linear probe window width: a lookup gives up on a table and falls
/// through to the next (older, or for insertion, a freshly grown) one after
/// checking this many consecutive slots.
const PROBE_WINDOW: usize = 8;

/// Fixed key used to seed every table's SipHash instance. Deterministic
/// across restarts is required so a key's bucket index is stable once a
/// region is saved and reopened — this is not a DoS-hardening hash, the key
/// is intentionally public and constant.
const SIP_KEY: (u64, u64) = (0x5A5A_1234_ABCD_EF01, 0x0123_4567_89AB_CDEF);

fn hash_key(key: &[u8]) -> u64 {
    use std::hash::Hasher;
    let mut hasher = SipHasher13::new_with_keys(SIP_KEY.0, SIP_KEY.1);
    hasher.write(key);
    hasher.finish()
}

/// On-region header at the start of every table's allocated extent.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TableHeader {
    capacity: u64,
    /// Offset of the next (newer) table in the chain, or `NIL` if this is
    /// the newest. Only ever mutated under a world-stop.
    next_table_offset: u64,
    retired: u64,
    self_offset: u64,
}

const HEADER_SIZE: usize = std::mem::size_of::<TableHeader>();

/// One bucket's region-resident layout: key/value offset words carrying the
/// 2-bit lifecycle state in their low bits (`nil -> set -> {tomb, move ->
/// tomb}`), plus the stored key's byte length.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawBucket {
    key_word: u64,
    value_word: u64,
    key_len: u64,
}

const BUCKET_SIZE: usize = std::mem::size_of::<RawBucket>();

/// Small fixed block tracking the hash table's current chain and an
/// approximate live-entry count.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct HashMeta {
    /// Approximate count of live entries: updated with relaxed atomic
    /// fetch-add/sub from `put`/`del`, so a concurrent reader of `len()`
    /// only ever gets an estimate, never a precise snapshot.
    size_estimate: u64,
    oldest_table_offset: u64,
    newest_table_offset: u64,
    _pad: u64,
}

const META_SIZE: usize = std::mem::size_of::<HashMeta>();

fn bucket_off(table_off: Off, idx: usize) -> Off {
    table_off + HEADER_SIZE as u64 + (idx * BUCKET_SIZE) as u64
}

/// One table in the chain, as found by walking [`HashMeta`]'s links.
struct TableRef {
    off: Off,
    capacity: usize,
}

/// RAII epoch reservation: every operation that dereferences region memory
/// through [`Region::raw_ptr`] holds one for its duration, so a `coalesce`
/// or in-progress `grow_and_migrate` world-stop can never race a pointer
/// still in use.
struct EnterGuard<'a> {
    region: &'a Region,
}

impl<'a> EnterGuard<'a> {
    fn new(region: &'a Region) -> Self {
        region.enter();
        Self { region }
    }
}

impl Drop for EnterGuard<'_> {
    fn drop(&mut self) {
        self.region.exit();
    }
}

enum InsertOutcome {
    Inserted(HashRet),
    /// Lost a CAS race for the slot; the whole `put` should restart from
    /// the chain search rather than retry this slot.
    Retry,
    /// No `Nil`/`Tomb` slot found in the probe window; caller must grow.
    Saturated,
}

/// The lock-free hash table. Keys and values are represented as
/// region-resident offset/length pairs; this table only compares and
/// stores offsets it's handed, never owning the key/value blobs
/// themselves (callers allocate and, on `del`, this table defers freeing
/// the key blob back to the caller's region).
pub struct HashTable<'a> {
    region: &'a Region,
    meta_off: Off,
    /// Serializes concurrent `grow_and_migrate` calls from this process;
    /// paired with a region world-stop for exclusion against readers.
    grow_lock: Mutex<()>,
}

impl<'a> HashTable<'a> {
    /// Allocate a fresh table and meta block in `region`, returning the
    /// meta block's offset — the handle a later [`HashTable::open`] needs.
    pub fn alloc(region: &Region, initial_capacity: usize) -> Result<Off> {
        let capacity = initial_capacity.max(16);
        let table_off = Self::alloc_table_storage(region, capacity)?;
        let meta = HashMeta {
            size_estimate: 0,
            oldest_table_offset: table_off,
            newest_table_offset: table_off,
            _pad: 0,
        };
        let meta_off = region.alloc(META_SIZE)?;
        region.write(meta_off, bytemuck::bytes_of(&meta))?;
        Ok(meta_off)
    }

    /// Attach to a table previously built by [`HashTable::alloc`].
    pub fn open(region: &'a Region, meta_off: Off) -> Result<Self> {
        Ok(Self { region, meta_off, grow_lock: Mutex::new(()) })
    }

    /// Convenience combining `alloc` + `open` for a table with no prior
    /// persisted state.
    pub fn new(region: &'a Region, initial_capacity: usize) -> Result<Self> {
        let meta_off = Self::alloc(region, initial_capacity)?;
        Self::open(region, meta_off)
    }

    fn alloc_table_storage(region: &Region, capacity: usize) -> Result<Off> {
        let bytes_len = HEADER_SIZE + capacity * BUCKET_SIZE;
        let off = region.alloc(bytes_len)?;
        let header =
            TableHeader { capacity: capacity as u64, next_table_offset: NIL, retired: 0, self_offset: off };
        // Every bucket word defaults to 0, which decodes as `BucketState::Nil`
        // with a 0 key_len — a single write covers header + all buckets.
        let mut buf = vec![0u8; bytes_len];
        buf[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        region.write(off, &buf)?;
        Ok(off)
    }

    /// Offset of this table's meta block, the handle to pass to a later
    /// `open`.
    pub fn off(&self) -> Off {
        self.meta_off
    }

    pub fn cap(&self) -> Result<usize> {
        let meta = self.read_meta()?;
        Ok(self.read_header(meta.newest_table_offset)?.capacity as usize)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.read_meta()?.size_estimate)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Grow (and fully, synchronously migrate) until the newest table's
    /// capacity is at least `capacity`.
    pub fn resize(&self, capacity: usize) -> Result<()> {
        loop {
            let meta = self.read_meta()?;
            let header = self.read_header(meta.newest_table_offset)?;
            if header.capacity as usize >= capacity {
                return Ok(());
            }
            self.grow_and_migrate()?;
        }
    }

    /// Destroy this table: defer-free every live key blob, free each
    /// table's on-region storage, and free the meta block. Takes `self` by
    /// value — the caller is asserting there's no concurrent access left.
    pub fn free(self) -> Result<()> {
        self.region.world_stop();
        let result = self.free_locked();
        self.region.world_resume();
        result
    }

    fn free_locked(&self) -> Result<()> {
        let meta = self.read_meta()?;
        let mut cur = meta.oldest_table_offset;
        while cur != NIL {
            let header = self.read_header(cur)?;
            for idx in 0..header.capacity as usize {
                let key_word = self.key_word_atomic(cur, idx)?.load(Ordering::Relaxed);
                if matches!(BucketState::from_word(key_word), BucketState::Set | BucketState::Move) {
                    let key_off = state_clear(key_word);
                    let key_len = self.key_len_atomic(cur, idx)?.load(Ordering::Relaxed) as usize;
                    self.region.defer_free(key_off, key_len);
                }
            }
            let next = header.next_table_offset;
            self.region.free(cur, HEADER_SIZE + header.capacity as usize * BUCKET_SIZE);
            if cur == meta.newest_table_offset {
                break;
            }
            cur = next;
        }
        self.region.free(self.meta_off, META_SIZE);
        Ok(())
    }

    /// Detach this handle without touching the on-region data — it can be
    /// reattached later via [`HashTable::open`].
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    fn read_header(&self, table_off: Off) -> Result<TableHeader> {
        let bytes = self.region.read(table_off, HEADER_SIZE)?;
        Ok(*bytemuck::from_bytes::<TableHeader>(&bytes))
    }

    fn write_header(&self, table_off: Off, header: &TableHeader) -> Result<()> {
        self.region.write(table_off, bytemuck::bytes_of(header))
    }

    fn read_meta(&self) -> Result<HashMeta> {
        let bytes = self.region.read(self.meta_off, META_SIZE)?;
        Ok(*bytemuck::from_bytes::<HashMeta>(&bytes))
    }

    fn write_meta(&self, meta: &HashMeta) -> Result<()> {
        self.region.write(self.meta_off, bytemuck::bytes_of(meta))
    }

    fn bump_len(&self, delta: i64) -> Result<()> {
        let ptr = self.region.raw_ptr(self.meta_off, 8)?;
        let atomic = unsafe { &*(ptr as *const AtomicU64) };
        if delta >= 0 {
            atomic.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            atomic.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn key_word_atomic(&self, table_off: Off, idx: usize) -> Result<&AtomicU64> {
        let ptr = self.region.raw_ptr(bucket_off(table_off, idx), 8)?;
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    fn value_word_atomic(&self, table_off: Off, idx: usize) -> Result<&AtomicU64> {
        let ptr = self.region.raw_ptr(bucket_off(table_off, idx) + 8, 8)?;
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    fn key_len_atomic(&self, table_off: Off, idx: usize) -> Result<&AtomicU64> {
        let ptr = self.region.raw_ptr(bucket_off(table_off, idx) + 16, 8)?;
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    /// Walk `HashMeta`'s links, oldest table first. Only ever more than one
    /// entry long while a `grow_and_migrate` is briefly mutating it — which
    /// can't overlap an ordinary operation, since both sides bracket
    /// themselves with the region's epoch reservation.
    fn chain(&self) -> Result<Vec<TableRef>> {
        let meta = self.read_meta()?;
        let mut refs = Vec::new();
        let mut cur = meta.oldest_table_offset;
        for _ in 0..256 {
            if cur == NIL {
                break;
            }
            let header = self.read_header(cur)?;
            refs.push(TableRef { off: cur, capacity: header.capacity as usize });
            if cur == meta.newest_table_offset {
                return Ok(refs);
            }
            cur = header.next_table_offset;
        }
        Err(RegionError::Corruption("hash table chain did not terminate at the newest table"))
    }

    /// Find `key`'s bucket index within `table`'s probe window, if present.
    /// Used identically by `get`, `put`'s existing-entry check, `cmp_xchg`,
    /// `del`, and `cmp_del` — the single place chain-walk correctness lives.
    fn find_slot_for_key(&self, table: &TableRef, key: &[u8], hash: u64) -> Result<Option<usize>> {
        let start = (hash as usize) % table.capacity;
        let window = PROBE_WINDOW.min(table.capacity);
        for i in 0..window {
            let idx = (start + i) % table.capacity;
            let key_word = self.key_word_atomic(table.off, idx)?.load(Ordering::Acquire);
            match BucketState::from_word(key_word) {
                BucketState::Nil => return Ok(None),
                BucketState::Tomb => {}
                BucketState::Set | BucketState::Move => {
                    let stored_off = state_clear(key_word);
                    let stored_len = self.key_len_atomic(table.off, idx)?.load(Ordering::Acquire) as usize;
                    if stored_len == key.len() && self.region.read(stored_off, stored_len)? == key {
                        return Ok(Some(idx));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Look up `key` (given as a region offset/length), searching every
    /// table in the chain from newest to oldest so a key that hasn't yet
    /// been migrated off an older table is still found.
    pub fn get(&self, key_off: Off, key_len: usize) -> Result<HashRet> {
        let _guard = EnterGuard::new(self.region);
        let key = self.region.read(key_off, key_len)?;
        let hash = hash_key(&key);
        let chain = self.chain()?;
        for table in chain.iter().rev() {
            if let Some(idx) = self.find_slot_for_key(table, &key, hash)? {
                let value_word = self.value_word_atomic(table.off, idx)?.load(Ordering::Acquire);
                return Ok(HashRet::ok(state_clear(value_word)));
            }
        }
        Ok(HashRet::not_found())
    }

    /// Insert or overwrite `key -> value`, returning the previous value (or
    /// `NotFound` if the key was absent). Checks every table in the chain
    /// for an existing entry before inserting fresh into the newest table,
    /// so a duplicate Set bucket for the same key can never exist across
    /// table generations.
    pub fn put(&self, key_off: Off, key_len: usize, value: Off) -> Result<HashRet> {
        loop {
            {
                let _guard = EnterGuard::new(self.region);
                let key = self.region.read(key_off, key_len)?;
                let hash = hash_key(&key);
                let chain = self.chain()?;
                for table in chain.iter().rev() {
                    if let Some(idx) = self.find_slot_for_key(table, &key, hash)? {
                        let prev = self.value_word_atomic(table.off, idx)?
                            .swap(state_word(value, BucketState::Set), Ordering::AcqRel);
                        return Ok(HashRet::ok(state_clear(prev)));
                    }
                }
                match self.try_insert_newest(key_off, key_len, &key, hash, value)? {
                    InsertOutcome::Inserted(ret) => return Ok(ret),
                    InsertOutcome::Retry => continue,
                    InsertOutcome::Saturated => {}
                }
            }
            self.grow_and_migrate()?;
        }
    }

    fn try_insert_newest(
        &self,
        key_off: Off,
        key_len: usize,
        key: &[u8],
        hash: u64,
        value: Off,
    ) -> Result<InsertOutcome> {
        let meta = self.read_meta()?;
        let table_off = meta.newest_table_offset;
        let header = self.read_header(table_off)?;
        let capacity = header.capacity as usize;
        let start = (hash as usize) % capacity;
        let window = PROBE_WINDOW.min(capacity);

        for i in 0..window {
            let idx = (start + i) % capacity;
            let key_atomic = self.key_word_atomic(table_off, idx)?;
            let current = key_atomic.load(Ordering::Acquire);
            match BucketState::from_word(current) {
                BucketState::Nil | BucketState::Tomb => {
                    self.key_len_atomic(table_off, idx)?.store(key_len as u64, Ordering::Relaxed);
                    self.value_word_atomic(table_off, idx)?
                        .store(state_word(value, BucketState::Set), Ordering::Release);
                    let new_word = state_word(key_off, BucketState::Set);
                    return match key_atomic.compare_exchange(
                        current,
                        new_word,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.bump_len(1)?;
                            Ok(InsertOutcome::Inserted(HashRet::not_found()))
                        }
                        Err(_) => Ok(InsertOutcome::Retry),
                    };
                }
                BucketState::Set | BucketState::Move => {
                    let stored_off = state_clear(current);
                    let stored_len = self.key_len_atomic(table_off, idx)?.load(Ordering::Acquire) as usize;
                    if stored_len == key.len() && self.region.read(stored_off, stored_len)? == key {
                        // Another thread inserted this exact key between our
                        // chain search and now; fold into it instead of
                        // creating a second live bucket for the same key.
                        let prev = self.value_word_atomic(table_off, idx)?
                            .swap(state_word(value, BucketState::Set), Ordering::AcqRel);
                        return Ok(InsertOutcome::Inserted(HashRet::ok(state_clear(prev))));
                    }
                }
            }
        }
        Ok(InsertOutcome::Saturated)
    }

    pub fn xchg(&self, key_off: Off, key_len: usize, value: Off) -> Result<HashRet> {
        self.put(key_off, key_len, value)
    }

    /// Swap in `value` only if the current value equals `expected`.
    pub fn cmp_xchg(&self, key_off: Off, key_len: usize, expected: Off, value: Off) -> Result<HashRet> {
        let _guard = EnterGuard::new(self.region);
        let key = self.region.read(key_off, key_len)?;
        let hash = hash_key(&key);
        let chain = self.chain()?;
        for table in chain.iter().rev() {
            if let Some(idx) = self.find_slot_for_key(table, &key, hash)? {
                let value_atomic = self.value_word_atomic(table.off, idx)?;
                loop {
                    let current = value_atomic.load(Ordering::Acquire);
                    if state_clear(current) != expected {
                        return Ok(HashRet::stop(state_clear(current)));
                    }
                    match value_atomic.compare_exchange(
                        current,
                        state_word(value, BucketState::Set),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(prev) => return Ok(HashRet::ok(state_clear(prev))),
                        Err(_) => continue,
                    }
                }
            }
        }
        Ok(HashRet::not_found())
    }

    /// Tombstone `key`, deferring its key blob back to the region for
    /// reclamation once every reader that could still see it has exited.
    pub fn del(&self, key_off: Off, key_len: usize) -> Result<HashRet> {
        // A loop rather than a recursive retry on a lost CAS: re-entering
        // the region's epoch reservation on the same slot without first
        // exiting it can deadlock a concurrent world-stop (the stopper
        // waits for the slot to clear, which can't happen until the nested
        // call returns, which itself may be waiting on the same stop).
        loop {
            let _guard = EnterGuard::new(self.region);
            let key = self.region.read(key_off, key_len)?;
            let hash = hash_key(&key);
            let chain = self.chain()?;
            let mut lost_race = false;
            for table in chain.iter().rev() {
                if let Some(idx) = self.find_slot_for_key(table, &key, hash)? {
                    let key_atomic = self.key_word_atomic(table.off, idx)?;
                    let key_word = key_atomic.load(Ordering::Acquire);
                    let tombed = state_trans(key_word, BucketState::Tomb);
                    if key_atomic
                        .compare_exchange(key_word, tombed, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        lost_race = true;
                        break;
                    }
                    let stored_key_off = state_clear(key_word);
                    let stored_key_len = self.key_len_atomic(table.off, idx)?.load(Ordering::Acquire) as usize;
                    let value_atomic = self.value_word_atomic(table.off, idx)?;
                    let prev_value = value_atomic.swap(
                        state_trans(value_atomic.load(Ordering::Acquire), BucketState::Tomb),
                        Ordering::AcqRel,
                    );
                    self.bump_len(-1)?;
                    self.region.defer_free(stored_key_off, stored_key_len);
                    return Ok(HashRet::ok(state_clear(prev_value)));
                }
            }
            if !lost_race {
                return Ok(HashRet::not_found());
            }
        }
    }

    /// Tombstone `key` only if its current value equals `expected`.
    pub fn cmp_del(&self, key_off: Off, key_len: usize, expected: Off) -> Result<HashRet> {
        let _guard = EnterGuard::new(self.region);
        let key = self.region.read(key_off, key_len)?;
        let hash = hash_key(&key);
        let chain = self.chain()?;
        for table in chain.iter().rev() {
            if let Some(idx) = self.find_slot_for_key(table, &key, hash)? {
                let value_atomic = self.value_word_atomic(table.off, idx)?;
                let current = value_atomic.load(Ordering::Acquire);
                if state_clear(current) != expected {
                    return Ok(HashRet::stop(state_clear(current)));
                }
                let key_atomic = self.key_word_atomic(table.off, idx)?;
                let key_word = key_atomic.load(Ordering::Acquire);
                let tombed = state_trans(key_word, BucketState::Tomb);
                if key_atomic.compare_exchange(key_word, tombed, Ordering::AcqRel, Ordering::Acquire).is_err() {
                    return Ok(HashRet::stop(expected));
                }
                let stored_key_off = state_clear(key_word);
                let stored_key_len = self.key_len_atomic(table.off, idx)?.load(Ordering::Acquire) as usize;
                value_atomic.store(state_trans(current, BucketState::Tomb), Ordering::Release);
                self.bump_len(-1)?;
                self.region.defer_free(stored_key_off, stored_key_len);
                return Ok(HashRet::ok(expected));
            }
        }
        Ok(HashRet::not_found())
    }

    /// Call `f(key_off, value_off)` for every live entry across every table
    /// generation. No snapshot isolation: entries inserted or removed
    /// during the walk may or may not be observed.
    pub fn iterate(&self, mut f: impl FnMut(Off, Off)) -> Result<()> {
        let _guard = EnterGuard::new(self.region);
        let chain = self.chain()?;
        for table in &chain {
            for idx in 0..table.capacity {
                let key_word = self.key_word_atomic(table.off, idx)?.load(Ordering::Acquire);
                if matches!(BucketState::from_word(key_word), BucketState::Set | BucketState::Move) {
                    let value_word = self.value_word_atomic(table.off, idx)?.load(Ordering::Acquire);
                    f(state_clear(key_word), state_clear(value_word));
                }
            }
        }
        Ok(())
    }

    /// Publish a table with double the newest table's capacity, migrate
    /// every live bucket into it, then free the old table. Runs under a
    /// region world-stop: the structural swap (meta + header links) is
    /// never visible half-done to a concurrent `get`/`put`/`del`, since
    /// those all bracket their chain read with an epoch reservation that
    /// the world-stop waits to drain before this starts.
    fn grow_and_migrate(&self) -> Result<()> {
        let _lock = self.grow_lock.lock().unwrap();
        self.region.world_stop();
        let result = self.grow_and_migrate_locked();
        self.region.world_resume();
        result
    }

    fn grow_and_migrate_locked(&self) -> Result<()> {
        let meta = self.read_meta()?;
        let old_off = meta.newest_table_offset;
        let old_header = self.read_header(old_off)?;
        let new_capacity = old_header.capacity as usize * 2;
        let new_off = Self::alloc_table_storage(self.region, new_capacity)?;

        for idx in 0..old_header.capacity as usize {
            let key_word = self.key_word_atomic(old_off, idx)?.load(Ordering::Relaxed);
            if BucketState::from_word(key_word) != BucketState::Set {
                continue;
            }
            let value_word = self.value_word_atomic(old_off, idx)?.load(Ordering::Relaxed);
            let key_len = self.key_len_atomic(old_off, idx)?.load(Ordering::Relaxed) as usize;
            let key_off = state_clear(key_word);
            let key_bytes = self.region.read(key_off, key_len)?;
            let hash = hash_key(&key_bytes);
            self.insert_fresh(new_off, new_capacity, key_off, key_len, hash, state_clear(value_word))?;
        }

        self.region.free(old_off, HEADER_SIZE + old_header.capacity as usize * BUCKET_SIZE);

        let new_meta = HashMeta {
            size_estimate: meta.size_estimate,
            oldest_table_offset: new_off,
            newest_table_offset: new_off,
            _pad: 0,
        };
        self.write_meta(&new_meta)?;
        Ok(())
    }

    /// Place an already-known live bucket into `table_off` during
    /// migration. No CAS needed: `grow_and_migrate` runs world-stopped, and
    /// `new_capacity` is always double the source, so a linear scan always
    /// finds room.
    fn insert_fresh(
        &self,
        table_off: Off,
        capacity: usize,
        key_off: Off,
        key_len: usize,
        hash: u64,
        value: Off,
    ) -> Result<()> {
        let start = (hash as usize) % capacity;
        for i in 0..capacity {
            let idx = (start + i) % capacity;
            let key_atomic = self.key_word_atomic(table_off, idx)?;
            if BucketState::from_word(key_atomic.load(Ordering::Relaxed)) == BucketState::Nil {
                self.key_len_atomic(table_off, idx)?.store(key_len as u64, Ordering::Relaxed);
                self.value_word_atomic(table_off, idx)?
                    .store(state_word(value, BucketState::Set), Ordering::Relaxed);
                key_atomic.store(state_word(key_off, BucketState::Set), Ordering::Relaxed);
                return Ok(());
            }
        }
        Err(RegionError::Corruption("hash migration target table ran out of room"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionOptions;

    fn store_key(region: &Region, bytes: &[u8]) -> Off {
        let off = region.alloc(bytes.len()).unwrap();
        region.write(off, bytes).unwrap();
        off
    }

    #[test]
    fn put_get_roundtrip() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let table = HashTable::new(&region, 16).unwrap();

        let key = store_key(&region, b"hello");
        let ret = table.put(key, 5, 42).unwrap();
        assert_eq!(ret.code, HashCode::NotFound);

        let got = table.get(key, 5).unwrap();
        assert_eq!(got.code, HashCode::Ok);
        assert_eq!(got.prev_value, 42);
    }

    #[test]
    fn put_overwrite_returns_previous() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let table = HashTable::new(&region, 16).unwrap();
        let key = store_key(&region, b"k");

        table.put(key, 1, 1).unwrap();
        let ret = table.put(key, 1, 2).unwrap();
        assert_eq!(ret.code, HashCode::Ok);
        assert_eq!(ret.prev_value, 1);
    }

    #[test]
    fn del_then_get_not_found_and_key_blob_deferred() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let table = HashTable::new(&region, 16).unwrap();
        let key = store_key(&region, b"gone");

        table.put(key, 4, 7).unwrap();
        let del_ret = table.del(key, 4).unwrap();
        assert_eq!(del_ret.code, HashCode::Ok);
        assert_eq!(del_ret.prev_value, 7);

        let get_ret = table.get(key, 4).unwrap();
        assert_eq!(get_ret.code, HashCode::NotFound);

        // The tombstoned key blob was deferred, not leaked: a few gc_tick
        // passes reap it.
        for _ in 0..4 {
            region.gc_tick();
        }
    }

    #[test]
    fn cmp_xchg_rejects_mismatch() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let table = HashTable::new(&region, 16).unwrap();
        let key = store_key(&region, b"cas");

        table.put(key, 3, 5).unwrap();
        let stopped = table.cmp_xchg(key, 3, 999, 6).unwrap();
        assert_eq!(stopped.code, HashCode::Stop);

        let ok = table.cmp_xchg(key, 3, 5, 6).unwrap();
        assert_eq!(ok.code, HashCode::Ok);
        assert_eq!(ok.prev_value, 5);
    }

    #[test]
    fn cmp_del_rejects_mismatch_then_succeeds() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let table = HashTable::new(&region, 16).unwrap();
        let key = store_key(&region, b"cd");

        table.put(key, 2, 10).unwrap();
        let stopped = table.cmp_del(key, 2, 999).unwrap();
        assert_eq!(stopped.code, HashCode::Stop);

        let ok = table.cmp_del(key, 2, 10).unwrap();
        assert_eq!(ok.code, HashCode::Ok);
        assert_eq!(table.get(key, 2).unwrap().code, HashCode::NotFound);
    }

    #[test]
    fn iterate_visits_live_entries() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let table = HashTable::new(&region, 16).unwrap();

        let k1 = store_key(&region, b"a");
        let k2 = store_key(&region, b"b");
        table.put(k1, 1, 100).unwrap();
        table.put(k2, 1, 200).unwrap();

        let mut seen = Vec::new();
        table.iterate(|_k, v| seen.push(v)).unwrap();
        seen.sort();
        assert_eq!(seen, vec![100, 200]);
    }

    #[test]
    fn resize_grows_capacity_without_losing_entries() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let table = HashTable::new(&region, 16).unwrap();

        let keys: Vec<Off> = (0..20u32).map(|i| store_key(&region, &i.to_le_bytes())).collect();
        for (i, &k) in keys.iter().enumerate() {
            table.put(k, 4, i as u64).unwrap();
        }

        assert!(table.cap().unwrap() > 16);
        for (i, &k) in keys.iter().enumerate() {
            let ret = table.get(k, 4).unwrap();
            assert_eq!(ret.code, HashCode::Ok);
            assert_eq!(ret.prev_value, i as u64);
        }
    }

    /// A large number of inserts forces several resizes; every key must
    /// remain retrievable with its correct value afterward, and none of the
    /// resizes may leave a key duplicated or resurrected.
    #[test]
    fn large_scale_resize_preserves_every_key() {
        let region = Region::open_anon(&RegionOptions::new()).unwrap();
        let table = HashTable::new(&region, 16).unwrap();

        const N: u32 = 257;
        let keys: Vec<(Off, u32)> =
            (0..N).map(|i| (store_key(&region, &i.to_le_bytes()), i)).collect();

        for &(k, i) in &keys {
            let ret = table.put(k, 4, i as u64).unwrap();
            assert_eq!(ret.code, HashCode::NotFound);
        }

        for &(k, i) in &keys {
            let ret = table.get(k, 4).unwrap();
            assert_eq!(ret.code, HashCode::Ok, "key {i} missing after resize");
            assert_eq!(ret.prev_value, i as u64);
        }

        // Delete every even key; odd keys must survive untouched and none
        // of the deleted keys should resurrect from a stale table.
        for &(k, i) in &keys {
            if i % 2 == 0 {
                let ret = table.del(k, 4).unwrap();
                assert_eq!(ret.code, HashCode::Ok);
            }
        }
        for &(k, i) in &keys {
            let ret = table.get(k, 4).unwrap();
            if i % 2 == 0 {
                assert_eq!(ret.code, HashCode::NotFound, "key {i} resurrected");
            } else {
                assert_eq!(ret.code, HashCode::Ok);
                assert_eq!(ret.prev_value, i as u64);
            }
        }
    }

    #[test]
    fn concurrent_put_get_del_from_multiple_threads() {
        // Leaked so the spawned threads can borrow region/table with a
        // 'static lifetime without unsafe.
        let region: &'static Region = Box::leak(Box::new(Region::open_anon(&RegionOptions::new()).unwrap()));
        let table: &'static HashTable<'static> =
            Box::leak(Box::new(HashTable::new(region, 16).unwrap()));

        let mut handles = Vec::new();
        for t in 0..4u32 {
            handles.push(std::thread::spawn(move || {
                for i in 0..32u32 {
                    let bytes = (t * 1000 + i).to_le_bytes();
                    let off = region.alloc(bytes.len()).unwrap();
                    region.write(off, &bytes).unwrap();
                    table.put(off, 4, (t * 1000 + i) as u64).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for t in 0..4u32 {
            for i in 0..32u32 {
                let bytes = (t * 1000 + i).to_le_bytes();
                let key_off = region.alloc(bytes.len()).unwrap();
                region.write(key_off, &bytes).unwrap();
                let ret = table.get(key_off, 4).unwrap();
                assert_eq!(ret.code, HashCode::Ok);
                assert_eq!(ret.prev_value, (t * 1000 + i) as u64);
            }
        }
    }
}
