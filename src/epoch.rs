//! Epoch-based reclamation (spec §4.3): readers announce a reservation
//! before touching the region and clear it after, a background collector
//! advances the global epoch once every announced reservation has moved
//! past it, and only then reaps deferred frees left over from two epochs
//! back. A world-stop (used by [`crate::journal`] saves and mapping
//! coalesces) waits out every outstanding reservation before proceeding.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::offset::Off;

/// Epoch has three generations: current, and the two trailing ones whose
/// deferred frees might still be observed by a reader that entered before
/// the last advance.
const NUM_GENERATIONS: usize = 3;

/// One thread's reservation slot. `repr(C, align(64))` rather than
/// `crossbeam_utils::CachePadded` so the exact same type can be reinterpreted
/// directly out of mapped region bytes for the shared variant: a `Vec<Slot>`
/// (private) and a raw `*mut Slot` into the mapping (shared) are both just a
/// slice of this type, matching spec.md §3's "occupying its own cache line".
#[repr(C, align(64))]
pub(crate) struct Slot {
    /// `u64::MAX` means "not reserved" (thread outside a critical section);
    /// otherwise the epoch the thread entered at.
    epoch: AtomicU64,
}

pub(crate) const SLOT_SIZE: usize = std::mem::size_of::<Slot>();

const NOT_RESERVED: u64 = u64::MAX;

impl Slot {
    fn new() -> Self {
        Self { epoch: AtomicU64::new(NOT_RESERVED) }
    }
}

/// Backing storage for the reservation slot table: either a process-heap
/// `Vec` (private variant) or a raw pointer into the mapped region (shared
/// variant, set up by [`crate::region::Region`] at a fixed offset right after
/// the meta header).
enum SlotTable {
    Private(Vec<Slot>),
    Shared { ptr: *mut Slot, len: usize },
}

// SAFETY: `Shared`'s pointer addresses region memory that outlives the
// `Epoch` built from it (the mapping is never unmapped while the owning
// `Region` is alive), and every access goes through `Slot`'s own atomics.
unsafe impl Send for SlotTable {}
unsafe impl Sync for SlotTable {}

impl SlotTable {
    fn get(&self, idx: usize) -> &Slot {
        match self {
            SlotTable::Private(v) => &v[idx],
            SlotTable::Shared { ptr, len } => {
                debug_assert!(idx < *len);
                unsafe { &*ptr.add(idx) }
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            SlotTable::Private(v) => v.len(),
            SlotTable::Shared { len, .. } => *len,
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Slot> {
        (0..self.len()).map(move |i| self.get(i))
    }
}

/// A single deferred action, queued until every reader that could have
/// observed the retired state has exited: either an extent to hand back to
/// the allocator, or an arbitrary one-shot callback (`Region::defer`).
enum DeferredAction {
    Free { off: Off, len: usize },
    Callback(Box<dyn FnOnce() + Send>),
}

/// Epoch-based reclamation state, shared by every thread using one region.
/// Works identically whether the slot table lives in process heap (private
/// variant, [`Epoch::new_private`]) or inside the mapped region (shared
/// variant, [`Epoch::new_shared`]) — both are just a [`SlotTable`], so the
/// rest of this type doesn't need two code paths.
pub(crate) struct Epoch {
    slots: SlotTable,
    global: AtomicU64,
    generations: [Mutex<Vec<DeferredAction>>; NUM_GENERATIONS],
    stop_requested: AtomicBool,
    stop_cond: Condvar,
    stop_lock: Mutex<()>,
}

impl Epoch {
    /// Process-heap reservation table: not visible across a reopen from a
    /// different process, cheaper to set up.
    pub fn new_private(num_slots: usize) -> Self {
        Self::with_slots(SlotTable::Private((0..num_slots).map(|_| Slot::new()).collect()))
    }

    /// Reservation table resident inside the mapped region at `ptr`
    /// (`num_slots * SLOT_SIZE` bytes, already reserved by the caller).
    /// Caller must have already initialized those bytes via
    /// [`Epoch::init_shared_slots`], on first creation and on every reopen.
    ///
    /// # Safety
    ///
    /// `ptr` must point at `num_slots * SLOT_SIZE` bytes of region memory
    /// that outlive this `Epoch` and that nothing else concurrently
    /// reinterprets as anything but a `[Slot; num_slots]`.
    pub unsafe fn new_shared(ptr: *mut u8, num_slots: usize) -> Self {
        Self::with_slots(SlotTable::Shared { ptr: ptr as *mut Slot, len: num_slots })
    }

    /// Stamp `NOT_RESERVED` into `num_slots` slots starting at `ptr`. Called
    /// once when a shared region is first created, and again on every reopen
    /// — a crashed writer could have left a slot parked at a stale epoch,
    /// which would otherwise wedge `try_advance` forever.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Epoch::new_shared`].
    pub unsafe fn init_shared_slots(ptr: *mut u8, num_slots: usize) {
        for i in 0..num_slots {
            let slot = &*(ptr as *mut Slot).add(i);
            slot.epoch.store(NOT_RESERVED, Ordering::Release);
        }
    }

    fn with_slots(slots: SlotTable) -> Self {
        Self {
            slots,
            global: AtomicU64::new(0),
            generations: std::array::from_fn(|_| Mutex::new(Vec::new())),
            stop_requested: AtomicBool::new(false),
            stop_cond: Condvar::new(),
            stop_lock: Mutex::new(()),
        }
    }

    /// Reserve a slot for the calling thread at the current global epoch.
    /// Loops if a world-stop is in progress or just starting, matching the
    /// original's "enter re-checks world_lock and restarts" protocol so a
    /// stopper can never race a straggling enter.
    pub fn enter(&self, slot_idx: usize) -> u64 {
        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                let guard = self.stop_lock.lock().unwrap();
                let _unused = self
                    .stop_cond
                    .wait_while(guard, |_| self.stop_requested.load(Ordering::Acquire));
                continue;
            }

            let epoch = self.global.load(Ordering::Acquire);
            self.slots.get(slot_idx).epoch.store(epoch, Ordering::Release);
            // Publish the reservation before re-checking stop_requested, so
            // a stopper that observes "no stop" here is guaranteed to then
            // see our slot if it checks again (acquire/release pair).
            std::sync::atomic::fence(Ordering::SeqCst);

            if self.stop_requested.load(Ordering::Acquire) {
                self.slots.get(slot_idx).epoch.store(NOT_RESERVED, Ordering::Release);
                continue;
            }

            return epoch;
        }
    }

    /// Release the calling thread's reservation.
    pub fn exit(&self, slot_idx: usize) {
        self.slots.get(slot_idx).epoch.store(NOT_RESERVED, Ordering::Release);
    }

    /// Queue `off`/`len` to be freed once the epoch it was retired at has
    /// fully drained (i.e. once `generations` rotates past it twice more).
    pub fn defer(&self, off: Off, len: usize) {
        let epoch = self.global.load(Ordering::Acquire) as usize % NUM_GENERATIONS;
        self.generations[epoch].lock().unwrap().push(DeferredAction::Free { off, len });
    }

    /// Queue an arbitrary one-shot callback to run once the current epoch
    /// has fully drained. Backs [`crate::region::Region::defer`] for
    /// caller-supplied cleanup that isn't a plain extent free.
    pub fn defer_fn(&self, f: impl FnOnce() + Send + 'static) {
        let epoch = self.global.load(Ordering::Acquire) as usize % NUM_GENERATIONS;
        self.generations[epoch].lock().unwrap().push(DeferredAction::Callback(Box::new(f)));
    }

    /// Gather phase: find the minimum epoch any reserved slot is still at.
    fn min_reserved(&self) -> Option<u64> {
        self.slots
            .iter()
            .map(|s| s.epoch.load(Ordering::Acquire))
            .filter(|&e| e != NOT_RESERVED)
            .min()
    }

    /// Advance the global epoch if every reserved slot has caught up to it,
    /// then reap the generation that's now two full advances behind: plain
    /// frees are handed to `reap`, callbacks are invoked directly. Returns
    /// true if it advanced.
    pub fn try_advance(&self, mut reap: impl FnMut(Off, usize)) -> bool {
        let current = self.global.load(Ordering::Acquire);
        match self.min_reserved() {
            Some(min) if min < current => return false,
            _ => {}
        }

        if self
            .global
            .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let reap_gen = (current + 1 + 1) as usize % NUM_GENERATIONS;
        let mut bucket = self.generations[reap_gen].lock().unwrap();
        for action in bucket.drain(..) {
            match action {
                DeferredAction::Free { off, len } => reap(off, len),
                DeferredAction::Callback(f) => f(),
            }
        }
        true
    }

    /// Stop the world: block until every currently-reserved slot exits,
    /// and prevent new reservations from being taken until `resume`. Used
    /// by `save()` and mapping `coalesce()`, both of which need every
    /// outstanding pointer quiesced.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        loop {
            let all_clear = self.slots.iter().all(|s| s.epoch.load(Ordering::Acquire) == NOT_RESERVED);
            if all_clear {
                return;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    pub fn resume(&self) {
        self.stop_requested.store(false, Ordering::Release);
        let _guard = self.stop_lock.lock().unwrap();
        self.stop_cond.notify_all();
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_exit_roundtrip() {
        let epoch = Epoch::new_private(4);
        let e = epoch.enter(0);
        assert_eq!(e, 0);
        epoch.exit(0);
        assert_eq!(epoch.min_reserved(), None);
    }

    #[test]
    fn advance_reaps_trailing_generation() {
        let epoch = Epoch::new_private(1);
        epoch.defer(100, 16);
        let mut reaped = Vec::new();
        // No slots reserved, so every attempt should advance.
        for _ in 0..3 {
            epoch.try_advance(|off, len| reaped.push((off, len)));
        }
        assert!(reaped.contains(&(100, 16)));
    }

    #[test]
    fn defer_fn_runs_once_drained() {
        let epoch = Epoch::new_private(1);
        let ran = std::sync::Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        epoch.defer_fn(move || flag.store(true, Ordering::Release));
        for _ in 0..3 {
            epoch.try_advance(|_, _| {});
        }
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn stop_blocks_new_enters_until_resume() {
        let epoch = std::sync::Arc::new(Epoch::new_private(2));
        epoch.stop();
        assert_eq!(epoch.min_reserved(), None);
        epoch.resume();
        let e = epoch.enter(0);
        assert_eq!(e, epoch.global.load(Ordering::Acquire));
        epoch.exit(0);
    }

    #[test]
    fn shared_slots_survive_reinit() {
        let mut buf = vec![0u8; 4 * SLOT_SIZE];
        unsafe {
            Epoch::init_shared_slots(buf.as_mut_ptr(), 4);
            let epoch = Epoch::new_shared(buf.as_mut_ptr(), 4);
            let e = epoch.enter(1);
            assert_eq!(e, 0);
            epoch.exit(1);
        }
    }

    #[test]
    fn deferred_frees_reclaimed_after_concurrent_threads_exit() {
        let epoch = std::sync::Arc::new(Epoch::new_private(8));
        let mut handles = Vec::new();
        for slot in 0..8u64 {
            let epoch = epoch.clone();
            handles.push(std::thread::spawn(move || {
                epoch.enter(slot as usize);
                epoch.defer(1000 + slot, 8);
                epoch.exit(slot as usize);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let reaped = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        for _ in 0..3 {
            let reaped = reaped.clone();
            epoch.try_advance(move |off, len| reaped.lock().unwrap().push((off, len)));
        }
        let reaped = reaped.lock().unwrap();
        for slot in 0..8u64 {
            assert!(reaped.contains(&(1000 + slot, 8)));
        }
    }
}
