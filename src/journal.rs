//! Crash-atomic persistence (spec §4.4).
//!
//! Dirty pages are tracked at cache-line granularity in a bitmap. `save()`
//! swaps the live mark set out from under the mutators during a world-stop,
//! forks a child to write a journal file of the dirty ranges with two
//! `fsync`s bracketing a magic trailer, then has the parent apply the
//! journal back into the mapping and unlink it. If the process dies between
//! those two fsyncs, the trailer is either absent (safe: nothing was
//! applied, file gets deleted on next open) or present (safe: replay it).

use std::fs::{File, OpenOptions};
use std::io::{Read as IoRead, Seek, SeekFrom, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};

use crate::error::{RegionError, Result};
use crate::offset::Off;

/// Bytes covered by one dirty-bitmap bit. Matches the original's cache-line
/// granularity so a single-word write doesn't force a whole page dirty.
const MARK_GRANULARITY: usize = 64;

/// Trailing magic that marks a fully-written, safe-to-replay journal file.
const JOURNAL_MAGIC: u64 = 0xB0E9_C403_2E41_4824;

/// One dirty-range record as written to the journal file: offset, length,
/// then `len` bytes of payload.
struct Record {
    off: Off,
    len: u64,
}

/// Tracks which cache lines of the region have been written since the last
/// `save()`. Two generations (`live`, `draining`) so writers marking dirty
/// bits never block on the writer reading out the previous generation.
pub(crate) struct DirtyMarks {
    bits: Vec<AtomicU64>,
}

impl DirtyMarks {
    pub fn new(region_len: usize) -> Self {
        let words = region_len.div_ceil(MARK_GRANULARITY).div_ceil(64).max(1);
        Self { bits: (0..words).map(|_| AtomicU64::new(0)).collect() }
    }

    /// Mark the cache line(s) covering `[off, off+len)` dirty. Called by
    /// every mutator after writing into the mapping. Relaxed: marks only
    /// need to be visible by the time `save()`'s world-stop runs, and that
    /// already provides the necessary synchronization.
    pub fn mark(&self, off: Off, len: usize) {
        if len == 0 {
            return;
        }
        let first_line = off as usize / MARK_GRANULARITY;
        let last_line = (off as usize + len - 1) / MARK_GRANULARITY;
        for line in first_line..=last_line {
            let word = line / 64;
            let bit = line % 64;
            if word < self.bits.len() {
                self.bits[word].fetch_or(1 << bit, Ordering::Relaxed);
            }
        }
    }

    /// Grow the bitmap to cover a larger region after `Mapping::grow`.
    pub fn grow(&mut self, new_region_len: usize) {
        let words = new_region_len.div_ceil(MARK_GRANULARITY).div_ceil(64).max(1);
        while self.bits.len() < words {
            self.bits.push(AtomicU64::new(0));
        }
    }

    /// Swap out the live bitmap for a fresh, all-zero one, returning the
    /// dirty-line numbers that need to be flushed to the journal. Must be
    /// called under a world-stop: no mutator may be mid-write.
    fn drain(&self) -> Vec<usize> {
        let mut lines = Vec::new();
        for (word_idx, word) in self.bits.iter().enumerate() {
            let bits = word.swap(0, Ordering::AcqRel);
            if bits == 0 {
                continue;
            }
            for bit in 0..64 {
                if bits & (1 << bit) != 0 {
                    lines.push(word_idx * 64 + bit);
                }
            }
        }
        lines
    }
}

/// Coalesce adjacent dirty cache lines into fewer, larger records so the
/// journal doesn't pay a per-record header for every 64-byte line.
fn coalesce_lines(lines: &[usize]) -> Vec<(Off, u64)> {
    let mut ranges = Vec::new();
    let mut iter = lines.iter().copied();
    let Some(first) = iter.next() else { return ranges };
    let mut start = first;
    let mut end = first;
    for line in iter {
        if line == end + 1 {
            end = line;
        } else {
            ranges.push((
                (start * MARK_GRANULARITY) as Off,
                ((end - start + 1) * MARK_GRANULARITY) as u64,
            ));
            start = line;
            end = line;
        }
    }
    ranges.push(((start * MARK_GRANULARITY) as Off, ((end - start + 1) * MARK_GRANULARITY) as u64));
    ranges
}

/// Handles journal-file creation, writing, fsync sequencing, and the
/// recovery check on open. One per region.
pub(crate) struct Journal {
    path: PathBuf,
    /// Serializes concurrent `save()` callers; only one journal write may be
    /// in flight at a time.
    save_lock: Mutex<()>,
}

impl Journal {
    pub fn new(region_path: &Path) -> Self {
        let mut path = region_path.as_os_str().to_owned();
        path.push(".journal");
        Self { path: PathBuf::from(path), save_lock: Mutex::new(()) }
    }

    /// Check for a leftover journal from a prior crash. If it ends with the
    /// magic trailer, the write it records completed but wasn't applied
    /// (process died between the child's second fsync and the parent
    /// applying it) — replay it. Otherwise it's a partial write; delete it.
    pub fn recover(&self, apply: impl FnMut(Off, &[u8]) -> Result<()>) -> Result<bool> {
        let mut apply = apply;
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(RegionError::Journal(e)),
        };

        let len = file.metadata().map_err(RegionError::Journal)?.len();
        if len < 8 {
            drop(file);
            std::fs::remove_file(&self.path).map_err(RegionError::Journal)?;
            return Ok(false);
        }

        file.seek(SeekFrom::End(-8)).map_err(RegionError::Journal)?;
        let trailer = file.read_u64::<LittleEndian>().map_err(RegionError::Journal)?;
        if trailer != JOURNAL_MAGIC {
            drop(file);
            std::fs::remove_file(&self.path).map_err(RegionError::Journal)?;
            return Ok(false);
        }

        file.seek(SeekFrom::Start(0)).map_err(RegionError::Journal)?;
        let body_len = len - 8;
        let mut read = 0u64;
        let mut saw_sentinel = false;
        while read < body_len {
            let off = file.read_u64::<LittleEndian>().map_err(RegionError::Journal)?;
            let rec_len = file.read_u64::<LittleEndian>().map_err(RegionError::Journal)?;
            read += 16;
            if off == 0 && rec_len == 0 {
                // Sentinel record marking the end of the data records, written
                // right before the magic trailer by `write_journal_body`.
                saw_sentinel = true;
                break;
            }
            let mut buf = vec![0u8; rec_len as usize];
            file.read_exact(&mut buf).map_err(RegionError::Journal)?;
            apply(off, &buf)?;
            read += rec_len;
        }

        if !saw_sentinel {
            drop(file);
            std::fs::remove_file(&self.path).map_err(RegionError::Journal)?;
            return Err(RegionError::Corruption("journal missing end-of-records sentinel"));
        }

        drop(file);
        std::fs::remove_file(&self.path).map_err(RegionError::Journal)?;
        Ok(true)
    }

    /// Persist the dirty lines tracked by `marks` into the backing file
    /// reachable through `read_range`. Must be called with the world
    /// stopped for the `drain()` step; `read_range`/writing the journal
    /// happen after world-resume since the journal only needs a consistent
    /// snapshot of the bytes, not exclusion from further writes (a write
    /// landing after drain just gets caught by the next save instead).
    pub fn save(
        &self,
        marks: &DirtyMarks,
        mut read_range: impl FnMut(Off, usize) -> Result<Vec<u8>>,
        mut apply_range: impl FnMut(Off, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let _guard = self.save_lock.lock().unwrap();

        let lines = marks.drain();
        if lines.is_empty() {
            return Ok(());
        }
        let ranges = coalesce_lines(&lines);

        let mut records = Vec::with_capacity(ranges.len());
        for (off, len) in &ranges {
            records.push((*off, read_range(*off, *len as usize)?));
        }

        self.write_journal_forked(&records)?;

        for (off, buf) in &records {
            apply_range(*off, buf)?;
        }

        std::fs::remove_file(&self.path).map_err(RegionError::Journal)?;
        Ok(())
    }

    /// Write the journal file in a forked child so a crash mid-write leaves
    /// the parent's in-memory state untouched, matching the original's
    /// fork-based `persist_save` sequencing.
    fn write_journal_forked(&self, records: &[(Off, Vec<u8>)]) -> Result<()> {
        // SAFETY: the child only performs async-signal-safe file I/O and
        // calls `_exit` via process::exit, never touching Rust runtime
        // state shared with the parent (allocator arenas, mutexes) beyond
        // what's already consistent at fork time for a simple linear write.
        match unsafe { fork() }.map_err(|e| RegionError::Journal(std::io::Error::from(e)))? {
            ForkResult::Child => {
                let result = Self::write_journal_body(&self.path, records);
                std::process::exit(if result.is_ok() { 0 } else { 1 });
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None)
                    .map_err(|e| RegionError::Journal(std::io::Error::from(e)))?;
                use nix::sys::wait::WaitStatus;
                match status {
                    WaitStatus::Exited(_, 0) => Ok(()),
                    _ => Err(RegionError::Corruption("journal writer child failed")),
                }
            }
        }
    }

    fn write_journal_body(path: &Path, records: &[(Off, Vec<u8>)]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        for (off, buf) in records {
            let rec = Record { off: *off, len: buf.len() as u64 };
            file.write_u64::<LittleEndian>(rec.off)?;
            file.write_u64::<LittleEndian>(rec.len)?;
            file.write_all(buf)?;
        }
        // Sentinel record marking the end of the data records, so a reader
        // doesn't have to trust a byte-count derived purely from the file's
        // total length to know where records stop and the trailer begins.
        file.write_u64::<LittleEndian>(0)?;
        file.write_u64::<LittleEndian>(0)?;
        file.sync_all()?;

        file.write_u64::<LittleEndian>(JOURNAL_MAGIC)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_merges_adjacent_lines() {
        let lines = vec![0, 1, 2, 5, 6, 10];
        let ranges = coalesce_lines(&lines);
        assert_eq!(
            ranges,
            vec![
                (0, 3 * MARK_GRANULARITY as u64),
                (5 * MARK_GRANULARITY as u64, 2 * MARK_GRANULARITY as u64),
                (10 * MARK_GRANULARITY as u64, MARK_GRANULARITY as u64),
            ]
        );
    }

    #[test]
    fn marks_drain_clears_bits() {
        let marks = DirtyMarks::new(4096);
        marks.mark(128, 8);
        marks.mark(4000, 8);
        let lines = marks.drain();
        assert!(!lines.is_empty());
        assert!(marks.drain().is_empty());
    }

    #[test]
    fn recover_no_file_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(&dir.path().join("region.db"));
        let replayed = journal.recover(|_, _| Ok(())).unwrap();
        assert!(!replayed);
    }

    #[test]
    fn recover_replays_records_up_to_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let region_path = dir.path().join("region.db");
        let journal = Journal::new(&region_path);

        let records = vec![(0u64, vec![1u8, 2, 3, 4]), (64u64, vec![5u8, 6])];
        Journal::write_journal_body(&journal.path, &records).unwrap();

        let mut applied = Vec::new();
        let replayed = journal
            .recover(|off, buf| {
                applied.push((off, buf.to_vec()));
                Ok(())
            })
            .unwrap();
        assert!(replayed);
        assert_eq!(applied, records);
        assert!(!journal.path.exists());
    }

    #[test]
    fn recover_rejects_journal_missing_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let region_path = dir.path().join("region.db");
        let journal = Journal::new(&region_path);

        // Hand-write a journal with a data record, a magic trailer, but no
        // sentinel in between, as if a corrupted writer skipped it.
        let mut file = OpenOptions::new().write(true).create_new(true).open(&journal.path).unwrap();
        file.write_u64::<LittleEndian>(0).unwrap();
        file.write_u64::<LittleEndian>(4).unwrap();
        file.write_all(&[9u8, 9, 9, 9]).unwrap();
        file.write_u64::<LittleEndian>(JOURNAL_MAGIC).unwrap();
        drop(file);

        let result = journal.recover(|_, _| Ok(()));
        assert!(matches!(result, Err(RegionError::Corruption(_))));
    }
}
