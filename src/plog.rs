//! The circular persistent log: a fixed-size byte ring appended to at the
//! tail and trimmed from either end, backed by a memory-mapped file
//! standing in for a pmem-backed region (spec.md §4.1).
//!
//! Entries are stored as two separate appends per logical Raft entry — a
//! fixed-size header, then the payload — so that [`CircularLog::poll_head`]
//! and [`CircularLog::pop_tail`] are always called in pairs by the caller
//! (see [`crate::bridge`]). The ring itself only knows about raw byte
//! records; it does not interpret `LogEntry` at all.

use std::convert::TryInto;
use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::LogFull;
use crate::NodeId;
use crate::Term;

/// Size, in bytes, of the root region at the front of the mapping holding
/// `current_term`/`voted_for`/`head_offset`/`tail_offset` — the persisted
/// Raft state layout from spec.md §6 (`Root: {term, voted_for, log: ptr}`),
/// with the ring itself standing in for the `log` pointer. Kept well clear
/// of cacheline contention with the ring data that follows it.
const ROOT_SIZE: usize = 64;

struct RingState {
    current_term: Term,
    voted_for: Option<NodeId>,
    /// Offset of the oldest unpolled byte, monotonically increasing
    /// (logical, not wrapped) so that `tail - head` is always the live
    /// byte count regardless of how many times the ring has wrapped.
    head: u64,
    /// Offset one past the newest appended byte, monotonically increasing.
    tail: u64,
}

/// A fixed-capacity ring of persisted bytes with FIFO head/tail trimming.
///
/// All mutating operations acquire an internal lock for their duration and
/// flush the root region before returning — this is Cyclone's stand-in for
/// a pmem transaction (spec.md §5: "persistent-memory transactions are
/// synchronous and block until durable").
pub struct CircularLog {
    mmap: Mutex<MmapMut>,
    state: Mutex<RingState>,
    capacity: usize,
}

impl CircularLog {
    /// Opens `path`, creating it sized `capacity + ROOT_SIZE` bytes if it
    /// does not exist. Reopening an existing file restores `head`/`tail`
    /// from the root region; `capacity` must match the file's original
    /// size or this returns an error.
    pub fn open(path: &Path, capacity: usize) -> std::io::Result<Self> {
        let existed = path.exists();
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let file_len = (ROOT_SIZE + capacity) as u64;
        if !existed {
            file.set_len(file_len)?;
        } else {
            let actual = file.metadata()?.len();
            if actual != file_len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("pmem log {} is {} bytes, expected {}", path.display(), actual, file_len),
                ));
            }
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let state = if existed {
            Self::read_state(&mmap)
        } else {
            let state = RingState {
                current_term: 0,
                voted_for: None,
                head: 0,
                tail: 0,
            };
            Self::write_state(&mut mmap, &state);
            mmap.flush_range(0, ROOT_SIZE)?;
            state
        };
        Ok(CircularLog {
            mmap: Mutex::new(mmap),
            state: Mutex::new(state),
            capacity,
        })
    }

    /// Bytes currently live in the ring.
    pub fn len(&self) -> u64 {
        let s = self.state.lock();
        s.tail - s.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current tail offset — the position the next `append` will start
    /// writing at (spec.md §4.1 `offset()`).
    pub fn offset(&self) -> u64 {
        self.state.lock().tail
    }

    fn ring_index(&self, logical: u64) -> usize {
        (logical % self.capacity as u64) as usize
    }

    /// Reserves `bytes.len()` space at the tail, writes it, and advances the
    /// tail. Returns the (pre-wrap) logical offset the record starts at.
    pub fn append(&self, bytes: &[u8]) -> Result<u64, LogFull> {
        let mut state = self.state.lock();
        let free = self.capacity as u64 - (state.tail - state.head);
        if (bytes.len() as u64) > free {
            return Err(LogFull {
                requested: bytes.len(),
                free: free as usize,
            });
        }
        let start = state.tail;
        let mut mmap = self.mmap.lock();
        self.write_ring(&mut mmap, start, bytes);
        state.tail += bytes.len() as u64;
        self.persist_state(&mut mmap, &state);
        Ok(start)
    }

    fn write_ring(&self, mmap: &mut MmapMut, start: u64, bytes: &[u8]) {
        let mut idx = self.ring_index(start);
        for &b in bytes {
            mmap[ROOT_SIZE + idx] = b;
            idx += 1;
            if idx == self.capacity {
                idx = 0;
            }
        }
    }

    fn read_state(mmap: &MmapMut) -> RingState {
        let current_term = u64::from_le_bytes(mmap[0..8].try_into().unwrap());
        let voted_for = match mmap[8] {
            0 => None,
            _ => Some(u32::from_le_bytes(mmap[9..13].try_into().unwrap())),
        };
        let head = u64::from_le_bytes(mmap[16..24].try_into().unwrap());
        let tail = u64::from_le_bytes(mmap[24..32].try_into().unwrap());
        RingState {
            current_term,
            voted_for,
            head,
            tail,
        }
    }

    fn write_state(mmap: &mut MmapMut, state: &RingState) {
        mmap[0..8].copy_from_slice(&state.current_term.to_le_bytes());
        match state.voted_for {
            None => mmap[8] = 0,
            Some(id) => {
                mmap[8] = 1;
                mmap[9..13].copy_from_slice(&id.to_le_bytes());
            }
        }
        mmap[16..24].copy_from_slice(&state.head.to_le_bytes());
        mmap[24..32].copy_from_slice(&state.tail.to_le_bytes());
    }

    fn persist_state(&self, mmap: &mut MmapMut, state: &RingState) {
        Self::write_state(mmap, state);
        let _ = mmap.flush_range(0, ROOT_SIZE);
    }

    /// Reads the durable `current_term`.
    pub fn current_term(&self) -> Term {
        self.state.lock().current_term
    }

    /// Reads the durable `voted_for`.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.state.lock().voted_for
    }

    /// Transactionally updates `current_term`, flushing before returning
    /// (spec.md §3: "current_term and voted_for are flushed before any
    /// vote is sent or granted").
    pub fn persist_term(&self, term: Term) {
        let mut state = self.state.lock();
        state.current_term = term;
        let mut mmap = self.mmap.lock();
        self.persist_state(&mut mmap, &state);
    }

    /// Transactionally updates `voted_for`, flushing before returning.
    pub fn persist_vote(&self, voted_for: Option<NodeId>) {
        let mut state = self.state.lock();
        state.voted_for = voted_for;
        let mut mmap = self.mmap.lock();
        self.persist_state(&mut mmap, &state);
    }

    /// Copies `dst_len` bytes starting at logical `offset`, handling
    /// wrap-around transparently. Panics (a logic error, not a runtime
    /// condition) if the requested range has already been polled/popped.
    pub fn read(&self, offset: u64, dst_len: usize) -> Vec<u8> {
        let state = self.state.lock();
        assert!(
            offset >= state.head && offset + dst_len as u64 <= state.tail,
            "read [{}, {}) out of live range [{}, {})",
            offset,
            offset + dst_len as u64,
            state.head,
            state.tail
        );
        let mmap = self.mmap.lock();
        let mut out = Vec::with_capacity(dst_len);
        let mut idx = self.ring_index(offset);
        for _ in 0..dst_len {
            out.push(mmap[ROOT_SIZE + idx]);
            idx += 1;
            if idx == self.capacity {
                idx = 0;
            }
        }
        out
    }

    /// Advances a logical offset past a record of `len` bytes.
    pub fn skip(&self, offset: u64, len: usize) -> u64 {
        offset + len as u64
    }

    /// Removes the oldest `len` bytes (the head-most record). The caller is
    /// responsible for invoking this once per header and once per payload,
    /// within the same host-level transaction, so that a partial removal
    /// never becomes visible (spec.md §4.1).
    pub fn poll_head(&self, len: usize) {
        let mut state = self.state.lock();
        assert!(state.head + len as u64 <= state.tail, "poll_head past tail");
        state.head += len as u64;
        let mut mmap = self.mmap.lock();
        self.persist_state(&mut mmap, &state);
    }

    /// Removes the newest `len` bytes (the tail-most, necessarily
    /// uncommitted record) — used to roll back a conflicting entry.
    pub fn pop_tail(&self, len: usize) {
        let mut state = self.state.lock();
        assert!(state.tail >= state.head + len as u64, "pop_tail past head");
        state.tail -= len as u64;
        let mut mmap = self.mmap.lock();
        self.persist_state(&mut mmap, &state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &Path, cap: usize) -> CircularLog {
        CircularLog::open(&dir.join("plog.bin"), cap).unwrap()
    }

    #[test]
    fn round_trips_a_simple_append() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), 128);
        let off = log.append(b"hello").unwrap();
        assert_eq!(log.read(off, 5), b"hello");
    }

    #[test]
    fn wraps_around_the_ring() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), 16);
        log.append(&[1u8; 10]).unwrap();
        log.poll_head(10);
        let off = log.append(&[2u8; 12]).unwrap();
        assert_eq!(log.read(off, 12), vec![2u8; 12]);
    }

    #[test]
    fn append_fails_when_full() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), 8);
        log.append(&[0u8; 8]).unwrap();
        let err = log.append(&[0u8; 1]).unwrap_err();
        assert_eq!(err.requested, 1);
        assert_eq!(err.free, 0);
    }

    #[test]
    fn pop_tail_rolls_back_an_uncommitted_append() {
        let dir = tempdir().unwrap();
        let log = open(dir.path(), 32);
        log.append(b"committed").unwrap();
        let before = log.offset();
        log.append(b"tentative").unwrap();
        log.pop_tail(9);
        assert_eq!(log.offset(), before);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plog.bin");
        {
            let log = CircularLog::open(&path, 64).unwrap();
            log.append(b"persisted").unwrap();
        }
        let log = CircularLog::open(&path, 64).unwrap();
        assert_eq!(log.offset(), 9);
        assert_eq!(log.read(0, 9), b"persisted");
    }
}
