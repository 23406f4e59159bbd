//! Process-wide lock metadata: bytelock and ownership-record tables.
//!
//! Application addresses hash onto coarse buckets in two fixed tables,
//! allocated once on first transactional use. The bytelock table serves the
//! pessimistic reader-writer protocol; the orec table serves the optimistic
//! protocol. Table sizes are compile-time constants: the bytelock reader row
//! is `MAX_THREADS` wide, which is what bounds the number of concurrently
//! registered threads.
//!
//! All cross-thread communication in the runtime goes through these records,
//! so every field is an atomic with explicitly chosen orderings.

use std::sync::atomic::{fence, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

use tracing::info;

use weft_types::{ThreadSlot, Word, MAX_THREADS};

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

/// Number of bytelock buckets (power of two).
pub const BYTELOCK_TABLE_LEN: usize = 1 << 16;

/// Number of ownership-record buckets (power of two).
///
/// Deliberately small: the optimistic protocol trades a limited orec table
/// for freedom from any global timestamp.
pub const OREC_TABLE_LEN: usize = 1 << 10;

/// Bytes of address granularity folded into one bucket (one word).
const GRAIN_SHIFT: usize = 3;

/// Fibonacci hashing multiplier (64-bit golden ratio), for well-distributed
/// bucket indices from word-aligned addresses.
const FIB_MULT: u64 = 0x9E37_79B9_7F4A_7C15;

#[inline]
fn bucket_of(addr: *const Word, table_bits: u32) -> usize {
    let h = ((addr as u64) >> GRAIN_SHIFT).wrapping_mul(FIB_MULT);
    (h >> (64 - table_bits)) as usize
}

// ---------------------------------------------------------------------------
// ByteLock
// ---------------------------------------------------------------------------

/// A reader-writer bytelock: one owner word plus a per-thread byte array of
/// reader presence flags.
///
/// Invariants:
/// - `owner != 0` identifies the unique writer; `owner == 0` means free.
/// - After a writer finishes draining, `reader[i] == 0` for every other
///   thread, and the writer's own reader byte is clear.
/// - `version` strictly increases on each successful write acquisition.
/// - `reader_version[i] != 0` records the `version` thread `i` first read
///   under; 0 means "no version recorded".
#[repr(align(64))]
pub struct ByteLock {
    owner: AtomicU32,
    version: AtomicU32,
    reader: [AtomicU8; MAX_THREADS],
    reader_version: [AtomicU32; MAX_THREADS],
}

impl ByteLock {
    fn new() -> Self {
        Self {
            owner: AtomicU32::new(0),
            // Version 0 is reserved as the "no version recorded" sentinel in
            // reader_version slots, so counting starts at 1.
            version: AtomicU32::new(1),
            reader: std::array::from_fn(|_| AtomicU8::new(0)),
            reader_version: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Current writer slot id, 0 when free.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    /// Try to claim the writer slot: CAS `owner` 0 → `slot`.
    #[inline]
    #[must_use]
    pub fn try_acquire_writer(&self, slot: ThreadSlot) -> bool {
        self.owner
            .compare_exchange(0, slot.get(), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the writer slot.
    #[inline]
    pub fn release_writer(&self) {
        self.owner.store(0, Ordering::Release);
    }

    /// Publish this thread's reader byte, then fence so the subsequent
    /// `owner` load cannot be reordered before the store (x86 needs the
    /// explicit store-load barrier).
    #[inline]
    pub fn set_reader(&self, slot: ThreadSlot) {
        self.reader[slot.index()].store(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Clear this thread's reader byte.
    #[inline]
    pub fn clear_reader(&self, slot: ThreadSlot) {
        self.reader[slot.index()].store(0, Ordering::Release);
    }

    /// Reader byte of an arbitrary slot index (used by the writer drain).
    #[inline]
    #[must_use]
    pub fn reader_at(&self, index: usize) -> u8 {
        self.reader[index].load(Ordering::Acquire)
    }

    /// Current version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Bump the version after a successful write acquisition.
    #[inline]
    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    /// The version this thread first read under, 0 if none recorded.
    #[inline]
    #[must_use]
    pub fn reader_version(&self, slot: ThreadSlot) -> u32 {
        self.reader_version[slot.index()].load(Ordering::Acquire)
    }

    /// Record the version this thread first read under.
    #[inline]
    pub fn set_reader_version(&self, slot: ThreadSlot, version: u32) {
        self.reader_version[slot.index()].store(version, Ordering::Release);
    }

    /// Clear this thread's recorded reader version.
    #[inline]
    pub fn clear_reader_version(&self, slot: ThreadSlot) {
        self.reader_version[slot.index()].store(0, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Orec
// ---------------------------------------------------------------------------

/// Lock bit of an orec word: set when a committing writer holds the record.
pub const OREC_LOCK_BIT: Word = 1 << (Word::BITS - 1);

/// The orec word a given thread installs while holding a record.
#[inline]
#[must_use]
pub const fn orec_lock_word(slot_id: u32) -> Word {
    OREC_LOCK_BIT | slot_id as Word
}

/// Whether an orec word has its lock bit set.
#[inline]
#[must_use]
pub const fn orec_locked(v: Word) -> bool {
    v & OREC_LOCK_BIT != 0
}

/// An ownership record: a tagged word `v` that is either an unlocked version
/// count or a lock word naming its holder, plus a companion slot `p` holding
/// the version to restore on abort (or bump on commit) while `v` is locked.
///
/// `p` is only ever touched by the thread that holds the lock, so its
/// accesses are relaxed; publication rides on the release store to `v`.
#[repr(align(64))]
pub struct Orec {
    v: AtomicUsize,
    p: AtomicUsize,
}

impl Orec {
    fn new() -> Self {
        Self {
            v: AtomicUsize::new(0),
            p: AtomicUsize::new(0),
        }
    }

    /// Sample the tagged word.
    #[inline]
    #[must_use]
    pub fn v(&self, order: Ordering) -> Word {
        self.v.load(order)
    }

    /// CAS the tagged word from an observed unlocked value to a lock word.
    #[inline]
    #[must_use]
    pub fn try_lock(&self, observed: Word, lock_word: Word) -> bool {
        self.v
            .compare_exchange(observed, lock_word, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Publish a new tagged word (release).
    #[inline]
    pub fn set_v(&self, v: Word) {
        self.v.store(v, Ordering::Release);
    }

    /// Saved pre-lock version. Holder-only.
    #[inline]
    #[must_use]
    pub fn p(&self) -> Word {
        self.p.load(Ordering::Relaxed)
    }

    /// Save the pre-lock version. Holder-only.
    #[inline]
    pub fn set_p(&self, p: Word) {
        self.p.store(p, Ordering::Relaxed);
    }
}

/// A read-set record: the orec guarding a location and the tagged word it
/// held when the read validated.
#[derive(Clone, Copy)]
pub struct OrecSnapshot {
    pub orec: &'static Orec,
    pub v: Word,
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

struct MetadataTables {
    bytelocks: Box<[ByteLock]>,
    orecs: Box<[Orec]>,
}

static TABLES: OnceLock<MetadataTables> = OnceLock::new();

fn tables() -> &'static MetadataTables {
    TABLES.get_or_init(|| {
        info!(
            bytelocks = BYTELOCK_TABLE_LEN,
            orecs = OREC_TABLE_LEN,
            max_threads = MAX_THREADS,
            "metadata tables created"
        );
        MetadataTables {
            bytelocks: (0..BYTELOCK_TABLE_LEN)
                .map(|_| ByteLock::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            orecs: (0..OREC_TABLE_LEN)
                .map(|_| Orec::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    })
}

/// The bytelock guarding `addr`.
#[inline]
#[must_use]
pub fn bytelock_for(addr: *const Word) -> &'static ByteLock {
    &tables().bytelocks[bucket_of(addr, BYTELOCK_TABLE_LEN.trailing_zeros())]
}

/// The ownership record guarding `addr`.
#[inline]
#[must_use]
pub fn orec_for(addr: *const Word) -> &'static Orec {
    &tables().orecs[bucket_of(addr, OREC_TABLE_LEN.trailing_zeros())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn slot(n: u32) -> ThreadSlot {
        ThreadSlot::new(n).unwrap()
    }

    #[test]
    fn hashing_is_stable_and_in_range() {
        let mut words = [0_usize; 64];
        for (i, w) in words.iter_mut().enumerate() {
            let p = std::ptr::addr_of!(*w);
            let a = bucket_of(p, BYTELOCK_TABLE_LEN.trailing_zeros());
            let b = bucket_of(p, BYTELOCK_TABLE_LEN.trailing_zeros());
            assert_eq!(a, b, "hash must be deterministic (word {i})");
            assert!(a < BYTELOCK_TABLE_LEN);
            assert!(bucket_of(p, OREC_TABLE_LEN.trailing_zeros()) < OREC_TABLE_LEN);
        }
    }

    #[test]
    fn adjacent_words_spread_across_buckets() {
        let words = [0_usize; 256];
        let mut buckets: Vec<usize> = words
            .iter()
            .map(|w| bucket_of(std::ptr::addr_of!(*w), BYTELOCK_TABLE_LEN.trailing_zeros()))
            .collect();
        buckets.sort_unstable();
        buckets.dedup();
        // Fibonacci hashing must not collapse a dense array onto a handful
        // of buckets.
        assert!(buckets.len() > 200, "only {} distinct buckets", buckets.len());
    }

    #[test]
    fn bytelock_writer_exclusive() {
        let lock = ByteLock::new();
        assert!(lock.try_acquire_writer(slot(1)));
        assert!(!lock.try_acquire_writer(slot(2)));
        assert_eq!(lock.owner(), 1);
        lock.release_writer();
        assert!(lock.try_acquire_writer(slot(2)));
    }

    #[test]
    fn bytelock_version_starts_nonzero() {
        let lock = ByteLock::new();
        assert_eq!(lock.version(), 1);
        lock.bump_version();
        assert_eq!(lock.version(), 2);
    }

    #[test]
    fn reader_flags_are_per_slot() {
        let lock = ByteLock::new();
        lock.set_reader(slot(3));
        assert_eq!(lock.reader_at(2), 1);
        assert_eq!(lock.reader_at(0), 0);
        lock.clear_reader(slot(3));
        assert_eq!(lock.reader_at(2), 0);
    }

    #[test]
    fn orec_lock_word_encoding() {
        let w = orec_lock_word(7);
        assert!(orec_locked(w));
        assert!(!orec_locked(41));
        assert_eq!(w & !OREC_LOCK_BIT, 7);
    }

    #[test]
    fn orec_lock_release_cycle() {
        let o = Orec::new();
        let before = o.v(Ordering::Relaxed);
        assert!(o.try_lock(before, orec_lock_word(1)));
        o.set_p(before);
        assert!(!o.try_lock(before, orec_lock_word(2)));
        o.set_v(o.p() + 1);
        assert_eq!(o.v(Ordering::Relaxed), before + 1);
        assert!(!orec_locked(o.v(Ordering::Relaxed)));
    }

    /// Only one of many racing threads can win a bytelock writer CAS.
    #[test]
    fn writer_cas_race_single_winner() {
        let lock = Arc::new(ByteLock::new());
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = Vec::new();
        for i in 0..8_u32 {
            let l = Arc::clone(&lock);
            let b = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                b.wait();
                u32::from(l.try_acquire_writer(slot(i + 1)))
            }));
        }
        let winners: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
    }
}
