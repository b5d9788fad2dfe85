use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crossbeam::epoch;
use serde::{Deserialize, Serialize};

use crate::access;
use crate::batcher::{Batcher, BatcherError, LeaveOutcome};
use crate::segmap::SegMap;
use crate::segment::{Addr, Segment, SegmentState, FIRST_SEGMENT_ID};
use crate::txn::{Transaction, TX_ID_LIMIT, TX_NONE};

// Offsets are packed into the low 32 bits of an address.
const MAX_SEGMENT_LEN: usize = u32::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    InvalidAlignment { align: usize },
    InvalidSize { size: usize, align: usize },
    OutOfMemory { size: usize },
    Admission(BatcherError),
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::InvalidAlignment { align } => {
                write!(f, "alignment {} is not a power of two", align)
            }
            RegionError::InvalidSize { size, align } => write!(
                f,
                "size {} is not a positive multiple of the effective alignment {}",
                size, align
            ),
            RegionError::OutOfMemory { size } => {
                write!(f, "failed to allocate {} bytes for the first segment", size)
            }
            RegionError::Admission(err) => write!(f, "transaction admission failed: {}", err),
        }
    }
}

impl std::error::Error for RegionError {}

impl From<BatcherError> for RegionError {
    fn from(err: BatcherError) -> Self {
        RegionError::Admission(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmError {
    /// Another transaction holds an incompatible access on a word.
    Conflict,
    /// A previous operation already aborted this transaction.
    TransactionAborted,
    /// Allocation failed; the transaction is still live.
    OutOfMemory { size: usize },
    InvalidLength { len: usize, align: usize },
    UnknownAddress { addr: Addr },
    AlreadyFreed { addr: Addr },
    FreeFirstSegment,
    ReadOnlyWrite,
}

impl StmError {
    /// Conflict aborts are the normal path and are worth retrying.
    #[inline]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StmError::Conflict | StmError::TransactionAborted)
    }
}

impl fmt::Display for StmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StmError::Conflict => write!(f, "conflicting word access; transaction aborted"),
            StmError::TransactionAborted => {
                write!(f, "transaction was already aborted")
            }
            StmError::OutOfMemory { size } => {
                write!(f, "failed to allocate a {} byte segment", size)
            }
            StmError::InvalidLength { len, align } => write!(
                f,
                "length {} is not a positive multiple of the alignment {}",
                len, align
            ),
            StmError::UnknownAddress { addr } => {
                write!(f, "address {:?} does not name a reachable word range", addr)
            }
            StmError::AlreadyFreed { addr } => {
                write!(f, "segment at {:?} was already freed in this transaction", addr)
            }
            StmError::FreeFirstSegment => {
                write!(f, "the first segment cannot be freed")
            }
            StmError::ReadOnlyWrite => {
                write!(f, "write issued inside a read-only transaction")
            }
        }
    }
}

impl std::error::Error for StmError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub first_segment_size: usize,
    pub alignment: usize,
}

impl RegionConfig {
    pub fn new(first_segment_size: usize, alignment: usize) -> Self {
        Self {
            first_segment_size,
            alignment,
        }
    }

    // Words must hold a pointer-sized value; smaller requested
    // alignments are widened and the size re-checked against the
    // effective value.
    pub fn effective_alignment(&self) -> usize {
        self.alignment.max(mem::size_of::<usize>())
    }

    pub fn validate(&self) -> Result<(), RegionError> {
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(RegionError::InvalidAlignment {
                align: self.alignment,
            });
        }
        let align = self.effective_alignment();
        if self.first_segment_size == 0
            || self.first_segment_size % align != 0
            || self.first_segment_size > MAX_SEGMENT_LEN
        {
            return Err(RegionError::InvalidSize {
                size: self.first_segment_size,
                align,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    epochs: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    segments_allocated: AtomicU64,
    segments_freed: AtomicU64,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionStats {
    pub epochs: u64,
    pub commits: u64,
    pub aborts: u64,
    pub segments_allocated: u64,
    pub segments_freed: u64,
    pub segments_live: usize,
}

/// A shared transactional memory region: a set of dual-copy segments
/// plus the epoch batcher coordinating access to them.
pub struct Region {
    align: usize,
    first_len: usize,
    segments: SegMap,
    batcher: Batcher,
    pending_alloc: Mutex<Vec<Segment>>,
    pending_free: Mutex<Vec<u32>>,
    next_segment_id: AtomicU32,
    tx_counter: AtomicU64,
    counters: Counters,
}

impl Region {
    pub fn create(config: RegionConfig) -> Result<Self, RegionError> {
        config.validate()?;
        let align = config.effective_alignment();
        let size = config.first_segment_size;

        let segments = SegMap::new();
        let first = Segment::new(FIRST_SEGMENT_ID, size, align, SegmentState::Live, TX_NONE)
            .ok_or(RegionError::OutOfMemory { size })?;
        segments.insert(first);

        Ok(Self {
            align,
            first_len: size,
            segments,
            batcher: Batcher::new(),
            pending_alloc: Mutex::new(Vec::new()),
            pending_free: Mutex::new(Vec::new()),
            next_segment_id: AtomicU32::new(FIRST_SEGMENT_ID + 1),
            tx_counter: AtomicU64::new(1),
            counters: Counters::default(),
        })
    }

    /// Shorthand for `create(RegionConfig::new(size, align))`.
    pub fn with_first_segment(size: usize, align: usize) -> Result<Self, RegionError> {
        Self::create(RegionConfig::new(size, align))
    }

    /// Base address of the permanent first segment.
    #[inline]
    pub fn first_addr(&self) -> Addr {
        Addr::new(FIRST_SEGMENT_ID, 0)
    }

    #[inline]
    pub fn first_size(&self) -> usize {
        self.first_len
    }

    /// Effective alignment: the transactional access granularity.
    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }

    /// Epoch the batcher is currently admitting into.
    pub fn current_epoch(&self) -> u64 {
        self.batcher.epoch()
    }

    pub fn stats(&self) -> RegionStats {
        let guard = epoch::pin();
        RegionStats {
            epochs: self.counters.epochs.load(Ordering::Acquire),
            commits: self.counters.commits.load(Ordering::Acquire),
            aborts: self.counters.aborts.load(Ordering::Acquire),
            segments_allocated: self.counters.segments_allocated.load(Ordering::Acquire),
            segments_freed: self.counters.segments_freed.load(Ordering::Acquire),
            segments_live: self.segments.len(&guard),
        }
    }

    /// Begin a transaction. Blocks while an epoch with queued writers is
    /// active (writers) or while a wave turnover is in progress.
    pub fn begin(&self, read_only: bool) -> Result<Transaction, RegionError> {
        let epoch = self.batcher.enter(read_only)?;
        let id = self.tx_counter.fetch_add(1, Ordering::AcqRel);
        debug_assert!(id < TX_ID_LIMIT);
        Ok(Transaction::new(id, read_only, epoch))
    }

    /// Read `dst.len()` bytes starting at `src` into `dst`.
    pub fn read(&self, tx: &mut Transaction, src: Addr, dst: &mut [u8]) -> Result<(), StmError> {
        access::read(self, tx, src, dst)
    }

    /// Write `src` to the shared range starting at `dst`.
    pub fn write(&self, tx: &mut Transaction, src: &[u8], dst: Addr) -> Result<(), StmError> {
        access::write(self, tx, src, dst)
    }

    /// Allocate a tentative segment of `size` bytes, zeroed. It becomes
    /// reachable by other transactions only after this one commits.
    pub fn alloc(&self, tx: &mut Transaction, size: usize) -> Result<Addr, StmError> {
        if tx.aborted {
            return Err(StmError::TransactionAborted);
        }
        if size == 0 || size % self.align != 0 || size > MAX_SEGMENT_LEN {
            tx.aborted = true;
            return Err(StmError::InvalidLength {
                len: size,
                align: self.align,
            });
        }

        let id = self.next_segment_id.fetch_add(1, Ordering::AcqRel);
        if id == u32::MAX || id <= FIRST_SEGMENT_ID {
            // Id space exhausted; ids are never reused, and a wrapped
            // counter must not mint the reserved low ids again.
            self.next_segment_id.store(u32::MAX, Ordering::Release);
            return Err(StmError::OutOfMemory { size });
        }

        // Allocation failure does not abort the transaction.
        let segment = Segment::new(id, size, self.align, SegmentState::PendingAlloc, tx.id)
            .ok_or(StmError::OutOfMemory { size })?;
        let addr = segment.base_addr();
        tx.local_allocs.push(segment);
        self.counters
            .segments_allocated
            .fetch_add(1, Ordering::AcqRel);
        Ok(addr)
    }

    /// Mark the segment at `addr` for reclamation at the epoch boundary,
    /// contingent on commit. Freeing a tentative segment allocated by
    /// this same transaction cancels the allocation on the spot.
    pub fn free(&self, tx: &mut Transaction, addr: Addr) -> Result<(), StmError> {
        if tx.aborted {
            return Err(StmError::TransactionAborted);
        }
        if addr.offset() != 0 {
            tx.aborted = true;
            return Err(StmError::UnknownAddress { addr });
        }
        let id = addr.segment_id();
        if id == FIRST_SEGMENT_ID {
            tx.aborted = true;
            return Err(StmError::FreeFirstSegment);
        }

        if let Some(pos) = tx.local_allocs.iter().position(|s| s.id() == id) {
            let segment = tx.local_allocs.swap_remove(pos);
            drop(segment);
            return Ok(());
        }

        if tx.local_frees.contains(&id) {
            tx.aborted = true;
            return Err(StmError::AlreadyFreed { addr });
        }

        let guard = epoch::pin();
        if self.segments.get(id, &guard).is_none() {
            tx.aborted = true;
            return Err(StmError::UnknownAddress { addr });
        }
        tx.local_frees.push(id);
        Ok(())
    }

    /// End the transaction, releasing its epoch slot. Returns whether it
    /// committed. The last participant out runs the epoch commit step.
    pub fn end(&self, mut tx: Transaction) -> bool {
        let committed = !tx.aborted;

        if committed {
            if !tx.local_allocs.is_empty() {
                self.lock_pending_alloc()
                    .extend(tx.local_allocs.drain(..));
            }
            if !tx.local_frees.is_empty() {
                // Committed frees transition to region pending-free; the
                // epoch commit step reclaims them.
                let guard = epoch::pin();
                for id in &tx.local_frees {
                    if let Some(segment) = self.segments.get(*id, &guard) {
                        segment.set_state(SegmentState::PendingFree);
                    }
                }
                self.lock_pending_free().append(&mut tx.local_frees);
            }
            self.counters.commits.fetch_add(1, Ordering::AcqRel);
        } else {
            // Aborts leave no trace: written marks are cleared before the
            // slot is released, tentative segments die here, local frees
            // are forgotten (their segments stay live).
            access::rollback_writes(self, &mut tx);
            tx.local_allocs.clear();
            tx.local_frees.clear();
            self.counters.aborts.fetch_add(1, Ordering::AcqRel);
        }

        if self.batcher.leave() == LeaveOutcome::LastOut {
            self.commit_epoch();
            self.batcher.release();
        }
        committed
    }

    // Epoch commit step. Runs on the last participant's thread while the
    // batcher blocks all admissions, so the region is quiescent.
    fn commit_epoch(&self) {
        let guard = epoch::pin();

        let frees = mem::take(&mut *self.lock_pending_free());
        for id in frees {
            if self.segments.remove(id, &guard) {
                self.counters.segments_freed.fetch_add(1, Ordering::AcqRel);
            }
        }

        self.segments.for_each(&guard, |segment| {
            if segment.take_touched() {
                segment.reset_words();
            }
        });

        let allocs = mem::take(&mut *self.lock_pending_alloc());
        for segment in allocs {
            if segment.take_touched() {
                // Publishes the creator's writes: written words flip to
                // their writable copy.
                segment.reset_words();
            }
            segment.set_state(SegmentState::Live);
            segment.clear_owner();
            self.segments.insert(segment);
        }

        self.counters.epochs.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn segments(&self) -> &SegMap {
        &self.segments
    }

    pub(crate) fn seed_for_backoff(&self) -> u64 {
        self.tx_counter.load(Ordering::Relaxed)
    }

    fn lock_pending_alloc(&self) -> std::sync::MutexGuard<'_, Vec<Segment>> {
        self.pending_alloc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending_free(&self) -> std::sync::MutexGuard<'_, Vec<u32>> {
        self.pending_free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("align", &self.align)
            .field("first_len", &self.first_len)
            .field("stats", &self.stats())
            .finish()
    }
}
