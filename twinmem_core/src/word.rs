use std::sync::atomic::{AtomicU64, Ordering};

use crate::txn::{TxId, TX_NONE};

const WRITTEN: u64 = 1 << 63;
const READ_BY_OTHERS: u64 = 1 << 62;
const VALID_COPY_B: u64 = 1 << 61;
pub(crate) const ACCESSOR_MASK: u64 = VALID_COPY_B - 1;

pub(crate) const COPY_A: usize = 0;
pub(crate) const COPY_B: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WordConflict {
    WrittenByOther,
    ReadByOther,
    OwnedByOther,
}

// One aligned word of a segment. All protocol state lives in a single
// atomic so that racing transactions always observe a consistent
// (written, read_by_others, accessor) triple and every transition is
// one compare-and-swap.
pub(crate) struct WordControl(AtomicU64);

impl WordControl {
    #[inline]
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    fn readable(bits: u64) -> usize {
        if bits & VALID_COPY_B != 0 {
            COPY_B
        } else {
            COPY_A
        }
    }

    #[inline]
    fn writable(bits: u64) -> usize {
        Self::readable(bits) ^ 1
    }

    // Copy index holding the last committed value. Read-only fast path:
    // never mutates word state.
    #[inline]
    pub fn readable_copy(&self) -> usize {
        Self::readable(self.0.load(Ordering::Acquire))
    }

    // Read by a read/write transaction. Returns the copy index to read
    // from, claiming the first-accessor slot when the word is untouched.
    pub fn read_access(&self, id: TxId) -> Result<usize, WordConflict> {
        debug_assert_ne!(id, TX_NONE);
        debug_assert_eq!(id & !ACCESSOR_MASK, 0);

        let mut bits = self.0.load(Ordering::Acquire);
        loop {
            let accessor = bits & ACCESSOR_MASK;

            if accessor == id {
                return Ok(if bits & WRITTEN != 0 {
                    Self::writable(bits)
                } else {
                    Self::readable(bits)
                });
            }

            if accessor == TX_NONE {
                match self.0.compare_exchange(
                    bits,
                    bits | id,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(Self::readable(bits)),
                    Err(observed) => {
                        bits = observed;
                        continue;
                    }
                }
            }

            // Another read/write transaction touched this word first.
            if bits & WRITTEN != 0 {
                return Err(WordConflict::WrittenByOther);
            }
            if bits & READ_BY_OTHERS != 0 {
                return Ok(Self::readable(bits));
            }
            match self.0.compare_exchange(
                bits,
                bits | READ_BY_OTHERS,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(Self::readable(bits)),
                Err(observed) => {
                    bits = observed;
                    continue;
                }
            }
        }
    }

    // Write by a read/write transaction. Returns the writable copy index
    // and whether this call set the written flag (first write of this
    // transaction to the word; the caller logs those for abort rollback).
    pub fn write_access(&self, id: TxId) -> Result<(usize, bool), WordConflict> {
        debug_assert_ne!(id, TX_NONE);
        debug_assert_eq!(id & !ACCESSOR_MASK, 0);

        let mut bits = self.0.load(Ordering::Acquire);
        loop {
            let accessor = bits & ACCESSOR_MASK;

            if accessor == id {
                if bits & WRITTEN != 0 {
                    return Ok((Self::writable(bits), false));
                }
                if bits & READ_BY_OTHERS != 0 {
                    return Err(WordConflict::ReadByOther);
                }
                match self.0.compare_exchange(
                    bits,
                    bits | WRITTEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok((Self::writable(bits), true)),
                    Err(observed) => {
                        bits = observed;
                        continue;
                    }
                }
            }

            if accessor == TX_NONE {
                match self.0.compare_exchange(
                    bits,
                    bits | id | WRITTEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok((Self::writable(bits), true)),
                    Err(observed) => {
                        bits = observed;
                        continue;
                    }
                }
            }

            return Err(if bits & WRITTEN != 0 {
                WordConflict::WrittenByOther
            } else {
                WordConflict::OwnedByOther
            });
        }
    }

    // Abort rollback: drop the written mark so the commit step will not
    // publish this word. Accessor and read_by_others may remain; the
    // epoch reset clears them.
    pub fn clear_written(&self) {
        let mut bits = self.0.load(Ordering::Acquire);
        loop {
            if bits & WRITTEN == 0 {
                return;
            }
            match self.0.compare_exchange(
                bits,
                bits & !WRITTEN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => bits = observed,
            }
        }
    }

    // Epoch boundary, region quiescent: flip the valid copy iff the word
    // was written by a committed transaction, clear everything else.
    pub fn epoch_reset(&self) {
        let bits = self.0.load(Ordering::Acquire);
        let mut valid = bits & VALID_COPY_B;
        if bits & WRITTEN != 0 {
            valid ^= VALID_COPY_B;
        }
        self.0.store(valid, Ordering::Release);
    }

    #[inline]
    pub fn is_clean(&self) -> bool {
        self.0.load(Ordering::Acquire) & !VALID_COPY_B == 0
    }

    #[cfg(test)]
    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}
