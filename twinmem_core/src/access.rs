use crossbeam::epoch::{self, Guard};

use crate::region::{Region, StmError};
use crate::segment::{Addr, Segment};
use crate::txn::{Transaction, WriteEntry};

// Resolve `addr` against the shared table first, then the transaction's
// tentative segments (visible only to their creator).
fn resolve<'a>(
    region: &'a Region,
    local_allocs: &'a [Segment],
    addr: Addr,
    guard: &'a Guard,
) -> Option<&'a Segment> {
    if let Some(segment) = region.segments().get(addr.segment_id(), guard) {
        return Some(segment);
    }
    local_allocs
        .iter()
        .find(|segment| segment.id() == addr.segment_id())
}

fn abort_on<T>(tx: &mut Transaction, err: StmError) -> Result<T, StmError> {
    tx.aborted = true;
    Err(err)
}

pub(crate) fn read(
    region: &Region,
    tx: &mut Transaction,
    src: Addr,
    dst: &mut [u8],
) -> Result<(), StmError> {
    if tx.aborted {
        return Err(StmError::TransactionAborted);
    }
    let align = region.align();
    if dst.is_empty() || dst.len() % align != 0 {
        return abort_on(
            tx,
            StmError::InvalidLength {
                len: dst.len(),
                align,
            },
        );
    }

    let id = tx.id;
    let read_only = tx.read_only;

    let outcome = {
        let guard = epoch::pin();
        match resolve(region, &tx.local_allocs, src, &guard) {
            Some(segment) if segment.contains_range(src.offset(), dst.len()) => {
                let first = segment.word_index(src.offset());

                if read_only {
                    for (i, chunk) in dst.chunks_exact_mut(align).enumerate() {
                        let copy = segment.word(first + i).readable_copy();
                        segment.read_word(copy, first + i, chunk);
                    }
                    Ok(())
                } else {
                    segment.mark_touched();
                    let mut result = Ok(());
                    for (i, chunk) in dst.chunks_exact_mut(align).enumerate() {
                        match segment.word(first + i).read_access(id) {
                            Ok(copy) => segment.read_word(copy, first + i, chunk),
                            Err(_conflict) => {
                                result = Err(StmError::Conflict);
                                break;
                            }
                        }
                    }
                    result
                }
            }
            _ => Err(StmError::UnknownAddress { addr: src }),
        }
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(err) => abort_on(tx, err),
    }
}

pub(crate) fn write(
    region: &Region,
    tx: &mut Transaction,
    src: &[u8],
    dst: Addr,
) -> Result<(), StmError> {
    if tx.aborted {
        return Err(StmError::TransactionAborted);
    }
    if tx.read_only {
        return abort_on(tx, StmError::ReadOnlyWrite);
    }
    let align = region.align();
    if src.is_empty() || src.len() % align != 0 {
        return abort_on(
            tx,
            StmError::InvalidLength {
                len: src.len(),
                align,
            },
        );
    }

    let id = tx.id;
    let mut marked: Vec<WriteEntry> = Vec::new();

    let outcome = {
        let guard = epoch::pin();
        match resolve(region, &tx.local_allocs, dst, &guard) {
            Some(segment) if segment.contains_range(dst.offset(), src.len()) => {
                segment.mark_touched();
                let first = segment.word_index(dst.offset());
                let mut result = Ok(());
                for (i, chunk) in src.chunks_exact(align).enumerate() {
                    match segment.word(first + i).write_access(id) {
                        Ok((copy, newly_written)) => {
                            segment.write_word(copy, first + i, chunk);
                            if newly_written {
                                marked.push(WriteEntry {
                                    segment: segment.id(),
                                    word: (first + i) as u32,
                                });
                            }
                        }
                        Err(_conflict) => {
                            result = Err(StmError::Conflict);
                            break;
                        }
                    }
                }
                result
            }
            _ => Err(StmError::UnknownAddress { addr: dst }),
        }
    };

    tx.write_log.extend(marked);
    match outcome {
        Ok(()) => Ok(()),
        Err(err) => abort_on(tx, err),
    }
}

// Abort rollback: clear the written marks this transaction planted so
// the commit step never publishes them. Tentative segments are dropped
// wholesale by the caller right after, so entries pointing into them may
// simply vanish.
pub(crate) fn rollback_writes(region: &Region, tx: &mut Transaction) {
    let guard = epoch::pin();
    for entry in &tx.write_log {
        let segment = region
            .segments()
            .get(entry.segment, &guard)
            .or_else(|| {
                tx.local_allocs
                    .iter()
                    .find(|segment| segment.id() == entry.segment)
            });
        if let Some(segment) = segment {
            segment.word(entry.word as usize).clear_written();
        }
    }
    tx.write_log.clear();
}
