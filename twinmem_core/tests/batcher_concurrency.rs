use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use twinmem_core::{Region, RetryPolicy, StmError};

const ACCOUNTS: usize = 8;
const WORD: usize = 8;
const INITIAL_BALANCE: u64 = 1_000;
const WORKERS: usize = 4;
const TRANSFERS_PER_WORKER: usize = 50;

fn read_balance(
    region: &Region,
    tx: &mut twinmem_core::Transaction,
    account: usize,
) -> Result<u64, StmError> {
    let mut buf = [0_u8; WORD];
    region.read(tx, region.first_addr().byte_add((account * WORD) as u32), &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_balance(
    region: &Region,
    tx: &mut twinmem_core::Transaction,
    account: usize,
    balance: u64,
) -> Result<(), StmError> {
    region.write(
        tx,
        &balance.to_le_bytes(),
        region.first_addr().byte_add((account * WORD) as u32),
    )
}

fn total_balance(region: &Region) -> u64 {
    let mut tx = region.begin(true).expect("ro begin");
    let mut total = 0;
    for account in 0..ACCOUNTS {
        total += read_balance(region, &mut tx, account).expect("read balance");
    }
    assert!(region.end(tx));
    total
}

// Serializability under contention: concurrent transfers between a
// handful of accounts must conserve the total.
#[test]
fn concurrent_transfers_conserve_the_total_balance() {
    let region = Arc::new(Region::with_first_segment(ACCOUNTS * WORD, WORD).expect("region"));

    let mut setup = region.begin(false).expect("rw begin");
    for account in 0..ACCOUNTS {
        write_balance(&region, &mut setup, account, INITIAL_BALANCE).expect("seed");
    }
    assert!(region.end(setup));

    let mut workers = Vec::with_capacity(WORKERS);
    for worker in 0..WORKERS {
        let region = Arc::clone(&region);
        workers.push(thread::spawn(move || {
            // Cheap deterministic account picks, distinct per worker.
            let mut state = (worker as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let mut next = || {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state
            };

            for _ in 0..TRANSFERS_PER_WORKER {
                let from = (next() % ACCOUNTS as u64) as usize;
                let to = ((from + 1 + (next() % (ACCOUNTS as u64 - 1)) as usize) % ACCOUNTS) as usize;
                let amount = next() % 50;

                region
                    .run(false, RetryPolicy::default(), |region, tx| {
                        let from_balance = read_balance(region, tx, from)?;
                        let to_balance = read_balance(region, tx, to)?;
                        let moved = amount.min(from_balance);
                        write_balance(region, tx, from, from_balance - moved)?;
                        write_balance(region, tx, to, to_balance + moved)?;
                        Ok(())
                    })
                    .expect("transfer commits within the allowed attempts");
            }
        }));
    }

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(
        total_balance(&region),
        (ACCOUNTS as u64) * INITIAL_BALANCE,
        "transfers must conserve the total"
    );

    let stats = region.stats();
    assert_eq!(
        stats.commits,
        1 + (WORKERS * TRANSFERS_PER_WORKER) as u64 + 1,
        "setup + every transfer + the audit read"
    );
    assert!(stats.epochs > 0);
    assert!(
        stats.epochs <= stats.commits + stats.aborts,
        "an epoch needs at least one participant"
    );
}

// Writer progress under a continuous read-only stream: queued writers
// gate new readers, so the writer gets the next wave.
#[test]
fn a_writer_is_not_starved_by_a_reader_stream() {
    let region = Arc::new(Region::with_first_segment(64, 8).expect("region"));
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..3 {
        let region = Arc::clone(&region);
        let stop = Arc::clone(&stop);
        readers.push(thread::spawn(move || {
            let mut reads = 0_u64;
            while !stop.load(Ordering::Acquire) {
                let mut tx = region.begin(true).expect("ro begin");
                let mut buf = [0_u8; 8];
                region.read(&mut tx, region.first_addr(), &mut buf).expect("read");
                assert!(region.end(tx));
                reads += 1;
            }
            reads
        }));
    }

    let mut writer_tx = region.begin(false).expect("writer admission");
    region
        .write(&mut writer_tx, &0xF00D_u64.to_le_bytes(), region.first_addr())
        .expect("write");
    assert!(region.end(writer_tx));

    stop.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.join().expect("reader panicked") > 0);
    }

    assert_eq!(region.stats().aborts, 0);
}

// Distinct-word writers batched into one wave must all commit.
#[test]
fn disjoint_writers_commit_in_the_same_wave() {
    let region = Arc::new(Region::with_first_segment(64, 8).expect("region"));

    let holder = region.begin(false).expect("holder");

    let mut writers = Vec::new();
    for word in 0..4_u32 {
        let region = Arc::clone(&region);
        writers.push(thread::spawn(move || {
            let mut tx = region.begin(false).expect("queued writer");
            region
                .write(
                    &mut tx,
                    &(word as u64 + 1).to_le_bytes(),
                    region.first_addr().byte_add(word * 8),
                )
                .expect("disjoint words never conflict");
            region.end(tx)
        }));
    }

    thread::sleep(std::time::Duration::from_millis(100));
    assert!(region.end(holder));

    for writer in writers {
        assert!(writer.join().expect("writer panicked"));
    }

    let mut tx = region.begin(true).expect("ro begin");
    for word in 0..4_u32 {
        let mut buf = [0_u8; 8];
        region
            .read(&mut tx, region.first_addr().byte_add(word * 8), &mut buf)
            .expect("read");
        assert_eq!(u64::from_le_bytes(buf), word as u64 + 1);
    }
    assert!(region.end(tx));
}

#[test]
fn epochs_advance_and_ids_stay_monotonic() {
    let region = Region::with_first_segment(16, 8).expect("region");

    let mut last_id = 0;
    for round in 0..10 {
        let tx = region.begin(round % 2 == 0).expect("begin");
        assert_eq!(tx.epoch(), region.current_epoch());
        assert!(tx.id() > last_id, "transaction ids are monotonic");
        last_id = tx.id();
        assert!(region.end(tx));
    }

    assert_eq!(region.stats().epochs, 10);
    assert_eq!(region.current_epoch(), 10);
}
