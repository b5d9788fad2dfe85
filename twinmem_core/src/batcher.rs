use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatcherError {
    Poisoned,
}

impl fmt::Display for BatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatcherError::Poisoned => {
                write!(f, "batcher lock poisoned by a panicked participant")
            }
        }
    }
}

impl std::error::Error for BatcherError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaveOutcome {
    Remaining,
    // The leaving transaction closed the epoch. The caller must run the
    // commit step and then call `release` to open the next wave.
    LastOut,
}

#[derive(Debug)]
struct Wave {
    epoch: u64,
    active: usize,
    waiting_writers: usize,
    waiting_readers: usize,
    draining: bool,
}

// Epoch admission. Writers arriving while an epoch is active queue up
// and are released together as the next wave; read-only transactions
// join the running epoch unless writers are already queued (gating them
// is what keeps a continuous reader stream from starving writers). The
// last participant out performs the commit step with `draining` holding
// all admissions shut.
pub(crate) struct Batcher {
    wave: Mutex<Wave>,
    admit: Condvar,
}

impl Batcher {
    pub fn new() -> Self {
        Self {
            wave: Mutex::new(Wave {
                epoch: 0,
                active: 0,
                waiting_writers: 0,
                waiting_readers: 0,
                draining: false,
            }),
            admit: Condvar::new(),
        }
    }

    // Blocks until admitted; returns the epoch entered.
    pub fn enter(&self, read_only: bool) -> Result<u64, BatcherError> {
        let mut wave = self.wave.lock().map_err(|_| BatcherError::Poisoned)?;

        if read_only {
            if !wave.draining && wave.waiting_writers == 0 {
                wave.active += 1;
                return Ok(wave.epoch);
            }
            wave.waiting_readers += 1;
        } else {
            if !wave.draining && wave.active == 0 && wave.waiting_writers == 0 {
                wave.active = 1;
                return Ok(wave.epoch);
            }
            wave.waiting_writers += 1;
        }

        // Queued participants are counted into `active` by `release`
        // before any wakeup, so the epoch they wake into cannot drain
        // without them.
        let entered = wave.epoch;
        loop {
            wave = self
                .admit
                .wait(wave)
                .map_err(|_| BatcherError::Poisoned)?;
            if wave.epoch != entered {
                return Ok(wave.epoch);
            }
        }
    }

    pub fn leave(&self) -> LeaveOutcome {
        let mut wave = self.lock_wave();
        debug_assert!(wave.active > 0, "leave without a matching enter");
        wave.active -= 1;
        if wave.active == 0 {
            wave.draining = true;
            LeaveOutcome::LastOut
        } else {
            LeaveOutcome::Remaining
        }
    }

    // Ends the drain: advances the epoch and admits the queued wave.
    pub fn release(&self) {
        let mut wave = self.lock_wave();
        debug_assert!(wave.draining, "release without a closing leave");
        wave.epoch += 1;
        wave.active = wave.waiting_writers + wave.waiting_readers;
        wave.waiting_writers = 0;
        wave.waiting_readers = 0;
        wave.draining = false;
        drop(wave);
        self.admit.notify_all();
    }

    pub fn epoch(&self) -> u64 {
        self.lock_wave().epoch
    }

    // `leave`/`release` must complete even after a poisoning panic
    // elsewhere; the wave counters are only ever mutated under the lock,
    // so the recovered state is consistent.
    fn lock_wave(&self) -> MutexGuard<'_, Wave> {
        self.wave
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
