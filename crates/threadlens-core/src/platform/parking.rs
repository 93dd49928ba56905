//! Parking table shared by suspenders and the suspend-signal handler
//!
//! Each slot holds one packed word, `(tid << 32) | state`, so that a state
//! transition can only ever apply to the thread it was meant for, plus a
//! futex sequence counter bumped after every transition.
//!
//! ```text
//! FREE -claim-> CLAIMED -request-> REQUESTED -handler-> PARKED -unpark-> RELEASED -handler-> CLAIMED
//!                                      |                                    |
//!                                  (timeout)                            (drop before
//!                                      v                                 handler left)
//!                                  ABANDONED                                v
//!                                                              ORPHANED -handler-> FREE
//! ```
//!
//! The table is static so a late handler can never touch freed memory.
//! Everything reachable from [`park_current`] is async-signal-safe: atomics
//! and raw syscalls only.

use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::{PlatformFault, Tid};

/// Upper bound on threads that can be held at once
pub const PARKING_SLOTS: usize = 1024;

const FREE: u32 = 0;
const CLAIMED: u32 = 1;
const REQUESTED: u32 = 2;
const PARKED: u32 = 3;
const RELEASED: u32 = 4;
const ABANDONED: u32 = 5;
const ORPHANED: u32 = 6;

struct Slot {
    word: AtomicU64,
    seq: AtomicU32,
}

impl Slot {
    const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
            seq: AtomicU32::new(0),
        }
    }

    fn transition(&self, from: u64, to: u64) -> bool {
        let ok = self
            .word
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if ok {
            self.bump();
        }
        ok
    }

    fn bump(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.seq);
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: Slot = Slot::new();

static SLOTS: [Slot; PARKING_SLOTS] = [EMPTY; PARKING_SLOTS];

const fn pack(tid: i32, state: u32) -> u64 {
    ((tid as u32 as u64) << 32) | state as u64
}

const fn state_of(word: u64) -> u32 {
    word as u32
}

/// Exclusive claim on one slot of the table; freed on drop
#[derive(Debug)]
pub(crate) struct SlotRef {
    index: usize,
    tid: i32,
}

impl SlotRef {
    /// Claim a free slot for `tid`, `None` when the table is full
    pub(crate) fn claim(tid: Tid) -> Option<SlotRef> {
        let claimed = pack(tid.0, CLAIMED);
        SLOTS
            .iter()
            .position(|slot| {
                slot.word
                    .compare_exchange(FREE as u64, claimed, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            })
            .map(|index| SlotRef { index, tid: tid.0 })
    }

    fn slot(&self) -> &'static Slot {
        &SLOTS[self.index]
    }

    fn word(&self, state: u32) -> u64 {
        pack(self.tid, state)
    }

    /// Arm the slot before the suspend signal goes out
    pub(crate) fn request(&self) -> Result<(), PlatformFault> {
        if self.slot().transition(self.word(CLAIMED), self.word(REQUESTED)) {
            Ok(())
        } else {
            Err(PlatformFault::InvalidState)
        }
    }

    /// Disarm after the signal could not be sent
    pub(crate) fn cancel_request(&self) {
        self.slot()
            .transition(self.word(REQUESTED), self.word(CLAIMED));
    }

    /// Wait for the handler to acknowledge the request.
    ///
    /// On timeout the request is abandoned, so a signal delivered later finds
    /// nothing to park on.
    pub(crate) fn await_parked(&self, timeout: Duration) -> Result<(), PlatformFault> {
        let slot = self.slot();
        let requested = self.word(REQUESTED);
        let parked = self.word(PARKED);
        let deadline = Instant::now() + timeout;

        loop {
            let seq = slot.seq.load(Ordering::Acquire);
            let word = slot.word.load(Ordering::Acquire);
            if word == parked {
                return Ok(());
            }
            if word != requested {
                return Err(PlatformFault::InvalidState);
            }

            let now = Instant::now();
            if now >= deadline {
                if slot.transition(requested, self.word(ABANDONED)) {
                    return Err(PlatformFault::Timeout);
                }
                // Lost the race against the handler, re-check
                continue;
            }
            futex_wait(&slot.seq, seq, Some(deadline - now));
        }
    }

    /// Release a parked thread and wait until it has left the handler
    pub(crate) fn unpark(&self, timeout: Duration) -> Result<(), PlatformFault> {
        let slot = self.slot();
        let released = self.word(RELEASED);
        if !slot.transition(self.word(PARKED), released) {
            return Err(PlatformFault::InvalidState);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let seq = slot.seq.load(Ordering::Acquire);
            if slot.word.load(Ordering::Acquire) != released {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PlatformFault::Timeout);
            }
            futex_wait(&slot.seq, seq, Some(deadline - now));
        }
    }

    #[cfg(test)]
    fn state(&self) -> u32 {
        state_of(self.slot().word.load(Ordering::Acquire))
    }
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        let slot = self.slot();
        loop {
            let word = slot.word.load(Ordering::Acquire);
            let next = match state_of(word) {
                // Never leave a thread parked behind a dropped handle
                PARKED => self.word(RELEASED),
                // Handler still on its way out; it frees the slot itself
                RELEASED => self.word(ORPHANED),
                _ => FREE as u64,
            };
            if slot.transition(word, next) && state_of(next) != RELEASED {
                return;
            }
        }
    }
}

/// Signal-handler side of the handshake for the thread `tid`.
///
/// Returns immediately unless a suspender armed a slot for this thread.
pub(crate) fn park_current(tid: i32) {
    let requested = pack(tid, REQUESTED);
    let parked = pack(tid, PARKED);

    let Some(slot) = SLOTS
        .iter()
        .find(|slot| slot.word.load(Ordering::Acquire) == requested)
    else {
        return;
    };
    if !slot.transition(requested, parked) {
        return;
    }

    loop {
        let seq = slot.seq.load(Ordering::Acquire);
        if slot.word.load(Ordering::Acquire) != parked {
            break;
        }
        futex_wait(&slot.seq, seq, None);
    }

    loop {
        let word = slot.word.load(Ordering::Acquire);
        let next = match state_of(word) {
            RELEASED => pack(tid, CLAIMED),
            ORPHANED => FREE as u64,
            _ => break,
        };
        if slot.transition(word, next) {
            break;
        }
    }
}

fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |ts| ts as *const libc::timespec);

    // EINTR, EAGAIN and spurious wakeups all land back in the caller's re-check loop
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
        );
    }
}

fn futex_wake(word: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX,
        );
    }
}
