//! Suspend / execute / resume
//!
//! [`Freezer::focus`] halts every other thread of the process, runs a closure
//! on the calling thread, then lets the others run again. This is best-effort
//! exclusion, not a lock: threads that cannot be captured keep running, and
//! threads spawned by the closure are never frozen.
//!
//! # Preconditions
//! - The closure must not wait on, lock against, or signal another thread of
//!   the process. Whatever it waits for may be frozen. This includes locks a
//!   frozen thread might hold (stdout, the allocator's arena locks, ...).
//! - `focus` must not be called from inside a closure passed to `focus`.
//! - The closure should fail by returning an error through its own return
//!   type, not by panicking. `panic!` runs the panic hook (which writes to
//!   stderr) and allocates the payload while the other threads are still
//!   frozen. If a panic has to escape, raise it with
//!   [`std::panic::resume_unwind`] and a payload built before the call.
//!
//! ```no_run
//! use threadlens_core::Freezer;
//!
//! let freezer = Freezer::new()?;
//! let checked: Result<u32, &str> = freezer.focus(|| Err("invariant broken"))?;
//! assert!(checked.is_err());
//! # Ok::<(), threadlens_core::Error>(())
//! ```

use std::mem;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::FreezerConfig;
use crate::platform::{SignalPlatform, ThreadPlatform, Tid};
use crate::report::{FreezeReport, Stage, ThreadFailure};
use crate::{Error, Result};

/// Serializes freeze sessions so two freezers never suspend each other
static FOCUS_GATE: Mutex<()> = Mutex::new(());

/// Runs closures while the rest of the process is frozen
#[derive(Debug, Clone)]
pub struct Freezer<P: ThreadPlatform = SignalPlatform> {
    platform: P,
}

impl Freezer<SignalPlatform> {
    /// Freezer on the signal platform with default settings
    pub fn new() -> Result<Self> {
        Self::with_config(&FreezerConfig::default())
    }

    pub fn with_config(config: &FreezerConfig) -> Result<Self> {
        Ok(Self::with_platform(SignalPlatform::new(config)?))
    }
}

impl<P: ThreadPlatform> Freezer<P> {
    pub fn with_platform(platform: P) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Run `action` with every other capturable thread suspended.
    ///
    /// A panic in `action` propagates after all threads have been resumed and
    /// all handles released. Threads that failed to suspend are skipped; a
    /// thread that could not be confirmed resumed turns an otherwise
    /// successful call into [`Error::ResumeIncomplete`]. Use
    /// [`Freezer::focus_with_report`] to keep the action's value in that case.
    ///
    /// Threads are suspended one after another. A thread that never
    /// acknowledges (it blocks the suspend signal, say) costs a full
    /// acknowledgement timeout before the next one is tried, and the threads
    /// already suspended stay frozen for that whole wait.
    pub fn focus<F, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        let (value, report) = self.focus_with_report(action)?;

        if report.is_degraded() {
            return Err(Error::ResumeIncomplete {
                failed: report.resume_failures().count(),
                suspended: report.suspended,
            });
        }

        Ok(value)
    }

    /// Like [`Freezer::focus`], but always hands back the action's value
    /// together with the session report.
    ///
    /// Only fails if the platform is unusable or the thread snapshot itself
    /// could not be taken, in which case nothing was suspended and `action`
    /// did not run.
    pub fn focus_with_report<F, R>(&self, action: F) -> Result<(R, FreezeReport)>
    where
        F: FnOnce() -> R,
    {
        let _gate = FOCUS_GATE.lock().unwrap_or_else(PoisonError::into_inner);

        self.platform.prepare()?;
        let current = self.platform.current_thread();
        let tids = self.platform.enumerate_threads()?;

        let mut set = FreezeSet::capture(&self.platform, current, &tids);
        debug!(
            "Freezing {} of {} threads (caller {})",
            set.records.len(),
            tids.len(),
            current
        );

        // No allocation or logging from here until the set is thawed
        set.suspend_all();
        let value = action();
        let report = set.finish();

        report.log();
        Ok((value, report))
    }
}

/// [`Freezer::focus`] on a default [`Freezer`]
pub fn focus<F, R>(action: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    Freezer::new()?.focus(action)
}

struct ThreadRecord<H> {
    tid: Tid,
    handle: Option<H>,
    suspended: bool,
}

/// Threads captured by one `focus` call.
///
/// Thaws and releases on drop, so an unwinding action cannot leave threads
/// suspended or handles open.
struct FreezeSet<'p, P: ThreadPlatform> {
    platform: &'p P,
    records: Vec<ThreadRecord<P::Handle>>,
    failures: Vec<ThreadFailure>,
    enumerated: usize,
    skipped: usize,
    suspended: usize,
    resumed: usize,
    frozen_at: Option<Instant>,
    frozen_for: Duration,
    thawed: bool,
}

impl<'p, P: ThreadPlatform> FreezeSet<'p, P> {
    fn capture(platform: &'p P, current: Tid, tids: &[Tid]) -> Self {
        let mut records = Vec::with_capacity(tids.len());
        let mut skipped = 0;

        // Identity, not run state: the caller is the only thread left out
        for &tid in tids.iter().filter(|&&tid| tid != current) {
            match platform.acquire(tid) {
                Ok(handle) => records.push(ThreadRecord {
                    tid,
                    handle: Some(handle),
                    suspended: false,
                }),
                Err(e) => {
                    debug!("Skipping thread {}: {}", tid, e);
                    skipped += 1;
                }
            }
        }

        // A record fails at most once: either it never suspends or its resume fails
        let failures = Vec::with_capacity(records.len());

        Self {
            platform,
            records,
            failures,
            enumerated: tids.len(),
            skipped,
            suspended: 0,
            resumed: 0,
            frozen_at: None,
            frozen_for: Duration::ZERO,
            thawed: false,
        }
    }

    fn suspend_all(&mut self) {
        self.frozen_at = Some(Instant::now());

        for record in self.records.iter_mut() {
            let Some(handle) = record.handle.as_ref() else {
                continue;
            };
            match self.platform.suspend(handle) {
                Ok(()) => {
                    record.suspended = true;
                    self.suspended += 1;
                }
                Err(fault) => self.failures.push(ThreadFailure {
                    tid: record.tid,
                    stage: Stage::Suspend,
                    fault,
                }),
            }
        }
    }

    fn thaw(&mut self) {
        if self.thawed {
            return;
        }
        self.thawed = true;

        for record in self.records.iter_mut().filter(|r| r.suspended) {
            let Some(handle) = record.handle.as_ref() else {
                continue;
            };
            match self.platform.resume(handle) {
                Ok(()) => self.resumed += 1,
                Err(fault) => self.failures.push(ThreadFailure {
                    tid: record.tid,
                    stage: Stage::Resume,
                    fault,
                }),
            }
            record.suspended = false;
        }

        if let Some(frozen_at) = self.frozen_at {
            self.frozen_for = frozen_at.elapsed();
        }

        for record in self.records.iter_mut() {
            if let Some(handle) = record.handle.take() {
                self.platform.release(handle);
            }
        }
    }

    fn report(&mut self) -> FreezeReport {
        FreezeReport {
            enumerated: self.enumerated,
            captured: self.records.len(),
            skipped: self.skipped,
            suspended: self.suspended,
            resumed: self.resumed,
            failures: mem::take(&mut self.failures),
            frozen_for: self.frozen_for,
        }
    }

    fn finish(mut self) -> FreezeReport {
        self.thaw();
        self.report()
    }
}

impl<P: ThreadPlatform> Drop for FreezeSet<'_, P> {
    fn drop(&mut self) {
        if !self.thawed {
            self.thaw();
            self.report().log();
        }
    }
}
