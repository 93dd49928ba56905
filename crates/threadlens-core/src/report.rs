//! Outcome of one freeze session

use std::fmt;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::platform::{PlatformFault, Tid};

/// Phase in which a per-thread operation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Suspend,
    Resume,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Suspend => write!(f, "suspend"),
            Stage::Resume => write!(f, "resume"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadFailure {
    pub tid: Tid,
    pub stage: Stage,
    pub fault: PlatformFault,
}

/// What a `focus` call managed to freeze and thaw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreezeReport {
    /// Threads seen in the snapshot, calling thread included
    pub enumerated: usize,

    /// Threads a handle was acquired for
    pub captured: usize,

    /// Threads skipped because no handle could be acquired
    pub skipped: usize,

    /// Threads confirmed halted
    pub suspended: usize,

    /// Threads confirmed running again
    pub resumed: usize,

    /// Per-thread suspend/resume failures, in the order they happened
    pub failures: Vec<ThreadFailure>,

    /// Time between the first suspend and the last resume
    pub frozen_for: Duration,
}

impl FreezeReport {
    pub fn suspend_failures(&self) -> impl Iterator<Item = &ThreadFailure> {
        self.failures.iter().filter(|f| f.stage == Stage::Suspend)
    }

    pub fn resume_failures(&self) -> impl Iterator<Item = &ThreadFailure> {
        self.failures.iter().filter(|f| f.stage == Stage::Resume)
    }

    /// A thread may have been left halted
    pub fn is_degraded(&self) -> bool {
        self.resume_failures().next().is_some()
    }

    /// Every captured thread was frozen and thawed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn log(&self) {
        for failure in &self.failures {
            match failure.stage {
                Stage::Suspend => warn!(
                    "Thread {} was not frozen: {}",
                    failure.tid, failure.fault
                ),
                Stage::Resume => error!(
                    "Thread {} may still be suspended: {}",
                    failure.tid, failure.fault
                ),
            }
        }

        debug!(
            "Freeze session: enumerated={}, captured={}, skipped={}, suspended={}, resumed={}, frozen for {:?}",
            self.enumerated, self.captured, self.skipped, self.suspended, self.resumed, self.frozen_for
        );
    }
}

impl fmt::Display for FreezeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} threads, {} captured, {} skipped, {} suspended, {} resumed, {} failures, frozen for {:?}",
            self.enumerated,
            self.captured,
            self.skipped,
            self.suspended,
            self.resumed,
            self.failures.len(),
            self.frozen_for
        )
    }
}
