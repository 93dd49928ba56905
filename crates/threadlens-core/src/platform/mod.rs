//! OS boundary of the freezer
//!
//! The freezer only needs a handful of primitives from the operating system:
//! list the threads of the current process, tell which one is calling,
//! acquire a suspend/resume capability for a thread, and suspend or resume
//! through that capability. [`ThreadPlatform`] names exactly those.
//!
//! [`SignalPlatform`] is the Linux implementation. It parks threads inside a
//! signal handler, see [`parking`] for the handshake.

use nix::errno::Errno;
use std::fmt;

use crate::Result;

mod parking;
pub mod signal;

pub use parking::PARKING_SLOTS;
pub use signal::{ParkHandle, SignalPlatform};

/// Kernel thread id (the value `gettid(2)` returns)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub i32);

impl Tid {
    pub fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a single suspend or resume did not go through.
///
/// `Copy` and allocation-free: faults are recorded while other threads are
/// frozen, and a frozen thread may hold the allocator lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFault {
    /// The kernel refused to deliver the suspend signal
    Signal(Errno),
    /// The thread did not acknowledge in time
    Timeout,
    /// The handle was not in the state the operation expects
    InvalidState,
}

impl fmt::Display for PlatformFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformFault::Signal(errno) => write!(f, "signal delivery failed: {}", errno),
            PlatformFault::Timeout => write!(f, "no acknowledgement before timeout"),
            PlatformFault::InvalidState => write!(f, "handle in unexpected state"),
        }
    }
}

/// Thread control primitives consumed by [`crate::Freezer`].
///
/// `suspend` and `resume` run while other threads of the process are halted,
/// so implementations must neither allocate nor take locks in them.
pub trait ThreadPlatform {
    /// Per-thread suspend/resume capability
    type Handle;

    /// Check the platform is still usable, before anything is suspended
    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Id of the calling thread
    fn current_thread(&self) -> Tid;

    /// Point-in-time snapshot of the process's threads, calling thread included
    fn enumerate_threads(&self) -> Result<Vec<Tid>>;

    /// Acquire a handle for `tid`, failing if the thread is gone or out of reach
    fn acquire(&self, tid: Tid) -> Result<Self::Handle>;

    /// Halt the thread behind `handle`; returns once it is confirmed halted
    fn suspend(&self, handle: &Self::Handle) -> std::result::Result<(), PlatformFault>;

    /// Let a previously suspended thread run again
    fn resume(&self, handle: &Self::Handle) -> std::result::Result<(), PlatformFault>;

    /// Give the handle back
    fn release(&self, handle: Self::Handle) {
        drop(handle);
    }
}
