//! Signal-based thread suspension for Linux
//!
//! Linux has no `SuspendThread`; stopping signals act on the whole process.
//! A thread is suspended here by directing the suspend signal at it with
//! `tgkill(2)`. Its handler acknowledges through the parking table and sleeps
//! on a futex until the suspender releases it.
//!
//! Threads that block the suspend signal never acknowledge and are reported
//! as suspend timeouts. A signal that already carries another handler is
//! refused, and a session fails up front if our handler was replaced since.

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{getpid, gettid};
use procfs::process::Process;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::parking::{park_current, SlotRef};
use super::{PlatformFault, ThreadPlatform, Tid};
use crate::config::FreezerConfig;
use crate::{Error, Result};

/// Serializes the check-then-install of the suspend handler
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Suspend/resume capability for one thread.
///
/// Holds a slot of the parking table; dropping the handle frees the slot.
#[derive(Debug)]
pub struct ParkHandle {
    tid: Tid,
    slot: SlotRef,
}

impl ParkHandle {
    pub fn tid(&self) -> Tid {
        self.tid
    }
}

/// [`ThreadPlatform`] backed by `/proc/self/task`, `tgkill(2)` and futexes
#[derive(Debug, Clone)]
pub struct SignalPlatform {
    signal: Signal,
    ack_timeout: Duration,
    release_timeout: Duration,
}

impl SignalPlatform {
    /// Build a platform from `config`, installing the suspend handler if needed.
    ///
    /// Fails with [`Error::Platform`] if the signal already has a handler that
    /// is not ours; that handler is left in place. The handler stays installed for the lifetime of the process: a suspend
    /// signal that arrives after its request was abandoned must still hit our
    /// handler, not the default disposition (which terminates the process).
    pub fn new(config: &FreezerConfig) -> Result<Self> {
        config.validate()?;
        let signal = config.signal()?;
        install_handler(signal)?;

        Ok(Self {
            signal,
            ack_timeout: config.ack_timeout(),
            release_timeout: config.release_timeout(),
        })
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }
}

impl ThreadPlatform for SignalPlatform {
    type Handle = ParkHandle;

    fn current_thread(&self) -> Tid {
        Tid(gettid().as_raw())
    }

    fn prepare(&self) -> Result<()> {
        match disposition(self.signal)? {
            Disposition::Ours => Ok(()),
            Disposition::Default => Err(Error::Platform(format!(
                "Suspend handler for {} is no longer installed",
                self.signal.as_str()
            ))),
            Disposition::Foreign => Err(Error::Platform(format!(
                "Suspend handler for {} was replaced by another handler",
                self.signal.as_str()
            ))),
        }
    }

    fn enumerate_threads(&self) -> Result<Vec<Tid>> {
        let process = Process::myself()?;
        let tids = process
            .tasks()?
            // A task that vanished mid-listing is simply not part of the snapshot
            .filter_map(|task| task.ok())
            .map(|task| Tid(task.tid))
            .collect();
        Ok(tids)
    }

    fn acquire(&self, tid: Tid) -> Result<ParkHandle> {
        let acquire_err = |reason: String| Error::Acquire { tid, reason };

        let stat = Process::myself()
            .and_then(|process| process.task_from_tid(tid.as_raw()))
            .and_then(|task| task.stat())
            .map_err(|e| acquire_err(e.to_string()))?;

        // Zombie or dead: nothing left to run, nothing to suspend
        if matches!(stat.state, 'Z' | 'X' | 'x') {
            return Err(acquire_err(format!("thread has exited (state {})", stat.state)));
        }

        let slot = SlotRef::claim(tid).ok_or_else(|| {
            acquire_err(format!(
                "parking table full ({} slots)",
                super::PARKING_SLOTS
            ))
        })?;

        Ok(ParkHandle { tid, slot })
    }

    fn suspend(&self, handle: &ParkHandle) -> std::result::Result<(), PlatformFault> {
        handle.slot.request()?;

        let rc = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                getpid().as_raw(),
                handle.tid.as_raw(),
                self.signal as libc::c_int,
            )
        };
        if rc != 0 {
            let errno = Errno::last();
            handle.slot.cancel_request();
            return Err(PlatformFault::Signal(errno));
        }

        handle.slot.await_parked(self.ack_timeout)
    }

    fn resume(&self, handle: &ParkHandle) -> std::result::Result<(), PlatformFault> {
        handle.slot.unpark(self.release_timeout)
    }
}

/// Who currently handles a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// `SIG_DFL` or `SIG_IGN`
    Default,
    Ours,
    /// Some other handler the application installed
    Foreign,
}

/// Read the current disposition of `signal` without changing it
fn disposition(signal: Signal) -> Result<Disposition> {
    let mut current = MaybeUninit::<libc::sigaction>::uninit();
    let rc = unsafe { libc::sigaction(signal as libc::c_int, ptr::null(), current.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::Platform(format!(
            "Failed to query {} disposition: {}",
            signal.as_str(),
            Errno::last()
        )));
    }

    let handler = unsafe { current.assume_init() }.sa_sigaction;
    Ok(if handler == on_suspend_signal as libc::sighandler_t {
        Disposition::Ours
    } else if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        Disposition::Default
    } else {
        Disposition::Foreign
    })
}

fn install_handler(signal: Signal) -> Result<()> {
    let _lock = INSTALL_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    match disposition(signal)? {
        Disposition::Ours => return Ok(()),
        Disposition::Foreign => {
            return Err(Error::Platform(format!(
                "{} already has a handler installed, refusing to replace it",
                signal.as_str()
            )))
        }
        Disposition::Default => {}
    }

    // SA_RESTART keeps interrupted syscalls of the parked thread transparent
    let action = SigAction::new(
        SigHandler::Handler(on_suspend_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(signal, &action) }.map_err(|e| {
        Error::Platform(format!(
            "Failed to install {} handler: {}",
            signal.as_str(),
            e
        ))
    })?;

    debug!("Installed suspend handler for {}", signal.as_str());
    Ok(())
}

extern "C" fn on_suspend_signal(_signum: libc::c_int) {
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        let tid = libc::syscall(libc::SYS_gettid) as i32;
        park_current(tid);
        *errno = saved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn platform() -> SignalPlatform {
        SignalPlatform::new(&FreezerConfig::default()).unwrap()
    }

    #[test]
    fn test_enumeration_includes_current_thread() {
        let platform = platform();
        let current = platform.current_thread();
        let tids = platform.enumerate_threads().unwrap();
        assert!(tids.contains(&current));
    }

    #[test]
    fn test_enumeration_sees_spawned_thread() {
        let platform = platform();
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_worker = stop.clone();

        let worker = thread::spawn(move || {
            tx.send(Tid(gettid().as_raw())).unwrap();
            while !stop_worker.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }
        });

        let worker_tid = rx.recv().unwrap();
        assert!(platform.enumerate_threads().unwrap().contains(&worker_tid));

        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();
    }

    #[test]
    fn test_acquire_nonexistent_thread_fails() {
        let platform = platform();
        let result = platform.acquire(Tid(5_100_000));
        assert!(matches!(result, Err(Error::Acquire { .. })));
    }

    #[test]
    fn test_suspend_and_resume_worker() {
        let platform = platform();
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_worker = stop.clone();

        let worker = thread::spawn(move || {
            tx.send(Tid(gettid().as_raw())).unwrap();
            while !stop_worker.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        });

        let tid = rx.recv().unwrap();
        let handle = platform.acquire(tid).unwrap();
        assert_eq!(handle.tid(), tid);

        platform.suspend(&handle).unwrap();
        platform.resume(&handle).unwrap();
        platform.release(handle);

        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();
    }

    #[test]
    fn test_handler_reused_across_platforms() {
        let first = platform();
        let second = platform();
        assert_eq!(first.signal(), second.signal());
        assert_eq!(disposition(Signal::SIGUSR2).unwrap(), Disposition::Ours);
        second.prepare().unwrap();
    }

    static APP_HITS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn app_handler(_signum: libc::c_int) {
        APP_HITS.fetch_add(1, Ordering::SeqCst);
    }

    fn set_app_handler(signal: Signal) {
        let action = SigAction::new(
            SigHandler::Handler(app_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe { sigaction(signal, &action) }.unwrap();
    }

    fn config_for(signal: Signal) -> FreezerConfig {
        FreezerConfig {
            suspend_signal: signal.as_str().to_string(),
            ..FreezerConfig::default()
        }
    }

    #[test]
    fn test_existing_handler_is_kept() {
        // SIGUSR1 is used by this test only
        set_app_handler(Signal::SIGUSR1);
        raise(Signal::SIGUSR1).unwrap();
        let hits = APP_HITS.load(Ordering::SeqCst);
        assert!(hits >= 1);

        let result = SignalPlatform::new(&config_for(Signal::SIGUSR1));
        assert!(matches!(result, Err(Error::Platform(_))));

        assert_eq!(disposition(Signal::SIGUSR1).unwrap(), Disposition::Foreign);
        raise(Signal::SIGUSR1).unwrap();
        assert!(APP_HITS.load(Ordering::SeqCst) > hits);
    }

    #[test]
    fn test_replaced_handler_detected() {
        // SIGWINCH is used by this test only
        let installed = SignalPlatform::new(&config_for(Signal::SIGWINCH)).unwrap();
        installed.prepare().unwrap();

        set_app_handler(Signal::SIGWINCH);

        assert!(matches!(installed.prepare(), Err(Error::Platform(_))));
        assert!(matches!(
            SignalPlatform::new(&config_for(Signal::SIGWINCH)),
            Err(Error::Platform(_))
        ));
        assert_eq!(disposition(Signal::SIGWINCH).unwrap(), Disposition::Foreign);
    }
}
