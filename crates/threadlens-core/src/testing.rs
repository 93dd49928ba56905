//! In-memory platform for exercising the freezer's control flow

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::platform::{PlatformFault, ThreadPlatform, Tid};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    Acquire(Tid),
    Suspend(Tid),
    Resume(Tid),
    Release(Tid),
}

/// Records every call and tracks a suspend count per thread
pub(crate) struct RecordingPlatform {
    current: Tid,
    threads: Vec<Tid>,
    fail_prepare: bool,
    fail_enumerate: bool,
    fail_acquire: Vec<Tid>,
    fail_suspend: Vec<Tid>,
    fail_resume: Vec<Tid>,
    calls: Mutex<Vec<Call>>,
    depth: Mutex<HashMap<Tid, i32>>,
    outstanding: AtomicUsize,
}

impl RecordingPlatform {
    pub(crate) fn new(current: i32, threads: &[i32]) -> Self {
        Self {
            current: Tid(current),
            threads: threads.iter().copied().map(Tid).collect(),
            fail_prepare: false,
            fail_enumerate: false,
            fail_acquire: Vec::new(),
            fail_suspend: Vec::new(),
            fail_resume: Vec::new(),
            calls: Mutex::new(Vec::new()),
            depth: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub(crate) fn failing_enumeration(mut self) -> Self {
        self.fail_enumerate = true;
        self
    }

    pub(crate) fn failing_acquire(mut self, tid: i32) -> Self {
        self.fail_acquire.push(Tid(tid));
        self
    }

    pub(crate) fn failing_suspend(mut self, tid: i32) -> Self {
        self.fail_suspend.push(Tid(tid));
        self
    }

    pub(crate) fn failing_resume(mut self, tid: i32) -> Self {
        self.fail_resume.push(Tid(tid));
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Current suspend count of `tid`
    pub(crate) fn depth(&self, tid: i32) -> i32 {
        self.depth.lock().unwrap().get(&Tid(tid)).copied().unwrap_or(0)
    }

    /// Threads with a non-zero suspend count, sorted
    pub(crate) fn frozen(&self) -> Vec<Tid> {
        let mut frozen: Vec<Tid> = self
            .depth
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, depth)| **depth > 0)
            .map(|(tid, _)| *tid)
            .collect();
        frozen.sort();
        frozen
    }

    /// Handles acquired and not yet released
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ThreadPlatform for RecordingPlatform {
    type Handle = Tid;

    fn prepare(&self) -> Result<()> {
        if self.fail_prepare {
            return Err(Error::Platform("suspend handler replaced".to_string()));
        }
        Ok(())
    }

    fn current_thread(&self) -> Tid {
        self.current
    }

    fn enumerate_threads(&self) -> Result<Vec<Tid>> {
        if self.fail_enumerate {
            return Err(Error::Enumeration("thread table unavailable".to_string()));
        }
        Ok(self.threads.clone())
    }

    fn acquire(&self, tid: Tid) -> Result<Tid> {
        self.record(Call::Acquire(tid));
        if self.fail_acquire.contains(&tid) {
            return Err(Error::Acquire {
                tid,
                reason: "access denied".to_string(),
            });
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(tid)
    }

    fn suspend(&self, handle: &Tid) -> std::result::Result<(), PlatformFault> {
        self.record(Call::Suspend(*handle));
        if self.fail_suspend.contains(handle) {
            return Err(PlatformFault::Timeout);
        }
        *self.depth.lock().unwrap().entry(*handle).or_insert(0) += 1;
        Ok(())
    }

    fn resume(&self, handle: &Tid) -> std::result::Result<(), PlatformFault> {
        self.record(Call::Resume(*handle));
        if self.fail_resume.contains(handle) {
            return Err(PlatformFault::Timeout);
        }
        *self.depth.lock().unwrap().entry(*handle).or_insert(0) -= 1;
        Ok(())
    }

    fn release(&self, handle: Tid) {
        self.record(Call::Release(handle));
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}
