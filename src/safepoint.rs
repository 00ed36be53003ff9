use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::mutator::{Mutator, ThreadState};

/// Brings all threads with heap access to a stop, so a pause-requiring
/// collection phase can run.
///
/// A mutator counts as stopped while it is parked in [wait_gc] or while its
/// state says it is outside managed code. Threads re-entering managed code
/// while a pause is active park first.
pub struct GlobalSafepoint {
    /// Non-zero while some thread owns a safepoint. Mutators poll this.
    pub(crate) gc_running: AtomicU32,
    pub(crate) n_mutators: AtomicU32,
    threads_stopped: AtomicU32,
    lock: Mutex<()>,
    cv_stopped: Condvar,
    cv_resume: Condvar,
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            gc_running: AtomicU32::new(0),
            n_mutators: AtomicU32::new(0),
            threads_stopped: AtomicU32::new(0),
            lock: Mutex::new(()),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
        }
    }

    /// Park the calling mutator until the current pause ends.
    pub fn wait_gc(&self) {
        let mut guard = self.lock.lock();
        self.threads_stopped.fetch_add(1, Ordering::SeqCst);
        self.cv_stopped.notify_all();
        while self.gc_running.load(Ordering::SeqCst) != 0 {
            self.cv_resume.wait(&mut guard);
        }
        self.threads_stopped.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
    }

    /// A mutator left managed code; it no longer blocks pauses.
    pub(crate) fn notify_stopped(&self) {
        let guard = self.lock.lock();
        self.threads_stopped.fetch_add(1, Ordering::SeqCst);
        self.cv_stopped.notify_all();
        drop(guard);
    }

    /// A mutator wants back into managed code; holds it out while a pause is
    /// running.
    pub(crate) fn notify_running(&self) {
        let mut guard = self.lock.lock();
        while self.gc_running.load(Ordering::SeqCst) != 0 {
            self.cv_resume.wait(&mut guard);
        }
        self.threads_stopped.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
    }

    fn begin(&self) -> bool {
        self.gc_running
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn wait_until_stopped(&self, threads: u32) {
        let mut guard = self.lock.lock();
        while self.threads_stopped.load(Ordering::SeqCst) < threads {
            self.cv_stopped.wait(&mut guard);
        }
        drop(guard);
    }

    fn end(&self) {
        let guard = self.lock.lock();
        self.gc_running.store(0, Ordering::SeqCst);
        self.cv_resume.notify_all();
        drop(guard);
    }
}

/// World-stopped scope. While it lives every attached mutator except the
/// requesting one is parked.
pub struct SafepointScope {
    safepoint: *const GlobalSafepoint,
}

impl SafepointScope {
    /// Try to stop the world from `mutator`'s thread. Returns None when
    /// another thread already owns a safepoint; the caller is parked until
    /// that pause finishes and should re-evaluate whether its own pause is
    /// still needed.
    pub fn new(mutator: &Mutator) -> Option<Self> {
        let safepoint = mutator.global_safepoint();
        if !safepoint.begin() {
            mutator.safepoint();
            return None;
        }
        debug_assert_eq!(mutator.state(), ThreadState::Unsafe);
        let others = safepoint.n_mutators.load(Ordering::SeqCst) - 1;
        safepoint.wait_until_stopped(others);
        Some(Self {
            safepoint: safepoint as *const _,
        })
    }

    pub(crate) fn safepoint(&self) -> &GlobalSafepoint {
        unsafe { &*self.safepoint }
    }
}

impl Drop for SafepointScope {
    fn drop(&mut self) {
        self.safepoint().end();
    }
}
