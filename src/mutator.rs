use std::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
    sync::Arc,
};

use atomic::{Atomic, Ordering};
use parking_lot::{Condvar, Mutex};

use crate::{
    api::{Collectable, Gc, Trace},
    heap::Heap,
    safepoint::GlobalSafepoint,
    shadow_stack::ShadowStack,
    tlab::Tlab,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Running managed code; must park for pauses.
    Unsafe = 0,
    /// Parked at a safepoint.
    Waiting = 1,
    /// Outside managed code (blocking syscalls, native work); pauses do not
    /// wait for it.
    Safe = 2,
}

/// A thread attached to the heap. Owns the thread's TLAB and shadow stack
/// and participates in the safepoint protocol.
pub struct Mutator {
    pub(crate) tlab: Tlab,
    pub(crate) state: Atomic<ThreadState>,
    safepoint: *const GlobalSafepoint,
    last_sp: Cell<*mut *mut u8>,
    join_data: Arc<JoinDataInternal>,
    shadow_stack: ShadowStack,
    pub(crate) heap: Arc<UnsafeCell<Heap>>,
    rc: u32,
}

impl Mutator {
    pub(crate) fn new(
        heap: Arc<UnsafeCell<Heap>>,
        safepoint: *const GlobalSafepoint,
        join_data: Arc<JoinDataInternal>,
    ) -> Mutator {
        Mutator {
            heap,
            safepoint,
            state: Atomic::new(ThreadState::Unsafe),
            tlab: Tlab::new(),
            last_sp: Cell::new(null_mut()),
            join_data,
            shadow_stack: ShadowStack::new(),
            rc: 1,
        }
    }

    /// Spawn a mutator thread attached to the heap.
    pub fn spawn_mutator<F>(&self, closure: F) -> JoinData
    where
        F: FnOnce(MutatorRef) + Send + 'static,
    {
        let state = self.enter_unsafe();
        let heap = self.heap_ref();
        let join_data = JoinData::new();
        let mut mutator = MutatorRef::new(Mutator::new(
            self.heap.clone(),
            heap.safepoint(),
            join_data.internal.clone(),
        ));

        heap.attach_current_thread(&mut *mutator);
        // Counts as stopped until the new thread actually runs.
        mutator.state_save_and_set(ThreadState::Safe);
        drop(state);
        std::thread::spawn(move || {
            mutator.state_set(ThreadState::Unsafe, ThreadState::Safe);
            closure(mutator.clone());
            mutator.stop();
            drop(mutator);
        });

        join_data
    }

    pub(crate) fn heap_ref(&self) -> &mut Heap {
        unsafe { &mut *self.heap.get() }
    }

    pub fn shadow_stack(&self) -> &'static ShadowStack {
        unsafe { std::mem::transmute(&self.shadow_stack) }
    }

    pub fn global_safepoint(&self) -> &GlobalSafepoint {
        unsafe { &*self.safepoint }
    }

    pub(crate) fn state(&self) -> ThreadState {
        self.state.load(Ordering::Relaxed)
    }

    pub(crate) fn set_gc_and_wait(&self) {
        let state = self.state.load(Ordering::Relaxed);
        self.state.store(ThreadState::Waiting, Ordering::Release);
        self.global_safepoint().wait_gc();
        self.state.store(state, Ordering::Release);
    }

    /// Poll for a pending pause. Returns true when the thread parked.
    #[inline(always)]
    pub fn safepoint(&self) -> bool {
        let safepoint = self.global_safepoint();
        if safepoint.gc_running.load(Ordering::Relaxed) != 0 {
            self.safepoint_slow();
            return true;
        }
        false
    }

    #[inline(never)]
    #[cold]
    fn safepoint_slow(&self) {
        self.last_sp.set(approximate_stack_pointer());
        self.set_gc_and_wait();
    }

    pub(crate) fn state_set(&self, state: ThreadState, old_state: ThreadState) -> ThreadState {
        self.last_sp.set(approximate_stack_pointer());
        if state == old_state {
            return old_state;
        }
        self.state.store(state, Ordering::Release);
        match (old_state, state) {
            // Leaving the safe region blocks while a pause runs.
            (ThreadState::Safe, _) => self.global_safepoint().notify_running(),
            (_, ThreadState::Safe) => self.global_safepoint().notify_stopped(),
            _ => (),
        }
        if state == ThreadState::Unsafe {
            self.safepoint();
        }
        old_state
    }

    pub(crate) fn state_save_and_set(&self, state: ThreadState) -> ThreadState {
        self.state_set(state, self.state.load(Ordering::Relaxed))
    }

    pub fn enter_unsafe(&self) -> MutatorStateGuard {
        let state = self.state_save_and_set(ThreadState::Unsafe);
        MutatorStateGuard {
            mutator: self as *const Self,
            gc_state: state,
        }
    }

    /// Mark the thread as outside managed code for the guard's lifetime, so
    /// pauses do not wait for it.
    pub fn enter_safe(&self) -> MutatorStateGuard {
        let state = self.state_save_and_set(ThreadState::Safe);
        MutatorStateGuard {
            mutator: self as *const Self,
            gc_state: state,
        }
    }

    pub(crate) fn stop(&self) {
        let mut running = self.join_data.running.lock();
        *running = false;
        self.join_data.cv_stopped.notify_all();
    }

    pub(crate) fn reset_tlab(&mut self) {
        self.tlab.reset();
    }
}

impl MutatorRef {
    /// Record a reference store into `object` so a later collection rescans
    /// it for young pointers.
    pub fn write_barrier(&self, object: Gc<dyn Collectable>) {
        self.heap_ref().write_barrier(object.raw());
    }

    /// Request an explicit full collection.
    pub fn collect(&self, keep: &mut [&mut dyn Trace]) {
        self.heap_ref().collect_explicit(self, keep);
    }

    /// Allocate `T` on the managed heap.
    #[inline(always)]
    pub fn allocate<T: Collectable + Sized + 'static>(&mut self, value: T) -> Gc<T> {
        let heap = unsafe { &mut *self.heap.get() };
        heap.allocate(self, value)
    }
}

#[inline(always)]
fn approximate_stack_pointer() -> *mut *mut u8 {
    let mut result = null_mut();
    result = &mut result as *mut *mut *mut u8 as *mut *mut u8;
    result
}

/// Restores the saved thread state on drop.
pub struct MutatorStateGuard {
    mutator: *const Mutator,
    gc_state: ThreadState,
}

impl Drop for MutatorStateGuard {
    fn drop(&mut self) {
        unsafe {
            (*self.mutator).state_save_and_set(self.gc_state);
        }
    }
}

pub(crate) struct JoinDataInternal {
    running: Mutex<bool>,
    cv_stopped: Condvar,
}

impl JoinDataInternal {
    fn new() -> JoinDataInternal {
        JoinDataInternal {
            running: Mutex::new(true),
            cv_stopped: Condvar::new(),
        }
    }
}

/// Handle for waiting on a spawned mutator thread without blocking pauses.
pub struct JoinData {
    pub(crate) internal: Arc<JoinDataInternal>,
}

impl JoinData {
    pub(crate) fn new() -> Self {
        Self {
            internal: Arc::new(JoinDataInternal::new()),
        }
    }

    pub fn join(self, mutator: &Mutator) {
        let state = mutator.enter_safe();
        let mut running = self.internal.running.lock();
        while *running {
            self.internal.cv_stopped.wait(&mut running);
        }
        drop(state);
    }
}

unsafe impl Send for Mutator {}

impl Drop for Mutator {
    fn drop(&mut self) {
        let mptr = self as *mut Self;
        let heap = self.heap_ref();
        heap.detach_current_thread(mptr);
        self.stop();
    }
}

/// Reference-counted handle to a [Mutator]. Cheap to clone within the owning
/// thread; the mutator detaches from the heap when the last handle drops.
pub struct MutatorRef {
    mutator: NonNull<Mutator>,
}

impl MutatorRef {
    pub fn new(mutator: Mutator) -> Self {
        Self {
            mutator: unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(mutator))) },
        }
    }
}

impl Deref for MutatorRef {
    type Target = Mutator;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutator.as_ptr() }
    }
}

impl DerefMut for MutatorRef {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutator.as_ptr() }
    }
}

impl Clone for MutatorRef {
    fn clone(&self) -> Self {
        unsafe {
            (*self.mutator.as_ptr()).rc += 1;
            Self {
                mutator: self.mutator,
            }
        }
    }
}

impl Drop for MutatorRef {
    fn drop(&mut self) {
        unsafe {
            (*self.mutator.as_ptr()).rc -= 1;
            if (*self.mutator.as_ptr()).rc == 0 {
                core::ptr::drop_in_place(self.mutator.as_ptr());
                drop(Box::from_raw(self.mutator.as_ptr().cast::<std::mem::MaybeUninit<Mutator>>()));
            }
        }
    }
}

unsafe impl Send for MutatorRef {}

#[cold]
pub fn oom_abort() -> ! {
    eprintln!("OutOfMemory");
    std::process::abort();
}
