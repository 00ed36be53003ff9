use std::{
    ops::{Deref, DerefMut},
    ptr::null_mut,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    api::HeapObjectHeader,
    space::{ContinuousSpace, GcRetentionPolicy},
    utils::align_usize,
};

/// Moving space allocated front to back with a CAS on the end pointer.
/// Backs the semi-space collector and serves as the allocation space while a
/// copying collector is the foreground collector.
pub struct BumpPointerSpace {
    space: ContinuousSpace,
    objects_allocated: AtomicUsize,
    bytes_allocated: AtomicUsize,
}

impl BumpPointerSpace {
    pub fn create(name: impl Into<String>, begin: *mut u8, capacity: usize) -> Self {
        let limit = unsafe { begin.add(capacity) };
        Self {
            space: ContinuousSpace::new(
                name,
                begin,
                begin,
                limit,
                GcRetentionPolicy::AlwaysCollect,
                true,
            ),
            objects_allocated: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
        }
    }

    /// Lock-free allocation of `size` bytes, already aligned by the caller.
    /// Null when the space is exhausted.
    #[inline]
    pub fn alloc(&self, size: usize) -> *mut u8 {
        debug_assert_eq!(size % 8, 0);
        let mut old = self.space.end.load(Ordering::Relaxed);
        let mut new;
        loop {
            unsafe {
                new = old.add(size);
                if new > self.limit() {
                    return null_mut();
                }

                let res = self.space.end.compare_exchange_weak(
                    old,
                    new,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                );
                match res {
                    Ok(_) => break,
                    Err(x) => old = x,
                }
            }
        }
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        old
    }

    /// Non-atomic variant for use inside pauses.
    ///
    /// # Safety
    ///
    /// No other thread may be allocating from this space.
    pub unsafe fn alloc_thread_unsafe(&self, size: usize) -> *mut u8 {
        let old = self.space.end.load(Ordering::Relaxed);
        let new = old.add(align_usize(size, 8));
        if new > self.limit() {
            return null_mut();
        }
        self.space.end.store(new, Ordering::Release);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        old
    }

    /// Carve out a thread-local allocation block. Returns (start, end) or
    /// None when the space cannot fit it. Usage inside the block is folded
    /// into the counters when the TLAB is retired, not here.
    pub fn alloc_block(&self, size: usize) -> Option<(*mut u8, *mut u8)> {
        let mut old = self.space.end.load(Ordering::Relaxed);
        loop {
            unsafe {
                let new = old.add(size);
                if new > self.limit() {
                    return None;
                }
                match self.space.end.compare_exchange_weak(
                    old,
                    new,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some((old, new)),
                    Err(x) => old = x,
                }
            }
        }
    }

    /// A thread retired a TLAB; fold its usage into the space counters.
    pub fn record_tlab_usage(&self, objects: usize, bytes: usize) {
        self.objects_allocated.fetch_add(objects, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Reset the counters after an in-place compaction resized the space to
    /// its survivors.
    pub fn record_compaction(&self, objects: usize, bytes: usize) {
        self.objects_allocated.store(objects, Ordering::Relaxed);
        self.bytes_allocated.store(bytes, Ordering::Relaxed);
    }

    /// Empty the space. The heap releases the physical pages afterwards.
    pub fn reset(&self) {
        self.set_end(self.begin());
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.bytes_allocated.store(0, Ordering::Relaxed);
    }

    /// Walk the allocated objects in address order. Requires the space to be
    /// densely packed, which holds during pauses after TLABs are revoked.
    pub unsafe fn walk(&self, mut visitor: impl FnMut(*mut HeapObjectHeader)) {
        let mut pos = self.begin();
        let end = self.end();
        while pos < end {
            let obj = pos.cast::<HeapObjectHeader>();
            if !(*obj).is_allocated() {
                break;
            }
            visitor(obj);
            pos = pos.add((*obj).size());
        }
    }
}

impl Deref for BumpPointerSpace {
    type Target = ContinuousSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}

impl DerefMut for BumpPointerSpace {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.space
    }
}
