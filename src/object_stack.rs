use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::MmapMut;

use crate::api::HeapObjectHeader;

/// Fixed-capacity stack of object pointers backed by its own mapping.
///
/// Used for the allocation stack (objects allocated since the last GC), the
/// live stack it is swapped with, and collector mark stacks. Pushes can be
/// atomic so allocation never takes a lock; a failed push means the stack is
/// full and the caller must drain it (for the allocation stack, by forcing a
/// collection).
#[allow(dead_code)]
pub struct ObjectStack {
    name: &'static str,
    mem_map: MmapMut,
    begin: *mut *mut HeapObjectHeader,
    /// Index below which elements are valid. Only pop_front style draining by
    /// the collectors moves it.
    front_index: AtomicUsize,
    /// One past the last valid element.
    back_index: AtomicUsize,
    capacity: usize,
}

impl ObjectStack {
    pub fn create(name: &'static str, capacity: usize) -> Self {
        let mem_map = MmapMut::map_anon(capacity * std::mem::size_of::<*mut HeapObjectHeader>())
            .unwrap();
        let begin = mem_map.as_ptr() as *mut *mut HeapObjectHeader;
        Self {
            name,
            mem_map,
            begin,
            front_index: AtomicUsize::new(0),
            back_index: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free push. Returns false when the stack is full.
    #[inline]
    pub fn atomic_push_back(&self, value: *mut HeapObjectHeader) -> bool {
        let mut index;
        loop {
            index = self.back_index.load(Ordering::Relaxed);
            if index >= self.capacity {
                return false;
            }
            if self
                .back_index
                .compare_exchange_weak(index, index + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        unsafe {
            self.begin.add(index).write(value);
        }
        true
    }

    /// Push without synchronization. Callers must own the stack exclusively.
    #[inline]
    pub fn push_back(&self, value: *mut HeapObjectHeader) -> bool {
        let index = self.back_index.load(Ordering::Relaxed);
        if index >= self.capacity {
            return false;
        }
        unsafe {
            self.begin.add(index).write(value);
        }
        self.back_index.store(index + 1, Ordering::Relaxed);
        true
    }

    #[inline]
    pub fn pop_back(&self) -> Option<*mut HeapObjectHeader> {
        let index = self.back_index.load(Ordering::Relaxed);
        if index == self.front_index.load(Ordering::Relaxed) {
            return None;
        }
        self.back_index.store(index - 1, Ordering::Relaxed);
        Some(unsafe { self.begin.add(index - 1).read() })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.back_index.load(Ordering::Relaxed) >= self.capacity
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.back_index.load(Ordering::Relaxed) - self.front_index.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.front_index.store(0, Ordering::Relaxed);
        self.back_index.store(0, Ordering::Relaxed);
    }

    pub fn as_slice(&self) -> &[*mut HeapObjectHeader] {
        unsafe {
            std::slice::from_raw_parts(
                self.begin.add(self.front_index.load(Ordering::Relaxed)),
                self.size(),
            )
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [*mut HeapObjectHeader] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.begin.add(self.front_index.load(Ordering::Relaxed)),
                self.size(),
            )
        }
    }

    /// Sort and deduplicate so `contains` can binary search. Only done on the
    /// live stack during paused verification.
    pub fn sort(&mut self) {
        let slice = self.as_mut_slice();
        slice.sort_unstable();
        let front = self.front_index.load(Ordering::Relaxed);
        let mut unique = front;
        unsafe {
            for i in front..self.back_index.load(Ordering::Relaxed) {
                let value = self.begin.add(i).read();
                if unique == front || self.begin.add(unique - 1).read() != value {
                    self.begin.add(unique).write(value);
                    unique += 1;
                }
            }
        }
        self.back_index.store(unique, Ordering::Relaxed);
    }

    pub fn contains(&self, value: *mut HeapObjectHeader) -> bool {
        self.as_slice().contains(&value)
    }
}

unsafe impl Send for ObjectStack {}
unsafe impl Sync for ObjectStack {}
