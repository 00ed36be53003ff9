use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

use atomic::Atomic;

use crate::{api::HeapObjectHeader, bitmap::ObjectBitmap};

/// How a space behaves across the different collection depths.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcRetentionPolicy {
    /// Objects are never reclaimed (image space).
    NeverCollect,
    /// Only collected by a full collection (zygote space).
    FullCollect,
    /// Collected by every collection that visits the space.
    AlwaysCollect,
}

/// Contiguous range of the heap reservation. Spaces never own their payload
/// mapping; they are carved out of the single arena owned by the heap.
#[repr(C)]
pub struct ContinuousSpace {
    name: String,
    begin: *mut u8,
    pub(crate) end: Atomic<*mut u8>,
    limit: *mut u8,
    retention: GcRetentionPolicy,
    can_move_objects: bool,
}

impl ContinuousSpace {
    pub fn new(
        name: impl Into<String>,
        begin: *mut u8,
        end: *mut u8,
        limit: *mut u8,
        retention: GcRetentionPolicy,
        can_move_objects: bool,
    ) -> Self {
        Self {
            name: name.into(),
            begin,
            end: Atomic::new(end),
            limit,
            retention,
            can_move_objects,
        }
    }

    pub fn has_address(&self, obj: *const HeapObjectHeader) -> bool {
        obj >= self.begin as *const _ && obj < self.limit as *const _
    }

    pub fn contains(&self, obj: *const HeapObjectHeader) -> bool {
        self.has_address(obj)
    }

    pub fn end(&self) -> *mut u8 {
        self.end.load(atomic::Ordering::Relaxed)
    }

    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    pub fn limit(&self) -> *mut u8 {
        self.limit
    }

    pub fn size(&self) -> usize {
        self.end() as usize - self.begin() as usize
    }

    pub fn set_end(&self, end: *mut u8) {
        self.end.store(end, atomic::Ordering::Relaxed);
    }

    pub fn set_limit(&mut self, limit: *mut u8) {
        self.limit = limit;
    }

    pub fn capacity(&self) -> usize {
        self.limit() as usize - self.begin() as usize
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retention_policy(&self) -> GcRetentionPolicy {
        self.retention
    }

    pub fn set_retention_policy(&mut self, retention: GcRetentionPolicy) {
        self.retention = retention;
    }

    pub fn can_move_objects(&self) -> bool {
        self.can_move_objects
    }
}

/// Continuous space with live and mark bitmaps, the base of every space the
/// mark-sweep collectors operate on.
///
/// Bitmaps are reference counted so the mark bitmap can be bound to the live
/// bitmap for spaces a partial or sticky collection leaves alone; marking
/// through the bound bitmap then trivially keeps every object live and the
/// sweep of that space is a no-op.
#[repr(C)]
pub struct BitmapSpace {
    space: ContinuousSpace,
    live_bitmap: Arc<ObjectBitmap>,
    mark_bitmap: Arc<ObjectBitmap>,
    /// Holds the real mark bitmap while it is bound to the live bitmap.
    temp_bitmap: Option<Arc<ObjectBitmap>>,
}

impl BitmapSpace {
    pub fn create(
        name: impl Into<String>,
        begin: *mut u8,
        size: usize,
        capacity: usize,
        retention: GcRetentionPolicy,
        can_move_objects: bool,
    ) -> Self {
        assert!(size <= capacity);
        let end = unsafe { begin.add(size) };
        let limit = unsafe { begin.add(capacity) };
        let live_bitmap = Arc::new(ObjectBitmap::create("live bitmap", begin, capacity));
        let mark_bitmap = Arc::new(ObjectBitmap::create("mark bitmap", begin, capacity));
        Self {
            space: ContinuousSpace::new(name, begin, end, limit, retention, can_move_objects),
            live_bitmap,
            mark_bitmap,
            temp_bitmap: None,
        }
    }

    pub fn live_bitmap(&self) -> &ObjectBitmap {
        &self.live_bitmap
    }

    pub fn mark_bitmap(&self) -> &ObjectBitmap {
        &self.mark_bitmap
    }

    pub fn swap_bitmaps(&mut self) {
        std::mem::swap(&mut self.live_bitmap, &mut self.mark_bitmap);
    }

    /// Make marking through the mark bitmap write into the live bitmap.
    pub fn bind_live_to_mark_bitmap(&mut self) {
        debug_assert!(!self.has_bound_bitmaps());
        let mark = std::mem::replace(&mut self.mark_bitmap, self.live_bitmap.clone());
        self.temp_bitmap = Some(mark);
    }

    pub fn unbind_bitmaps(&mut self) {
        debug_assert!(self.has_bound_bitmaps());
        if let Some(mark) = self.temp_bitmap.take() {
            self.mark_bitmap = mark;
        }
    }

    pub fn has_bound_bitmaps(&self) -> bool {
        self.temp_bitmap.is_some()
    }

    /// Free everything live but not marked. `free` receives dead object
    /// headers; the owning allocator reclaims the memory. Bound bitmaps mean
    /// nothing in the space died, so the walk is skipped.
    pub fn sweep(&self, swap_bitmaps: bool, free: impl FnMut(*mut HeapObjectHeader)) {
        if Arc::ptr_eq(&self.live_bitmap, &self.mark_bitmap) {
            return;
        }
        let (mut live, mut mark) = (&*self.live_bitmap, &*self.mark_bitmap);
        if swap_bitmaps {
            std::mem::swap(&mut live, &mut mark);
        }
        ObjectBitmap::sweep_walk(
            live,
            mark,
            self.begin() as usize,
            self.end() as usize,
            free,
        );
    }
}

impl Deref for BitmapSpace {
    type Target = ContinuousSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}

impl DerefMut for BitmapSpace {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.space
    }
}

impl std::fmt::Debug for BitmapSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {:p}->{:p}(limit {:p})",
            self.name(),
            self.begin(),
            self.end(),
            self.limit()
        )
    }
}

unsafe impl Send for ContinuousSpace {}
unsafe impl Sync for ContinuousSpace {}
