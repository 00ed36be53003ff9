use std::ptr::null_mut;

/// Default thread local allocation buffer size.
pub const TLAB_SIZE: usize = 32 * 1024;

/// Allocations above this go to the shared allocator even when a TLAB has
/// room, so one big object cannot burn most of a buffer.
pub const TLAB_OBJECT_SIZE_LIMIT: usize = 8 * 1024;

/// Thread local allocation buffer. A mutator bumps through its buffer with
/// no synchronization; the space the buffer came from only learns about the
/// usage when the buffer is retired.
pub struct Tlab {
    pub start: *mut u8,
    pub cursor: *mut u8,
    pub end: *mut u8,
    objects: usize,
}

impl Tlab {
    pub fn new() -> Self {
        Self {
            start: null_mut(),
            cursor: null_mut(),
            end: null_mut(),
            objects: 0,
        }
    }

    #[inline(always)]
    pub fn can_allocate(size: usize) -> bool {
        size <= TLAB_OBJECT_SIZE_LIMIT
    }

    #[inline(always)]
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if self.cursor.is_null() {
            return null_mut();
        }
        unsafe {
            let result = self.cursor;
            let new_cursor = result.add(size);
            if new_cursor > self.end {
                return null_mut();
            }
            self.cursor = new_cursor;
            self.objects += 1;
            result
        }
    }

    pub fn fill(&mut self, start: *mut u8, end: *mut u8) {
        self.start = start;
        self.cursor = start;
        self.end = end;
        self.objects = 0;
    }

    pub fn reset(&mut self) {
        self.start = null_mut();
        self.cursor = null_mut();
        self.end = null_mut();
        self.objects = 0;
    }

    pub fn is_valid(&self) -> bool {
        !self.start.is_null()
    }

    pub fn used_bytes(&self) -> usize {
        self.cursor as usize - self.start as usize
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects
    }
}
