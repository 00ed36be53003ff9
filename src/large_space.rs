use std::{
    ptr::null_mut,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::api::HeapObjectHeader;

/// Header placed in front of every large object. The object payload is always
/// aligned to [HALF_ALIGNMENT](PreciseAllocation::HALF_ALIGNMENT) but not to
/// [ALIGNMENT](PreciseAllocation::ALIGNMENT), so a pointer with the half
/// alignment bit set is recognizably large.
#[repr(C)]
pub struct PreciseAllocation {
    /// Allocation request size, without this header.
    pub cell_size: usize,
    mark: AtomicBool,
    /// Index in the space's allocation vector.
    pub index_in_space: u32,
    /// Was the base pointer shifted by half alignment to unalign the cell?
    pub adjusted_alignment: bool,
    /// Allocated since the last collection finished; sticky collections only
    /// sweep these.
    pub is_newly_allocated: bool,
    /// Allocated before the zygote fork. Spared by everything but a full
    /// collection.
    pub is_zygote: bool,
}

impl PreciseAllocation {
    pub const ALIGNMENT: usize = 16;
    /// Alignment of the pointer returned by [cell](PreciseAllocation::cell).
    pub const HALF_ALIGNMENT: usize = Self::ALIGNMENT / 2;

    /// Check whether `raw_ptr` points at a large object cell.
    pub fn is_precise(raw_ptr: *mut ()) -> bool {
        (raw_ptr as usize & Self::HALF_ALIGNMENT) != 0
    }

    pub fn from_cell(ptr: *mut HeapObjectHeader) -> *mut Self {
        unsafe {
            ptr.cast::<u8>()
                .offset(-(Self::header_size() as isize))
                .cast()
        }
    }

    #[inline]
    pub fn base_pointer(&self) -> *mut () {
        if self.adjusted_alignment {
            ((self as *const Self as isize) - (Self::HALF_ALIGNMENT as isize)) as *mut ()
        } else {
            self as *const Self as *mut ()
        }
    }

    /// Cell address, always aligned to `Self::HALF_ALIGNMENT` but never to
    /// `Self::ALIGNMENT`.
    pub fn cell(&self) -> *mut HeapObjectHeader {
        let addr = unsafe { (self as *const Self as *const u8).add(Self::header_size()) };
        addr as _
    }

    pub fn above_lower_bound(&self, raw_ptr: *mut ()) -> bool {
        raw_ptr >= self.cell() as *mut ()
    }

    pub fn below_upper_bound(&self, raw_ptr: *mut ()) -> bool {
        let begin = self.cell() as usize;
        raw_ptr as usize <= begin + self.cell_size + 8
    }

    /// Header size plus the padding that keeps the cell half-aligned.
    pub const fn header_size() -> usize {
        ((core::mem::size_of::<PreciseAllocation>() + Self::HALF_ALIGNMENT - 1)
            & !(Self::HALF_ALIGNMENT - 1))
            | Self::HALF_ALIGNMENT
    }

    pub fn contains(&self, raw_ptr: *mut ()) -> bool {
        self.above_lower_bound(raw_ptr) && self.below_upper_bound(raw_ptr)
    }

    pub fn is_marked(&self) -> bool {
        self.mark.load(Ordering::Relaxed)
    }

    /// Returns the previous mark state.
    pub fn test_and_set_marked(&self) -> bool {
        if self.is_marked() {
            return true;
        }
        self.mark
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
    }

    pub fn clear_marked(&self) {
        self.mark.store(false, Ordering::Relaxed);
    }

    pub fn is_newly_allocated(&self) -> bool {
        self.is_newly_allocated
    }

    pub fn is_live(&self) -> bool {
        self.is_marked() || self.is_newly_allocated
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn try_create(size: usize, index_in_space: u32) -> *mut Self {
        let adjusted_alignment_allocation_size = Self::header_size() + size + Self::HALF_ALIGNMENT;
        unsafe {
            let mut space = libc::malloc(adjusted_alignment_allocation_size).cast::<u8>();
            if space.is_null() {
                return null_mut();
            }

            let mut adjusted_alignment = false;
            if !is_aligned_for_precise_allocation(space) {
                space = space.add(Self::HALF_ALIGNMENT);
                adjusted_alignment = true;
                debug_assert!(is_aligned_for_precise_allocation(space));
            }
            debug_assert!(size != 0);
            space.cast::<Self>().write(Self {
                cell_size: size,
                mark: AtomicBool::new(false),
                index_in_space,
                adjusted_alignment,
                is_newly_allocated: true,
                is_zygote: false,
            });

            space.cast()
        }
    }

    pub fn destroy(&mut self) {
        let base = self.base_pointer();
        unsafe {
            libc::free(base as _);
        }
    }
}

/// Check if `mem` is aligned for a precise allocation header.
pub fn is_aligned_for_precise_allocation(mem: *mut u8) -> bool {
    (mem as usize & (PreciseAllocation::ALIGNMENT - 1)) == 0
}

/// Discontinuous space for objects above the large object threshold. Each
/// object gets its own malloc'd region and is never moved.
pub struct LargeObjectSpace {
    pub(crate) allocations: Vec<*mut PreciseAllocation>,
    bytes_allocated: usize,
    objects_allocated: usize,
    total_bytes_allocated: usize,
    /// Allocations at indices below this were alive at the end of the last
    /// collection; sticky collections only consider the rest.
    nursery_offset: usize,
    /// First index the current collection will sweep.
    sweep_offset: usize,
    /// Large objects holding references into the moving spaces. Maintained by
    /// the write barrier since the card table does not cover malloc'd memory.
    pub(crate) dirty_objects: Vec<*mut HeapObjectHeader>,
}

impl LargeObjectSpace {
    pub fn new() -> Self {
        Self {
            allocations: Vec::new(),
            bytes_allocated: 0,
            objects_allocated: 0,
            total_bytes_allocated: 0,
            nursery_offset: 0,
            sweep_offset: 0,
            dirty_objects: Vec::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated
    }

    pub fn total_bytes_allocated(&self) -> usize {
        self.total_bytes_allocated
    }

    pub fn allocate(&mut self, size: usize) -> *mut HeapObjectHeader {
        unsafe {
            let index = self.allocations.len();
            let memory = PreciseAllocation::try_create(size, index as _);
            if memory.is_null() {
                return null_mut();
            }

            self.allocations.push(memory);
            self.bytes_allocated += (*memory).cell_size();
            self.total_bytes_allocated += (*memory).cell_size();
            self.objects_allocated += 1;
            let cell = (*memory).cell();
            // Size of zero in the header marks the object as large.
            (*cell).set_large();
            cell
        }
    }

    /// Byte size of the large object holding `object`.
    pub fn allocation_size(&self, object: *const HeapObjectHeader) -> usize {
        unsafe { (*PreciseAllocation::from_cell(object as _)).cell_size() }
    }

    pub fn contains_object(&self, object: *const HeapObjectHeader) -> bool {
        if !PreciseAllocation::is_precise(object as _) {
            return false;
        }
        let prec = PreciseAllocation::from_cell(object as _);
        self.allocations
            .get(unsafe { (*prec).index_in_space as usize })
            .map_or(false, |&p| p == prec)
    }

    pub fn is_marked(&self, object: *const HeapObjectHeader) -> bool {
        unsafe { (*PreciseAllocation::from_cell(object as _)).is_marked() }
    }

    /// Mark `object`, returning whether it was already marked.
    pub fn test_and_set_marked(&self, object: *const HeapObjectHeader) -> bool {
        unsafe { (*PreciseAllocation::from_cell(object as _)).test_and_set_marked() }
    }

    /// Note a large object that now references a moving space.
    pub fn record_dirty_object(&mut self, object: *mut HeapObjectHeader) {
        self.dirty_objects.push(object);
    }

    /// Pin every current allocation as a zygote large object.
    pub fn set_all_large_objects_as_zygote(&mut self) {
        for &alloc in self.allocations.iter() {
            unsafe {
                (*alloc).is_zygote = true;
            }
        }
    }

    /// Decide the sweep window and clear mark bits ahead of marking. A sticky
    /// collection keeps everything allocated before the last cycle implicitly
    /// live.
    pub fn prepare_for_marking(&mut self, sticky: bool) {
        self.sweep_offset = if sticky { self.nursery_offset } else { 0 };
        for i in self.sweep_offset..self.allocations.len() {
            unsafe {
                let alloc = self.allocations[i];
                (*alloc).is_newly_allocated = false;
                (*alloc).clear_marked();
            }
        }
    }

    /// Sweep unmarked allocations in the current window, compacting the
    /// allocation vector. Returns (objects freed, bytes freed). Zygote
    /// allocations are only freed when `full` is set.
    pub fn sweep(&mut self, full: bool) -> (usize, usize) {
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        let mut src_index = self.sweep_offset;
        let mut dst_index = src_index;
        while src_index < self.allocations.len() {
            let allocation = self.allocations[src_index];
            src_index += 1;
            unsafe {
                let dead = !(*allocation).is_live() && (full || !(*allocation).is_zygote);
                if dead {
                    freed_objects += 1;
                    freed_bytes += (*allocation).cell_size();
                    self.bytes_allocated -= (*allocation).cell_size();
                    self.objects_allocated -= 1;
                    (*allocation).destroy();
                } else {
                    (*allocation).index_in_space = dst_index as u32;
                    self.allocations[dst_index] = allocation;
                    dst_index += 1;
                    (*allocation).clear_marked();
                }
            }
        }
        self.allocations.truncate(dst_index);
        self.nursery_offset = self.allocations.len();
        (freed_objects, freed_bytes)
    }
}

impl Drop for LargeObjectSpace {
    fn drop(&mut self) {
        while let Some(alloc) = self.allocations.pop() {
            unsafe {
                (*alloc).destroy();
            }
        }
    }
}

unsafe impl Send for LargeObjectSpace {}
