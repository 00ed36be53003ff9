use std::{
    ops::{Deref, DerefMut},
    ptr::null_mut,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crate::{
    api::HeapObjectHeader,
    space::{ContinuousSpace, GcRetentionPolicy},
    utils::align_usize,
};

pub const REGION_SIZE: usize = 256 * 1024;

/// Objects of this size or more take whole regions.
pub const LARGE_REGION_THRESHOLD: usize = REGION_SIZE / 2;

/// Regions whose live ratio is at least this are not evacuated, their
/// objects stay put and are tracked through the unevacuated from-space type.
pub const EVACUATE_LIVE_PERCENT_THRESHOLD: usize = 75;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionState {
    Free,
    Allocated,
    /// First region of a multi-region allocation.
    Large,
    LargeTail,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionType {
    None,
    ToSpace,
    FromSpace,
    UnevacFromSpace,
}

pub struct Region {
    idx: usize,
    begin: *mut u8,
    top: AtomicPtr<u8>,
    end: *mut u8,
    state: RegionState,
    typ: RegionType,
    /// Live bytes as tallied during marking; drives the evacuation decision.
    live_bytes: AtomicUsize,
    objects_allocated: AtomicUsize,
    /// Allocated since the last collection; a generational cycle evacuates
    /// only these.
    newly_allocated: bool,
}

impl Region {
    fn new(idx: usize, begin: *mut u8) -> Self {
        Self {
            idx,
            begin,
            top: AtomicPtr::new(begin),
            end: unsafe { begin.add(REGION_SIZE) },
            state: RegionState::Free,
            typ: RegionType::None,
            live_bytes: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            newly_allocated: false,
        }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    pub fn top(&self) -> *mut u8 {
        self.top.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn region_type(&self) -> RegionType {
        self.typ
    }

    pub fn is_free(&self) -> bool {
        self.state == RegionState::Free
    }

    pub fn is_in_from_space(&self) -> bool {
        self.typ == RegionType::FromSpace
    }

    pub fn is_in_unevac_from_space(&self) -> bool {
        self.typ == RegionType::UnevacFromSpace
    }

    pub fn is_in_to_space(&self) -> bool {
        self.typ == RegionType::ToSpace
    }

    pub fn is_newly_allocated(&self) -> bool {
        self.newly_allocated
    }

    pub fn bytes_allocated(&self) -> usize {
        self.top() as usize - self.begin as usize
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// CAS bump allocation within the region.
    #[inline]
    fn alloc(&self, size: usize) -> *mut u8 {
        debug_assert_eq!(size % 8, 0);
        let mut old = self.top.load(Ordering::Relaxed);
        loop {
            let new = unsafe { old.add(size) };
            if new > self.end {
                return null_mut();
            }
            match self
                .top
                .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.objects_allocated.fetch_add(1, Ordering::Relaxed);
                    return old;
                }
                Err(x) => old = x,
            }
        }
    }

    fn reset(&mut self) {
        self.top.store(self.begin, Ordering::Relaxed);
        self.state = RegionState::Free;
        self.typ = RegionType::None;
        self.live_bytes.store(0, Ordering::Relaxed);
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.newly_allocated = false;
    }
}

/// Moving space divided into fixed-size regions, the allocation space of the
/// concurrent copying collector. Evacuation works region by region: mostly
/// dead regions are evacuated, dense ones are left in place.
pub struct RegionSpace {
    space: ContinuousSpace,
    regions: Vec<Region>,
    /// Region currently served to shared allocation, index into `regions`.
    current_region: usize,
    num_non_free_regions: usize,
}

impl RegionSpace {
    pub fn create(name: impl Into<String>, begin: *mut u8, capacity: usize) -> Self {
        let capacity = capacity - capacity % REGION_SIZE;
        let num_regions = capacity / REGION_SIZE;
        let limit = unsafe { begin.add(capacity) };
        let regions = (0..num_regions)
            .map(|i| Region::new(i, unsafe { begin.add(i * REGION_SIZE) }))
            .collect();
        Self {
            space: ContinuousSpace::new(
                name,
                begin,
                limit,
                limit,
                GcRetentionPolicy::AlwaysCollect,
                true,
            ),
            regions,
            current_region: usize::MAX,
            num_non_free_regions: 0,
        }
    }

    #[inline]
    pub fn region_for(&self, obj: *const HeapObjectHeader) -> &Region {
        debug_assert!(self.has_address(obj));
        let idx = (obj as usize - self.begin() as usize) / REGION_SIZE;
        &self.regions[idx]
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn bytes_allocated(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| !r.is_free())
            .map(|r| r.bytes_allocated())
            .sum()
    }

    pub fn objects_allocated(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| !r.is_free())
            .map(|r| r.objects_allocated())
            .sum()
    }

    pub fn non_free_region_count(&self) -> usize {
        self.num_non_free_regions
    }

    fn take_free_region(&mut self) -> Option<usize> {
        let idx = self.regions.iter().position(|r| r.is_free())?;
        let region = &mut self.regions[idx];
        region.state = RegionState::Allocated;
        region.typ = RegionType::ToSpace;
        region.newly_allocated = true;
        self.num_non_free_regions += 1;
        Some(idx)
    }

    /// Allocate from the shared allocation region, moving to a fresh one when
    /// it fills up. Requires external synchronization for the region switch;
    /// the bump inside a region is lock free.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let size = align_usize(size, 8);
        if size >= LARGE_REGION_THRESHOLD {
            return self.alloc_large(size);
        }
        if self.current_region != usize::MAX {
            let ptr = self.regions[self.current_region].alloc(size);
            if !ptr.is_null() {
                return ptr;
            }
        }
        match self.take_free_region() {
            Some(idx) => {
                self.current_region = idx;
                self.regions[idx].alloc(size)
            }
            None => null_mut(),
        }
    }

    /// Allocate a TLAB-sized block from a dedicated region walk.
    pub fn alloc_tlab(&mut self, size: usize) -> Option<(*mut u8, *mut u8)> {
        let ptr = self.alloc(size);
        if ptr.is_null() {
            None
        } else {
            Some((ptr, unsafe { ptr.add(size) }))
        }
    }

    fn alloc_large(&mut self, size: usize) -> *mut u8 {
        let needed = align_usize(size, REGION_SIZE) / REGION_SIZE;
        // First fit over runs of free regions.
        let mut run_start = 0;
        let mut run_len = 0;
        for i in 0..self.regions.len() {
            if self.regions[i].is_free() {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == needed {
                    for j in run_start..run_start + needed {
                        let region = &mut self.regions[j];
                        region.state = if j == run_start {
                            RegionState::Large
                        } else {
                            RegionState::LargeTail
                        };
                        region.typ = RegionType::ToSpace;
                        region.newly_allocated = true;
                        region.top.store(region.end, Ordering::Relaxed);
                    }
                    self.num_non_free_regions += needed;
                    self.regions[run_start]
                        .objects_allocated
                        .fetch_add(1, Ordering::Relaxed);
                    return self.regions[run_start].begin;
                }
            } else {
                run_len = 0;
            }
        }
        null_mut()
    }

    /// Snapshot the regions a starting cycle may evacuate and zero their
    /// live byte tallies. With `sticky` only newly allocated regions are
    /// candidates. Regions taken after this call are not candidates, so
    /// objects allocated while marking runs are implicitly live.
    pub fn prepare_for_marking(&mut self, sticky: bool) -> Vec<usize> {
        let mut candidates = Vec::new();
        for region in self.regions.iter_mut() {
            if region.is_free() {
                continue;
            }
            if sticky && !region.newly_allocated {
                continue;
            }
            region.live_bytes.store(0, Ordering::Relaxed);
            candidates.push(region.idx);
        }
        candidates
    }

    /// Turn the candidate regions into from-space at the flip. Dense regions
    /// and whole-region allocations stay put as unevacuated from-space.
    pub fn set_from_space(&mut self, candidates: &[usize]) {
        self.current_region = usize::MAX;
        for &idx in candidates {
            // Live bytes of a multi-region allocation are tallied on its
            // head, tails follow the head's verdict. Candidates come in
            // ascending order so the head is already classified.
            let head_is_from_space = idx > 0
                && matches!(
                    self.regions[idx - 1].state,
                    RegionState::Large | RegionState::LargeTail
                )
                && self.regions[idx - 1].typ == RegionType::FromSpace;
            let region = &mut self.regions[idx];
            let live = region.live_bytes.load(Ordering::Relaxed);
            let used = region.top() as usize - region.begin as usize;
            let dense = used > 0 && live * 100 >= used * EVACUATE_LIVE_PERCENT_THRESHOLD;
            let evacuate = match region.state {
                // A dead large allocation is dropped whole, never copied.
                RegionState::Large => live == 0,
                RegionState::LargeTail => head_is_from_space,
                _ => !dense,
            };
            region.typ = if evacuate {
                RegionType::FromSpace
            } else {
                RegionType::UnevacFromSpace
            };
            region.newly_allocated = false;
        }
    }

    /// Free every evacuated from-space region and return (objects, bytes)
    /// reclaimed. Unevacuated regions flip back to to-space.
    pub fn clear_from_space(&mut self) -> (usize, usize) {
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        for region in self.regions.iter_mut() {
            match region.typ {
                RegionType::FromSpace => {
                    freed_objects += region.objects_allocated();
                    freed_bytes += region.bytes_allocated();
                    region.reset();
                    self.num_non_free_regions -= 1;
                }
                RegionType::UnevacFromSpace => {
                    region.typ = RegionType::ToSpace;
                }
                _ => {}
            }
        }
        (freed_objects, freed_bytes)
    }

    /// Release physical pages of free regions through `release`.
    pub fn release_free_regions(&self, mut release: impl FnMut(*mut u8, usize)) {
        for region in self.regions.iter() {
            if region.is_free() {
                release(region.begin, REGION_SIZE);
            }
        }
    }

    pub fn revoke_current_region(&mut self) {
        self.current_region = usize::MAX;
    }
}

impl Deref for RegionSpace {
    type Target = ContinuousSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}

impl DerefMut for RegionSpace {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.space
    }
}

unsafe impl Send for RegionSpace {}
