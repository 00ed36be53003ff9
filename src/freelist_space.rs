use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
    ptr::null_mut,
};

use hashbrown::HashMap;

use crate::{
    api::HeapObjectHeader,
    space::{BitmapSpace, GcRetentionPolicy},
    utils::align_usize,
};

pub const PAGE_SIZE: usize = 4096;

/// Allocations up to this size are served from bracket runs, anything bigger
/// gets whole pages.
pub const LARGE_SIZE_THRESHOLD: usize = 2048;

const NUM_THREAD_BRACKETS: usize = 32;
const NUM_BRACKETS: usize = NUM_THREAD_BRACKETS + 2;

#[inline]
fn bracket_index(size: usize) -> usize {
    debug_assert!(size <= LARGE_SIZE_THRESHOLD);
    if size <= 512 {
        (size + 15) / 16 - 1
    } else if size <= 1024 {
        NUM_THREAD_BRACKETS
    } else {
        NUM_THREAD_BRACKETS + 1
    }
}

#[inline]
fn bracket_size(index: usize) -> usize {
    if index < NUM_THREAD_BRACKETS {
        (index + 1) * 16
    } else if index == NUM_THREAD_BRACKETS {
        1024
    } else {
        2048
    }
}

/// Free slots are chained through their first word.
#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PageState {
    Empty,
    /// Page carved into equal slots of one bracket.
    Run,
    /// First page of a multi-page allocation.
    LargeRun,
    /// Continuation of a multi-page allocation.
    LargeRunPart,
}

/// Per run-page bookkeeping.
struct Run {
    bracket: usize,
    allocated: u16,
    free_list: *mut FreeSlot,
}

/// Non-moving space with segregated size brackets backed by a page map, in
/// the malloc-space role: the collectors free into it object by object.
///
/// Small allocations come from runs, pages split into equal slots chained on
/// a per-run free list. Larger ones take whole page ranges. Empty runs and
/// ranges merge back into a map of free page runs so the space can report its
/// largest contiguous hole and return slack to the kernel.
pub struct FreeListSpace {
    space: BitmapSpace,
    page_map: Vec<PageState>,
    /// page index -> run length in pages, for every free range.
    free_page_runs: BTreeMap<usize, usize>,
    runs: HashMap<usize, Run>,
    /// Runs with at least one free slot, per bracket.
    non_full_runs: [Vec<usize>; NUM_BRACKETS],
    /// Length in pages of each large run, keyed by first page.
    large_runs: HashMap<usize, usize>,
    /// High-water page; pages past it have never been touched.
    footprint_pages: usize,
    capacity_pages: usize,
    bytes_allocated: usize,
    objects_allocated: usize,
}

impl FreeListSpace {
    pub fn create(
        name: impl Into<String>,
        begin: *mut u8,
        initial_size: usize,
        capacity: usize,
        can_move_objects: bool,
    ) -> Self {
        debug_assert!(is_page_aligned(begin as usize) && is_page_aligned(capacity));
        let capacity_pages = capacity / PAGE_SIZE;
        let mut this = Self {
            space: BitmapSpace::create(
                name,
                begin,
                initial_size,
                capacity,
                GcRetentionPolicy::AlwaysCollect,
                can_move_objects,
            ),
            page_map: vec![PageState::Empty; capacity_pages],
            free_page_runs: BTreeMap::new(),
            runs: HashMap::new(),
            non_full_runs: std::array::from_fn(|_| Vec::new()),
            large_runs: HashMap::new(),
            footprint_pages: 0,
            capacity_pages,
            bytes_allocated: 0,
            objects_allocated: 0,
        };
        this.free_page_runs.insert(0, capacity_pages);
        this
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated
    }

    /// Bytes of address space the space has ever touched.
    pub fn footprint(&self) -> usize {
        self.footprint_pages * PAGE_SIZE
    }

    /// Give up the underlying space, dropping the free-list metadata. Used
    /// when the compacted main space is sealed into the zygote space.
    pub fn into_bitmap_space(self) -> BitmapSpace {
        self.space
    }

    /// Largest allocation the space could currently satisfy.
    pub fn max_contiguous_allocation(&self) -> usize {
        self.free_page_runs
            .values()
            .copied()
            .max()
            .unwrap_or(0)
            .saturating_mul(PAGE_SIZE)
            .max(if self
                .non_full_runs
                .iter()
                .enumerate()
                .any(|(i, v)| !v.is_empty() && bracket_size(i) == 2048)
            {
                2048
            } else {
                0
            })
    }

    #[inline]
    fn page_addr(&self, page: usize) -> *mut u8 {
        unsafe { self.begin().add(page * PAGE_SIZE) }
    }

    #[inline]
    fn page_of(&self, ptr: *const u8) -> usize {
        (ptr as usize - self.begin() as usize) / PAGE_SIZE
    }

    /// Best-fit allocation of `n` contiguous pages.
    fn alloc_pages(&mut self, n: usize, state: PageState) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (&start, &len) in self.free_page_runs.iter() {
            if len >= n && best.map_or(true, |(_, blen)| len < blen) {
                best = Some((start, len));
                if len == n {
                    break;
                }
            }
        }
        let (start, len) = best?;
        self.free_page_runs.remove(&start);
        if len > n {
            self.free_page_runs.insert(start + n, len - n);
        }
        self.page_map[start] = state;
        if state == PageState::LargeRun {
            for i in 1..n {
                self.page_map[start + i] = PageState::LargeRunPart;
            }
        }
        if start + n > self.footprint_pages {
            self.footprint_pages = start + n;
            self.set_end(self.page_addr(self.footprint_pages));
        }
        Some(start)
    }

    fn free_pages(&mut self, start: usize, n: usize) {
        for i in 0..n {
            self.page_map[start + i] = PageState::Empty;
        }
        // Coalesce with neighbours.
        let mut start = start;
        let mut n = n;
        if let Some((&prev_start, &prev_len)) = self.free_page_runs.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free_page_runs.remove(&prev_start);
                start = prev_start;
                n += prev_len;
            }
        }
        if let Some(&next_len) = self.free_page_runs.get(&(start + n)) {
            self.free_page_runs.remove(&(start + n));
            n += next_len;
        }
        self.free_page_runs.insert(start, n);
    }

    fn new_run(&mut self, bracket: usize) -> Option<usize> {
        let page = self.alloc_pages(1, PageState::Run)?;
        let size = bracket_size(bracket);
        let slots = PAGE_SIZE / size;
        let base = self.page_addr(page);
        let mut head = null_mut::<FreeSlot>();
        unsafe {
            for i in (0..slots).rev() {
                let slot = base.add(i * size).cast::<FreeSlot>();
                (*slot).next = head;
                head = slot;
            }
        }
        self.runs.insert(
            page,
            Run {
                bracket,
                allocated: 0,
                free_list: head,
            },
        );
        self.non_full_runs[bracket].push(page);
        Some(page)
    }

    /// Allocate `size` bytes (header included). Returns null when the space
    /// cannot satisfy the request; usable size is written to `*usable`.
    pub fn alloc(&mut self, size: usize, usable: &mut usize) -> *mut u8 {
        let size = align_usize(size, 16);
        if size > LARGE_SIZE_THRESHOLD {
            let pages = align_usize(size, PAGE_SIZE) / PAGE_SIZE;
            let page = match self.alloc_pages(pages, PageState::LargeRun) {
                Some(page) => page,
                None => return null_mut(),
            };
            self.large_runs.insert(page, pages);
            *usable = pages * PAGE_SIZE;
            self.bytes_allocated += *usable;
            self.objects_allocated += 1;
            return self.page_addr(page);
        }

        let bracket = bracket_index(size);
        let page = match self.non_full_runs[bracket].last().copied() {
            Some(page) => page,
            None => match self.new_run(bracket) {
                Some(page) => page,
                None => return null_mut(),
            },
        };
        let bsize = bracket_size(bracket);
        let run = self.runs.get_mut(&page).unwrap();
        let slot = run.free_list;
        debug_assert!(!slot.is_null());
        unsafe {
            run.free_list = (*slot).next;
        }
        run.allocated += 1;
        if run.free_list.is_null() {
            self.non_full_runs[bracket].retain(|&p| p != page);
        }
        *usable = bsize;
        self.bytes_allocated += bsize;
        self.objects_allocated += 1;
        slot.cast()
    }

    /// Free one object, returning the bytes reclaimed.
    pub fn free(&mut self, obj: *mut HeapObjectHeader) -> usize {
        let ptr = obj.cast::<u8>();
        debug_assert!(self.has_address(obj));
        let page = self.page_of(ptr);
        match self.page_map[page] {
            PageState::LargeRun => {
                let pages = self.large_runs.remove(&page).unwrap();
                self.free_pages(page, pages);
                self.bytes_allocated -= pages * PAGE_SIZE;
                self.objects_allocated -= 1;
                self.live_bitmap().clear(ptr);
                pages * PAGE_SIZE
            }
            PageState::Run => {
                let page_base = self.page_addr(page) as usize;
                let run = self.runs.get_mut(&page).unwrap();
                let bracket = run.bracket;
                let bsize = bracket_size(bracket);
                debug_assert_eq!((ptr as usize - page_base) % bsize, 0);
                let was_full = run.free_list.is_null();
                let slot = ptr.cast::<FreeSlot>();
                unsafe {
                    (*slot).next = run.free_list;
                }
                run.free_list = slot;
                run.allocated -= 1;
                let now_empty = run.allocated == 0;
                if now_empty {
                    self.runs.remove(&page);
                    self.non_full_runs[bracket].retain(|&p| p != page);
                    self.free_pages(page, 1);
                } else if was_full {
                    self.non_full_runs[bracket].push(page);
                }
                self.bytes_allocated -= bsize;
                self.objects_allocated -= 1;
                self.live_bitmap().clear(ptr);
                bsize
            }
            state => unreachable!("freeing {:p} in page state {:?}", obj, state),
        }
    }

    /// Bytes backing `obj`, bracket or page rounded.
    pub fn allocation_size(&self, obj: *const HeapObjectHeader) -> usize {
        let page = self.page_of(obj.cast());
        match self.page_map[page] {
            PageState::LargeRun => self.large_runs[&page] * PAGE_SIZE,
            PageState::Run => bracket_size(self.runs[&page].bracket),
            state => unreachable!("sizing {:p} in page state {:?}", obj, state),
        }
    }

    /// Release the physical pages of every free run through `release`.
    /// Returns the number of bytes handed back.
    pub fn trim(&mut self, mut release: impl FnMut(*mut u8, usize)) -> usize {
        let mut reclaimed = 0;
        let runs: Vec<(usize, usize)> = self
            .free_page_runs
            .iter()
            .map(|(&s, &l)| (s, l))
            .collect();
        for (start, len) in runs {
            let len = len.min(self.footprint_pages.saturating_sub(start));
            if len == 0 {
                continue;
            }
            release(self.page_addr(start), len * PAGE_SIZE);
            reclaimed += len * PAGE_SIZE;
        }
        reclaimed
    }
}

#[inline]
fn is_page_aligned(x: usize) -> bool {
    x % PAGE_SIZE == 0
}

impl Deref for FreeListSpace {
    type Target = BitmapSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}

impl DerefMut for FreeListSpace {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.space
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brackets_round_trip() {
        for size in (16..=LARGE_SIZE_THRESHOLD).step_by(16) {
            let idx = bracket_index(size);
            assert!(bracket_size(idx) >= size);
        }
        assert_eq!(bracket_size(bracket_index(16)), 16);
        assert_eq!(bracket_size(bracket_index(513)), 1024);
        assert_eq!(bracket_size(bracket_index(2048)), 2048);
    }
}
