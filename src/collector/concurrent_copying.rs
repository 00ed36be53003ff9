use std::ptr::NonNull;
use std::time::Instant;

use crate::{
    api::{HeapObjectHeader, Visitor},
    bitmap::ObjectBitmap,
    card_table::CardTable,
    collector::{GarbageCollector, GcType},
    heap::Heap,
    mutator::{oom_abort, Mutator},
    region_space::{RegionState, RegionSpace},
    safepoint::SafepointScope,
    statistics::GcCause,
    utils::formatted_size,
};

/// Region based copying collector. Marking runs concurrently and tallies
/// per-region live bytes; the evacuation itself happens inside the final
/// pause, region by region, skipping regions dense enough that copying them
/// would not pay off.
///
/// In generational mode a sticky cycle only evacuates regions allocated
/// since the previous cycle; references into them from everything older are
/// found through the remembered sets, the mod-union tables and card scans
/// over the old regions.
pub struct ConcurrentCopying {
    pub base: GarbageCollector,
    mark_stack: Vec<*mut HeapObjectHeader>,
    /// Everything marked outside the immune spaces, revisited by the fixup
    /// pass after evacuation.
    marked_objects: Vec<*mut HeapObjectHeader>,
    region_bitmap: ObjectBitmap,
    candidates: Vec<usize>,
    /// Set by the marking visitor when it saw a reference into the region
    /// space; drives remembered set card retention.
    found_region_reference: bool,
    copied_objects: usize,
    copied_bytes: usize,
    fallback_objects: usize,
}

struct CcMarkVisitor {
    cc: *mut ConcurrentCopying,
    heap: *mut Heap,
    gc_type: GcType,
    clear_soft: bool,
}

impl Visitor for CcMarkVisitor {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        unsafe {
            (*self.cc).mark_object(&mut *self.heap, self.gc_type, root.as_ptr());
        }
    }

    fn mark_soft(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        if !self.clear_soft {
            self.mark_object(root);
        }
    }
}

/// Rewrites references to evacuated objects through the forwarding address
/// left in the old header. Idempotent, so revisiting a slot is harmless.
struct FixupVisitor {
    cc: *mut ConcurrentCopying,
    heap: *mut Heap,
}

impl Visitor for FixupVisitor {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        unsafe {
            let obj = root.as_ptr();
            let heap = &*self.heap;
            if let Some(region_space) = heap.region_space.as_ref() {
                if region_space.has_address(obj) {
                    (*self.cc).found_region_reference = true;
                    if (*obj).is_forwarded() {
                        *root = NonNull::new_unchecked((*obj).forwarding_address());
                    }
                }
            }
        }
    }
}

impl ConcurrentCopying {
    pub fn new(region_space: &RegionSpace) -> Self {
        Self {
            base: GarbageCollector::new("concurrent copying"),
            mark_stack: Vec::with_capacity(1024),
            marked_objects: Vec::new(),
            region_bitmap: ObjectBitmap::create(
                "region space bitmap",
                region_space.begin(),
                region_space.capacity(),
            ),
            candidates: Vec::new(),
            found_region_reference: false,
            copied_objects: 0,
            copied_bytes: 0,
            fallback_objects: 0,
        }
    }

    unsafe fn mark_object(&mut self, heap: &mut Heap, gc_type: GcType, obj: *mut HeapObjectHeader) {
        if obj.is_null() {
            return;
        }
        let region_space = heap.region_space.as_ref().unwrap();
        if region_space.has_address(obj) {
            self.found_region_reference = true;
            if !self.region_bitmap.atomic_test_and_set(obj.cast()) {
                region_space.region_for(obj).add_live_bytes((*obj).size());
                self.mark_stack.push(obj);
            }
            return;
        }
        if gc_type == GcType::Sticky {
            // Everything outside the region space is immune in a young
            // cycle.
            return;
        }
        if let Some(image) = heap.image_space.as_ref() {
            if image.has_address(obj) {
                return;
            }
        }
        if let Some(zygote) = heap.zygote_space.as_ref() {
            if zygote.has_address(obj) {
                return;
            }
        }
        if heap.main_space.has_address(obj) {
            if !heap.main_space.mark_bitmap().atomic_test_and_set(obj.cast()) {
                self.mark_stack.push(obj);
            }
            return;
        }
        if heap.non_moving_space.has_address(obj) {
            if !heap
                .non_moving_space
                .mark_bitmap()
                .atomic_test_and_set(obj.cast())
            {
                self.mark_stack.push(obj);
            }
            return;
        }
        if heap.large_space.contains_object(obj) {
            if !heap.large_space.test_and_set_marked(obj) {
                self.mark_stack.push(obj);
            }
        }
    }

    fn mark_visitor(&mut self, heap: &mut Heap, gc_type: GcType, clear_soft: bool) -> CcMarkVisitor {
        CcMarkVisitor {
            cc: self as *mut _,
            heap: heap as *mut _,
            gc_type,
            clear_soft,
        }
    }

    unsafe fn drain_mark_stack(&mut self, heap: &mut Heap, gc_type: GcType, clear_soft: bool) {
        let mut visitor = self.mark_visitor(heap, gc_type, clear_soft);
        while let Some(object) = self.mark_stack.pop() {
            self.marked_objects.push(object);
            (*object).get_dyn().trace(&mut visitor);
        }
    }

    unsafe fn mark_roots(&mut self, heap: &mut Heap, gc_type: GcType, clear_soft: bool) {
        let mut visitor = self.mark_visitor(heap, gc_type, clear_soft);
        let heap = &mut *(heap as *mut Heap);
        heap.walk_roots(&mut visitor);
    }

    /// Dense object walk over one region. Bump allocation keeps objects
    /// contiguous between the region's begin and top.
    unsafe fn walk_region(
        region_begin: *mut u8,
        region_top: *mut u8,
        mut visit: impl FnMut(*mut HeapObjectHeader),
    ) {
        let mut ptr = region_begin;
        while ptr < region_top {
            let obj = ptr.cast::<HeapObjectHeader>();
            let size = (*obj).size();
            if size == 0 {
                break;
            }
            visit(obj);
            ptr = ptr.add(size);
        }
    }

    /// Visit every object outside the candidate regions that may reference
    /// into them: mod-union cards of the immune spaces, remembered set cards
    /// of the malloc spaces, old regions with interesting cards and dirty
    /// large objects.
    ///
    /// Runs twice per sticky cycle, once with the marking visitor and once
    /// with the fixup visitor; `retain` controls whether exhausted remembered
    /// set cards and large object entries are dropped.
    unsafe fn scan_old_to_young(
        &mut self,
        heap: &mut Heap,
        mut visit: impl FnMut(&mut Self, *mut HeapObjectHeader),
        retain: bool,
    ) {
        let cc = self as *mut Self;
        let heap2 = &mut *(heap as *mut Heap);
        let card_table = &heap2.card_table;

        if let (Some(table), Some(image)) = (heap.image_mod_union.as_ref(), heap.image_space.as_ref())
        {
            table.update_and_mark_references(card_table, image.live_bitmap(), |obj| {
                visit(&mut *cc, obj);
            });
        }
        if let (Some(table), Some(zygote)) =
            (heap.zygote_mod_union.as_ref(), heap.zygote_space.as_ref())
        {
            table.update_and_mark_references(card_table, zygote.live_bitmap(), |obj| {
                visit(&mut *cc, obj);
            });
        }

        for (rem_set, space) in [
            (heap2.main_rem_set.as_mut(), &heap2.main_space),
            (heap2.non_moving_rem_set.as_mut(), &heap2.non_moving_space),
        ] {
            if let Some(rem_set) = rem_set {
                rem_set.update_and_mark_references(card_table, space.live_bitmap(), |obj| {
                    (*cc).found_region_reference = false;
                    visit(&mut *cc, obj);
                    // A false return drops the card, so without retention
                    // report every card as still interesting.
                    (*cc).found_region_reference || !retain
                });
            }
        }

        // Old regions whose cards were touched since the last cycle.
        let region_space = heap2.region_space.as_ref().unwrap();
        for region in region_space.regions() {
            if region.is_free()
                || region.state() == RegionState::LargeTail
                || self.candidates.contains(&region.idx())
            {
                continue;
            }
            let top = region.top();
            if !card_table.range_has_card_at_least(region.begin(), top, CardTable::CARD_AGED) {
                continue;
            }
            Self::walk_region(region.begin(), top, |obj| {
                visit(&mut *cc, obj);
            });
        }

        let dirty: Vec<_> = heap2.large_space.dirty_objects.drain(..).collect();
        for obj in dirty {
            (*cc).found_region_reference = false;
            visit(&mut *cc, obj);
            if retain && (*cc).found_region_reference {
                heap2.large_space.record_dirty_object(obj);
            }
        }
    }

    /// Copy every marked object out of the from-space regions, leaving
    /// forwarding addresses behind.
    unsafe fn evacuate(&mut self, heap: &mut Heap) {
        let heap2 = &mut *(heap as *mut Heap);
        let region_space = heap.region_space.as_ref().unwrap();
        for &idx in self.candidates.iter() {
            let region = &region_space.regions()[idx];
            if !region.is_in_from_space() || region.state() != RegionState::Allocated {
                continue;
            }
            let mut to_copy = Vec::new();
            self.region_bitmap
                .visit_marked_range(region.begin(), region.top(), |obj| {
                    to_copy.push(obj);
                });
            for obj in to_copy {
                let size = (*obj).size();
                let mut dst = heap2.region_space.as_mut().unwrap().alloc(size);
                if dst.is_null() {
                    let mut usable = 0;
                    dst = heap2.non_moving_space.alloc(size, &mut usable);
                    if !dst.is_null() {
                        heap2.non_moving_space.live_bitmap().set(dst);
                        heap2.non_moving_space.mark_bitmap().set(dst);
                        self.fallback_objects += 1;
                    }
                }
                if dst.is_null() {
                    log::error!(
                        "concurrent copying: no room to evacuate {} object",
                        formatted_size(size)
                    );
                    oom_abort();
                }
                core::ptr::copy_nonoverlapping(obj.cast::<u8>(), dst, size);
                (*obj).set_forwarded(dst as usize);
                self.copied_objects += 1;
                self.copied_bytes += size;
            }
        }
    }

    /// Rewrite every reference to an evacuated object. Revisits the roots,
    /// everything marked this cycle and the old-to-young scan set.
    unsafe fn fixup_references(&mut self, heap: &mut Heap) {
        let mut visitor = FixupVisitor {
            cc: self as *mut _,
            heap: heap as *mut _,
        };
        let heap2 = &mut *(heap as *mut Heap);
        heap2.walk_roots(&mut visitor);
        for i in 0..self.marked_objects.len() {
            let obj = self.marked_objects[i];
            let target = if (*obj).is_forwarded() {
                (*obj).forwarding_address()
            } else {
                obj
            };
            (*target).get_dyn().trace(&mut visitor);
        }
        let vis = &mut visitor as *mut FixupVisitor;
        self.scan_old_to_young(
            heap2,
            |_, obj| {
                (*obj).get_dyn().trace(&mut *vis);
            },
            true,
        );
    }

    pub fn run(
        &mut self,
        heap: &mut Heap,
        mutator: &Mutator,
        gc_type: GcType,
        cause: GcCause,
        clear_soft: bool,
    ) -> bool {
        debug_assert!(gc_type != GcType::Partial);
        let scope = match SafepointScope::new(mutator) {
            Some(scope) => scope,
            None => return false,
        };
        let start = Instant::now();
        let sticky = gc_type == GcType::Sticky;
        self.base.begin_cycle(cause);
        self.copied_objects = 0;
        self.copied_bytes = 0;
        self.fallback_objects = 0;
        self.marked_objects.clear();
        self.region_bitmap.clear_all();
        unsafe {
            heap.revoke_all_tlabs();
            heap.process_cards(gc_type);
            self.candidates = heap
                .region_space
                .as_mut()
                .unwrap()
                .prepare_for_marking(sticky);
            // Allocation during marking must go to fresh regions that are
            // not candidates.
            heap.region_space.as_mut().unwrap().revoke_current_region();
            if !sticky {
                heap.main_space.mark_bitmap().clear_all();
                heap.non_moving_space.mark_bitmap().clear_all();
                heap.large_space.prepare_for_marking(false);
                heap.swap_stacks();
            }

            self.mark_roots(heap, gc_type, clear_soft);
            let first_pause = start.elapsed();
            self.base.record_pause(first_pause);
            drop(scope);

            // Concurrent marking. Mutations are caught through dirty cards
            // in the final pause.
            let mut visitor = self.mark_visitor(heap, gc_type, clear_soft);
            let vis = &mut visitor as *mut CcMarkVisitor;
            self.scan_old_to_young(
                heap,
                |_, obj| {
                    (*obj).get_dyn().trace(&mut *vis);
                },
                false,
            );
            self.drain_mark_stack(heap, gc_type, clear_soft);

            let second_scope = match SafepointScope::new(mutator) {
                Some(scope) => scope,
                None => return false,
            };
            let pause_start = Instant::now();
            heap.revoke_all_tlabs();
            self.mark_roots(heap, gc_type, clear_soft);
            self.rescan_dirty(heap, gc_type, clear_soft);
            self.drain_mark_stack(heap, gc_type, clear_soft);

            heap.region_space.as_mut().unwrap().set_from_space(&self.candidates);
            self.evacuate(heap);
            self.fixup_references(heap);

            let heap_ptr = heap as *mut Heap;
            let cc = self as *mut Self;
            heap.process_references(|obj| {
                let region_space = (*heap_ptr).region_space.as_ref().unwrap();
                if region_space.has_address(obj) {
                    if (*obj).is_forwarded() {
                        Some((*obj).forwarding_address())
                    } else if (*cc).region_bitmap.test(obj.cast())
                        || !region_space.region_for(obj).is_in_from_space()
                    {
                        Some(obj)
                    } else {
                        None
                    }
                } else if sticky || (*heap_ptr).is_live_after_full_mark(obj) {
                    Some(obj)
                } else {
                    None
                }
            });

            let (region_objects, region_bytes) =
                heap.region_space.as_mut().unwrap().clear_from_space();
            let freed_objects = region_objects.saturating_sub(self.copied_objects);
            let freed_bytes = region_bytes.saturating_sub(self.copied_bytes);
            self.base.record_free(freed_objects, freed_bytes);
            heap.record_free(freed_objects, freed_bytes);

            if !sticky {
                self.sweep(heap);
                heap.live_stack.reset();
            }

            let pause = pause_start.elapsed();
            self.base.record_pause(pause);
            log::info!(
                "concurrent copying ({}): copied {} objects / {}, freed {}, pauses {:.4}ms+{:.4}ms",
                gc_type,
                self.copied_objects,
                formatted_size(self.copied_bytes),
                formatted_size(freed_bytes),
                first_pause.as_secs_f64() * 1000.0,
                pause.as_secs_f64() * 1000.0
            );
            drop(second_scope);
        }
        self.base.end_cycle(start.elapsed());
        true
    }

    /// Final pause rescan: cards dirtied while marking ran concurrently,
    /// plus objects allocated into the malloc spaces during that window.
    unsafe fn rescan_dirty(&mut self, heap: &mut Heap, gc_type: GcType, clear_soft: bool) {
        let mut visitor = self.mark_visitor(heap, gc_type, clear_soft);
        let heap2 = &mut *(heap as *mut Heap);
        for space in [&heap2.main_space, &heap2.non_moving_space] {
            heap2.card_table.scan(
                space.live_bitmap(),
                space.begin(),
                space.end(),
                CardTable::CARD_DIRTY,
                |obj| {
                    (*obj).get_dyn().trace(&mut visitor);
                },
            );
        }
        // Old regions picking up new references while marking ran.
        let region_space = heap2.region_space.as_ref().unwrap();
        for region in region_space.regions() {
            if region.is_free()
                || region.state() == RegionState::LargeTail
                || self.candidates.contains(&region.idx())
            {
                continue;
            }
            let top = region.top();
            if !heap2
                .card_table
                .range_has_card_at_least(region.begin(), top, CardTable::CARD_DIRTY)
            {
                continue;
            }
            Self::walk_region(region.begin(), top, |obj| {
                (*obj).get_dyn().trace(&mut visitor);
            });
        }

        let dirty: Vec<_> = heap2.large_space.dirty_objects.drain(..).collect();
        for obj in dirty.iter().copied() {
            (*obj).get_dyn().trace(&mut visitor);
        }
        for obj in dirty {
            heap2.large_space.record_dirty_object(obj);
        }
        for i in 0..heap2.allocation_stack.size() {
            let obj = heap2.allocation_stack.as_slice()[i];
            self.mark_object(heap2, gc_type, obj);
        }
    }

    unsafe fn sweep(&mut self, heap: &mut Heap) {
        heap.mark_alloc_stack_as_live();
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        {
            let heap2 = &mut *(heap as *mut Heap);
            heap.main_space.sweep(false, |obj| {
                freed_bytes += heap2.main_space.free(obj);
                freed_objects += 1;
            });
            heap.main_space.swap_bitmaps();
            heap.non_moving_space.sweep(false, |obj| {
                freed_bytes += heap2.non_moving_space.free(obj);
                freed_objects += 1;
            });
            heap.non_moving_space.swap_bitmaps();
        }
        // Zygote large objects stay immune, matching the untraced zygote
        // space above.
        let (los_objects, los_bytes) = heap.large_space.sweep(false);
        self.base.record_free(freed_objects, freed_bytes);
        self.base.record_free_los(los_objects, los_bytes);
        heap.record_free(freed_objects + los_objects, freed_bytes + los_bytes);
    }
}
