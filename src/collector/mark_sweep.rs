use std::ptr::NonNull;
use std::time::Instant;

use threadfin::{Task, ThreadPool};

use crate::{
    api::{HeapObjectHeader, Visitor},
    card_table::CardTable,
    collector::{GarbageCollector, GcType},
    heap::Heap,
    mutator::Mutator,
    safepoint::SafepointScope,
    statistics::GcCause,
    utils::formatted_size,
};

/// Tracing mark-sweep over the free-list spaces, the zygote space and the
/// large object space. Runs fully stopped, or with concurrent marking and
/// sweeping in its concurrent configuration.
///
/// Depth comes from the requested [GcType]: a sticky cycle binds the live
/// bitmaps of the long-lived spaces so only objects allocated since the last
/// cycle are candidates, a partial cycle spares the zygote space and a full
/// cycle spares only the image space.
pub struct MarkSweep {
    pub base: GarbageCollector,
    concurrent: bool,
    mark_stack: Vec<*mut HeapObjectHeader>,
    /// Set by the marking visitor when it saw a reference into a sweepable
    /// space; drives dirty large object retention in sticky cycles.
    found_reference: bool,
    pool: ThreadPool,
    sweep_task: Option<Task<(f64, usize, usize)>>,
}

pub(crate) struct MarkObjectVisitor {
    ms: *mut MarkSweep,
    heap: *mut Heap,
    gc_type: GcType,
    clear_soft: bool,
}

impl Visitor for MarkObjectVisitor {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        unsafe {
            (*self.ms).mark_object(&mut *self.heap, self.gc_type, root.as_ptr());
        }
    }

    fn mark_soft(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        if !self.clear_soft {
            self.mark_object(root);
        }
    }
}

impl MarkSweep {
    pub fn new(concurrent: bool, gc_threads: usize) -> Self {
        Self {
            base: GarbageCollector::new(if concurrent {
                "concurrent mark sweep"
            } else {
                "mark sweep"
            }),
            concurrent,
            mark_stack: Vec::with_capacity(1024),
            found_reference: false,
            // Background workers, used for the concurrent sweep handoff.
            pool: ThreadPool::builder()
                .size(gc_threads.max(1))
                .stack_size(512 * 1024)
                .build(),
            sweep_task: None,
        }
    }

    /// Block until a concurrent sweep from the previous cycle has finished.
    pub fn wait_for_concurrent_sweep(&mut self, heap: &mut Heap) {
        if let Some(task) = self.sweep_task.take() {
            let (time_ms, freed_objects, freed_bytes) = task.join();
            heap.record_free(freed_objects, freed_bytes);
            log::debug!(
                "concurrent sweep end: freed {} in {:.4}ms",
                formatted_size(freed_bytes),
                time_ms
            );
        }
    }

    /// Mark `obj`, pushing it for tracing when this is the first visit.
    /// Spaces that the current depth does not collect are immune: objects in
    /// them are neither marked nor traced, their outgoing references are
    /// covered by mod-union tables and card scans.
    pub(crate) fn mark_object(
        &mut self,
        heap: &mut Heap,
        gc_type: GcType,
        obj: *mut HeapObjectHeader,
    ) {
        if obj.is_null() {
            return;
        }
        if let Some(image) = heap.image_space.as_ref() {
            if image.has_address(obj) {
                return;
            }
        }
        if let Some(zygote) = heap.zygote_space.as_ref() {
            if zygote.has_address(obj) {
                if gc_type != GcType::Full {
                    return;
                }
                if !zygote.mark_bitmap().atomic_test_and_set(obj.cast()) {
                    self.mark_stack.push(obj);
                }
                return;
            }
        }
        if heap.main_space.has_address(obj) {
            self.found_reference = true;
            if !heap.main_space.mark_bitmap().atomic_test_and_set(obj.cast()) {
                self.mark_stack.push(obj);
            }
            return;
        }
        if heap.non_moving_space.has_address(obj) {
            self.found_reference = true;
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
            self.found_reference = true;
            if !heap.large_space.test_and_set_marked(obj) {
                self.mark_stack.push(obj);
            }
        }
    }

    fn is_marked(heap: &Heap, gc_type: GcType, obj: *mut HeapObjectHeader) -> bool {
        if let Some(image) = heap.image_space.as_ref() {
            if image.has_address(obj) {
                return true;
            }
        }
        if let Some(zygote) = heap.zygote_space.as_ref() {
            if zygote.has_address(obj) {
                return gc_type != GcType::Full || zygote.mark_bitmap().test(obj.cast());
            }
        }
        if heap.main_space.has_address(obj) {
            return heap.main_space.mark_bitmap().test(obj.cast());
        }
        if heap.non_moving_space.has_address(obj) {
            return heap.non_moving_space.mark_bitmap().test(obj.cast());
        }
        if heap.large_space.contains_object(obj) {
            return heap.large_space.is_marked(obj);
        }
        false
    }

    fn visitor(&mut self, heap: &mut Heap, gc_type: GcType, clear_soft: bool) -> MarkObjectVisitor {
        MarkObjectVisitor {
            ms: self as *mut _,
            heap: heap as *mut _,
            gc_type,
            clear_soft,
        }
    }

    unsafe fn drain_mark_stack(&mut self, heap: &mut Heap, gc_type: GcType, clear_soft: bool) {
        let mut visitor = self.visitor(heap, gc_type, clear_soft);
        while let Some(object) = self.mark_stack.pop() {
            (*object).get_dyn().trace(&mut visitor);
        }
    }

    unsafe fn mark_roots(&mut self, heap: &mut Heap, gc_type: GcType, clear_soft: bool) {
        let mut visitor = self.visitor(heap, gc_type, clear_soft);
        let heap = &mut *(heap as *mut Heap);
        heap.walk_roots(&mut visitor);
    }

    /// Trace objects sitting on recorded image and zygote cards; these are
    /// the only way immune spaces keep collected-space objects alive.
    unsafe fn update_mod_union_tables(&mut self, heap: &mut Heap, gc_type: GcType, clear_soft: bool) {
        let mut visitor = self.visitor(heap, gc_type, clear_soft);
        let heap = &mut *(heap as *mut Heap);
        let card_table = &heap.card_table;
        if let (Some(table), Some(image)) = (heap.image_mod_union.as_ref(), heap.image_space.as_ref())
        {
            table.update_and_mark_references(card_table, image.live_bitmap(), |obj| {
                (*obj).get_dyn().trace(&mut visitor);
            });
        }
        if gc_type != GcType::Full {
            if let (Some(table), Some(zygote)) =
                (heap.zygote_mod_union.as_ref(), heap.zygote_space.as_ref())
            {
                table.update_and_mark_references(card_table, zygote.live_bitmap(), |obj| {
                    (*obj).get_dyn().trace(&mut visitor);
                });
            }
        }
    }

    /// Scan cards at or above `minimum_age` over the collected free-list
    /// spaces. Sticky cycles use this to find old-to-young references;
    /// concurrent cycles re-run it for cards dirtied while marking.
    unsafe fn scan_cards(
        &mut self,
        heap: &mut Heap,
        gc_type: GcType,
        clear_soft: bool,
        minimum_age: u8,
    ) {
        let mut visitor = self.visitor(heap, gc_type, clear_soft);
        let heap = &mut *(heap as *mut Heap);
        for space in [&heap.main_space, &heap.non_moving_space] {
            heap.card_table.scan(
                space.live_bitmap(),
                space.begin(),
                space.end(),
                minimum_age,
                |obj| {
                    (*obj).get_dyn().trace(&mut visitor);
                },
            );
        }
        // Large objects are outside the card table window; the write barrier
        // records them directly. Sticky cycles keep entries that still
        // reference a sweepable space, they are next cycle's old-to-young
        // set.
        let dirty: Vec<_> = heap.large_space.dirty_objects.drain(..).collect();
        for obj in dirty {
            self.found_reference = false;
            (*obj).get_dyn().trace(&mut visitor);
            if gc_type == GcType::Sticky && self.found_reference {
                heap.large_space.record_dirty_object(obj);
            }
        }
    }

    unsafe fn bind_bitmaps(&mut self, heap: &mut Heap, gc_type: GcType) {
        match gc_type {
            GcType::Sticky => {
                heap.main_space.bind_live_to_mark_bitmap();
                heap.non_moving_space.bind_live_to_mark_bitmap();
                if let Some(zygote) = heap.zygote_space.as_mut() {
                    zygote.bind_live_to_mark_bitmap();
                }
            }
            GcType::Partial => {
                heap.main_space.mark_bitmap().clear_all();
                heap.non_moving_space.mark_bitmap().clear_all();
                if let Some(zygote) = heap.zygote_space.as_mut() {
                    zygote.bind_live_to_mark_bitmap();
                }
            }
            GcType::Full => {
                heap.main_space.mark_bitmap().clear_all();
                heap.non_moving_space.mark_bitmap().clear_all();
                if let Some(zygote) = heap.zygote_space.as_ref() {
                    zygote.mark_bitmap().clear_all();
                }
            }
        }
    }

    unsafe fn unbind_bitmaps(&mut self, heap: &mut Heap) {
        if heap.main_space.has_bound_bitmaps() {
            heap.main_space.unbind_bitmaps();
        }
        if heap.non_moving_space.has_bound_bitmaps() {
            heap.non_moving_space.unbind_bitmaps();
        }
        if let Some(zygote) = heap.zygote_space.as_mut() {
            if zygote.has_bound_bitmaps() {
                zygote.unbind_bitmaps();
            }
        }
    }

    /// Sticky reclaim: only objects in the swapped allocation stack can be
    /// dead. Everything else kept its live bit from previous cycles.
    unsafe fn sweep_array(&mut self, heap: &mut Heap) {
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        let mut freed_los_objects = 0;
        let mut freed_los_bytes = 0;
        let live_stack = &heap.live_stack;
        for &obj in live_stack.as_slice() {
            if obj.is_null() {
                continue;
            }
            if heap.main_space.has_address(obj) {
                if !heap.main_space.mark_bitmap().test(obj.cast()) {
                    freed_bytes += heap.main_space.free(obj);
                    freed_objects += 1;
                }
            } else if heap.non_moving_space.has_address(obj) {
                if !heap.non_moving_space.mark_bitmap().test(obj.cast()) {
                    freed_bytes += heap.non_moving_space.free(obj);
                    freed_objects += 1;
                }
            }
        }
        let (objs, bytes) = heap.large_space.sweep(false);
        freed_los_objects += objs;
        freed_los_bytes += bytes;
        self.base.record_free(freed_objects, freed_bytes);
        self.base.record_free_los(freed_los_objects, freed_los_bytes);
        heap.record_free(
            freed_objects + freed_los_objects,
            freed_bytes + freed_los_bytes,
        );
    }

    /// Full reclaim over the space bitmaps. With `concurrent` the free-list
    /// walk is handed to the worker pool and joined at the start of the next
    /// cycle.
    unsafe fn sweep_spaces(&mut self, heap: &mut Heap, gc_type: GcType) {
        // Fold the swapped stack into the live bitmaps so the sweep can free
        // unmarked objects allocated since the last cycle.
        heap.mark_alloc_stack_as_live();

        if let Some(zygote) = heap.zygote_space.as_mut() {
            if gc_type == GcType::Full {
                let (objs, bytes) = zygote.sweep_full(true);
                self.base.record_free(objs, bytes);
                heap.record_free(objs, bytes);
            }
        }

        let full = gc_type == GcType::Full;
        if self.concurrent {
            // The large object sweep is a list scan, not worth handing off.
            let (los_objs, los_bytes) = heap.large_space.sweep(full);
            self.base.record_free_los(los_objs, los_bytes);
            heap.record_free(los_objs, los_bytes);
            let heap_addr = heap as *mut Heap as usize;
            self.sweep_task = Some(self.pool.execute(move || {
                let start = Instant::now();
                let heap = &mut *(heap_addr as *mut Heap);
                let (objects, bytes) = heap.sweep_malloc_spaces_locked(full);
                let elapsed = start.elapsed().as_micros() as f64 / 1000.0;
                (elapsed, objects, bytes)
            }));
        } else {
            let (objects, bytes) = heap.sweep_malloc_spaces_locked(full);
            self.base.record_free(objects, bytes);
            heap.record_free(objects, bytes);
            let (los_objs, los_bytes) = heap.large_space.sweep(full);
            self.base.record_free_los(los_objs, los_bytes);
            heap.record_free(los_objs, los_bytes);
        }
    }

    /// One collection cycle. The caller has already arbitrated which thread
    /// collects; this takes its own pauses.
    pub fn run(
        &mut self,
        heap: &mut Heap,
        mutator: &Mutator,
        gc_type: GcType,
        cause: GcCause,
        clear_soft: bool,
    ) -> bool {
        let scope = match SafepointScope::new(mutator) {
            Some(scope) => scope,
            None => return false,
        };
        let start = Instant::now();
        self.base.begin_cycle(cause);
        unsafe {
            self.wait_for_concurrent_sweep(heap);
            heap.revoke_all_tlabs();
            heap.process_cards(gc_type);
            self.bind_bitmaps(heap, gc_type);
            heap.large_space.prepare_for_marking(gc_type == GcType::Sticky);
            heap.swap_stacks();

            self.mark_roots(heap, gc_type, clear_soft);

            if self.concurrent {
                // Let the world run while the graph is traced; mutations are
                // caught through dirty cards in the final pause.
                let pause = start.elapsed();
                drop(scope);
                self.base.record_pause(pause);

                self.update_mod_union_tables(heap, gc_type, clear_soft);
                if gc_type == GcType::Sticky {
                    self.scan_cards(heap, gc_type, clear_soft, CardTable::CARD_AGED);
                }
                self.drain_mark_stack(heap, gc_type, clear_soft);

                let second_pause = match SafepointScope::new(mutator) {
                    Some(scope) => scope,
                    None => return false,
                };
                let pause_start = Instant::now();
                self.mark_roots(heap, gc_type, clear_soft);
                self.scan_cards(heap, gc_type, clear_soft, CardTable::CARD_DIRTY);
                // Objects allocated while marking ran are roots: a reference
                // stored into one may be the only remaining path to its
                // target.
                for i in 0..heap.allocation_stack.size() {
                    let obj = heap.allocation_stack.as_slice()[i];
                    self.mark_object(heap, gc_type, obj);
                }
                self.drain_mark_stack(heap, gc_type, clear_soft);
                self.finish_cycle(heap, gc_type);
                self.base.record_pause(pause_start.elapsed());
                drop(second_pause);
            } else {
                self.update_mod_union_tables(heap, gc_type, clear_soft);
                if gc_type == GcType::Sticky {
                    self.scan_cards(heap, gc_type, clear_soft, CardTable::CARD_AGED);
                }
                self.drain_mark_stack(heap, gc_type, clear_soft);
                self.finish_cycle(heap, gc_type);
                self.base.record_pause(start.elapsed());
                drop(scope);
            }
        }
        let duration = start.elapsed();
        log::info!(
            "{} {} gc({}): freed {} objects / {}, paused {:.3}ms, total {:.3}ms",
            self.base.name(),
            gc_type,
            cause,
            self.base.iteration.total_freed_objects(),
            formatted_size(self.base.iteration.total_freed_bytes()),
            self.base
                .iteration
                .pause_times
                .iter()
                .map(|d| d.as_secs_f64())
                .sum::<f64>()
                * 1000.0,
            duration.as_secs_f64() * 1000.0,
        );
        self.base.end_cycle(duration);
        true
    }

    unsafe fn finish_cycle(&mut self, heap: &mut Heap, gc_type: GcType) {
        debug_assert!(self.mark_stack.is_empty());
        let heap_ptr = heap as *mut Heap;
        heap.process_references(|obj| {
            if Self::is_marked(&*heap_ptr, gc_type, obj) {
                Some(obj)
            } else {
                None
            }
        });

        if gc_type == GcType::Sticky {
            self.sweep_array(heap);
        } else {
            self.sweep_spaces(heap, gc_type);
        }
        self.unbind_bitmaps(heap);
        heap.live_stack.reset();
    }
}
