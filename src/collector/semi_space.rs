use std::ptr::NonNull;
use std::time::Instant;

use crate::{
    api::{HeapObjectHeader, Visitor},
    collector::{GarbageCollector, GcType},
    heap::Heap,
    mutator::{oom_abort, Mutator},
    safepoint::SafepointScope,
    statistics::GcCause,
    utils::formatted_size,
};

/// What the copying phase evacuates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CopyMode {
    /// Evacuate the active bump pointer space into its twin. The normal
    /// foreground cycle and the transition into a bump pointer allocator.
    EvacuateBumpSpace,
    /// Evacuate the main free-list space into its backup, squeezing out
    /// fragmentation. Used for homogeneous space compaction.
    CompactMainSpace,
}

/// Stop the world copying collector. Traces the whole heap in one pause,
/// evacuating the from-space as it goes; the image and zygote spaces stay
/// immune behind their mod-union tables, the other malloc spaces and the
/// large object space are marked in place and swept.
pub struct SemiSpace {
    pub base: GarbageCollector,
    mark_stack: Vec<*mut HeapObjectHeader>,
    mode: CopyMode,
    copied_objects: usize,
    copied_bytes: usize,
    fallback_objects: usize,
}

struct ForwardVisitor {
    ss: *mut SemiSpace,
    heap: *mut Heap,
    clear_soft: bool,
}

impl Visitor for ForwardVisitor {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        unsafe {
            let new = (*self.ss).mark_object(&mut *self.heap, root.as_ptr());
            *root = NonNull::new_unchecked(new);
        }
    }

    fn mark_soft(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        if !self.clear_soft {
            self.mark_object(root);
        }
    }
}

impl SemiSpace {
    pub fn new() -> Self {
        Self {
            base: GarbageCollector::new("semi space"),
            mark_stack: Vec::with_capacity(1024),
            mode: CopyMode::EvacuateBumpSpace,
            copied_objects: 0,
            copied_bytes: 0,
            fallback_objects: 0,
        }
    }

    fn from_space_contains(&self, heap: &Heap, obj: *const HeapObjectHeader) -> bool {
        match self.mode {
            CopyMode::EvacuateBumpSpace => heap.bump_space.has_address(obj),
            CopyMode::CompactMainSpace => heap.main_space.has_address(obj),
        }
    }

    /// Copy `obj` out of the from-space, leaving a forwarding address behind.
    /// Idempotent: a second visit returns the existing copy.
    unsafe fn forward_object(
        &mut self,
        heap: &mut Heap,
        obj: *mut HeapObjectHeader,
    ) -> *mut HeapObjectHeader {
        if (*obj).is_forwarded() {
            return (*obj).forwarding_address();
        }
        let size = (*obj).size();
        let mut dst = match self.mode {
            CopyMode::EvacuateBumpSpace => heap.temp_space.alloc_thread_unsafe(size),
            CopyMode::CompactMainSpace => {
                let mut usable = 0;
                let backup = heap.main_backup_space.as_mut().unwrap();
                let ptr = backup.alloc(size, &mut usable);
                if !ptr.is_null() {
                    backup.live_bitmap().set(ptr);
                }
                ptr
            }
        };
        if dst.is_null() {
            // To-space exhausted; spill into the non moving space rather
            // than fail the whole collection.
            let mut usable = 0;
            dst = heap.non_moving_space.alloc(size, &mut usable);
            if !dst.is_null() {
                heap.non_moving_space.live_bitmap().set(dst);
                heap.non_moving_space.mark_bitmap().set(dst);
                self.fallback_objects += 1;
            }
        }
        if dst.is_null() {
            log::error!(
                "semi space: no room to evacuate {} object",
                formatted_size(size)
            );
            oom_abort();
        }
        core::ptr::copy_nonoverlapping(obj.cast::<u8>(), dst, size);
        (*obj).set_forwarded(dst as usize);
        let new = dst.cast::<HeapObjectHeader>();
        self.copied_objects += 1;
        self.copied_bytes += size;
        self.mark_stack.push(new);
        new
    }

    /// Mark one object, returning its address after this collection (the
    /// to-space copy for from-space objects, the object itself otherwise).
    unsafe fn mark_object(
        &mut self,
        heap: &mut Heap,
        obj: *mut HeapObjectHeader,
    ) -> *mut HeapObjectHeader {
        if obj.is_null() {
            return obj;
        }
        if let Some(image) = heap.image_space.as_ref() {
            if image.has_address(obj) {
                return obj;
            }
        }
        if let Some(zygote) = heap.zygote_space.as_ref() {
            if zygote.has_address(obj) {
                return obj;
            }
        }
        if self.from_space_contains(heap, obj) {
            return self.forward_object(heap, obj);
        }
        if self.mode == CopyMode::EvacuateBumpSpace && heap.main_space.has_address(obj) {
            if !heap.main_space.mark_bitmap().atomic_test_and_set(obj.cast()) {
                self.mark_stack.push(obj);
            }
            return obj;
        }
        if heap.non_moving_space.has_address(obj) {
            if !heap
                .non_moving_space
                .mark_bitmap()
                .atomic_test_and_set(obj.cast())
            {
                self.mark_stack.push(obj);
            }
            return obj;
        }
        if heap.large_space.contains_object(obj) {
            if !heap.large_space.test_and_set_marked(obj) {
                self.mark_stack.push(obj);
            }
        }
        obj
    }

    fn visitor(&mut self, heap: &mut Heap, clear_soft: bool) -> ForwardVisitor {
        ForwardVisitor {
            ss: self as *mut _,
            heap: heap as *mut _,
            clear_soft,
        }
    }

    unsafe fn drain_mark_stack(&mut self, heap: &mut Heap, clear_soft: bool) {
        let mut visitor = self.visitor(heap, clear_soft);
        while let Some(object) = self.mark_stack.pop() {
            (*object).get_dyn().trace(&mut visitor);
        }
    }

    unsafe fn mark_roots(&mut self, heap: &mut Heap, clear_soft: bool) {
        let mut visitor = self.visitor(heap, clear_soft);
        let heap = &mut *(heap as *mut Heap);
        heap.walk_roots(&mut visitor);
    }

    unsafe fn update_mod_union_tables(&mut self, heap: &mut Heap, clear_soft: bool) {
        let mut visitor = self.visitor(heap, clear_soft);
        let heap = &mut *(heap as *mut Heap);
        let card_table = &heap.card_table;
        if let (Some(table), Some(image)) = (heap.image_mod_union.as_ref(), heap.image_space.as_ref())
        {
            table.update_and_mark_references(card_table, image.live_bitmap(), |obj| {
                (*obj).get_dyn().trace(&mut visitor);
            });
        }
        if let (Some(table), Some(zygote)) =
            (heap.zygote_mod_union.as_ref(), heap.zygote_space.as_ref())
        {
            table.update_and_mark_references(card_table, zygote.live_bitmap(), |obj| {
                (*obj).get_dyn().trace(&mut visitor);
            });
        }
    }

    unsafe fn sweep(&mut self, heap: &mut Heap) {
        heap.mark_alloc_stack_as_live();

        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        {
            let heap2 = &mut *(heap as *mut Heap);
            if self.mode == CopyMode::EvacuateBumpSpace {
                heap.main_space.sweep(false, |obj| {
                    freed_bytes += heap2.main_space.free(obj);
                    freed_objects += 1;
                });
                heap.main_space.swap_bitmaps();
            }
            heap.non_moving_space.sweep(false, |obj| {
                freed_bytes += heap2.non_moving_space.free(obj);
                freed_objects += 1;
            });
            heap.non_moving_space.swap_bitmaps();
        }
        // Zygote objects are never traced here, so zygote large objects
        // stay immune; only a full mark sweep reclaims them.
        let (los_objects, los_bytes) = heap.large_space.sweep(false);
        self.base.record_free(freed_objects, freed_bytes);
        self.base.record_free_los(los_objects, los_bytes);
        heap.record_free(freed_objects + los_objects, freed_bytes + los_bytes);
    }

    /// One copying cycle under a single pause.
    pub fn run(
        &mut self,
        heap: &mut Heap,
        mutator: &Mutator,
        mode: CopyMode,
        cause: GcCause,
        clear_soft: bool,
    ) -> bool {
        let scope = match SafepointScope::new(mutator) {
            Some(scope) => scope,
            None => return false,
        };
        let start = Instant::now();
        self.mode = mode;
        self.copied_objects = 0;
        self.copied_bytes = 0;
        self.fallback_objects = 0;
        self.base.begin_cycle(cause);
        unsafe {
            heap.revoke_all_tlabs();
            heap.process_cards(GcType::Full);
            if mode == CopyMode::EvacuateBumpSpace {
                heap.main_space.mark_bitmap().clear_all();
            }
            heap.non_moving_space.mark_bitmap().clear_all();
            heap.large_space.prepare_for_marking(false);
            heap.swap_stacks();

            let (from_objects, from_bytes) = match mode {
                CopyMode::EvacuateBumpSpace => (
                    heap.bump_space.objects_allocated(),
                    heap.bump_space.size(),
                ),
                CopyMode::CompactMainSpace => (
                    heap.main_space.objects_allocated(),
                    heap.main_space.bytes_allocated(),
                ),
            };

            self.mark_roots(heap, clear_soft);
            self.update_mod_union_tables(heap, clear_soft);
            self.drain_mark_stack(heap, clear_soft);

            let heap_ptr = heap as *mut Heap;
            let ss = self as *mut Self;
            heap.process_references(|obj| {
                if (*ss).from_space_contains(&*heap_ptr, obj) {
                    if (*obj).is_forwarded() {
                        Some((*obj).forwarding_address())
                    } else {
                        None
                    }
                } else if (*heap_ptr).is_live_after_full_mark(obj) {
                    Some(obj)
                } else {
                    None
                }
            });

            self.sweep(heap);

            // Everything live left the from-space; account the rest as freed
            // and retire the space.
            let evac_freed_objects = from_objects.saturating_sub(self.copied_objects);
            let evac_freed_bytes = from_bytes.saturating_sub(self.copied_bytes);
            self.base.record_free(evac_freed_objects, evac_freed_bytes);
            heap.record_free(evac_freed_objects, evac_freed_bytes);
            match mode {
                CopyMode::EvacuateBumpSpace => {
                    heap.bump_space.reset();
                    heap.swap_bump_spaces();
                }
                CopyMode::CompactMainSpace => {
                    heap.swap_main_and_backup();
                }
            }

            // Moving invalidated the recorded allocation addresses.
            heap.allocation_stack.reset();
            heap.live_stack.reset();

            let pause = start.elapsed();
            self.base.record_pause(pause);
            log::info!(
                "semi space {:?}: copied {} objects / {}, {} fallback, paused {:.4}ms",
                mode,
                self.copied_objects,
                formatted_size(self.copied_bytes),
                self.fallback_objects,
                pause.as_secs_f64() * 1000.0
            );
            drop(scope);
        }
        self.base.end_cycle(start.elapsed());
        true
    }
}

impl Default for SemiSpace {
    fn default() -> Self {
        Self::new()
    }
}
