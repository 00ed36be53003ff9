use std::ptr::NonNull;
use std::time::Instant;

use hashbrown::HashMap;

use crate::{
    api::{HeapObjectHeader, Visitor},
    bitmap::ObjectBitmap,
    collector::{GarbageCollector, GcType},
    heap::Heap,
    mutator::Mutator,
    safepoint::SafepointScope,
    statistics::GcCause,
    utils::formatted_size,
};

/// Stop the world sliding compaction of the bump pointer space.
///
/// Unlike the semi space collector it needs no to-space: live objects slide
/// down within the space itself. The price is three passes (mark, update
/// references, move) under one pause. Forwarding addresses live in a side
/// table because objects keep servicing field walks until the move pass.
pub struct MarkCompact {
    pub base: GarbageCollector,
    mark_stack: Vec<*mut HeapObjectHeader>,
    /// Every object marked outside the immune spaces, revisited by the
    /// reference update pass.
    marked_objects: Vec<*mut HeapObjectHeader>,
    forwarding: HashMap<usize, usize>,
    bump_bitmap: Option<ObjectBitmap>,
}

struct MarkVisitor {
    mc: *mut MarkCompact,
    heap: *mut Heap,
    clear_soft: bool,
}

impl Visitor for MarkVisitor {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        unsafe {
            (*self.mc).mark_object(&mut *self.heap, root.as_ptr());
        }
    }

    fn mark_soft(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        if !self.clear_soft {
            self.mark_object(root);
        }
    }
}

struct UpdateVisitor<'a> {
    forwarding: &'a HashMap<usize, usize>,
}

impl<'a> Visitor for UpdateVisitor<'a> {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        if let Some(&new) = self.forwarding.get(&(root.as_ptr() as usize)) {
            *root = unsafe { NonNull::new_unchecked(new as *mut HeapObjectHeader) };
        }
    }

    // Soft targets are rewritten by reference processing; touching them
    // here would forward the same slot twice. After sliding, a forwarded
    // value can collide with another object's old address.
    fn mark_soft(&mut self, _root: &mut NonNull<HeapObjectHeader>) {}
}

impl MarkCompact {
    pub fn new() -> Self {
        Self {
            base: GarbageCollector::new("mark compact"),
            mark_stack: Vec::with_capacity(1024),
            marked_objects: Vec::new(),
            forwarding: HashMap::new(),
            bump_bitmap: None,
        }
    }

    unsafe fn mark_object(&mut self, heap: &mut Heap, obj: *mut HeapObjectHeader) {
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
                return;
            }
        }
        if heap.bump_space.has_address(obj) {
            if !self
                .bump_bitmap
                .as_ref()
                .unwrap()
                .atomic_test_and_set(obj.cast())
            {
                self.mark_stack.push(obj);
            }
            return;
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

    unsafe fn drain_mark_stack(&mut self, heap: &mut Heap, clear_soft: bool) {
        let mut visitor = MarkVisitor {
            mc: self as *mut _,
            heap: heap as *mut _,
            clear_soft,
        };
        while let Some(object) = self.mark_stack.pop() {
            self.marked_objects.push(object);
            (*object).get_dyn().trace(&mut visitor);
        }
    }

    unsafe fn mark_roots(&mut self, heap: &mut Heap, clear_soft: bool) {
        let mut visitor = MarkVisitor {
            mc: self as *mut _,
            heap: heap as *mut _,
            clear_soft,
        };
        heap.walk_roots(&mut visitor);
    }

    unsafe fn update_mod_union_tables(
        &self,
        heap: &mut Heap,
        mut visit: impl FnMut(*mut HeapObjectHeader),
    ) {
        let card_table = &heap.card_table;
        if let (Some(table), Some(image)) = (heap.image_mod_union.as_ref(), heap.image_space.as_ref())
        {
            table.update_and_mark_references(card_table, image.live_bitmap(), &mut visit);
        }
        if let (Some(table), Some(zygote)) =
            (heap.zygote_mod_union.as_ref(), heap.zygote_space.as_ref())
        {
            table.update_and_mark_references(card_table, zygote.live_bitmap(), &mut visit);
        }
    }

    /// Assign each surviving bump space object its slid-down address.
    unsafe fn compute_forwarding(&mut self, heap: &Heap) -> (*mut u8, usize, usize) {
        let bitmap = self.bump_bitmap.as_ref().unwrap();
        let mut cursor = heap.bump_space.begin();
        let mut objects = 0;
        let mut bytes = 0;
        bitmap.visit_marked_range(heap.bump_space.begin(), heap.bump_space.end(), |obj| {
            let size = (*obj).size();
            self.forwarding.insert(obj as usize, cursor as usize);
            cursor = cursor.add(size);
            objects += 1;
            bytes += size;
        });
        (cursor, objects, bytes)
    }

    /// Rewrite every reference into the bump space through the forwarding
    /// table. Covers roots, every object marked this cycle and the recorded
    /// immune space cards.
    unsafe fn update_references(&mut self, heap: &mut Heap) {
        let mut visitor = UpdateVisitor {
            forwarding: &self.forwarding,
        };
        heap.walk_roots(&mut visitor);
        for &obj in self.marked_objects.iter() {
            (*obj).get_dyn().trace(&mut visitor);
        }
        let heap2 = &mut *(heap as *mut Heap);
        self.update_mod_union_tables(heap2, |obj| {
            (*obj).get_dyn().trace(&mut visitor);
        });
    }

    /// Slide the survivors down. Ascending order plus non-increasing target
    /// addresses make overlapping moves safe.
    unsafe fn move_objects(&mut self, heap: &Heap) {
        let bitmap = self.bump_bitmap.as_ref().unwrap();
        bitmap.visit_marked_range(heap.bump_space.begin(), heap.bump_space.end(), |obj| {
            let new = self.forwarding[&(obj as usize)] as *mut u8;
            let size = (*obj).size();
            if new != obj as *mut u8 {
                core::ptr::copy(obj as *const u8, new, size);
            }
        });
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

    pub fn run(
        &mut self,
        heap: &mut Heap,
        mutator: &Mutator,
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
            heap.revoke_all_tlabs();
            heap.process_cards(GcType::Full);
            heap.main_space.mark_bitmap().clear_all();
            heap.non_moving_space.mark_bitmap().clear_all();
            heap.large_space.prepare_for_marking(false);
            heap.swap_stacks();

            self.forwarding.clear();
            self.marked_objects.clear();
            self.bump_bitmap = Some(ObjectBitmap::create(
                "mark compact bitmap",
                heap.bump_space.begin(),
                heap.bump_space.capacity(),
            ));

            let from_objects = heap.bump_space.objects_allocated();
            let from_bytes = heap.bump_space.size();

            self.mark_roots(heap, clear_soft);
            {
                let mc = self as *mut Self;
                let heap2 = &mut *(heap as *mut Heap);
                let mut visitor = MarkVisitor {
                    mc,
                    heap: heap2 as *mut _,
                    clear_soft,
                };
                self.update_mod_union_tables(heap, |obj| {
                    (*obj).get_dyn().trace(&mut visitor);
                });
            }
            self.drain_mark_stack(heap, clear_soft);

            let (new_end, live_objects, live_bytes) = self.compute_forwarding(heap);
            self.update_references(heap);
            self.move_objects(heap);
            heap.bump_space.set_end(new_end);
            heap.bump_space
                .record_compaction(live_objects, live_bytes);

            // Runs after the move: old bump space memory is gone, so
            // liveness and forwarding of moved objects come from the side
            // table alone.
            let heap_ptr = heap as *mut Heap;
            let mc = self as *mut Self;
            heap.process_references(|obj| {
                if (*heap_ptr).bump_space.has_address(obj) {
                    (*mc)
                        .forwarding
                        .get(&(obj as usize))
                        .map(|&new| new as *mut HeapObjectHeader)
                } else if (*heap_ptr).is_live_after_full_mark(obj) {
                    Some(obj)
                } else {
                    None
                }
            });

            self.sweep(heap);

            let freed_objects = from_objects.saturating_sub(live_objects);
            let freed_bytes = from_bytes.saturating_sub(live_bytes);
            self.base.record_free(freed_objects, freed_bytes);
            heap.record_free(freed_objects, freed_bytes);

            heap.allocation_stack.reset();
            heap.live_stack.reset();
            self.bump_bitmap = None;
            self.forwarding.clear();
            self.marked_objects.clear();

            let pause = start.elapsed();
            self.base.record_pause(pause);
            log::info!(
                "mark compact: {} objects / {} survived, freed {}, paused {:.4}ms",
                live_objects,
                formatted_size(live_bytes),
                formatted_size(freed_bytes),
                pause.as_secs_f64() * 1000.0
            );
            drop(scope);
        }
        self.base.end_cycle(start.elapsed());
        true
    }
}

impl Default for MarkCompact {
    fn default() -> Self {
        Self::new()
    }
}
