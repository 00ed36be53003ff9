use crate::{
    api::{Collectable, Gc, Trace},
    collector::{CollectorType, GcType},
    gcref::WeakRef,
    heap::{Heap, HeapConfig},
    letroot,
    mutator::MutatorRef,
    statistics::GcCause,
};

struct Node {
    next: Option<Gc<Node>>,
    value: u32,
}

impl Trace for Node {
    fn trace(&mut self, vis: &mut dyn crate::api::Visitor) {
        self.next.trace(vis);
    }
}

impl Collectable for Node {}

struct LargeNode {
    next: Option<Gc<Node>>,
    value: u32,
}

impl Trace for LargeNode {
    fn trace(&mut self, vis: &mut dyn crate::api::Visitor) {
        self.next.trace(vis);
    }
}

impl Collectable for LargeNode {
    fn allocation_size(&self) -> usize {
        128 * 1024
    }
}

struct Holder {
    big: Option<Gc<LargeNode>>,
    next: Option<Gc<Holder>>,
}

impl Trace for Holder {
    fn trace(&mut self, vis: &mut dyn crate::api::Visitor) {
        self.big.trace(vis);
        self.next.trace(vis);
    }
}

impl Collectable for Holder {}

fn small_heap(collector: CollectorType) -> MutatorRef {
    Heap::new(HeapConfig {
        collector,
        capacity: 32 * 1024 * 1024,
        non_moving_capacity: 8 * 1024 * 1024,
        background_daemon: false,
        ..Default::default()
    })
}

#[test]
fn test_alloc_and_read() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let a = mutator.allocate(Node {
        next: None,
        value: 7,
    });
    assert_eq!(a.value, 7);
    let b = mutator.allocate(42u32);
    assert_eq!(*b, 42);
    assert!(b.to_dyn().is::<u32>());
    assert!(!b.to_dyn().is::<Node>());
}

#[test]
fn test_mark_sweep_keeps_roots() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    letroot!(head = stack, mutator.allocate(Node { next: None, value: 0 }));
    for i in 1..64u32 {
        let node = mutator.allocate(Node {
            next: Some(*head),
            value: i,
        });
        *head = node;
    }
    // Garbage between the list nodes.
    for _ in 0..1000 {
        mutator.allocate(Node {
            next: None,
            value: 0xdead,
        });
    }
    mutator.collect(&mut []);

    let mut expected = 63;
    let mut cursor = Some(*head);
    while let Some(node) = cursor {
        assert_eq!(node.value, expected);
        expected = expected.wrapping_sub(1);
        cursor = node.next;
    }
    assert_eq!(expected, u32::MAX);

    let stats = mutator.heap_ref().statistics();
    assert!(stats.total_gc_cycles >= 1);
    assert!(stats.total_bytes_freed > 0);
}

#[test]
fn test_allocation_triggers_gc_at_footprint() {
    let mut mutator = Heap::new(HeapConfig {
        collector: CollectorType::MarkSweep,
        initial_size: 256 * 1024,
        growth_limit: 4 * 1024 * 1024,
        capacity: 32 * 1024 * 1024,
        non_moving_capacity: 8 * 1024 * 1024,
        background_daemon: false,
        ..Default::default()
    });
    let stack = mutator.shadow_stack();
    letroot!(keep = stack, mutator.allocate(Node { next: None, value: 9 }));

    // Overrun the initial footprint with garbage. No explicit collection
    // is requested; the allocation slow path has to run one itself.
    for _ in 0..20_000 {
        mutator.allocate(Node {
            next: None,
            value: 0xdead,
        });
    }
    let survivor = mutator.allocate(Node {
        next: Some(*keep),
        value: 10,
    });
    assert_eq!(survivor.value, 10);
    assert_eq!(survivor.next.unwrap().value, 9);

    let stats = mutator.heap_ref().statistics();
    assert!(stats.total_gc_cycles >= 1);
    assert!(stats.total_bytes_freed > 0);
    assert!(stats.bytes_allocated <= stats.growth_limit);
}

#[test]
fn test_allocation_listener_samples() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let mut mutator = small_heap(CollectorType::MarkSweep);
    let samples = Arc::new(AtomicUsize::new(0));
    let counter = samples.clone();
    mutator.heap_ref().set_allocation_listener(
        4 * 1024,
        Box::new(move |_size| {
            counter.fetch_add(1, Ordering::Relaxed);
        }),
    );
    for _ in 0..1000 {
        mutator.allocate(Node {
            next: None,
            value: 0,
        });
    }
    assert!(samples.load(Ordering::Relaxed) >= 1);

    mutator.heap_ref().remove_allocation_listener();
    let before = samples.load(Ordering::Relaxed);
    for _ in 0..1000 {
        mutator.allocate(Node {
            next: None,
            value: 0,
        });
    }
    assert_eq!(samples.load(Ordering::Relaxed), before);
}

#[test]
fn test_heap_verification_passes() {
    let mut mutator = Heap::new(HeapConfig {
        collector: CollectorType::MarkSweep,
        capacity: 32 * 1024 * 1024,
        non_moving_capacity: 8 * 1024 * 1024,
        verify_heap: true,
        background_daemon: false,
        ..Default::default()
    });
    let stack = mutator.shadow_stack();
    letroot!(head = stack, mutator.allocate(Node { next: None, value: 0 }));
    for i in 1..32u32 {
        let node = mutator.allocate(Node {
            next: Some(*head),
            value: i,
        });
        *head = node;
    }
    mutator.collect(&mut []);
    mutator.collect(&mut []);
    assert_eq!(head.value, 31);
}

#[test]
fn test_sticky_then_full() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    letroot!(old = stack, mutator.allocate(Node { next: None, value: 1 }));
    mutator.collect(&mut []);

    // Survivors of the full cycle are old now; a sticky cycle only looks at
    // objects allocated since.
    let young = mutator.allocate(Node {
        next: Some(*old),
        value: 2,
    });
    old.next = Some(young);
    mutator.write_barrier(old.to_dyn());
    for _ in 0..256 {
        mutator.allocate(Node {
            next: None,
            value: 0xdead,
        });
    }
    let heap = mutator.heap_ref();
    assert!(heap.run_gc(&mutator, GcType::Sticky, GcCause::Explicit, false));

    assert_eq!(old.value, 1);
    assert_eq!(old.next.unwrap().value, 2);
    assert_eq!(old.next.unwrap().next.unwrap().value, 1);

    assert!(heap.run_gc(&mutator, GcType::Full, GcCause::Explicit, false));
    assert_eq!(old.next.unwrap().value, 2);
}

#[test]
fn test_semi_space_moves_objects() {
    let mut mutator = small_heap(CollectorType::SemiSpace);
    let stack = mutator.shadow_stack();

    letroot!(node = stack, mutator.allocate(Node { next: None, value: 33 }));
    let before = node.raw();
    mutator.collect(&mut []);

    assert_ne!(before, node.raw());
    assert_eq!(node.value, 33);
}

#[test]
fn test_mark_compact_preserves_graph() {
    let mut mutator = small_heap(CollectorType::MarkCompact);
    let stack = mutator.shadow_stack();

    letroot!(head = stack, mutator.allocate(Node { next: None, value: 0 }));
    for i in 1..128u32 {
        // Interleave garbage so compaction actually slides survivors.
        mutator.allocate(Node {
            next: None,
            value: 0xdead,
        });
        let node = mutator.allocate(Node {
            next: Some(*head),
            value: i,
        });
        *head = node;
    }
    mutator.collect(&mut []);
    mutator.collect(&mut []);

    let mut count = 0;
    let mut cursor = Some(*head);
    let mut expected = 127;
    while let Some(node) = cursor {
        assert_eq!(node.value, expected);
        expected = expected.wrapping_sub(1);
        cursor = node.next;
        count += 1;
    }
    assert_eq!(count, 128);
}

#[test]
fn test_concurrent_copying_keeps_roots() {
    let mut mutator = small_heap(CollectorType::ConcurrentCopying);
    let stack = mutator.shadow_stack();

    letroot!(head = stack, mutator.allocate(Node { next: None, value: 0 }));
    for i in 1..64u32 {
        let node = mutator.allocate(Node {
            next: Some(*head),
            value: i,
        });
        *head = node;
    }
    mutator.collect(&mut []);

    let mut cursor = Some(*head);
    let mut expected = 63;
    while let Some(node) = cursor {
        assert_eq!(node.value, expected);
        expected = expected.wrapping_sub(1);
        cursor = node.next;
    }
}

#[test]
fn test_weak_ref_cleared() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    let target = mutator.allocate(Node {
        next: None,
        value: 9,
    });
    letroot!(weak = stack, WeakRef::new(&mut mutator, target));
    assert_eq!(weak.upgrade().unwrap().value, 9);

    mutator.collect(&mut []);
    assert!(weak.is_cleared());
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_weak_ref_live_target() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    letroot!(target = stack, mutator.allocate(Node { next: None, value: 11 }));
    letroot!(weak = stack, WeakRef::new(&mut mutator, *target));

    mutator.collect(&mut []);
    assert_eq!(weak.upgrade().unwrap().value, 11);
}

#[test]
fn test_soft_ref_cleared_on_demand() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    let target = mutator.allocate(Node {
        next: None,
        value: 5,
    });
    letroot!(soft = stack, WeakRef::soft(&mut mutator, target));

    // An ordinary cycle treats softly reachable targets as strong.
    mutator.collect(&mut []);
    assert_eq!(soft.upgrade().unwrap().value, 5);

    let heap = mutator.heap_ref();
    assert!(heap.run_gc(&mutator, GcType::Full, GcCause::Explicit, true));
    assert!(soft.is_cleared());
}

#[test]
fn test_large_objects() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    letroot!(kept = stack, mutator.allocate(LargeNode { next: None, value: 77 }));
    for _ in 0..8 {
        mutator.allocate(LargeNode {
            next: None,
            value: 0xdead,
        });
    }
    mutator.collect(&mut []);

    assert_eq!(kept.value, 77);
    let stats = mutator.heap_ref().statistics();
    assert!(stats.total_bytes_freed >= 8 * 128 * 1024);
}

#[test]
fn test_large_object_retains_small() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    letroot!(large = stack, mutator.allocate(LargeNode { next: None, value: 0 }));
    let small = mutator.allocate(Node {
        next: None,
        value: 123,
    });
    large.next = Some(small);
    mutator.write_barrier(large.to_dyn());

    mutator.collect(&mut []);
    assert_eq!(large.next.unwrap().value, 123);
}

#[test]
fn test_spawned_mutators() {
    let mutator = small_heap(CollectorType::MarkSweep);

    let mut joins = Vec::new();
    for t in 0..4u32 {
        joins.push(mutator.spawn_mutator(move |mut mutator| {
            let stack = mutator.shadow_stack();
            letroot!(head = stack, mutator.allocate(Node { next: None, value: t }));
            for _ in 0..2000 {
                let node = mutator.allocate(Node {
                    next: Some(*head),
                    value: t,
                });
                *head = node;
                mutator.safepoint();
            }
            assert_eq!(head.value, t);
        }));
    }
    for _ in 0..8 {
        mutator.collect(&mut []);
    }
    for join in joins {
        join.join(&mutator);
    }
}

#[test]
fn test_homogeneous_space_compact() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    letroot!(node = stack, mutator.allocate(Node { next: None, value: 55 }));
    for _ in 0..500 {
        mutator.allocate(Node {
            next: None,
            value: 0xdead,
        });
    }
    let before = node.raw();
    let heap = mutator.heap_ref();
    assert!(heap.perform_homogeneous_space_compact(&mutator));

    assert_ne!(before, node.raw());
    assert_eq!(node.value, 55);
}

#[test]
fn test_pre_zygote_fork() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    letroot!(shared = stack, mutator.allocate(Node { next: None, value: 100 }));
    assert!(!mutator.heap_ref().has_zygote_space());
    mutator.heap_ref().pre_zygote_fork(&mutator);
    assert!(mutator.heap_ref().has_zygote_space());
    assert_eq!(mutator.heap_ref().next_gc_type(), GcType::Sticky);
    assert_eq!(shared.value, 100);

    // Post-fork allocations land in the new main space; partial cycles spare
    // the zygote.
    letroot!(local = stack, mutator.allocate(Node { next: Some(*shared), value: 101 }));
    assert!(mutator
        .heap_ref()
        .run_gc(&mutator, GcType::Partial, GcCause::Explicit, false));
    assert_eq!(shared.value, 100);
    assert_eq!(local.next.unwrap().value, 100);

    assert!(mutator
        .heap_ref()
        .run_gc(&mutator, GcType::Full, GcCause::Explicit, false));
    assert_eq!(shared.value, 100);
}

#[test]
fn test_zygote_large_object_survives_compaction() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    let stack = mutator.shadow_stack();

    letroot!(
        owner = stack,
        mutator.allocate(Holder {
            big: None,
            next: None,
        })
    );
    let big = mutator.allocate(LargeNode {
        next: None,
        value: 40,
    });
    owner.big = Some(big);
    mutator.write_barrier(owner.to_dyn());

    mutator.heap_ref().pre_zygote_fork(&mutator);
    assert!(mutator.heap_ref().has_zygote_space());

    // The owner got sealed into the zygote and its large object carries the
    // zygote flag. Compaction never traces the zygote, so the large object
    // has to survive on the flag alone.
    assert!(mutator
        .heap_ref()
        .perform_homogeneous_space_compact(&mutator));
    assert_eq!(owner.big.unwrap().value, 40);

    // A full cycle traces through the zygote and keeps it as well.
    let heap = mutator.heap_ref();
    assert!(heap.run_gc(&mutator, GcType::Full, GcCause::Explicit, false));
    assert_eq!(owner.big.unwrap().value, 40);
}

#[test]
fn test_concurrent_mark_sweep_keeps_roots() {
    let mut mutator = small_heap(CollectorType::ConcurrentMarkSweep);
    let stack = mutator.shadow_stack();

    letroot!(head = stack, mutator.allocate(Node { next: None, value: 0 }));
    for i in 1..64u32 {
        let node = mutator.allocate(Node {
            next: Some(*head),
            value: i,
        });
        *head = node;
    }
    for _ in 0..1000 {
        mutator.allocate(Node {
            next: None,
            value: 0xdead,
        });
    }
    // The second cycle joins the sweep the first one handed to the pool.
    mutator.collect(&mut []);
    mutator.collect(&mut []);

    let mut expected = 63;
    let mut cursor = Some(*head);
    while let Some(node) = cursor {
        assert_eq!(node.value, expected);
        expected = expected.wrapping_sub(1);
        cursor = node.next;
    }
    assert_eq!(expected, u32::MAX);

    let stats = mutator.heap_ref().statistics();
    assert!(stats.total_gc_cycles >= 2);
    assert!(stats.total_bytes_freed > 0);
}

#[test]
fn test_concurrent_mark_sweep_spawned_mutators() {
    let mutator = small_heap(CollectorType::ConcurrentMarkSweep);

    let mut joins = Vec::new();
    for t in 0..4u32 {
        joins.push(mutator.spawn_mutator(move |mut mutator| {
            let stack = mutator.shadow_stack();
            letroot!(head = stack, mutator.allocate(Node { next: None, value: t }));
            for _ in 0..2000 {
                let node = mutator.allocate(Node {
                    next: Some(*head),
                    value: t,
                });
                *head = node;
                mutator.safepoint();
            }
            assert_eq!(head.value, t);
        }));
    }
    // Explicit cycles race the workers' allocation-triggered ones; every
    // cycle has to wait its turn on the completion lock.
    for _ in 0..8 {
        mutator.collect(&mut []);
    }
    for join in joins {
        join.join(&mutator);
    }
    mutator.collect(&mut []);
}

#[test]
fn test_soft_refs_cleared_under_pressure() {
    let mut mutator = Heap::new(HeapConfig {
        collector: CollectorType::MarkSweep,
        initial_size: 1024 * 1024,
        growth_limit: 4 * 1024 * 1024,
        capacity: 8 * 1024 * 1024,
        non_moving_capacity: 8 * 1024 * 1024,
        background_daemon: false,
        ..Default::default()
    });
    let stack = mutator.shadow_stack();

    // Chains of holders each owning a 128 KiB large object, so the bytes
    // kept alive are known up front. Strong ballast first, 1 MiB.
    letroot!(ballast = stack, None::<Gc<Holder>>);
    for _ in 0..8 {
        let holder = mutator.allocate(Holder {
            big: None,
            next: *ballast,
        });
        *ballast = Some(holder);
        let big = mutator.allocate(LargeNode {
            next: None,
            value: 1,
        });
        ballast.as_mut().unwrap().big = Some(big);
        mutator.write_barrier(holder.to_dyn());
    }

    // Another 1 MiB reachable only through a soft reference once the
    // building scope unroots it.
    letroot!(soft = stack, None::<WeakRef<Holder>>);
    {
        letroot!(head = stack, None::<Gc<Holder>>);
        for _ in 0..8 {
            let holder = mutator.allocate(Holder {
                big: None,
                next: *head,
            });
            *head = Some(holder);
            let big = mutator.allocate(LargeNode {
                next: None,
                value: 2,
            });
            head.as_mut().unwrap().big = Some(big);
            mutator.write_barrier(holder.to_dyn());
        }
        *soft = Some(WeakRef::soft(&mut mutator, head.unwrap()));
    }

    // Growing the strong chain past the growth limit leaves the slow path
    // no way out but clearing the softly held megabyte.
    for _ in 0..16 {
        let holder = mutator.allocate(Holder {
            big: None,
            next: *ballast,
        });
        *ballast = Some(holder);
        let big = mutator.allocate(LargeNode {
            next: None,
            value: 3,
        });
        ballast.as_mut().unwrap().big = Some(big);
        mutator.write_barrier(holder.to_dyn());
    }

    assert!(soft.as_ref().unwrap().is_cleared());
    let mut count = 0;
    let mut cursor = *ballast;
    while let Some(holder) = cursor {
        assert!(holder.big.is_some());
        cursor = holder.next;
        count += 1;
    }
    assert_eq!(count, 24);
    let stats = mutator.heap_ref().statistics();
    assert!(stats.bytes_allocated <= stats.growth_limit);
}

#[test]
fn test_disable_moving_gc_falls_back() {
    let mut mutator = small_heap(CollectorType::SemiSpace);
    let stack = mutator.shadow_stack();

    letroot!(node = stack, mutator.allocate(Node { next: None, value: 21 }));
    let before = node.raw();
    let heap = mutator.heap_ref();
    heap.increment_disable_moving_gc(&mutator);
    mutator.collect(&mut []);
    // The fallback collector must not have moved anything.
    assert_eq!(before, node.raw());
    assert_eq!(node.value, 21);
    heap.decrement_disable_moving_gc();

    mutator.collect(&mut []);
    assert_ne!(before, node.raw());
    assert_eq!(node.value, 21);
}

#[test]
fn test_native_allocation_tracking() {
    let mutator = small_heap(CollectorType::MarkSweep);
    let heap = mutator.heap_ref();
    heap.register_native_allocation(&mutator, 64 * 1024);
    assert_eq!(heap.statistics().native_bytes_registered, 64 * 1024);
    heap.register_native_free(64 * 1024);
    assert_eq!(heap.statistics().native_bytes_registered, 0);
    // Freeing more than was registered saturates at zero.
    heap.register_native_free(1024);
    assert_eq!(heap.statistics().native_bytes_registered, 0);
}

#[test]
fn test_statistics_and_dump() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    for _ in 0..100 {
        mutator.allocate(Node {
            next: None,
            value: 0,
        });
    }
    mutator.collect(&mut []);

    let heap = mutator.heap_ref();
    let stats = heap.statistics();
    assert!(stats.total_objects_allocated >= 100);
    assert!(stats.total_gc_cycles >= 1);
    assert!(stats.target_footprint > 0);
    let report = heap.dump_for_sig_quit();
    assert!(report.contains("main space"));
    assert!(report.contains("large object space"));
}

#[test]
fn test_trim_releases_pages() {
    let mut mutator = small_heap(CollectorType::MarkSweep);
    for _ in 0..2000 {
        mutator.allocate(Node {
            next: None,
            value: 0,
        });
    }
    mutator.collect(&mut []);
    // Trim only reclaims pages, never objects.
    let stack = mutator.shadow_stack();
    letroot!(node = stack, mutator.allocate(Node { next: None, value: 3 }));
    mutator.heap_ref().trim();
    assert_eq!(node.value, 3);
}
