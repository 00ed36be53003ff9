use std::{
    cell::UnsafeCell,
    mem::size_of,
    path::{Path, PathBuf},
    ptr::{null_mut, NonNull},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::{
    api::{vtable_of, Collectable, Gc, HeapObjectHeader, Trace, Visitor, MIN_ALLOCATION},
    api::small_type_id,
    bump_pointer_space::BumpPointerSpace,
    card_table::{age_card_visitor, CardTable},
    collector::{
        concurrent_copying::ConcurrentCopying,
        mark_compact::MarkCompact,
        mark_sweep::MarkSweep,
        semi_space::{CopyMode, SemiSpace},
        CollectorType, GcType,
    },
    freelist_space::{FreeListSpace, PAGE_SIZE},
    gcref::GcRefCell,
    image_space::{self, ImageSpace},
    large_space::{LargeObjectSpace, PreciseAllocation},
    mod_union_table::{ModUnionTable, RememberedSet},
    mutator::{oom_abort, JoinData, Mutator, MutatorRef},
    object_stack::ObjectStack,
    region_space::RegionSpace,
    safepoint::{GlobalSafepoint, SafepointScope},
    space::BitmapSpace,
    statistics::{GcCause, HeapStatistics},
    task_processor::{CollectorTransitionTask, ConcurrentGcTask, HeapTrimTask, TaskProcessor},
    tlab::{Tlab, TLAB_SIZE},
    utils::{align_up, align_usize, formatted_size, mmap::Mmap},
    zygote_space::ZygoteSpace,
};

/// How noticeable collector pauses are to the process right now. Background
/// processes trade latency for memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessState {
    JankPerceptible,
    JankImperceptible,
}

/// Creation-time knobs of the heap.
pub struct HeapConfig {
    /// Initial target footprint.
    pub initial_size: usize,
    /// The footprint never grows beyond this.
    pub growth_limit: usize,
    /// Reserved address space per malloc/moving space.
    pub capacity: usize,
    pub non_moving_capacity: usize,
    /// Address space reserved for the boot image when one is configured.
    pub image_capacity: usize,
    pub image_path: Option<PathBuf>,
    pub collector: CollectorType,
    /// Generational concurrent copying: minor cycles evacuate only regions
    /// allocated since the last collection.
    pub generational_cc: bool,
    /// Allocations of at least this many bytes go to the large object space.
    pub large_object_threshold: usize,
    pub target_utilization: f64,
    pub foreground_heap_growth_multiplier: f64,
    pub min_free: usize,
    pub max_free: usize,
    /// Worker threads backing the concurrent collectors.
    pub gc_threads: usize,
    /// Verify live bitmaps and the allocation stack around every collection.
    /// A failed check aborts the process.
    pub verify_heap: bool,
    /// Grow the footprint conservatively, trading collection frequency for
    /// a smaller resident set.
    pub low_memory_mode: bool,
    /// Entries in the allocation and live stacks.
    pub allocation_stack_capacity: usize,
    /// Spawn the daemon thread that runs background collections and trims.
    pub background_daemon: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_size: 4 * 1024 * 1024,
            growth_limit: 0,
            capacity: 256 * 1024 * 1024,
            non_moving_capacity: 16 * 1024 * 1024,
            image_capacity: 64 * 1024 * 1024,
            image_path: None,
            collector: CollectorType::ConcurrentMarkSweep,
            generational_cc: true,
            large_object_threshold: 3 * PAGE_SIZE,
            target_utilization: 0.75,
            foreground_heap_growth_multiplier: 2.0,
            min_free: 512 * 1024,
            max_free: 2 * 1024 * 1024,
            gc_threads: 1,
            verify_heap: false,
            low_memory_mode: false,
            allocation_stack_capacity: 64 * 1024,
            background_daemon: true,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AllocatorKind {
    FreeList,
    BumpPointer,
    Region,
}

/// Sampling callback fired roughly every `interval` allocated bytes.
struct AllocListener {
    interval: usize,
    bytes_until_sample: usize,
    callback: Box<dyn FnMut(usize) + Send>,
}

/// The heap: spaces, card marking structures, collectors and the policy that
/// decides when and how deeply to collect.
///
/// One `Heap` is shared by all attached [Mutator]s through an
/// `Arc<UnsafeCell<..>>`; methods taking `&mut self` rely on the safepoint
/// protocol and the allocation lock for exclusion.
pub struct Heap {
    pub config: HeapConfig,
    arena: Mmap,
    pub(crate) card_table: CardTable,
    safepoint: GlobalSafepoint,

    pub(crate) image_space: Option<ImageSpace>,
    pub(crate) zygote_space: Option<ZygoteSpace>,
    pub(crate) non_moving_space: FreeListSpace,
    pub(crate) main_space: FreeListSpace,
    pub(crate) main_backup_space: Option<FreeListSpace>,
    pub(crate) bump_space: BumpPointerSpace,
    pub(crate) temp_space: BumpPointerSpace,
    pub(crate) region_space: Option<RegionSpace>,
    pub(crate) large_space: LargeObjectSpace,

    pub(crate) image_mod_union: Option<ModUnionTable>,
    pub(crate) zygote_mod_union: Option<ModUnionTable>,
    pub(crate) main_rem_set: Option<RememberedSet>,
    pub(crate) non_moving_rem_set: Option<RememberedSet>,

    pub(crate) allocation_stack: ObjectStack,
    pub(crate) live_stack: ObjectStack,

    mark_sweep: MarkSweep,
    semi_space: SemiSpace,
    mark_compact: MarkCompact,
    concurrent_copying: Option<ConcurrentCopying>,
    collector_type: CollectorType,
    next_gc_type: GcType,
    /// Throughput of the last non-sticky cycle; a sticky cycle doing worse
    /// escalates the next one.
    last_full_throughput: f64,

    pub(crate) mutators: Vec<*mut Mutator>,
    mutators_lock: Mutex<()>,
    alloc_lock: Mutex<()>,
    /// Registered [GcRefCell] allocations, walked during reference
    /// processing.
    weak_refs: Vec<*mut HeapObjectHeader>,
    /// Roots supplied to an explicit collection, live only for its duration.
    extra_roots: Vec<*mut dyn Trace>,

    num_bytes_allocated: CachePadded<AtomicUsize>,
    native_bytes_registered: CachePadded<AtomicUsize>,
    target_footprint: AtomicUsize,
    concurrent_start_bytes: AtomicUsize,
    growth_limit: usize,
    total_objects_allocated: AtomicUsize,
    total_bytes_allocated: AtomicUsize,
    total_objects_freed: AtomicUsize,
    total_bytes_freed: AtomicUsize,
    gcs_requested: AtomicU64,
    gcs_completed: AtomicU64,
    /// Collector currently between claim and finish, if any. Collection
    /// cycles are serialized through this slot; a concurrent mark sweep
    /// keeps it claimed across its lock-free phase.
    collector_type_running: Mutex<Option<CollectorType>>,
    gc_complete_cond: Condvar,
    disable_moving_gc_count: Mutex<usize>,
    process_state: ProcessState,
    alloc_listener: Option<AllocListener>,

    task_processor: Option<Arc<TaskProcessor>>,
    daemon_join: Option<JoinData>,
}

impl Heap {
    /// Create a heap and return the mutator handle of the calling thread.
    pub fn new(config: HeapConfig) -> MutatorRef {
        let heap = Arc::new(UnsafeCell::new(Self::create(config)));
        let href = unsafe { &mut *heap.get() };
        let mut mutator = MutatorRef::new(Mutator::new(
            heap.clone(),
            href.safepoint(),
            JoinData::new().internal,
        ));
        href.attach_current_thread(&mut mutator);
        if href.config.background_daemon {
            href.start_task_daemon(&mutator);
        }
        mutator
    }

    fn create(config: HeapConfig) -> Self {
        let capacity = align_up(config.capacity.max(config.initial_size), PAGE_SIZE);
        let non_moving_capacity = align_up(config.non_moving_capacity, PAGE_SIZE);
        let image_capacity = if config.image_path.is_some() {
            align_up(config.image_capacity, PAGE_SIZE)
        } else {
            0
        };
        let use_region = config.collector == CollectorType::ConcurrentCopying;
        let total = image_capacity
            + non_moving_capacity
            + 4 * capacity
            + if use_region { capacity } else { 0 };
        let arena = Mmap::new(total);

        let image_begin = arena.start();
        let non_moving_begin = unsafe { image_begin.add(image_capacity) };
        let main_begin = unsafe { non_moving_begin.add(non_moving_capacity) };
        let backup_begin = unsafe { main_begin.add(capacity) };
        let bump_begin = unsafe { backup_begin.add(capacity) };
        let temp_begin = unsafe { bump_begin.add(capacity) };
        let region_begin = unsafe { temp_begin.add(capacity) };

        let card_table = CardTable::create(arena.start(), total);

        let image_space = config.image_path.as_ref().map(|path| {
            ImageSpace::load(path, image_begin, image_capacity)
                .unwrap_or_else(|e| panic!("failed to load boot image {}: {}", path.display(), e))
        });
        let image_mod_union = image_space.as_ref().map(|image| {
            ModUnionTable::new("image space mod union", image.begin(), image.end())
        });

        let non_moving_space = FreeListSpace::create(
            "non moving space",
            non_moving_begin,
            0,
            non_moving_capacity,
            false,
        );
        let main_space = FreeListSpace::create("main space", main_begin, 0, capacity, true);
        let main_backup_space = Some(FreeListSpace::create(
            "main space",
            backup_begin,
            0,
            capacity,
            true,
        ));
        let bump_space = BumpPointerSpace::create("bump pointer space", bump_begin, capacity);
        let temp_space = BumpPointerSpace::create("bump pointer space 2", temp_begin, capacity);
        let region_space = use_region.then(|| {
            RegionSpace::create("region space", region_begin, capacity)
        });

        let (main_rem_set, non_moving_rem_set) = if use_region {
            (
                Some(RememberedSet::new(
                    "main space remembered set",
                    main_begin,
                    unsafe { main_begin.add(capacity) },
                )),
                Some(RememberedSet::new(
                    "non moving space remembered set",
                    non_moving_begin,
                    unsafe { non_moving_begin.add(non_moving_capacity) },
                )),
            )
        } else {
            (None, None)
        };

        let concurrent_copying = region_space.as_ref().map(ConcurrentCopying::new);
        let growth_limit = if config.growth_limit == 0 {
            capacity
        } else {
            config.growth_limit.min(capacity)
        };
        let target = config.initial_size.min(growth_limit);
        let collector_type = config.collector;
        let next_gc_type = *GcType::plan_for(collector_type, config.generational_cc, false)
            .first()
            .unwrap();

        let mut heap = Self {
            card_table,
            safepoint: GlobalSafepoint::new(),
            image_space,
            zygote_space: None,
            non_moving_space,
            main_space,
            main_backup_space,
            bump_space,
            temp_space,
            region_space,
            large_space: LargeObjectSpace::new(),
            image_mod_union,
            zygote_mod_union: None,
            main_rem_set,
            non_moving_rem_set,
            allocation_stack: ObjectStack::create(
                "allocation stack",
                config.allocation_stack_capacity,
            ),
            live_stack: ObjectStack::create("live stack", config.allocation_stack_capacity),
            mark_sweep: MarkSweep::new(
                collector_type == CollectorType::ConcurrentMarkSweep,
                config.gc_threads,
            ),
            semi_space: SemiSpace::new(),
            mark_compact: MarkCompact::new(),
            concurrent_copying,
            collector_type,
            next_gc_type,
            last_full_throughput: 0.0,
            mutators: Vec::new(),
            mutators_lock: Mutex::new(()),
            alloc_lock: Mutex::new(()),
            weak_refs: Vec::new(),
            extra_roots: Vec::new(),
            num_bytes_allocated: CachePadded::new(AtomicUsize::new(0)),
            native_bytes_registered: CachePadded::new(AtomicUsize::new(0)),
            target_footprint: AtomicUsize::new(target),
            concurrent_start_bytes: AtomicUsize::new(usize::MAX),
            growth_limit,
            total_objects_allocated: AtomicUsize::new(0),
            total_bytes_allocated: AtomicUsize::new(0),
            total_objects_freed: AtomicUsize::new(0),
            total_bytes_freed: AtomicUsize::new(0),
            gcs_requested: AtomicU64::new(0),
            gcs_completed: AtomicU64::new(0),
            collector_type_running: Mutex::new(None),
            gc_complete_cond: Condvar::new(),
            disable_moving_gc_count: Mutex::new(0),
            process_state: ProcessState::JankPerceptible,
            alloc_listener: None,
            config,
            arena,
            task_processor: None,
            daemon_join: None,
        };
        heap.update_concurrent_start_bytes(target);
        heap
    }

    fn start_task_daemon(&mut self, mutator: &Mutator) {
        let processor = TaskProcessor::new();
        self.task_processor = Some(processor.clone());
        self.daemon_join = Some(mutator.spawn_mutator(move |mut daemon| {
            loop {
                let task = {
                    let _safe = daemon.enter_safe();
                    processor.next_task()
                };
                match task {
                    Some(mut task) => task.run(&mut daemon),
                    None => break,
                }
            }
        }));
    }

    /// Stop the background daemon and wait for it. Further background work
    /// runs inline on the requesting threads.
    pub fn stop_task_daemon(&mut self, mutator: &Mutator) {
        if let Some(processor) = self.task_processor.take() {
            processor.stop();
        }
        if let Some(join) = self.daemon_join.take() {
            join.join(mutator);
        }
    }

    pub fn safepoint(&self) -> &GlobalSafepoint {
        &self.safepoint
    }

    pub fn collector_type(&self) -> CollectorType {
        self.collector_type
    }

    pub fn next_gc_type(&self) -> GcType {
        self.next_gc_type
    }

    /// Monotone count of finished collections, used to drop superseded
    /// background GC requests.
    pub fn completed_gc_count(&self) -> u64 {
        self.gcs_completed.load(Ordering::Relaxed)
    }

    pub fn bytes_allocated(&self) -> usize {
        self.num_bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn target_footprint(&self) -> usize {
        self.target_footprint.load(Ordering::Relaxed)
    }

    pub fn has_zygote_space(&self) -> bool {
        self.zygote_space.is_some()
    }

    fn allocator_kind(&self) -> AllocatorKind {
        match self.collector_type {
            CollectorType::MarkSweep | CollectorType::ConcurrentMarkSweep => {
                AllocatorKind::FreeList
            }
            CollectorType::SemiSpace | CollectorType::MarkCompact => AllocatorKind::BumpPointer,
            CollectorType::ConcurrentCopying => AllocatorKind::Region,
        }
    }

    pub(crate) fn attach_current_thread(&mut self, mutator: &mut Mutator) {
        let _guard = self.mutators_lock.lock();
        self.mutators.push(mutator as *mut Mutator);
        self.safepoint.n_mutators.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn detach_current_thread(&mut self, mutator: *mut Mutator) {
        unsafe {
            let tlab = &mut (*mutator).tlab;
            if tlab.is_valid() {
                if self.bump_space.has_address(tlab.start.cast()) {
                    self.bump_space
                        .record_tlab_usage(tlab.objects_allocated(), tlab.used_bytes());
                }
                tlab.reset();
            }
        }
        let _guard = self.mutators_lock.lock();
        self.mutators.retain(|&m| m != mutator);
        self.safepoint.n_mutators.fetch_sub(1, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Allocation

    /// Allocate `value` on the managed heap.
    #[inline]
    pub fn allocate<T: Collectable + Sized + 'static>(
        &mut self,
        mutator: &mut MutatorRef,
        value: T,
    ) -> Gc<T> {
        mutator.safepoint();
        let size = align_usize(
            value.allocation_size() + size_of::<HeapObjectHeader>(),
            MIN_ALLOCATION,
        );
        unsafe {
            let large = size >= self.config.large_object_threshold;
            let mut header = self.try_allocate(mutator, size, large, false);
            if header.is_null() {
                header = self.allocate_slow(mutator, size, large);
            }
            (*header).value = 0;
            (*header).set_vtable(vtable_of::<T>());
            if large {
                (*header).set_large();
            } else {
                (*header).set_size(size);
            }
            (*header).type_id = small_type_id::<T>();
            ((*header).data() as *mut T).write(value);
            self.total_objects_allocated.fetch_add(1, Ordering::Relaxed);
            self.total_bytes_allocated.fetch_add(size, Ordering::Relaxed);
            self.notify_allocation(size);
            self.check_concurrent_gc(mutator);
            Gc {
                base: NonNull::new_unchecked(header),
                marker: Default::default(),
            }
        }
    }

    fn footprint_allows(&self, size: usize, grow: bool) -> bool {
        let limit = if grow {
            self.growth_limit
        } else {
            self.target_footprint.load(Ordering::Relaxed)
        };
        self.num_bytes_allocated.load(Ordering::Relaxed) + size <= limit
    }

    unsafe fn try_allocate(
        &mut self,
        mutator: &mut MutatorRef,
        size: usize,
        large: bool,
        grow: bool,
    ) -> *mut HeapObjectHeader {
        if large {
            if !self.footprint_allows(size, grow) {
                return null_mut();
            }
            let _guard = self.alloc_lock.lock();
            let header = self.large_space.allocate(size);
            if !header.is_null() {
                let usable = self.large_space.allocation_size(header);
                self.num_bytes_allocated.fetch_add(usable, Ordering::Relaxed);
            }
            return header;
        }
        match self.allocator_kind() {
            AllocatorKind::FreeList => {
                if !self.footprint_allows(size, grow) {
                    return null_mut();
                }
                let mut usable = 0;
                let ptr = {
                    let _guard = self.alloc_lock.lock();
                    self.main_space.alloc(size, &mut usable)
                };
                if ptr.is_null() {
                    return null_mut();
                }
                self.num_bytes_allocated.fetch_add(usable, Ordering::Relaxed);
                let header = ptr.cast::<HeapObjectHeader>();
                self.push_on_allocation_stack(mutator, header);
                header
            }
            AllocatorKind::BumpPointer => {
                if Tlab::can_allocate(size) {
                    let ptr = mutator.tlab.allocate(size);
                    if !ptr.is_null() {
                        return ptr.cast();
                    }
                    if !self.footprint_allows(TLAB_SIZE, grow) {
                        return null_mut();
                    }
                    match self.bump_space.alloc_block(TLAB_SIZE) {
                        Some((start, end)) => {
                            self.retire_tlab(mutator);
                            mutator.tlab.fill(start, end);
                            self.num_bytes_allocated
                                .fetch_add(TLAB_SIZE, Ordering::Relaxed);
                            mutator.tlab.allocate(size).cast()
                        }
                        None => null_mut(),
                    }
                } else {
                    if !self.footprint_allows(size, grow) {
                        return null_mut();
                    }
                    let ptr = self.bump_space.alloc(size);
                    if !ptr.is_null() {
                        self.num_bytes_allocated.fetch_add(size, Ordering::Relaxed);
                    }
                    ptr.cast()
                }
            }
            AllocatorKind::Region => {
                if Tlab::can_allocate(size) {
                    let ptr = mutator.tlab.allocate(size);
                    if !ptr.is_null() {
                        return ptr.cast();
                    }
                    if !self.footprint_allows(TLAB_SIZE, grow) {
                        return null_mut();
                    }
                    let block = {
                        let _guard = self.alloc_lock.lock();
                        self.region_space.as_mut().unwrap().alloc_tlab(TLAB_SIZE)
                    };
                    match block {
                        Some((start, end)) => {
                            self.retire_tlab(mutator);
                            mutator.tlab.fill(start, end);
                            self.num_bytes_allocated
                                .fetch_add(TLAB_SIZE, Ordering::Relaxed);
                            mutator.tlab.allocate(size).cast()
                        }
                        None => null_mut(),
                    }
                } else {
                    if !self.footprint_allows(size, grow) {
                        return null_mut();
                    }
                    let ptr = {
                        let _guard = self.alloc_lock.lock();
                        self.region_space.as_mut().unwrap().alloc(size)
                    };
                    if !ptr.is_null() {
                        self.num_bytes_allocated.fetch_add(size, Ordering::Relaxed);
                    }
                    ptr.cast()
                }
            }
        }
    }

    fn retire_tlab(&mut self, mutator: &mut MutatorRef) {
        let tlab = &mut mutator.tlab;
        if tlab.is_valid() {
            if self.bump_space.has_address(tlab.start.cast()) {
                self.bump_space
                    .record_tlab_usage(tlab.objects_allocated(), tlab.used_bytes());
            }
            tlab.reset();
        }
    }

    /// Free-list allocations are only discoverable through the allocation
    /// stack until a collection folds them into the live bitmap.
    unsafe fn push_on_allocation_stack(
        &mut self,
        mutator: &mut MutatorRef,
        obj: *mut HeapObjectHeader,
    ) {
        while !self.allocation_stack.atomic_push_back(obj) {
            // Stack full. A collection swaps in the empty stack.
            let plan = GcType::plan_for(
                self.collector_type,
                self.config.generational_cc,
                self.zygote_space.is_some(),
            );
            self.run_gc(mutator, plan[0], GcCause::ForAlloc, false);
        }
    }

    #[cold]
    #[inline(never)]
    unsafe fn allocate_slow(
        &mut self,
        mutator: &mut MutatorRef,
        size: usize,
        large: bool,
    ) -> *mut HeapObjectHeader {
        let plan = GcType::plan_for(
            self.collector_type,
            self.config.generational_cc,
            self.zygote_space.is_some(),
        );
        for &gc_type in plan.iter() {
            self.run_gc(mutator, gc_type, GcCause::ForAlloc, false);
            let ptr = self.try_allocate(mutator, size, large, false);
            if !ptr.is_null() {
                return ptr;
            }
        }
        // Let the footprint grow towards the hard limit.
        let ptr = self.try_allocate(mutator, size, large, true);
        if !ptr.is_null() {
            return ptr;
        }
        // Clearing soft references reclaims memory an ordinary cycle keeps.
        // Retried while each cycle still frees a useful fraction of the
        // heap; finalizer-style graphs can take a few cycles to unravel.
        const MAX_CLEAR_SOFT_ATTEMPTS: usize = 3;
        for _ in 0..MAX_CLEAR_SOFT_ATTEMPTS {
            self.run_gc(mutator, *plan.last().unwrap(), GcCause::ForAlloc, true);
            let ptr = self.try_allocate(mutator, size, large, true);
            if !ptr.is_null() {
                return ptr;
            }
            if self.last_cycle_freed_bytes() < self.growth_limit / 100 {
                break;
            }
        }
        if !large && self.allocator_kind() == AllocatorKind::FreeList {
            // The request may fit in total free memory without a run large
            // enough to hold it. Compaction is the last resort.
            if self.perform_homogeneous_space_compact(mutator) {
                let ptr = self.try_allocate(mutator, size, large, true);
                if !ptr.is_null() {
                    return ptr;
                }
            }
        }
        self.oom(size, large)
    }

    #[cold]
    fn oom(&mut self, size: usize, large: bool) -> ! {
        use std::fmt::Write;
        let mut report = String::new();
        let _ = writeln!(
            report,
            "allocation of {} failed: {} allocated, target footprint {}, growth limit {}",
            formatted_size(size),
            formatted_size(self.num_bytes_allocated.load(Ordering::Relaxed)),
            formatted_size(self.target_footprint.load(Ordering::Relaxed)),
            formatted_size(self.growth_limit),
        );
        if !large && self.allocator_kind() == AllocatorKind::FreeList {
            let largest = self.main_space.max_contiguous_allocation();
            if largest < size {
                let _ = writeln!(
                    report,
                    "failed due to fragmentation (largest possible contiguous allocation {})",
                    formatted_size(largest),
                );
            }
        }
        let _ = write!(report, "{}", self.dump_for_sig_quit());
        log::error!("{}", report);
        oom_abort()
    }

    // ------------------------------------------------------------------
    // Collection

    /// Block until no collection is in flight, then claim the slot for
    /// `collector`. Waiting happens with the mutator parked as safe so the
    /// running collector's pauses never wait on this thread, and the lock is
    /// released before any state transition.
    fn wait_for_gc_and_claim(&self, mutator: &Mutator, collector: CollectorType) {
        loop {
            {
                let mut running = self.collector_type_running.lock();
                if running.is_none() {
                    *running = Some(collector);
                    return;
                }
            }
            let state = mutator.enter_safe();
            let mut running = self.collector_type_running.lock();
            while running.is_some() {
                self.gc_complete_cond.wait(&mut running);
            }
            drop(running);
            drop(state);
        }
    }

    fn finish_gc(&self) {
        let mut running = self.collector_type_running.lock();
        *running = None;
        self.gc_complete_cond.notify_all();
    }

    /// Run one collection cycle of the configured collector at `gc_type`
    /// depth. Returns false when another collection satisfied the request
    /// while this thread waited its turn.
    pub fn run_gc(
        &mut self,
        mutator: &Mutator,
        gc_type: GcType,
        cause: GcCause,
        clear_soft: bool,
    ) -> bool {
        let mut collector_type = self.collector_type;
        if collector_type.is_moving() && *self.disable_moving_gc_count.lock() > 0 {
            collector_type = CollectorType::MarkSweep;
        }
        let completed_before = self.gcs_completed.load(Ordering::Relaxed);
        self.wait_for_gc_and_claim(mutator, collector_type);
        if cause == GcCause::Background
            && self.gcs_completed.load(Ordering::Relaxed) > completed_before
        {
            // A cycle finished while this request waited; the work it asked
            // for is done.
            self.finish_gc();
            return false;
        }
        let heap = unsafe { &mut *(self as *mut Heap) };
        // A sweep handed to the pool last cycle may still be rewriting free
        // list pages; every collector waits for it before touching spaces.
        self.mark_sweep.wait_for_concurrent_sweep(heap);
        if self.config.verify_heap {
            self.verify_heap(mutator, "pre gc");
        }
        let (ran, gc_type) = match collector_type {
            CollectorType::MarkSweep | CollectorType::ConcurrentMarkSweep => {
                let gc_type = if gc_type == GcType::Partial && self.zygote_space.is_none() {
                    GcType::Full
                } else {
                    gc_type
                };
                (
                    self.mark_sweep.run(heap, mutator, gc_type, cause, clear_soft),
                    gc_type,
                )
            }
            CollectorType::SemiSpace => (
                self.semi_space.run(
                    heap,
                    mutator,
                    CopyMode::EvacuateBumpSpace,
                    cause,
                    clear_soft,
                ),
                GcType::Full,
            ),
            CollectorType::MarkCompact => (
                self.mark_compact.run(heap, mutator, cause, clear_soft),
                GcType::Full,
            ),
            CollectorType::ConcurrentCopying => {
                let gc_type = if self.config.generational_cc && gc_type == GcType::Sticky {
                    GcType::Sticky
                } else {
                    GcType::Full
                };
                (
                    self.concurrent_copying.as_mut().unwrap().run(
                        heap, mutator, gc_type, cause, clear_soft,
                    ),
                    gc_type,
                )
            }
        };
        if ran {
            self.grow_for_utilization(gc_type);
            self.update_next_gc_type(collector_type, gc_type);
            self.gcs_completed.fetch_add(1, Ordering::Relaxed);
            if self.config.verify_heap {
                self.verify_heap(mutator, "post gc");
            }
        }
        self.finish_gc();
        ran
    }

    /// Bytes reclaimed by the most recent cycle of the collector that would
    /// run next. Gates the retries of the allocation slow path.
    fn last_cycle_freed_bytes(&self) -> usize {
        let mut collector_type = self.collector_type;
        if collector_type.is_moving() && *self.disable_moving_gc_count.lock() > 0 {
            collector_type = CollectorType::MarkSweep;
        }
        match collector_type {
            CollectorType::MarkSweep | CollectorType::ConcurrentMarkSweep => {
                self.mark_sweep.base.iteration.total_freed_bytes()
            }
            CollectorType::SemiSpace => self.semi_space.base.iteration.total_freed_bytes(),
            CollectorType::MarkCompact => self.mark_compact.base.iteration.total_freed_bytes(),
            CollectorType::ConcurrentCopying => self
                .concurrent_copying
                .as_ref()
                .map_or(0, |cc| cc.base.iteration.total_freed_bytes()),
        }
    }

    /// Check live bitmaps and the allocation stack for basic object sanity.
    /// An inconsistency here means collector state is corrupt and continuing
    /// would spread the damage, so the process aborts.
    fn verify_heap(&self, mutator: &Mutator, phase: &str) {
        let _scope = match SafepointScope::new(mutator) {
            Some(scope) => scope,
            None => return,
        };
        // A concurrent sweep rewrites freed payloads under this lock.
        let _alloc = self.alloc_lock.lock();
        let mut failures = 0usize;
        {
            let mut check_space = |space: &BitmapSpace| {
                space
                    .live_bitmap()
                    .visit_marked_range(space.begin(), space.end(), |obj| unsafe {
                        if !(*obj).is_allocated() || (*obj).size() == 0 {
                            log::error!(
                                "{}: corrupt object {:p} in {}",
                                phase,
                                obj,
                                space.name()
                            );
                            failures += 1;
                        }
                    });
            };
            check_space(&self.main_space);
            check_space(&self.non_moving_space);
            if let Some(zygote) = self.zygote_space.as_ref() {
                check_space(zygote);
            }
            if let Some(image) = self.image_space.as_ref() {
                check_space(image);
            }
        }
        for &obj in self.allocation_stack.as_slice() {
            if obj.is_null() {
                continue;
            }
            let known = self.main_space.has_address(obj)
                || self.non_moving_space.has_address(obj)
                || self.bump_space.has_address(obj)
                || self
                    .region_space
                    .as_ref()
                    .map_or(false, |r| r.has_address(obj))
                || self.large_space.contains_object(obj);
            if !known {
                log::error!(
                    "{}: allocation stack entry {:p} is outside every space",
                    phase,
                    obj
                );
                failures += 1;
            }
        }
        if failures != 0 {
            log::error!(
                "{} heap verification failed with {} errors\n{}",
                phase,
                failures,
                self.dump_for_sig_quit()
            );
            std::process::abort();
        }
    }

    /// Install a callback fired whenever `interval` bytes have been allocated
    /// since the previous sample, receiving the size of the crossing
    /// allocation.
    pub fn set_allocation_listener(
        &mut self,
        interval: usize,
        callback: Box<dyn FnMut(usize) + Send>,
    ) {
        self.alloc_listener = Some(AllocListener {
            interval,
            bytes_until_sample: interval,
            callback,
        });
    }

    pub fn remove_allocation_listener(&mut self) {
        self.alloc_listener = None;
    }

    fn notify_allocation(&mut self, size: usize) {
        if let Some(listener) = self.alloc_listener.as_mut() {
            if listener.bytes_until_sample <= size {
                listener.bytes_until_sample = listener.interval;
                (listener.callback)(size);
            } else {
                listener.bytes_until_sample -= size;
            }
        }
    }

    pub(crate) fn collect_explicit(&mut self, mutator: &Mutator, keep: &mut [&mut dyn Trace]) {
        for root in keep.iter_mut() {
            // The pointer never outlives this call: extra_roots is cleared
            // before returning, so erasing the borrow lifetime is sound.
            let root_ptr: *mut dyn Trace = unsafe {
                std::mem::transmute::<&mut dyn Trace, &mut (dyn Trace + 'static)>(&mut **root)
            };
            self.extra_roots.push(root_ptr);
        }
        let plan = GcType::plan_for(
            self.collector_type,
            self.config.generational_cc,
            self.zygote_space.is_some(),
        );
        self.run_gc(mutator, *plan.last().unwrap(), GcCause::Explicit, false);
        self.extra_roots.clear();
    }

    /// Walk every root: mutator shadow stacks plus roots pinned by an
    /// explicit collection request.
    pub(crate) unsafe fn walk_roots(&mut self, visitor: &mut dyn Visitor) {
        for i in 0..self.mutators.len() {
            (*self.mutators[i]).shadow_stack().walk(|var| {
                var.trace(visitor);
            });
        }
        for &root in self.extra_roots.iter() {
            (*root).trace(visitor);
        }
    }

    fn check_concurrent_gc(&mut self, mutator: &mut MutatorRef) {
        if !self.collector_type.is_concurrent() {
            return;
        }
        if self.num_bytes_allocated.load(Ordering::Relaxed)
            < self.concurrent_start_bytes.load(Ordering::Relaxed)
        {
            return;
        }
        let completed = self.gcs_completed.load(Ordering::Relaxed);
        if self.gcs_requested.load(Ordering::Relaxed) > completed {
            return;
        }
        self.gcs_requested.store(completed + 1, Ordering::Relaxed);
        match &self.task_processor {
            Some(processor) => processor.add_task(Box::new(ConcurrentGcTask::new(
                GcCause::Background,
                completed + 1,
            ))),
            None => {
                let gc_type = self.next_gc_type;
                self.run_gc(mutator, gc_type, GcCause::Background, false);
            }
        }
    }

    /// Recompute the target footprint from this cycle's survivors, and with a
    /// concurrent collector the threshold at which the next background cycle
    /// starts.
    fn grow_for_utilization(&mut self, gc_type: GcType) {
        let bytes_allocated = self.num_bytes_allocated.load(Ordering::Relaxed);
        let foreground = self.process_state == ProcessState::JankPerceptible;
        let multiplier = if foreground && !self.config.low_memory_mode {
            self.config.foreground_heap_growth_multiplier
        } else {
            1.0
        };
        let adjusted_min_free = (self.config.min_free as f64 * multiplier) as usize;
        let adjusted_max_free = (self.config.max_free as f64 * multiplier) as usize;
        let target = if gc_type != GcType::Sticky {
            let delta = (bytes_allocated as f64 * (1.0 / self.config.target_utilization - 1.0))
                as usize;
            bytes_allocated + delta.clamp(adjusted_min_free, adjusted_max_free)
        } else {
            // A sticky cycle reclaims little; keep the footprint unless the
            // survivors already crossed it.
            self.target_footprint.load(Ordering::Relaxed).max(bytes_allocated)
        };
        let target = target.min(self.growth_limit);
        self.target_footprint.store(target, Ordering::Relaxed);
        self.update_concurrent_start_bytes(target);
    }

    fn update_concurrent_start_bytes(&mut self, target: usize) {
        if !self.collector_type.is_concurrent() {
            self.concurrent_start_bytes.store(usize::MAX, Ordering::Relaxed);
            return;
        }
        // Start concurrent cycles with enough headroom that allocation does
        // not outrun marking.
        let headroom = (target / 8).clamp(128 * 1024, 4 * 1024 * 1024);
        self.concurrent_start_bytes
            .store(target.saturating_sub(headroom), Ordering::Relaxed);
    }

    fn update_next_gc_type(&mut self, collector_type: CollectorType, gc_type: GcType) {
        let plan = GcType::plan_for(
            collector_type,
            self.config.generational_cc,
            self.zygote_space.is_some(),
        );
        if plan.len() == 1 {
            self.next_gc_type = plan[0];
            return;
        }
        let iteration = match collector_type {
            CollectorType::MarkSweep | CollectorType::ConcurrentMarkSweep => {
                &self.mark_sweep.base.iteration
            }
            CollectorType::ConcurrentCopying => {
                &self.concurrent_copying.as_ref().unwrap().base.iteration
            }
            _ => {
                self.next_gc_type = plan[0];
                return;
            }
        };
        if gc_type == GcType::Sticky {
            let bytes_allocated = self.num_bytes_allocated.load(Ordering::Relaxed);
            let fits = bytes_allocated <= self.target_footprint.load(Ordering::Relaxed);
            if fits && iteration.throughput() >= self.last_full_throughput {
                self.next_gc_type = GcType::Sticky;
            } else {
                // Escalate one step; the ladder ends at full.
                let pos = plan.iter().position(|&t| t == gc_type).unwrap_or(0);
                self.next_gc_type = plan[(pos + 1).min(plan.len() - 1)];
            }
        } else {
            self.last_full_throughput = iteration.throughput();
            self.next_gc_type = plan[0];
        }
    }

    // ------------------------------------------------------------------
    // Services for the collectors

    pub(crate) unsafe fn revoke_all_tlabs(&mut self) {
        for i in 0..self.mutators.len() {
            let mutator = self.mutators[i];
            let tlab = &mut (*mutator).tlab;
            if !tlab.is_valid() {
                continue;
            }
            if self.bump_space.has_address(tlab.start.cast()) {
                self.bump_space
                    .record_tlab_usage(tlab.objects_allocated(), tlab.used_bytes());
            }
            // Region TLAB usage is already visible through the region top.
            tlab.reset();
        }
    }

    /// Prepare the card table for a cycle: harvest immune-space cards into
    /// their mod-union tables and age or clear the rest.
    pub(crate) unsafe fn process_cards(&mut self, gc_type: GcType) {
        let card_table: *const CardTable = &self.card_table;
        if let Some(table) = self.image_mod_union.as_mut() {
            table.clear_cards(&*card_table);
        }
        if let Some(table) = self.zygote_mod_union.as_mut() {
            table.clear_cards(&*card_table);
        }
        if self.collector_type == CollectorType::ConcurrentCopying {
            if let Some(rem_set) = self.main_rem_set.as_mut() {
                rem_set.clear_cards(&*card_table);
            }
            if let Some(rem_set) = self.non_moving_rem_set.as_mut() {
                rem_set.clear_cards(&*card_table);
            }
            if let Some(region) = self.region_space.as_ref() {
                self.card_table.modify_cards_atomic(
                    region.begin(),
                    region.limit(),
                    age_card_visitor,
                    |_, _, _| (),
                );
            }
        } else {
            for space in [&self.non_moving_space, &self.main_space] {
                if gc_type == GcType::Sticky {
                    self.card_table.modify_cards_atomic(
                        space.begin(),
                        space.end(),
                        age_card_visitor,
                        |_, _, _| (),
                    );
                } else {
                    self.card_table.clear_card_range(space.begin(), space.end());
                }
            }
        }
    }

    pub(crate) fn swap_stacks(&mut self) {
        std::mem::swap(&mut self.allocation_stack, &mut self.live_stack);
    }

    /// Fold the live stack into the live bitmaps so the sweep can see (and
    /// possibly free) objects allocated since the last cycle.
    pub(crate) unsafe fn mark_alloc_stack_as_live(&mut self) {
        for &obj in self.live_stack.as_slice() {
            if obj.is_null() {
                continue;
            }
            if self.main_space.has_address(obj) {
                self.main_space.live_bitmap().set(obj.cast());
            } else if self.non_moving_space.has_address(obj) {
                self.non_moving_space.live_bitmap().set(obj.cast());
            }
        }
    }

    pub(crate) fn record_free(&self, objects: usize, bytes: usize) {
        self.total_objects_freed.fetch_add(objects, Ordering::Relaxed);
        self.total_bytes_freed.fetch_add(bytes, Ordering::Relaxed);
        let mut current = self.num_bytes_allocated.load(Ordering::Relaxed);
        loop {
            let new = current.saturating_sub(bytes);
            match self.num_bytes_allocated.compare_exchange_weak(
                current,
                new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current = x,
            }
        }
    }

    /// Sweep the free-list spaces under the allocation lock. Runs on the
    /// worker thread of a concurrent sweep while mutators keep allocating.
    pub(crate) unsafe fn sweep_malloc_spaces_locked(&mut self, _full: bool) -> (usize, usize) {
        let heap = self as *mut Heap;
        let _guard = self.alloc_lock.lock();
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        for space in [&mut (*heap).main_space, &mut (*heap).non_moving_space] {
            let space_ptr = space as *mut FreeListSpace;
            space.sweep(false, |obj| {
                freed_bytes += (*space_ptr).free(obj);
                freed_objects += 1;
            });
            space.swap_bitmaps();
        }
        (freed_objects, freed_bytes)
    }

    /// Liveness after a completed full mark, for reference processing in the
    /// moving collectors. Spaces they treat as immune count as live.
    pub(crate) unsafe fn is_live_after_full_mark(&self, obj: *mut HeapObjectHeader) -> bool {
        if let Some(image) = self.image_space.as_ref() {
            if image.has_address(obj) {
                return true;
            }
        }
        if let Some(zygote) = self.zygote_space.as_ref() {
            if zygote.has_address(obj) {
                return true;
            }
        }
        if self.main_space.has_address(obj) {
            return self.main_space.mark_bitmap().test(obj.cast());
        }
        if self.non_moving_space.has_address(obj) {
            return self.non_moving_space.mark_bitmap().test(obj.cast());
        }
        if self.large_space.contains_object(obj) {
            return (*PreciseAllocation::from_cell(obj)).is_live();
        }
        // Bump, temp and region addresses were already rewritten by the
        // collector before reference processing runs.
        true
    }

    pub(crate) fn swap_bump_spaces(&mut self) {
        std::mem::swap(&mut self.bump_space, &mut self.temp_space);
        self.arena
            .dontneed(self.temp_space.begin(), self.temp_space.capacity());
    }

    pub(crate) fn swap_main_and_backup(&mut self) {
        if let Some(backup) = self.main_backup_space.as_mut() {
            std::mem::swap(&mut self.main_space, backup);
        }
    }

    /// Null out or forward the targets of registered weak and soft cells.
    /// `is_live` returns the (possibly moved) address of a live object and
    /// None for a dead one.
    pub(crate) unsafe fn process_references(
        &mut self,
        mut is_live: impl FnMut(*mut HeapObjectHeader) -> Option<*mut HeapObjectHeader>,
    ) {
        let cells = std::mem::take(&mut self.weak_refs);
        let mut kept = Vec::with_capacity(cells.len());
        for cell in cells {
            let cell = match is_live(cell) {
                Some(cell) => cell,
                // The cell itself died, nothing can reach it anymore.
                None => continue,
            };
            let data = (*cell).data() as *mut GcRefCell;
            let target = (*data).target;
            if !target.is_null() {
                (*data).target = is_live(target).unwrap_or(null_mut());
            }
            kept.push(cell);
        }
        self.weak_refs = kept;
    }

    pub(crate) fn register_reference(&mut self, cell: Gc<GcRefCell>) {
        let _guard = self.alloc_lock.lock();
        self.weak_refs.push(cell.raw());
    }

    /// Record a reference store into `obj`. Large objects live outside the
    /// card table window and are recorded directly.
    pub(crate) fn write_barrier(&mut self, obj: *mut HeapObjectHeader) {
        if self.large_space.contains_object(obj) {
            let _guard = self.alloc_lock.lock();
            self.large_space.record_dirty_object(obj);
        } else {
            self.card_table.mark_card(obj.cast());
        }
    }

    // ------------------------------------------------------------------
    // Space shaping

    /// Defragment the main space by copying it into the backup space and
    /// swapping the two. Frees no objects beyond what the copy drops.
    pub fn perform_homogeneous_space_compact(&mut self, mutator: &Mutator) -> bool {
        self.homogeneous_compact_with_cause(mutator, GcCause::HomogeneousSpaceCompact)
    }

    pub(crate) fn homogeneous_compact_with_cause(
        &mut self,
        mutator: &Mutator,
        cause: GcCause,
    ) -> bool {
        if self.allocator_kind() != AllocatorKind::FreeList {
            return false;
        }
        if *self.disable_moving_gc_count.lock() > 0 {
            return false;
        }
        self.wait_for_gc_and_claim(mutator, CollectorType::SemiSpace);
        if *self.disable_moving_gc_count.lock() > 0 {
            // Moving got disabled while this thread waited its turn.
            self.finish_gc();
            return false;
        }
        let heap = unsafe { &mut *(self as *mut Heap) };
        self.mark_sweep.wait_for_concurrent_sweep(heap);
        let ran = self
            .semi_space
            .run(heap, mutator, CopyMode::CompactMainSpace, cause, false);
        if ran {
            self.gcs_completed.fetch_add(1, Ordering::Relaxed);
            // The fragmented former main space sits in the backup slot;
            // retire it and hand its pages back.
            let arena: *const Mmap = &self.arena;
            if let Some(backup) = self.main_backup_space.as_mut() {
                let begin = backup.begin();
                let capacity = backup.capacity();
                unsafe {
                    (*arena).dontneed(begin, capacity);
                }
                *backup = FreeListSpace::create("main space", begin, 0, capacity, true);
            }
            log::info!(
                "homogeneous space compaction: main space {} in {} objects, largest free run {}",
                formatted_size(self.main_space.bytes_allocated()),
                self.main_space.objects_allocated(),
                formatted_size(self.main_space.max_contiguous_allocation()),
            );
        }
        self.finish_gc();
        ran
    }

    /// Seal everything allocated so far into an immune zygote space, to be
    /// shared across forked children. The main space is compacted first so
    /// the zygote covers a dense prefix; a fresh main space takes over the
    /// rest of the range.
    pub fn pre_zygote_fork(&mut self, mutator: &Mutator) {
        if self.zygote_space.is_some() {
            return;
        }
        if !self.perform_homogeneous_space_compact(mutator) {
            // Lost the arbitration or the allocator cannot compact; a full
            // collection at least sheds garbage before sealing.
            self.run_gc(mutator, GcType::Full, GcCause::Explicit, true);
        }
        // Sealing the main space must not overlap a collection in flight,
        // concurrent marking included.
        self.wait_for_gc_and_claim(mutator, self.collector_type);
        let heap = unsafe { &mut *(self as *mut Heap) };
        self.mark_sweep.wait_for_concurrent_sweep(heap);
        let scope = loop {
            if let Some(scope) = SafepointScope::new(mutator) {
                break scope;
            }
        };
        unsafe {
            self.revoke_all_tlabs();
            // Everything allocated after the compaction is live by decree.
            for &obj in self.allocation_stack.as_slice() {
                if !obj.is_null() && self.main_space.has_address(obj) {
                    self.main_space.live_bitmap().set(obj.cast());
                }
            }
            self.allocation_stack.reset();
            self.live_stack.reset();

            let zygote_begin = self.main_space.begin();
            let zygote_end = align_up(self.main_space.end() as usize, PAGE_SIZE) as *mut u8;
            let limit = self.main_space.limit();
            let new_main = FreeListSpace::create(
                "main space",
                zygote_end,
                0,
                limit as usize - zygote_end as usize,
                true,
            );
            let old_main = std::mem::replace(&mut self.main_space, new_main);
            let objects = old_main.objects_allocated();
            let mut sealed = old_main.into_bitmap_space();
            sealed.set_limit(zygote_end);
            let zygote = ZygoteSpace::from_bitmap_space(sealed, objects);
            log::info!(
                "zygote space created: {} objects / {}",
                zygote.objects_allocated(),
                formatted_size(zygote.bytes_allocated()),
            );
            self.zygote_space = Some(zygote);
            self.zygote_mod_union = Some(ModUnionTable::new(
                "zygote space mod union",
                zygote_begin,
                zygote_end,
            ));
            self.large_space.set_all_large_objects_as_zygote();
            self.next_gc_type = GcType::Sticky;
        }
        drop(scope);
        self.finish_gc();
    }

    /// Write the zygote space out as a boot image loadable by
    /// [HeapConfig::image_path].
    pub fn write_zygote_image(&self, path: &Path) -> std::io::Result<()> {
        let zygote = self.zygote_space.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "no zygote space to write")
        })?;
        image_space::write_image(
            path,
            zygote.begin(),
            zygote.end() as usize - zygote.begin() as usize,
            zygote.objects_allocated() as u64,
        )
    }

    // ------------------------------------------------------------------
    // External pressure and process state

    /// Account allocation of `bytes` of native memory whose lifetime is tied
    /// to managed objects, collecting if the pressure got too high.
    pub fn register_native_allocation(&mut self, mutator: &Mutator, bytes: usize) {
        let total = self
            .native_bytes_registered
            .fetch_add(bytes, Ordering::Relaxed)
            + bytes;
        if total > self.target_footprint.load(Ordering::Relaxed) {
            let plan = GcType::plan_for(
                self.collector_type,
                self.config.generational_cc,
                self.zygote_space.is_some(),
            );
            self.run_gc(mutator, *plan.last().unwrap(), GcCause::NativeAlloc, false);
        }
    }

    pub fn register_native_free(&mut self, bytes: usize) {
        let mut current = self.native_bytes_registered.load(Ordering::Relaxed);
        loop {
            let new = current.saturating_sub(bytes);
            match self.native_bytes_registered.compare_exchange_weak(
                current,
                new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current = x,
            }
        }
    }

    /// While the returned count is held moving collections are replaced by
    /// full mark sweep cycles, so raw pointers handed to native code stay
    /// put.
    pub fn increment_disable_moving_gc(&mut self, mutator: &Mutator) {
        // A moving collection may be in flight; parking at the safepoint
        // orders this request after it.
        mutator.safepoint();
        *self.disable_moving_gc_count.lock() += 1;
    }

    pub fn decrement_disable_moving_gc(&mut self) {
        let mut count = self.disable_moving_gc_count.lock();
        debug_assert!(*count > 0);
        *count -= 1;
    }

    /// Foreground/background transition. Background processes get a tighter
    /// footprint: the heap is compacted and trimmed when the process stops
    /// being jank sensitive.
    pub fn update_process_state(&mut self, mutator: &Mutator, state: ProcessState) {
        if self.process_state == state {
            return;
        }
        self.process_state = state;
        if state == ProcessState::JankImperceptible {
            match &self.task_processor {
                Some(processor) => processor.add_task(Box::new(CollectorTransitionTask::after(
                    Duration::from_secs(5),
                ))),
                None => {
                    self.homogeneous_compact_with_cause(mutator, GcCause::CollectorTransition);
                    self.trim();
                }
            }
        }
    }

    /// Schedule a trim for when the heap has likely gone quiet.
    pub fn request_trim(&mut self) {
        match &self.task_processor {
            Some(processor) => {
                processor.add_task(Box::new(HeapTrimTask::after(Duration::from_secs(5))))
            }
            None => {
                self.trim();
            }
        }
    }

    /// Return free pages of the malloc spaces and free regions to the
    /// system. Returns the number of bytes released.
    pub fn trim(&mut self) -> usize {
        let _guard = self.alloc_lock.lock();
        let arena: *const Mmap = &self.arena;
        let mut reclaimed = self
            .main_space
            .trim(|page, size| unsafe { (*arena).dontneed(page, size) });
        reclaimed += self
            .non_moving_space
            .trim(|page, size| unsafe { (*arena).dontneed(page, size) });
        if let Some(region) = self.region_space.as_ref() {
            region.release_free_regions(|page, size| {
                unsafe { (*arena).dontneed(page, size) };
                reclaimed += size;
            });
        }
        log::debug!("heap trim reclaimed {}", formatted_size(reclaimed));
        reclaimed
    }

    // ------------------------------------------------------------------
    // Introspection

    pub fn statistics(&self) -> HeapStatistics {
        let mut cycles = 0;
        let mut total_time = Duration::ZERO;
        let mut total_pause = Duration::ZERO;
        let mut max_pause = Duration::ZERO;
        let mut collectors = vec![
            &self.mark_sweep.base,
            &self.semi_space.base,
            &self.mark_compact.base,
        ];
        if let Some(cc) = self.concurrent_copying.as_ref() {
            collectors.push(&cc.base);
        }
        for collector in collectors {
            let stats = &collector.cumulative;
            cycles += stats.cycles;
            total_time += stats.total_time;
            total_pause += stats.total_pause_time;
            max_pause = max_pause.max(stats.max_pause);
        }
        HeapStatistics {
            bytes_allocated: self.num_bytes_allocated.load(Ordering::Relaxed),
            target_footprint: self.target_footprint.load(Ordering::Relaxed),
            growth_limit: self.growth_limit,
            capacity: self.config.capacity,
            concurrent_start_bytes: self.concurrent_start_bytes.load(Ordering::Relaxed),
            total_objects_allocated: self.total_objects_allocated.load(Ordering::Relaxed),
            total_bytes_allocated: self.total_bytes_allocated.load(Ordering::Relaxed),
            total_gc_cycles: cycles,
            total_gc_time: total_time,
            total_pause_time: total_pause,
            max_pause,
            total_bytes_freed: self.total_bytes_freed.load(Ordering::Relaxed),
            total_objects_freed: self.total_objects_freed.load(Ordering::Relaxed),
            native_bytes_registered: self.native_bytes_registered.load(Ordering::Relaxed),
        }
    }

    /// Multi-line report of heap and collector state, in the spirit of the
    /// SIGQUIT dumps runtimes produce.
    pub fn dump_for_sig_quit(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = write!(out, "{}", self.statistics());
        if let Some(image) = self.image_space.as_ref() {
            let _ = writeln!(out, "  image space: {} objects", image.objects_allocated());
        }
        if let Some(zygote) = self.zygote_space.as_ref() {
            let _ = writeln!(
                out,
                "  zygote space: {} objects / {}",
                zygote.objects_allocated(),
                formatted_size(zygote.bytes_allocated()),
            );
        }
        for space in [&self.main_space, &self.non_moving_space] {
            let _ = writeln!(
                out,
                "  {}: {} objects / {} (footprint {})",
                space.name(),
                space.objects_allocated(),
                formatted_size(space.bytes_allocated()),
                formatted_size(space.footprint()),
            );
        }
        if self.allocator_kind() == AllocatorKind::BumpPointer {
            let _ = writeln!(
                out,
                "  {}: {} objects / {}",
                self.bump_space.name(),
                self.bump_space.objects_allocated(),
                formatted_size(self.bump_space.bytes_allocated()),
            );
        }
        if let Some(region) = self.region_space.as_ref() {
            let _ = writeln!(
                out,
                "  region space: {}/{} regions in use, {}",
                region.non_free_region_count(),
                region.num_regions(),
                formatted_size(region.bytes_allocated()),
            );
        }
        let _ = writeln!(
            out,
            "  large object space: {} objects / {}",
            self.large_space.objects_allocated(),
            formatted_size(self.large_space.bytes_allocated()),
        );
        let mut collectors = vec![
            &self.mark_sweep.base,
            &self.semi_space.base,
            &self.mark_compact.base,
        ];
        if let Some(cc) = self.concurrent_copying.as_ref() {
            collectors.push(&cc.base);
        }
        for collector in collectors {
            let stats = &collector.cumulative;
            if stats.cycles == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "  {}: {} cycles in {:.3}s, mean throughput {}/s, max pause {:.3}ms",
                collector.name(),
                stats.cycles,
                stats.total_time.as_secs_f64(),
                formatted_size(stats.mean_throughput() as usize),
                stats.max_pause.as_secs_f64() * 1000.0,
            );
        }
        out
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // A pool sweep still holds a raw pointer into the spaces; they drop
        // right after this.
        let heap = unsafe { &mut *(self as *mut Heap) };
        self.mark_sweep.wait_for_concurrent_sweep(heap);
        if let Some(processor) = self.task_processor.take() {
            processor.stop();
        }
    }
}
