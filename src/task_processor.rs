use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{mutator::MutatorRef, statistics::GcCause};

/// Deferred heap maintenance work, run by the heap's daemon thread.
pub trait HeapTask: Send {
    /// Earliest time the task should run.
    fn target_run_time(&self) -> Instant {
        Instant::now()
    }

    fn run(&mut self, mutator: &mut MutatorRef);
}

struct QueuedTask {
    task: Box<dyn HeapTask>,
    when: Instant,
    /// Tie breaker keeping same-deadline tasks in submission order.
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Queue {
    tasks: BinaryHeap<QueuedTask>,
    running: bool,
    next_seq: u64,
}

/// Deadline-ordered task queue drained by one daemon mutator. Waiting
/// happens with the daemon parked as safe, so pauses never wait for it.
pub struct TaskProcessor {
    queue: Mutex<Queue>,
    cond: Condvar,
}

impl TaskProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(Queue {
                tasks: BinaryHeap::new(),
                running: true,
                next_seq: 0,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn add_task(&self, task: Box<dyn HeapTask>) {
        let mut queue = self.queue.lock();
        let when = task.target_run_time();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.tasks.push(QueuedTask { task, when, seq });
        self.cond.notify_all();
    }

    pub fn stop(&self) {
        let mut queue = self.queue.lock();
        queue.running = false;
        self.cond.notify_all();
    }

    /// Block until a task is due. None once the processor was stopped.
    pub fn next_task(&self) -> Option<Box<dyn HeapTask>> {
        let mut queue = self.queue.lock();
        loop {
            if !queue.running {
                return None;
            }
            match queue.tasks.peek() {
                None => {
                    self.cond.wait(&mut queue);
                }
                Some(head) if head.when <= Instant::now() => {
                    return Some(queue.tasks.pop().unwrap().task);
                }
                Some(head) => {
                    let when = head.when;
                    self.cond.wait_until(&mut queue, when);
                }
            }
        }
    }
}

/// Runs the next planned collection depth in the background once allocation
/// crossed the concurrent start threshold.
pub struct ConcurrentGcTask {
    cause: GcCause,
    /// Sequence number this request is meant to satisfy. A collection that
    /// completed in the meantime makes the task redundant.
    requested_gc_num: u64,
}

impl ConcurrentGcTask {
    pub fn new(cause: GcCause, requested_gc_num: u64) -> Self {
        Self {
            cause,
            requested_gc_num,
        }
    }
}

impl HeapTask for ConcurrentGcTask {
    fn run(&mut self, mutator: &mut MutatorRef) {
        let heap = mutator.heap_ref();
        if heap.completed_gc_count() >= self.requested_gc_num {
            return;
        }
        let gc_type = heap.next_gc_type();
        heap.run_gc(mutator, gc_type, self.cause, false);
    }
}

/// Returns unused pages to the system a little while after the heap went
/// quiet or the process went to the background.
pub struct HeapTrimTask {
    when: Instant,
}

impl HeapTrimTask {
    pub fn after(delay: Duration) -> Self {
        Self {
            when: Instant::now() + delay,
        }
    }
}

impl HeapTask for HeapTrimTask {
    fn target_run_time(&self) -> Instant {
        self.when
    }

    fn run(&mut self, mutator: &mut MutatorRef) {
        mutator.heap_ref().trim();
    }
}

/// Compacts the heap shortly after the process stopped being jank
/// sensitive, trading pause time for a tighter footprint.
pub struct CollectorTransitionTask {
    when: Instant,
}

impl CollectorTransitionTask {
    pub fn after(delay: Duration) -> Self {
        Self {
            when: Instant::now() + delay,
        }
    }
}

impl HeapTask for CollectorTransitionTask {
    fn target_run_time(&self) -> Instant {
        self.when
    }

    fn run(&mut self, mutator: &mut MutatorRef) {
        let heap = mutator.heap_ref();
        heap.homogeneous_compact_with_cause(mutator, GcCause::CollectorTransition);
        heap.trim();
    }
}
