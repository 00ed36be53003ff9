pub mod concurrent_copying;
pub mod mark_compact;
pub mod mark_sweep;
pub mod semi_space;

use std::time::Duration;

use crate::statistics::{CumulativeStats, GcCause, Iteration};

/// Which collector implementation drives the heap.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectorType {
    /// Stop the world mark-sweep.
    MarkSweep,
    /// Mark-sweep with concurrent marking and sweeping.
    ConcurrentMarkSweep,
    /// Copying collector between two bump pointer spaces.
    SemiSpace,
    /// Region based copying collector with concurrent marking.
    ConcurrentCopying,
    /// Sliding compaction within one bump pointer space.
    MarkCompact,
}

impl CollectorType {
    pub fn is_moving(self) -> bool {
        !matches!(self, CollectorType::MarkSweep | CollectorType::ConcurrentMarkSweep)
    }

    pub fn is_concurrent(self) -> bool {
        matches!(
            self,
            CollectorType::ConcurrentMarkSweep | CollectorType::ConcurrentCopying
        )
    }
}

impl std::fmt::Display for CollectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollectorType::MarkSweep => "mark sweep",
            CollectorType::ConcurrentMarkSweep => "concurrent mark sweep",
            CollectorType::SemiSpace => "semi space",
            CollectorType::ConcurrentCopying => "concurrent copying",
            CollectorType::MarkCompact => "mark compact",
        };
        f.write_str(s)
    }
}

/// Collection depth, ordered from cheapest to most thorough.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum GcType {
    /// Only objects allocated since the last collection are considered.
    Sticky,
    /// Everything except the zygote and image spaces.
    Partial,
    /// Everything except the image space.
    Full,
}

impl GcType {
    /// The escalation ladder a collector runs through when an allocation
    /// still does not fit after a cheaper collection.
    pub fn plan_for(collector: CollectorType, generational: bool, has_zygote: bool) -> Vec<GcType> {
        match collector {
            CollectorType::MarkSweep | CollectorType::ConcurrentMarkSweep => {
                let mut plan = vec![GcType::Sticky];
                if has_zygote {
                    plan.push(GcType::Partial);
                }
                plan.push(GcType::Full);
                plan
            }
            CollectorType::SemiSpace | CollectorType::MarkCompact => vec![GcType::Full],
            CollectorType::ConcurrentCopying => {
                if generational {
                    vec![GcType::Sticky, GcType::Full]
                } else {
                    vec![GcType::Full]
                }
            }
        }
    }
}

impl std::fmt::Display for GcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GcType::Sticky => "sticky",
            GcType::Partial => "partial",
            GcType::Full => "full",
        };
        f.write_str(s)
    }
}

/// State common to every collector: naming and per-cycle plus cumulative
/// accounting.
pub struct GarbageCollector {
    name: &'static str,
    pub iteration: Iteration,
    pub cumulative: CumulativeStats,
}

impl GarbageCollector {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            iteration: Iteration::default(),
            cumulative: CumulativeStats::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn begin_cycle(&mut self, cause: GcCause) {
        self.iteration.reset(cause);
    }

    pub fn record_pause(&mut self, pause: Duration) {
        self.iteration.pause_times.push(pause);
    }

    pub fn end_cycle(&mut self, duration: Duration) {
        self.iteration.duration = duration;
        self.cumulative.record(&self.iteration);
    }

    pub fn record_free(&mut self, objects: usize, bytes: usize) {
        self.iteration.freed_objects += objects;
        self.iteration.freed_bytes += bytes;
    }

    pub fn record_free_los(&mut self, objects: usize, bytes: usize) {
        self.iteration.freed_los_objects += objects;
        self.iteration.freed_los_bytes += bytes;
    }
}
