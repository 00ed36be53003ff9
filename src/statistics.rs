use std::time::Duration;

use crate::utils::formatted_size;

/// What prompted a collection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcCause {
    /// An allocation could not be satisfied.
    ForAlloc,
    /// Allocation crossed the concurrent start threshold.
    Background,
    /// User requested collection.
    Explicit,
    /// Native allocation pressure.
    NativeAlloc,
    /// Collector transition (foreground/background switch).
    CollectorTransition,
    HomogeneousSpaceCompact,
    DisableMovingGc,
}

impl std::fmt::Display for GcCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GcCause::ForAlloc => "Alloc",
            GcCause::Background => "Background",
            GcCause::Explicit => "Explicit",
            GcCause::NativeAlloc => "NativeAlloc",
            GcCause::CollectorTransition => "CollectorTransition",
            GcCause::HomogeneousSpaceCompact => "HomogeneousSpaceCompact",
            GcCause::DisableMovingGc => "DisableMovingGc",
        };
        f.write_str(s)
    }
}

/// Bookkeeping for one collection cycle.
#[derive(Default)]
pub struct Iteration {
    pub cause: Option<GcCause>,
    pub duration: Duration,
    pub pause_times: Vec<Duration>,
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub freed_los_objects: usize,
    pub freed_los_bytes: usize,
}

impl Iteration {
    pub fn reset(&mut self, cause: GcCause) {
        self.cause = Some(cause);
        self.duration = Duration::ZERO;
        self.pause_times.clear();
        self.freed_objects = 0;
        self.freed_bytes = 0;
        self.freed_los_objects = 0;
        self.freed_los_bytes = 0;
    }

    pub fn total_freed_bytes(&self) -> usize {
        self.freed_bytes + self.freed_los_bytes
    }

    pub fn total_freed_objects(&self) -> usize {
        self.freed_objects + self.freed_los_objects
    }

    /// Bytes reclaimed per second of collector time. Drives the choice
    /// between repeating a sticky collection and escalating.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.total_freed_bytes() as f64 / secs
    }
}

/// Running totals for one collector across all of its cycles.
#[derive(Default)]
pub struct CumulativeStats {
    pub cycles: usize,
    pub total_time: Duration,
    pub total_pause_time: Duration,
    pub max_pause: Duration,
    pub total_freed_objects: usize,
    pub total_freed_bytes: usize,
}

impl CumulativeStats {
    pub fn record(&mut self, iteration: &Iteration) {
        self.cycles += 1;
        self.total_time += iteration.duration;
        for &pause in iteration.pause_times.iter() {
            self.total_pause_time += pause;
            if pause > self.max_pause {
                self.max_pause = pause;
            }
        }
        self.total_freed_objects += iteration.total_freed_objects();
        self.total_freed_bytes += iteration.total_freed_bytes();
    }

    pub fn mean_throughput(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.total_freed_bytes as f64 / secs
    }
}

/// Snapshot of overall heap health, printable on demand.
pub struct HeapStatistics {
    pub bytes_allocated: usize,
    pub target_footprint: usize,
    pub growth_limit: usize,
    pub capacity: usize,
    pub concurrent_start_bytes: usize,
    pub total_objects_allocated: usize,
    pub total_bytes_allocated: usize,
    pub total_gc_cycles: usize,
    pub total_gc_time: Duration,
    pub total_pause_time: Duration,
    pub max_pause: Duration,
    pub total_bytes_freed: usize,
    pub total_objects_freed: usize,
    pub native_bytes_registered: usize,
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Allocated: {} (target footprint {}, growth limit {}, capacity {})",
            formatted_size(self.bytes_allocated),
            formatted_size(self.target_footprint),
            formatted_size(self.growth_limit),
            formatted_size(self.capacity),
        )?;
        writeln!(
            f,
            "  Concurrent start bytes: {}",
            formatted_size(self.concurrent_start_bytes)
        )?;
        writeln!(
            f,
            "  Total allocated: {} objects / {}",
            self.total_objects_allocated,
            formatted_size(self.total_bytes_allocated)
        )?;
        writeln!(
            f,
            "  Total freed: {} objects / {}",
            self.total_objects_freed,
            formatted_size(self.total_bytes_freed)
        )?;
        writeln!(
            f,
            "  GC cycles: {} in {:.3}s (paused {:.3}s, max pause {:.3}ms)",
            self.total_gc_cycles,
            self.total_gc_time.as_secs_f64(),
            self.total_pause_time.as_secs_f64(),
            self.max_pause.as_secs_f64() * 1000.0,
        )?;
        writeln!(
            f,
            "  Registered native bytes: {}",
            formatted_size(self.native_bytes_registered)
        )?;
        Ok(())
    }
}
