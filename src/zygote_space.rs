use std::ops::{Deref, DerefMut};

use crate::{
    api::HeapObjectHeader,
    space::{BitmapSpace, GcRetentionPolicy},
};

/// Frozen space holding the objects that were live at the zygote fork.
/// Nothing is ever allocated here again; only a full collection sweeps it,
/// and its objects never move. Partial and sticky collections see it through
/// a mod-union table instead of scanning it.
pub struct ZygoteSpace {
    space: BitmapSpace,
    objects_allocated: usize,
}

impl ZygoteSpace {
    /// Seal an existing bitmap space. The caller has already packed the
    /// surviving objects into `[begin, end)` and set their live bits.
    pub fn from_bitmap_space(mut space: BitmapSpace, objects_allocated: usize) -> Self {
        space.set_retention_policy(GcRetentionPolicy::FullCollect);
        Self {
            space,
            objects_allocated,
        }
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated
    }

    pub fn bytes_allocated(&self) -> usize {
        self.size()
    }

    /// Sweep for a full collection. The swept objects just lose their live
    /// bit, the memory is never reused.
    pub fn sweep_full(&mut self, swap_bitmaps: bool) -> (usize, usize) {
        let mut freed_objects = 0;
        let mut freed_bytes = 0;
        let live_bitmap = self.live_bitmap() as *const crate::bitmap::ObjectBitmap;
        self.space.sweep(swap_bitmaps, |obj: *mut HeapObjectHeader| unsafe {
            freed_objects += 1;
            freed_bytes += (*obj).size();
            (*live_bitmap).clear(obj.cast());
        });
        self.objects_allocated -= freed_objects;
        (freed_objects, freed_bytes)
    }
}

impl Deref for ZygoteSpace {
    type Target = BitmapSpace;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        &self.space
    }
}

impl DerefMut for ZygoteSpace {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.space
    }
}
