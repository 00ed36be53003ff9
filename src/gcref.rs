use std::marker::PhantomData;
use std::ptr::{null_mut, NonNull};

use crate::{
    api::{Collectable, Gc, HeapObjectHeader, Trace, Visitor},
    mutator::MutatorRef,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefKind {
    /// Cleared as soon as the target is no longer strongly reachable.
    Weak,
    /// Kept alive by ordinary collections, cleared only when the heap
    /// decides to shed softly reachable memory.
    Soft,
}

/// Heap-allocated cell holding a non-strong reference. The heap keeps a
/// registry of live cells and nulls their targets after marking, once the
/// target turned out to be unreachable (or, for soft cells, when the cycle
/// was asked to clear them).
pub struct GcRefCell {
    pub(crate) target: *mut HeapObjectHeader,
    pub(crate) kind: RefKind,
}

impl Trace for GcRefCell {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        if self.target.is_null() {
            return;
        }
        match self.kind {
            RefKind::Soft => unsafe {
                let mut target = NonNull::new_unchecked(self.target);
                vis.mark_soft(&mut target);
                self.target = target.as_ptr();
            },
            // Weak targets are never traced; reference processing either
            // forwards or clears them.
            RefKind::Weak => {}
        }
    }
}

impl Collectable for GcRefCell {}

/// Typed handle to a [GcRefCell]. The handle itself traces the cell
/// strongly; the cell's target follows weak or soft semantics.
pub struct WeakRef<T: Collectable> {
    pub(crate) cell: Gc<GcRefCell>,
    marker: PhantomData<T>,
}

impl<T: Collectable + Sized + 'static> WeakRef<T> {
    pub fn new(mutator: &mut MutatorRef, target: Gc<T>) -> Self {
        Self::with_kind(mutator, target, RefKind::Weak)
    }

    pub fn soft(mutator: &mut MutatorRef, target: Gc<T>) -> Self {
        Self::with_kind(mutator, target, RefKind::Soft)
    }

    fn with_kind(mutator: &mut MutatorRef, target: Gc<T>, kind: RefKind) -> Self {
        let cell = mutator.allocate(GcRefCell {
            target: target.raw(),
            kind,
        });
        mutator.heap_ref().register_reference(cell);
        Self {
            cell,
            marker: PhantomData,
        }
    }

    /// The target, if it is still alive.
    pub fn upgrade(&self) -> Option<Gc<T>> {
        let target = self.cell.target;
        if target.is_null() {
            None
        } else {
            Some(Gc::from_raw(target))
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.cell.target.is_null()
    }

    pub fn kind(&self) -> RefKind {
        self.cell.kind
    }

    /// Drop the target early without waiting for a collection.
    pub fn clear(&mut self) {
        self.cell.target = null_mut();
    }
}

impl<T: Collectable> Trace for WeakRef<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.mark_object(&mut self.cell.base);
    }
}

impl<T: Collectable> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell,
            marker: PhantomData,
        }
    }
}

impl<T: Collectable> Copy for WeakRef<T> {}
