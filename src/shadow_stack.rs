use crate::api::Trace;

/// Per-thread list of on-stack roots. Entries are linked through the machine
/// stack itself, pushing a root costs two pointer writes.
pub struct ShadowStack {
    #[doc(hidden)]
    pub head: core::cell::Cell<*mut RawShadowStackEntry>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self {
            head: core::cell::Cell::new(core::ptr::null_mut()),
        }
    }

    /// Walk all rooted values in this shadow stack.
    ///
    /// # Safety
    ///
    /// Must not run concurrently with pushes or pops on the owning thread,
    /// callers invoke it only at safepoints.
    pub unsafe fn walk(&self, mut visitor: impl FnMut(&mut dyn Rootable)) {
        let mut head = *self.head.as_ptr();
        while !head.is_null() {
            let next = (*head).prev;
            visitor((*head).get_dyn());
            head = next;
        }
    }
}

/// Raw entry in the shadow stack. Lives on the machine stack, constructed
/// only by [letroot!](crate::letroot).
#[repr(C)]
pub struct RawShadowStackEntry {
    stack: *mut ShadowStack,
    prev: *mut RawShadowStackEntry,
    /// Vtable of the `Rootable` impl of the rooted value.
    vtable: usize,
    /// The value itself starts right after the vtable word.
    data_start: [u8; 0],
}

impl RawShadowStackEntry {
    /// # Safety
    ///
    /// Returns `&mut dyn` from `&self`; moving collectors that update roots
    /// through this must be the only accessor at that point.
    pub unsafe fn get_dyn(&self) -> &mut dyn Rootable {
        core::mem::transmute(mopa::TraitObject {
            vtable: self.vtable as _,
            data: self.data_start.as_ptr() as *mut (),
        })
    }
}

/// Types that can live in a shadow stack slot.
pub trait Rootable: Trace {}
impl<T: Trace> Rootable for T {}

#[repr(C)]
pub struct ShadowStackInternal<'a, T: Rootable> {
    pub stack: &'a ShadowStack,
    pub prev: *mut RawShadowStackEntry,
    pub vtable: usize,
    pub value: T,
}

impl<'a, T: Rootable> ShadowStackInternal<'a, T> {
    #[doc(hidden)]
    /// # Safety
    ///
    /// Must only be invoked from `letroot!`.
    #[inline]
    pub unsafe fn construct(
        stack: &'a ShadowStack,
        prev: *mut RawShadowStackEntry,
        vtable: usize,
        value: T,
    ) -> Self {
        Self {
            stack,
            prev,
            vtable,
            value,
        }
    }
}

impl<T: Rootable> Drop for ShadowStackInternal<'_, T> {
    fn drop(&mut self) {
        (*self.stack).head.set(self.prev);
    }
}

/// Rooted value on stack. Non-copyable handle produced by `letroot!`.
pub struct Rooted<'a, 'b, T: Rootable> {
    #[doc(hidden)]
    pinned: core::pin::Pin<&'a mut ShadowStackInternal<'b, T>>,
}

impl<'a, 'b, T: Rootable> Rooted<'a, 'b, T> {
    /// # Safety
    ///
    /// Must only be invoked from `letroot!`.
    pub unsafe fn construct(pin: core::pin::Pin<&'a mut ShadowStackInternal<'b, T>>) -> Self {
        Self { pinned: pin }
    }
}

impl<'a, T: Rootable> core::ops::Deref for Rooted<'a, '_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.pinned.value
    }
}

impl<'a, T: Rootable> core::ops::DerefMut for Rooted<'a, '_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            &mut core::mem::transmute_copy::<_, &mut ShadowStackInternal<T>>(&mut self.pinned).value
        }
    }
}

impl<T: Rootable> std::fmt::Pointer for Rooted<'_, '_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.pinned)
    }
}

/// Roots a value in the current thread's shadow stack for the enclosing
/// lexical scope.
///
/// Does not heap allocate; the value is placed on the machine stack and the
/// entry is linked into the shadow stack until the binding goes out of scope.
#[macro_export]
macro_rules! letroot {
    ($var_name: ident: $t: ty = $stack: expr, $value: expr) => {
        let stack: &$crate::shadow_stack::ShadowStack = &$stack;
        let value = $value;
        let mut $var_name = unsafe {
            $crate::shadow_stack::ShadowStackInternal::<$t>::construct(
                stack,
                stack.head.get(),
                core::mem::transmute::<_, $crate::mopa::TraitObject>(
                    &value as &dyn $crate::shadow_stack::Rootable,
                )
                .vtable as usize,
                value,
            )
        };

        stack
            .head
            .set(unsafe { core::mem::transmute(&mut $var_name) });
        #[allow(unused_mut)]
        let mut $var_name =
            unsafe { $crate::shadow_stack::Rooted::construct(std::pin::Pin::new(&mut $var_name)) };
    };

    ($var_name: ident = $stack: expr, $value: expr) => {
        let stack: &$crate::shadow_stack::ShadowStack = &$stack;
        let value = $value;
        let mut $var_name = unsafe {
            $crate::shadow_stack::ShadowStackInternal::<_>::construct(
                stack,
                stack.head.get(),
                core::mem::transmute::<_, $crate::mopa::TraitObject>(
                    &value as &dyn $crate::shadow_stack::Rootable,
                )
                .vtable as usize,
                value,
            )
        };

        stack
            .head
            .set(unsafe { core::mem::transmute(&mut $var_name) });
        #[allow(unused_mut)]
        let mut $var_name =
            unsafe { $crate::shadow_stack::Rooted::construct(std::pin::Pin::new(&mut $var_name)) };
    };
}
