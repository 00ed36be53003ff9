use std::{
    any::TypeId,
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem::size_of,
    ptr::{null_mut, NonNull},
};

use crate::utils::BitFieldTrait;
use mopa::mopafy;

/// Visitor over the reference slots of an object graph. Collectors implement
/// this to mark, forward or otherwise inspect outgoing references.
pub trait Visitor {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>);
    /// Soft reference slots go through here so collectors can decide whether
    /// to treat them as strong. The default keeps them strong.
    fn mark_soft(&mut self, root: &mut NonNull<HeapObjectHeader>) {
        self.mark_object(root);
    }
}

pub trait Trace {
    fn trace(&mut self, _vis: &mut dyn Visitor) {}
}

pub trait Collectable: Trace + mopa::Any {
    fn allocation_size(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

mopafy!(Collectable);

/// All allocations are aligned to this granularity; object sizes are encoded
/// in units of it.
pub const MIN_ALLOCATION: usize = 8;

pub struct VTableBitField;
pub struct SizeBitField;
pub struct ForwardedBit;

impl BitFieldTrait<0, 48> for VTableBitField {}
impl BitFieldTrait<48, 14> for SizeBitField {}
impl BitFieldTrait<62, 1> for ForwardedBit {}

/// Header prepended to every managed object.
///
/// `value` packs the vtable pointer (48 bits), the allocation size in units of
/// [MIN_ALLOCATION] (14 bits, zero meaning "large object, the size lives in
/// the large-object space header") and the forwarded bit used by the moving
/// collectors. While the forwarded bit is set the vtable bits hold the new
/// address instead.
#[repr(C)]
pub struct HeapObjectHeader {
    pub value: u64,
    pub type_id: u32,
    pub padding: u32,
}

impl HeapObjectHeader {
    #[inline(always)]
    pub fn get_dyn(&mut self) -> &mut dyn Collectable {
        unsafe {
            std::mem::transmute(mopa::TraitObject {
                data: self.data() as *mut (),
                vtable: self.vtable() as _,
            })
        }
    }

    #[inline(always)]
    pub fn set_forwarded(&mut self, fwdptr: usize) {
        self.value = VTableBitField::update(self.value, fwdptr as _);
        self.value = ForwardedBit::update(self.value, 1);
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        ForwardedBit::decode(self.value) != 0
    }

    #[inline(always)]
    pub fn forwarding_address(&self) -> *mut HeapObjectHeader {
        debug_assert!(self.is_forwarded());
        VTableBitField::decode(self.value) as _
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        SizeBitField::decode(self.value) as usize * MIN_ALLOCATION
    }

    /// Large objects encode size zero in the header; their real size is kept
    /// by the large object space.
    #[inline(always)]
    pub fn is_precise(&self) -> bool {
        SizeBitField::decode(self.value) == 0
    }

    #[inline(always)]
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size != 0 && size % MIN_ALLOCATION == 0);
        self.value = SizeBitField::update(self.value, (size / MIN_ALLOCATION) as u64);
    }

    #[inline(always)]
    pub fn set_large(&mut self) {
        self.value = SizeBitField::update(self.value, 0);
    }

    #[inline(always)]
    pub fn vtable(&self) -> usize {
        VTableBitField::decode(self.value) as _
    }

    #[inline(always)]
    pub fn set_vtable(&mut self, vtable: usize) {
        self.value = VTableBitField::update(self.value, vtable as _);
    }

    #[inline(always)]
    pub fn is_allocated(&self) -> bool {
        self.vtable() != 0
    }

    #[inline(always)]
    pub fn data(&self) -> *const u8 {
        ((self as *const Self as usize) + size_of::<Self>()) as *const u8
    }

    #[inline(always)]
    pub fn type_id(&self) -> u32 {
        self.type_id
    }
}

pub fn vtable_of<T: Collectable>() -> usize {
    let x = null_mut::<T>();
    unsafe { std::mem::transmute::<_, mopa::TraitObject>(x as *mut dyn Collectable).vtable as _ }
}

pub fn small_type_id<T: 'static>() -> u32 {
    let mut hasher = DefaultHasher::new();
    TypeId::of::<T>().hash(&mut hasher);
    hasher.finish() as u32
}

/// Pointer into the managed heap. Copyable; keeping it live across a
///// safepoint is the user's responsibility (see [letroot!](crate::letroot)).
pub struct Gc<T: Collectable + ?Sized> {
    pub(crate) base: NonNull<HeapObjectHeader>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable + ?Sized> Gc<T> {
    pub fn to_dyn(self) -> Gc<dyn Collectable> {
        Gc {
            base: self.base,
            marker: PhantomData,
        }
    }

    pub fn is<U: Collectable>(&self) -> bool {
        unsafe { (*self.base.as_ptr()).type_id == small_type_id::<U>() }
    }

    pub fn downcast<U: Collectable>(&self) -> Option<Gc<U>> {
        if self.is::<U>() {
            Some(Gc {
                base: self.base,
                marker: PhantomData,
            })
        } else {
            None
        }
    }

    pub fn raw(&self) -> *mut HeapObjectHeader {
        self.base.as_ptr()
    }

    pub(crate) fn from_raw(header: *mut HeapObjectHeader) -> Self {
        Self {
            base: unsafe { NonNull::new_unchecked(header) },
            marker: PhantomData,
        }
    }
}

impl<T: Collectable + Sized> std::ops::Deref for Gc<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*(*self.base.as_ptr()).data().cast::<T>() }
    }
}

impl<T: Collectable + Sized> std::ops::DerefMut for Gc<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *((*self.base.as_ptr()).data() as *mut T) }
    }
}

impl<T: Collectable + ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable + ?Sized> Copy for Gc<T> {}

impl<T: Collectable + ?Sized> Trace for Gc<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.mark_object(&mut self.base);
    }
}

impl<T: Trace> Trace for Option<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        if let Some(value) = self {
            value.trace(vis);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for value in self.iter_mut() {
            value.trace(vis);
        }
    }
}

impl<T: Collectable + ?Sized> std::fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.base)
    }
}

macro_rules! impl_prim {
    ($($t: ty)*) => {
        $(
            impl Trace for $t {}
            impl Collectable for $t {}
        )*
    };
}

impl_prim!(
    u8 u16 u32 u64 u128
    i8 i16 i32 i64 i128
    f32 f64
    bool
    String
);
