//! Marker trait for types that are safe to share across independently
//! mapped virtual address spaces.
//!
//! A type is *virtual-address-space independent* if none of its bit
//! patterns encode a virtual address, and it is FFI-safe (the same
//! layout regardless of which process reads it). These are exactly the
//! properties a value placed in a POSIX shared memory segment must
//! have, since every attaching process may map the segment at a
//! different address: a raw pointer or `Box` pointing at process-local
//! memory would be garbage to every process but the one that wrote it.
//!
//! Use `#[derive(VirtualAddressSpaceIndependent)]` (from the
//! `vasi-macro` crate) rather than implementing this by hand; the
//! derive also validates that the type is FFI-safe and recurses into
//! field types.
#![no_std]

pub use vasi_macro::VirtualAddressSpaceIndependent;

/// # Safety
///
/// Implementors must ensure that:
/// - The type contains no pointers, references, or other values whose
///   meaning depends on the virtual address space of the process that
///   wrote them (a [`usize`] that happens to hold an address is fine as
///   long as it's never dereferenced as a pointer by a different
///   process; a raw pointer is not fine).
/// - The type's layout is independent of the compilation unit, i.e. it
///   is `#[repr(C)]`, `#[repr(transparent)]`, or a primitive.
pub unsafe trait VirtualAddressSpaceIndependent {
    /// Used by the derive macro to force evaluation of field-type
    /// checks at compile time. Not intended to be read.
    #[doc(hidden)]
    const IGNORE: () = ();
}

macro_rules! impl_vasi_for_primitive {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl VirtualAddressSpaceIndependent for $t {}
        )*
    };
}

impl_vasi_for_primitive!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
);

unsafe impl<T, const N: usize> VirtualAddressSpaceIndependent for [T; N] where
    T: VirtualAddressSpaceIndependent
{
}

unsafe impl<T> VirtualAddressSpaceIndependent for core::mem::MaybeUninit<T> where
    T: VirtualAddressSpaceIndependent
{
}

unsafe impl<T> VirtualAddressSpaceIndependent for Option<T> where T: VirtualAddressSpaceIndependent {}

unsafe impl<T> VirtualAddressSpaceIndependent for core::marker::PhantomData<T> {}
