//! Ownership conventions for Rust values handed across the C ABI.
//!
//! A value exposed to the managed side declares where its pointer comes from
//! by implementing [`FFI`]. Shared values are `Arc`-allocated: the managed side
//! receives a [`BridgedOwnedSharedPtr`] (one strong count it must give back
//! through the matching `*_free` export) and passes it back as a
//! [`BridgedBorrowedSharedPtr`] for the duration of a call.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

/// Declares how a bridged type is allocated.
pub trait FFI {
    type Origin;
}

/// Marker: the pointer was produced by `Arc::into_raw`.
pub struct FromArc;

/// A pointer carrying one strong count of an `Arc<T>`.
#[repr(transparent)]
pub struct BridgedOwnedSharedPtr<T> {
    ptr: Option<NonNull<T>>,
}

// Raw pointers are not Send; the pointee is (ArcFFI types are Send + Sync).
unsafe impl<T: Send + Sync> Send for BridgedOwnedSharedPtr<T> {}

impl<T> BridgedOwnedSharedPtr<T> {
    pub fn null() -> Self {
        Self { ptr: None }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    #[cfg(test)]
    pub(crate) fn borrow(&self) -> BridgedBorrowedSharedPtr<'_, T> {
        BridgedBorrowedSharedPtr {
            ptr: self.ptr,
            _phantom: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn into_raw(self) -> *const T {
        self.ptr
            .map_or(std::ptr::null(), |p| p.as_ptr() as *const T)
    }

    /// Erases the pointee type, e.g. to complete a managed task with any result.
    pub fn cast_to_void(self) -> BridgedOwnedSharedPtr<c_void> {
        BridgedOwnedSharedPtr {
            ptr: self.ptr.map(NonNull::cast),
        }
    }
}

/// A pointer to an `Arc<T>` allocation that the callee must not release.
#[repr(transparent)]
pub struct BridgedBorrowedSharedPtr<'a, T> {
    ptr: Option<NonNull<T>>,
    _phantom: PhantomData<&'a T>,
}

impl<T> Clone for BridgedBorrowedSharedPtr<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BridgedBorrowedSharedPtr<'_, T> {}

impl<'a, T> BridgedBorrowedSharedPtr<'a, T> {
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    pub fn to_raw(&self) -> Option<*const T> {
        self.ptr.map(|p| p.as_ptr() as *const T)
    }
}

/// Conversions for types shared with the managed side through an `Arc`.
pub trait ArcFFI: Sized + FFI<Origin = FromArc> {
    fn into_ptr(arc: Arc<Self>) -> BridgedOwnedSharedPtr<Self> {
        BridgedOwnedSharedPtr {
            ptr: NonNull::new(Arc::into_raw(arc) as *mut Self),
        }
    }

    /// Takes back the strong count carried by `ptr`.
    fn from_ptr(ptr: BridgedOwnedSharedPtr<Self>) -> Option<Arc<Self>> {
        // SAFETY: owned shared pointers are only ever created by `into_ptr`.
        ptr.ptr
            .map(|p| unsafe { Arc::from_raw(p.as_ptr() as *const Self) })
    }

    /// Clones the `Arc` behind a borrowed pointer, leaving the managed side's count intact.
    fn cloned_from_ptr(ptr: BridgedBorrowedSharedPtr<'_, Self>) -> Option<Arc<Self>> {
        ptr.ptr.map(|p| {
            let raw = p.as_ptr() as *const Self;
            // SAFETY: the managed side holds a strong count for the duration of the call.
            unsafe {
                Arc::increment_strong_count(raw);
                Arc::from_raw(raw)
            }
        })
    }

    fn as_ref<'a>(ptr: BridgedBorrowedSharedPtr<'a, Self>) -> Option<&'a Self> {
        // SAFETY: as above; the borrow cannot outlive the call.
        ptr.ptr.map(|p| unsafe { &*(p.as_ptr() as *const Self) })
    }

    fn free(ptr: BridgedOwnedSharedPtr<Self>) {
        drop(Self::from_ptr(ptr));
    }
}

impl<T: FFI<Origin = FromArc>> ArcFFI for T {}

/// A borrowed UTF-8 string passed to managed callbacks as pointer + length.
///
/// Only valid for the duration of the call it is passed to; the callee must copy it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FFIStr<'a> {
    ptr: *const u8,
    len: usize,
    _phantom: PhantomData<&'a str>,
}

impl<'a> FFIStr<'a> {
    pub fn new(s: &'a str) -> Self {
        Self {
            ptr: s.as_ptr(),
            len: s.len(),
            _phantom: PhantomData,
        }
    }

    pub fn as_str(&self) -> &'a str {
        // SAFETY: only constructed from a `&'a str` by `new`.
        unsafe { std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.ptr, self.len)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bridged(u32);

    impl FFI for Bridged {
        type Origin = FromArc;
    }

    #[test]
    fn arc_ptr_keeps_counts_balanced() {
        let arc = Arc::new(Bridged(7));
        let weak = Arc::downgrade(&arc);
        let owned = ArcFFI::into_ptr(arc);

        let cloned = ArcFFI::cloned_from_ptr(owned.borrow()).unwrap();
        assert_eq!(cloned.0, 7);
        assert_eq!(weak.strong_count(), 2);
        drop(cloned);

        assert_eq!(ArcFFI::as_ref(owned.borrow()).map(|b| b.0), Some(7));
        ArcFFI::free(owned);
        assert_eq!(weak.strong_count(), 0);
    }

    #[test]
    fn null_pointers_yield_none() {
        let owned = BridgedOwnedSharedPtr::<Bridged>::null();
        assert!(owned.is_null());
        assert!(owned.borrow().to_raw().is_none());
        assert!(<Bridged as ArcFFI>::from_ptr(owned).is_none());
    }

    #[test]
    fn ffi_str_round_trips() {
        let s = String::from("com/thalmic/myo/Pose");
        assert_eq!(FFIStr::new(&s).as_str(), "com/thalmic/myo/Pose");
    }
}
