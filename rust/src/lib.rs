mod attach;
mod bridge;
mod device;
mod error_conversion;
pub mod ffi;
mod host;
mod logging;
mod marshal;
pub mod native;
mod refs;
mod session;
mod task;

#[cfg(test)]
mod test_support;

pub use bridge::{CapabilitySet, EventKind, ListenerBridge};
pub use device::DeviceHandle;
pub use error_conversion::{BridgeError, FfiException, Result};
pub use host::{
    EnvPtr, HostError, HostVTable, ManagedRuntime, ManagedValue, MemberId, ObjectPtr,
    ThreadAttachment,
};
pub use marshal::{
    Arm, EmgData, EmgStreamMode, FirmwareVersion, LockingPolicy, Pose, Quaternion, UnlockType,
    Vector3, VibrationType, WarmupResult, WarmupState, XDirection,
};
pub use session::{PumpReport, RegistrationId, Session};
pub use task::{ExceptionConstructors, Tcb};

use std::ffi::{CStr, c_char};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::ptr::NonNull;

#[repr(transparent)]
pub struct FfiPtr<'a, T: Sized> {
    ptr: Option<NonNull<T>>,
    _phantom: PhantomData<&'a ()>,
}

// Derives would put bounds on `T`, which is usually an uninhabited marker type.
impl<T> Clone for FfiPtr<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FfiPtr<'_, T> {}

impl<T> PartialEq for FfiPtr<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for FfiPtr<'_, T> {}

// Compile-time assertion that `FfiPtr` is pointer-sized.
// Ensures ABI compatibility with the managed side (opaque handles/IntPtr across FFI).
const _: [(); std::mem::size_of::<FfiPtr<'_, ()>>()] = [(); std::mem::size_of::<*const ()>()];

impl<'a, T> FfiPtr<'a, T> {
    pub(crate) const fn null() -> Self {
        Self {
            ptr: None,
            _phantom: PhantomData,
        }
    }

    pub(crate) fn from_raw(ptr: *mut T) -> Self {
        Self {
            ptr: NonNull::new(ptr),
            _phantom: PhantomData,
        }
    }

    pub(crate) fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    pub(crate) fn as_raw(&self) -> *mut T {
        self.ptr
            .map(|nn| nn.as_ptr())
            .unwrap_or(std::ptr::null_mut())
    }
}

impl<'a, T> Debug for FfiPtr<'a, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FfiPtr({:p})", self.as_raw())
    }
}

/// A NUL-terminated UTF-8 string owned by the managed side.
type HostStr<'a> = FfiPtr<'a, c_char>;
impl<'a> HostStr<'a> {
    fn as_cstr(&self) -> Option<&CStr> {
        self.ptr.map(|ptr| unsafe { CStr::from_ptr(ptr.as_ptr()) })
    }
}
