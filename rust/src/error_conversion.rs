use crate::FfiPtr;
use crate::ffi::FFIStr;
use crate::host::HostError;
use std::fmt::{Debug, Display};

use crate::task::ExceptionConstructors;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failures surfaced to the managed side.
///
/// Only session creation and listener registration raise these; teardown and
/// dispatch failures are logged instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Malformed input to `init`, or rejected by the native SDK as such.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The native session could not be started.
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    /// A durable reference or a piece of payload metadata could not be acquired.
    #[error("Out of resources: {0}")]
    OutOfResources(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<HostError> for BridgeError {
    fn from(err: HostError) -> Self {
        BridgeError::Unexpected(err.to_string())
    }
}

// Opaque type representing a managed exception.
#[derive(Clone, Copy)]
enum Exception {}

/// A pointer to a managed exception.
/// This is used across the FFI boundary to represent exceptions created on the managed side.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct ExceptionPtr(FfiPtr<'static, Exception>);

impl ExceptionPtr {
    pub(crate) fn is_null(&self) -> bool {
        self.0.is_null()
    }

    #[cfg(test)]
    pub(crate) fn dangling() -> Self {
        ExceptionPtr(FfiPtr::from_raw(std::ptr::NonNull::dangling().as_ptr()))
    }
}

#[repr(transparent)]
pub struct RustExceptionConstructor(pub(crate) unsafe extern "C" fn(message: FFIStr<'_>) -> ExceptionPtr);

impl RustExceptionConstructor {
    /// Creates a generic managed exception for unexpected Rust errors.
    ///
    /// Prefixes the message with "Rust exception:" and forwards it
    /// across the FFI boundary to construct the managed exception.
    pub(crate) fn construct_from_rust(&self, err: impl Display) -> ExceptionPtr {
        let message = format!("Rust exception: {}", err);
        let ffi_message = FFIStr::new(&message);
        unsafe { (self.0)(ffi_message) }
    }
}

/// FFI constructor for the managed `IllegalArgumentException`.
#[repr(transparent)]
pub struct InvalidArgumentExceptionConstructor(
    pub(crate) unsafe extern "C" fn(message: FFIStr<'_>) -> ExceptionPtr,
);

impl InvalidArgumentExceptionConstructor {
    pub(crate) fn construct_from_rust(&self, message: &str) -> ExceptionPtr {
        let message = FFIStr::new(message);
        unsafe { (self.0)(message) }
    }
}

/// FFI constructor for the managed `MyoException`.
#[repr(transparent)]
pub struct MyoExceptionConstructor(pub(crate) unsafe extern "C" fn(message: FFIStr<'_>) -> ExceptionPtr);

impl MyoExceptionConstructor {
    pub(crate) fn construct_from_rust(&self, message: &str) -> ExceptionPtr {
        let message = FFIStr::new(message);
        unsafe { (self.0)(message) }
    }
}

/// FFI constructor for the managed `JNIException`, raised when the bridge runs
/// out of durable references or metadata.
#[repr(transparent)]
pub struct OutOfResourcesExceptionConstructor(
    pub(crate) unsafe extern "C" fn(message: FFIStr<'_>) -> ExceptionPtr,
);

impl OutOfResourcesExceptionConstructor {
    pub(crate) fn construct_from_rust(&self, message: &str) -> ExceptionPtr {
        let message = FFIStr::new(message);
        unsafe { (self.0)(message) }
    }
}

/// Trait for converting Rust error types into pointers to managed exceptions.
///
/// Implement this trait for error types that may be returned from Rust code and need to be
/// represented as exceptions on the managed side.
///
/// # Safety
/// The returned [`ExceptionPtr`] is an opaque handle to a managed exception object.
/// The handle must be freed on the managed side when no longer needed.
pub trait ErrorToException {
    fn to_exception(&self, ctors: &ExceptionConstructors) -> ExceptionPtr;
}

impl ErrorToException for BridgeError {
    fn to_exception(&self, ctors: &ExceptionConstructors) -> ExceptionPtr {
        match self {
            BridgeError::InvalidArgument(message) => ctors
                .invalid_argument_exception_constructor
                .construct_from_rust(message),
            BridgeError::ConnectionFailure(message) => ctors
                .myo_exception_constructor
                .construct_from_rust(message),
            BridgeError::OutOfResources(message) => ctors
                .out_of_resources_exception_constructor
                .construct_from_rust(message),
            BridgeError::Unexpected(message) => ctors
                .rust_exception_constructor
                .construct_from_rust(message),
        }
    }
}

/// Outcome of a synchronous export: a null pointer on success, otherwise the
/// managed exception to throw.
#[derive(Debug)]
#[repr(transparent)]
pub struct FfiException(ExceptionPtr);

impl FfiException {
    pub(crate) fn ok() -> Self {
        FfiException(ExceptionPtr(FfiPtr::null()))
    }

    pub(crate) fn from_error<E>(err: E, ctors: &ExceptionConstructors) -> Self
    where
        E: Debug + Display + ErrorToException,
    {
        tracing::debug!("[FFI] Raising exception: {}", err);
        FfiException(err.to_exception(ctors))
    }

    pub fn is_ok(&self) -> bool {
        self.0.is_null()
    }
}
