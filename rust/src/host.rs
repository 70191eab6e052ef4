//! The interface consumed from the managed runtime.
//!
//! [`ManagedRuntime`] is everything the bridge needs from the managed side:
//! thread attachment and detachment, durable references, member resolution, object
//! construction and method invocation. The managed side provides it as a
//! [`HostVTable`] of `extern "C"` function pointers.

use crate::FfiPtr;
use crate::ffi::FFIStr;

// Opaque types representing managed-side entities.
#[derive(Clone, Copy)]
enum ManagedObject {}
#[derive(Clone, Copy)]
enum ManagedEnv {}
#[derive(Clone, Copy)]
enum ManagedMember {}

/// A reference to a managed object (instance or type descriptor).
///
/// Whether it is local (valid for the current call on the current thread) or
/// durable (valid until explicitly deleted) depends on where it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ObjectPtr(FfiPtr<'static, ManagedObject>);

// Durable references are shared between the pump thread and the registering thread.
unsafe impl Send for ObjectPtr {}
unsafe impl Sync for ObjectPtr {}

impl ObjectPtr {
    pub fn null() -> Self {
        ObjectPtr(FfiPtr::null())
    }

    pub fn from_raw(ptr: *mut std::ffi::c_void) -> Self {
        ObjectPtr(FfiPtr::from_raw(ptr.cast()))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    #[cfg(test)]
    pub(crate) fn addr(&self) -> usize {
        self.0.as_raw() as usize
    }

    fn non_null(self) -> Option<Self> {
        (!self.is_null()).then_some(self)
    }
}

/// The per-thread execution context of the managed runtime. Not `Send`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct EnvPtr(FfiPtr<'static, ManagedEnv>);

impl EnvPtr {
    pub fn from_raw(ptr: *mut std::ffi::c_void) -> Self {
        EnvPtr(FfiPtr::from_raw(ptr.cast()))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// A resolved method or field. Stays valid as long as its type is pinned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct MemberId(FfiPtr<'static, ManagedMember>);

unsafe impl Send for MemberId {}
unsafe impl Sync for MemberId {}

impl MemberId {
    pub fn from_raw(ptr: *mut std::ffi::c_void) -> Self {
        MemberId(FfiPtr::from_raw(ptr.cast()))
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    #[cfg(test)]
    pub(crate) fn addr(&self) -> usize {
        self.0.as_raw() as usize
    }

    fn non_null(self) -> Option<Self> {
        (!self.is_null()).then_some(self)
    }
}

/// An argument passed to a managed constructor or method.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ManagedValue {
    Byte(i8),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectPtr),
}

/// C layout of a [`ManagedValue`]; the callee knows the type from the member signature.
#[repr(C)]
#[derive(Clone, Copy)]
pub union RawValue {
    b: i8,
    i: i32,
    j: i64,
    f: f32,
    d: f64,
    l: ObjectPtr,
}

impl From<ManagedValue> for RawValue {
    fn from(value: ManagedValue) -> Self {
        match value {
            ManagedValue::Byte(b) => RawValue { b },
            ManagedValue::Int(i) => RawValue { i },
            ManagedValue::Long(j) => RawValue { j },
            ManagedValue::Float(f) => RawValue { f },
            ManagedValue::Double(d) => RawValue { d },
            ManagedValue::Object(l) => RawValue { l },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("Cannot attach current thread: {0}")]
    AttachFailed(i32),
    #[error("Cannot detach current thread: {0}")]
    DetachFailed(i32),
}

/// The calling thread's context, and whether this call is what attached it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAttachment {
    pub env: EnvPtr,
    /// `false` for threads the runtime already knew, e.g. its own threads.
    pub newly_attached: bool,
}

/// Operations the bridge performs on the managed runtime.
///
/// Every call except attaching and detaching takes the context of the
/// calling thread. Lookups return `None` on failure; the
/// runtime may leave a fault pending, which the caller clears with
/// [`ManagedRuntime::take_pending_fault`].
pub trait ManagedRuntime: Send + Sync {
    /// Attaches the calling thread if it is not attached yet. Idempotent.
    fn attach_current_thread(&self) -> Result<ThreadAttachment, HostError>;

    /// Detaches the calling thread. Only called for threads whose attachment
    /// reported `newly_attached`, right before they exit.
    fn detach_current_thread(&self) -> Result<(), HostError>;

    fn new_durable_ref(&self, env: EnvPtr, obj: ObjectPtr) -> Option<ObjectPtr>;
    fn delete_durable_ref(&self, env: EnvPtr, obj: ObjectPtr);
    fn delete_local_ref(&self, env: EnvPtr, obj: ObjectPtr);

    /// Type descriptor of `obj`, as a local reference.
    fn type_of(&self, env: EnvPtr, obj: ObjectPtr) -> Option<ObjectPtr>;
    /// Type descriptor by name, as a local reference.
    fn find_type(&self, env: EnvPtr, name: &str) -> Option<ObjectPtr>;

    fn method(&self, env: EnvPtr, ty: ObjectPtr, name: &str, signature: &str)
    -> Option<MemberId>;
    fn field(&self, env: EnvPtr, ty: ObjectPtr, name: &str, signature: &str) -> Option<MemberId>;
    fn static_field(
        &self,
        env: EnvPtr,
        ty: ObjectPtr,
        name: &str,
        signature: &str,
    ) -> Option<MemberId>;

    /// Reads a static object field, returning a local reference.
    fn static_object_field(&self, env: EnvPtr, ty: ObjectPtr, field: MemberId)
    -> Option<ObjectPtr>;

    /// Constructs an object, returning a local reference.
    fn new_object(
        &self,
        env: EnvPtr,
        ty: ObjectPtr,
        constructor: MemberId,
        args: &[ManagedValue],
    ) -> Option<ObjectPtr>;

    fn set_int_field(&self, env: EnvPtr, obj: ObjectPtr, field: MemberId, value: i32);

    /// Copies `bytes` into a new managed byte array, returned as a local reference.
    fn new_byte_array(&self, env: EnvPtr, bytes: &[i8]) -> Option<ObjectPtr>;

    fn call_void_method(&self, env: EnvPtr, obj: ObjectPtr, method: MemberId, args: &[ManagedValue]);

    /// Describes the pending fault on the runtime's own diagnostic output and
    /// clears it. Returns whether a fault was pending.
    fn take_pending_fault(&self, env: EnvPtr) -> bool;
}

/// Runtime operations provided by the managed side.
///
/// Any changes here must be mirrored on the managed side in the exact same order.
/// Functions returning a pointer return null on failure.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostVTable {
    /// Returns 0 on success and writes the thread's context to `out_env`, and
    /// whether the thread was attached by this call to `out_newly_attached`.
    pub attach_current_thread:
        unsafe extern "C" fn(out_env: *mut EnvPtr, out_newly_attached: *mut bool) -> i32,
    /// Returns 0 on success.
    pub detach_current_thread: unsafe extern "C" fn() -> i32,
    pub new_durable_ref: unsafe extern "C" fn(env: EnvPtr, obj: ObjectPtr) -> ObjectPtr,
    pub delete_durable_ref: unsafe extern "C" fn(env: EnvPtr, obj: ObjectPtr),
    pub delete_local_ref: unsafe extern "C" fn(env: EnvPtr, obj: ObjectPtr),
    pub type_of: unsafe extern "C" fn(env: EnvPtr, obj: ObjectPtr) -> ObjectPtr,
    pub find_type: unsafe extern "C" fn(env: EnvPtr, name: FFIStr<'_>) -> ObjectPtr,
    pub method: unsafe extern "C" fn(
        env: EnvPtr,
        ty: ObjectPtr,
        name: FFIStr<'_>,
        signature: FFIStr<'_>,
    ) -> MemberId,
    pub field: unsafe extern "C" fn(
        env: EnvPtr,
        ty: ObjectPtr,
        name: FFIStr<'_>,
        signature: FFIStr<'_>,
    ) -> MemberId,
    pub static_field: unsafe extern "C" fn(
        env: EnvPtr,
        ty: ObjectPtr,
        name: FFIStr<'_>,
        signature: FFIStr<'_>,
    ) -> MemberId,
    pub static_object_field:
        unsafe extern "C" fn(env: EnvPtr, ty: ObjectPtr, field: MemberId) -> ObjectPtr,
    pub new_object: unsafe extern "C" fn(
        env: EnvPtr,
        ty: ObjectPtr,
        constructor: MemberId,
        args: *const RawValue,
        args_len: usize,
    ) -> ObjectPtr,
    pub set_int_field: unsafe extern "C" fn(env: EnvPtr, obj: ObjectPtr, field: MemberId, value: i32),
    pub new_byte_array: unsafe extern "C" fn(env: EnvPtr, bytes: *const i8, len: usize) -> ObjectPtr,
    pub call_void_method: unsafe extern "C" fn(
        env: EnvPtr,
        obj: ObjectPtr,
        method: MemberId,
        args: *const RawValue,
        args_len: usize,
    ),
    pub take_pending_fault: unsafe extern "C" fn(env: EnvPtr) -> bool,
}

fn raw_args(args: &[ManagedValue]) -> Vec<RawValue> {
    args.iter().copied().map(RawValue::from).collect()
}

impl ManagedRuntime for HostVTable {
    fn attach_current_thread(&self) -> Result<ThreadAttachment, HostError> {
        let mut env = EnvPtr(FfiPtr::null());
        let mut newly_attached = false;
        let status = unsafe { (self.attach_current_thread)(&mut env, &mut newly_attached) };
        match status {
            0 if !env.is_null() => Ok(ThreadAttachment {
                env,
                newly_attached,
            }),
            0 => Err(HostError::AttachFailed(-1)),
            code => Err(HostError::AttachFailed(code)),
        }
    }

    fn detach_current_thread(&self) -> Result<(), HostError> {
        match unsafe { (self.detach_current_thread)() } {
            0 => Ok(()),
            code => Err(HostError::DetachFailed(code)),
        }
    }

    fn new_durable_ref(&self, env: EnvPtr, obj: ObjectPtr) -> Option<ObjectPtr> {
        unsafe { (self.new_durable_ref)(env, obj) }.non_null()
    }

    fn delete_durable_ref(&self, env: EnvPtr, obj: ObjectPtr) {
        unsafe { (self.delete_durable_ref)(env, obj) }
    }

    fn delete_local_ref(&self, env: EnvPtr, obj: ObjectPtr) {
        unsafe { (self.delete_local_ref)(env, obj) }
    }

    fn type_of(&self, env: EnvPtr, obj: ObjectPtr) -> Option<ObjectPtr> {
        unsafe { (self.type_of)(env, obj) }.non_null()
    }

    fn find_type(&self, env: EnvPtr, name: &str) -> Option<ObjectPtr> {
        unsafe { (self.find_type)(env, FFIStr::new(name)) }.non_null()
    }

    fn method(
        &self,
        env: EnvPtr,
        ty: ObjectPtr,
        name: &str,
        signature: &str,
    ) -> Option<MemberId> {
        unsafe { (self.method)(env, ty, FFIStr::new(name), FFIStr::new(signature)) }.non_null()
    }

    fn field(&self, env: EnvPtr, ty: ObjectPtr, name: &str, signature: &str) -> Option<MemberId> {
        unsafe { (self.field)(env, ty, FFIStr::new(name), FFIStr::new(signature)) }.non_null()
    }

    fn static_field(
        &self,
        env: EnvPtr,
        ty: ObjectPtr,
        name: &str,
        signature: &str,
    ) -> Option<MemberId> {
        unsafe { (self.static_field)(env, ty, FFIStr::new(name), FFIStr::new(signature)) }
            .non_null()
    }

    fn static_object_field(
        &self,
        env: EnvPtr,
        ty: ObjectPtr,
        field: MemberId,
    ) -> Option<ObjectPtr> {
        unsafe { (self.static_object_field)(env, ty, field) }.non_null()
    }

    fn new_object(
        &self,
        env: EnvPtr,
        ty: ObjectPtr,
        constructor: MemberId,
        args: &[ManagedValue],
    ) -> Option<ObjectPtr> {
        let raw = raw_args(args);
        unsafe { (self.new_object)(env, ty, constructor, raw.as_ptr(), raw.len()) }.non_null()
    }

    fn set_int_field(&self, env: EnvPtr, obj: ObjectPtr, field: MemberId, value: i32) {
        unsafe { (self.set_int_field)(env, obj, field, value) }
    }

    fn new_byte_array(&self, env: EnvPtr, bytes: &[i8]) -> Option<ObjectPtr> {
        unsafe { (self.new_byte_array)(env, bytes.as_ptr(), bytes.len()) }.non_null()
    }

    fn call_void_method(
        &self,
        env: EnvPtr,
        obj: ObjectPtr,
        method: MemberId,
        args: &[ManagedValue],
    ) {
        let raw = raw_args(args);
        unsafe { (self.call_void_method)(env, obj, method, raw.as_ptr(), raw.len()) }
    }

    fn take_pending_fault(&self, env: EnvPtr) -> bool {
        unsafe { (self.take_pending_fault)(env) }
    }
}
