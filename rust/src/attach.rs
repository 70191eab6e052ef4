//! Thread attachment to the managed runtime.
//!
//! Native callbacks may arrive on any thread. Before calling into managed code
//! a thread must be attached; it then stays attached until it exits. The
//! resulting context is cached per thread and per runtime, and passed
//! explicitly to everything that talks to the runtime. Threads this module
//! attached are detached again by the thread-local destructor.

use std::cell::RefCell;
use std::sync::Arc;

use crate::host::{EnvPtr, HostError, ManagedRuntime, ManagedValue, MemberId, ObjectPtr};

/// One runtime the current thread is attached to.
struct Attachment {
    key: usize,
    env: EnvPtr,
    /// Held so the runtime outlives the attachment and its address stays unique.
    runtime: Arc<dyn ManagedRuntime>,
    /// Set when attaching was our doing; the runtime's own threads stay attached.
    detach_on_exit: bool,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if !self.detach_on_exit {
            return;
        }
        match self.runtime.detach_current_thread() {
            Ok(()) => tracing::debug!(
                "[FFI] Detached thread {:?} from the managed runtime",
                std::thread::current().id()
            ),
            Err(err) => tracing::error!("[FFI] {}", err),
        }
    }
}

thread_local! {
    static ATTACHED: RefCell<Vec<Attachment>> = const { RefCell::new(Vec::new()) };
}

fn runtime_key(runtime: &Arc<dyn ManagedRuntime>) -> usize {
    Arc::as_ptr(runtime) as *const () as usize
}

/// Returns the calling thread's context for `runtime`, attaching the thread first if needed.
pub(crate) fn attach(runtime: &Arc<dyn ManagedRuntime>) -> Result<CallContext<'_>, HostError> {
    let key = runtime_key(runtime);
    let cached = ATTACHED
        .try_with(|attached| {
            attached
                .borrow()
                .iter()
                .find(|a| a.key == key)
                .map(|a| a.env)
        })
        .ok()
        .flatten();
    if let Some(env) = cached {
        return Ok(CallContext {
            env,
            runtime: runtime.as_ref(),
        });
    }

    let attachment = runtime.attach_current_thread()?;
    tracing::debug!(
        "[FFI] Attached thread {:?} to the managed runtime",
        std::thread::current().id()
    );
    let cached = ATTACHED.try_with(|attached| {
        attached.borrow_mut().push(Attachment {
            key,
            env: attachment.env,
            runtime: Arc::clone(runtime),
            detach_on_exit: attachment.newly_attached,
        })
    });
    if cached.is_err() {
        tracing::warn!(
            "[FFI] Thread {:?} attached during teardown and stays attached",
            std::thread::current().id()
        );
    }
    Ok(CallContext {
        env: attachment.env,
        runtime: runtime.as_ref(),
    })
}

/// An attached thread's view of the managed runtime.
#[derive(Clone, Copy)]
pub(crate) struct CallContext<'rt> {
    env: EnvPtr,
    runtime: &'rt dyn ManagedRuntime,
}

impl<'rt> CallContext<'rt> {
    #[cfg(test)]
    pub(crate) fn env(&self) -> EnvPtr {
        self.env
    }

    pub(crate) fn new_durable_ref(&self, obj: ObjectPtr) -> Option<ObjectPtr> {
        self.runtime.new_durable_ref(self.env, obj)
    }

    pub(crate) fn delete_durable_ref(&self, obj: ObjectPtr) {
        self.runtime.delete_durable_ref(self.env, obj)
    }

    pub(crate) fn delete_local_ref(&self, obj: ObjectPtr) {
        self.runtime.delete_local_ref(self.env, obj)
    }

    pub(crate) fn type_of(&self, obj: ObjectPtr) -> Option<ObjectPtr> {
        self.runtime.type_of(self.env, obj)
    }

    pub(crate) fn find_type(&self, name: &str) -> Option<ObjectPtr> {
        self.runtime.find_type(self.env, name)
    }

    pub(crate) fn method(&self, ty: ObjectPtr, name: &str, signature: &str) -> Option<MemberId> {
        self.runtime.method(self.env, ty, name, signature)
    }

    pub(crate) fn field(&self, ty: ObjectPtr, name: &str, signature: &str) -> Option<MemberId> {
        self.runtime.field(self.env, ty, name, signature)
    }

    pub(crate) fn static_field(
        &self,
        ty: ObjectPtr,
        name: &str,
        signature: &str,
    ) -> Option<MemberId> {
        self.runtime.static_field(self.env, ty, name, signature)
    }

    pub(crate) fn static_object_field(&self, ty: ObjectPtr, field: MemberId) -> Option<ObjectPtr> {
        self.runtime.static_object_field(self.env, ty, field)
    }

    pub(crate) fn new_object(
        &self,
        ty: ObjectPtr,
        constructor: MemberId,
        args: &[ManagedValue],
    ) -> Option<ObjectPtr> {
        self.runtime.new_object(self.env, ty, constructor, args)
    }

    pub(crate) fn set_int_field(&self, obj: ObjectPtr, field: MemberId, value: i32) {
        self.runtime.set_int_field(self.env, obj, field, value)
    }

    pub(crate) fn new_byte_array(&self, bytes: &[i8]) -> Option<ObjectPtr> {
        self.runtime.new_byte_array(self.env, bytes)
    }

    pub(crate) fn call_void_method(&self, obj: ObjectPtr, method: MemberId, args: &[ManagedValue]) {
        self.runtime.call_void_method(self.env, obj, method, args)
    }

    pub(crate) fn take_pending_fault(&self) -> bool {
        self.runtime.take_pending_fault(self.env)
    }
}
