use futures::FutureExt;
use std::any::Any;
use std::ffi::c_void;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use tokio::runtime::Runtime;

use crate::FfiPtr;
use crate::error_conversion::{
    ErrorToException, ExceptionPtr, InvalidArgumentExceptionConstructor, MyoExceptionConstructor,
    OutOfResourcesExceptionConstructor, RustExceptionConstructor,
};
use crate::ffi::{ArcFFI, BridgedOwnedSharedPtr};

/// The global Tokio runtime driving asynchronous pumps.
static RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    crate::logging::init_logging();

    tokio::runtime::Builder::new_multi_thread()
        .thread_name("myo-bridge")
        .enable_all()
        .build()
        .unwrap_or_else(|err| panic!("Cannot start the tokio runtime: {err}"))
});

/// Opaque type representing a managed task completion source.
enum Tcs {}

/// A pointer to a task completion source on the managed side.
#[repr(transparent)]
pub struct TcsPtr(FfiPtr<'static, Tcs>);

unsafe impl Send for TcsPtr {}

/// Function pointer type to complete a task with a result.
type CompleteTask = unsafe extern "C" fn(tcs: TcsPtr, result: BridgedOwnedSharedPtr<c_void>);

/// Function pointer type to fail a task with an exception handle.
type FailTask = unsafe extern "C" fn(tcs: TcsPtr, exception_handle: ExceptionPtr);

/// **Task Control Block** (TCB)
///
/// Lets Rust complete or fail a managed task: the task's completion source
/// plus the two function pointers that act on it.
#[repr(C)]
pub struct Tcb {
    tcs: TcsPtr,
    complete_task: CompleteTask,
    fail_task: FailTask,
    // SAFETY: The memory is a leaked unmanaged allocation on the managed side.
    // This guarantees that the pointer remains valid and is not moved or deallocated.
    constructors: &'static ExceptionConstructors,
}

impl Tcb {
    #[cfg(test)]
    pub(crate) fn for_test(
        tcs: usize,
        complete_task: CompleteTask,
        fail_task: FailTask,
        constructors: &'static ExceptionConstructors,
    ) -> Self {
        Tcb {
            tcs: TcsPtr(FfiPtr::from_raw(tcs as *mut Tcs)),
            complete_task,
            fail_task,
            constructors,
        }
    }
}

impl TcsPtr {
    #[cfg(test)]
    pub(crate) fn addr(&self) -> usize {
        self.0.as_raw() as usize
    }
}

/// Exception constructors passed from the managed side.
/// Any changes here must be mirrored on the managed side in the exact same order (alphabetical).
#[repr(C)]
pub struct ExceptionConstructors {
    pub invalid_argument_exception_constructor: InvalidArgumentExceptionConstructor,
    pub myo_exception_constructor: MyoExceptionConstructor,
    pub out_of_resources_exception_constructor: OutOfResourcesExceptionConstructor,
    pub rust_exception_constructor: RustExceptionConstructor,
}

#[cfg(test)]
type ExceptionConstructorFn = unsafe extern "C" fn(message: crate::ffi::FFIStr<'_>) -> ExceptionPtr;

impl ExceptionConstructors {
    #[cfg(test)]
    pub(crate) fn new(
        invalid_argument: ExceptionConstructorFn,
        myo: ExceptionConstructorFn,
        out_of_resources: ExceptionConstructorFn,
        rust: ExceptionConstructorFn,
    ) -> Self {
        ExceptionConstructors {
            invalid_argument_exception_constructor: InvalidArgumentExceptionConstructor(
                invalid_argument,
            ),
            myo_exception_constructor: MyoExceptionConstructor(myo),
            out_of_resources_exception_constructor: OutOfResourcesExceptionConstructor(
                out_of_resources,
            ),
            rust_exception_constructor: RustExceptionConstructor(rust),
        }
    }
}

/// Text of a caught panic. `panic!` only ever carries `&str` or `String`.
fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "panic with a non-string payload"
    }
}

/// Bridges tokio futures with managed tasks.
pub(crate) struct BridgedFuture;

impl BridgedFuture {
    /// Spawns a future onto the global Tokio runtime.
    ///
    /// The future's result is sent back to the managed side through the TCB,
    /// so `T` must implement `ArcFFI`. A panic inside the future is caught and
    /// reported as an exception.
    pub(crate) fn spawn<F, T, E>(tcb: Tcb, future: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static + ArcFFI,
        T: Debug,
        E: Debug + Display + ErrorToException,
    {
        let Tcb {
            tcs,
            complete_task,
            fail_task,
            constructors,
        } = tcb;

        RUNTIME.spawn(async move {
            // Catch panics in the future to prevent unwinding tokio executor thread's stack.
            let result = AssertUnwindSafe(future).catch_unwind().await;

            tracing::trace!(
                "[FFI]: Future completed with result: {} - {:?}",
                std::any::type_name::<T>(),
                result
            );

            match result {
                Ok(Ok(res)) => {
                    let arced_res = Arc::new(res);
                    unsafe { complete_task(tcs, ArcFFI::into_ptr(arced_res).cast_to_void()) };
                }
                Ok(Err(err)) => {
                    let exception_ptr = err.to_exception(constructors);
                    unsafe { fail_task(tcs, exception_ptr) };
                }
                Err(panic) => {
                    let exception_ptr = constructors
                        .rust_exception_constructor
                        .construct_from_rust(panic_message(panic.as_ref()));
                    unsafe { fail_task(tcs, exception_ptr) };
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_conversion::BridgeError;
    use crate::ffi::FFI;
    use crate::test_support::test_constructors;
    use std::sync::Mutex;
    use std::sync::mpsc::{Sender, channel};

    #[derive(Debug)]
    struct Answer(u32);

    impl FFI for Answer {
        type Origin = crate::ffi::FromArc;
    }

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Completed(usize, u32),
        Failed(usize),
    }

    static OUTCOMES: Mutex<Option<Sender<Outcome>>> = Mutex::new(None);

    unsafe extern "C" fn complete(tcs: TcsPtr, result: BridgedOwnedSharedPtr<c_void>) {
        let answer = unsafe { Arc::from_raw(result.into_raw().cast::<Answer>()) };
        if let Some(tx) = OUTCOMES.lock().unwrap().as_ref() {
            tx.send(Outcome::Completed(tcs.addr(), answer.0)).unwrap();
        }
    }

    unsafe extern "C" fn fail(tcs: TcsPtr, _exception: ExceptionPtr) {
        if let Some(tx) = OUTCOMES.lock().unwrap().as_ref() {
            tx.send(Outcome::Failed(tcs.addr())).unwrap();
        }
    }

    fn explode() -> Result<Answer, BridgeError> {
        panic!("listener blew up")
    }

    fn constructors() -> &'static ExceptionConstructors {
        Box::leak(Box::new(test_constructors()))
    }

    #[test]
    fn completes_fails_and_survives_panics() {
        let (tx, rx) = channel();
        *OUTCOMES.lock().unwrap() = Some(tx);

        BridgedFuture::spawn::<_, _, BridgeError>(
            Tcb::for_test(0x10, complete, fail, constructors()),
            async { Ok(Answer(42)) },
        );
        assert_eq!(rx.recv().unwrap(), Outcome::Completed(0x10, 42));

        BridgedFuture::spawn::<_, Answer, _>(
            Tcb::for_test(0x20, complete, fail, constructors()),
            async { Err(BridgeError::Unexpected("pump failed".into())) },
        );
        assert_eq!(rx.recv().unwrap(), Outcome::Failed(0x20));

        BridgedFuture::spawn(
            Tcb::for_test(0x30, complete, fail, constructors()),
            async { explode() },
        );
        assert_eq!(rx.recv().unwrap(), Outcome::Failed(0x30));
    }

    #[test]
    fn panic_payloads_become_messages() {
        let literal: Box<dyn Any + Send> = Box::new("pump stalled");
        let formatted: Box<dyn Any + Send> = Box::new(format!("device {}", 3));
        let other: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(literal.as_ref()), "pump stalled");
        assert_eq!(panic_message(formatted.as_ref()), "device 3");
        assert_eq!(panic_message(other.as_ref()), "panic with a non-string payload");
    }
}
