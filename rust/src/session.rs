use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::HostStr;
use crate::bridge::{CapabilitySet, ListenerBridge};
use crate::device::DeviceHandle;
use crate::error_conversion::{BridgeError, FfiException, Result};
use crate::ffi::{ArcFFI, BridgedBorrowedSharedPtr, BridgedOwnedSharedPtr, FFI, FromArc};
use crate::host::{HostVTable, ManagedRuntime, ObjectPtr};
use crate::marshal::LockingPolicy;
use crate::native::{self, NativeDevice, NativeError, NativeHub, NativeListener, NativeSdk};
use crate::task::{BridgedFuture, ExceptionConstructors, Tcb};

/// Identifies one listener registration within its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl RegistrationId {
    pub fn from_raw(id: u64) -> Self {
        RegistrationId(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Result of an asynchronous pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    /// Managed callbacks invoked during the pump, across all listeners.
    pub events_dispatched: u64,
}

impl FFI for PumpReport {
    type Origin = FromArc;
}

/// Checks an application identifier in reverse-domain form, e.g. `com.example.app`.
///
/// At least three non-empty `.`-separated segments. The first is alphanumeric;
/// the others may also contain `-` and `_`, though not at either end.
pub(crate) fn validate_application_identifier(id: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(BridgeError::InvalidArgument(format!(
            "Invalid application identifier \"{id}\": {reason}"
        )))
    };

    let segments: Vec<&str> = id.split('.').collect();
    if segments.len() < 3 {
        return invalid("expected at least three segments");
    }
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return invalid("empty segment");
        }
        let separator = |c: char| c == '-' || c == '_';
        if i == 0 {
            if !segment.chars().all(|c| c.is_ascii_alphanumeric()) {
                return invalid("the first segment must be alphanumeric");
            }
        } else if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || separator(c))
        {
            return invalid("segments may only contain letters, digits, '-' and '_'");
        } else if segment.starts_with(separator) || segment.ends_with(separator) {
            return invalid("segments may not start or end with '-' or '_'");
        }
    }
    Ok(())
}

/// One native session plus the listener registrations made on it.
pub struct Session {
    hub: Box<dyn NativeHub>,
    runtime: Arc<dyn ManagedRuntime>,
    registrations: Mutex<Vec<(RegistrationId, Arc<ListenerBridge>)>>,
    next_registration: AtomicU64,
    locking_policy: Mutex<LockingPolicy>,
    /// Managed callbacks invoked by any registration of this session.
    delivered: Arc<AtomicU64>,
}

impl Session {
    /// Opens a session on the SDK this build links against.
    pub fn init(runtime: Arc<dyn ManagedRuntime>, application_identifier: &str) -> Result<Self> {
        Self::init_with(native::default_sdk(), runtime, application_identifier)
    }

    pub fn init_with(
        sdk: &dyn NativeSdk,
        runtime: Arc<dyn ManagedRuntime>,
        application_identifier: &str,
    ) -> Result<Self> {
        validate_application_identifier(application_identifier)?;

        let hub = sdk
            .open(application_identifier)
            .map_err(|err| match err {
                NativeError::InvalidArgument(msg) => BridgeError::InvalidArgument(msg),
                NativeError::Runtime(msg) => BridgeError::ConnectionFailure(msg),
            })?;
        tracing::info!("Session opened for {}", application_identifier);

        Ok(Session {
            hub,
            runtime,
            registrations: Mutex::new(Vec::new()),
            next_registration: AtomicU64::new(1),
            locking_policy: Mutex::new(LockingPolicy::Standard),
            delivered: Arc::new(AtomicU64::new(0)),
        })
    }

    fn registrations(&self) -> MutexGuard<'_, Vec<(RegistrationId, Arc<ListenerBridge>)>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn locking_policy(&self) -> LockingPolicy {
        *self
            .locking_policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_locking_policy(&self, policy: LockingPolicy) {
        if policy == LockingPolicy::Unknown {
            tracing::warn!("Unknown locking policy, using the standard one");
        }
        *self
            .locking_policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = policy;
        self.hub.set_locking_policy(policy.to_native());
    }

    /// Pumps events on the calling thread for up to `duration_ms`.
    pub fn run(&self, duration_ms: u32) {
        tracing::trace!("Running for {} ms", duration_ms);
        self.hub.run(duration_ms);
    }

    /// Pumps a single batch of events, waiting up to `duration_ms` for one.
    pub fn run_once(&self, duration_ms: u32) {
        tracing::trace!("Running once for up to {} ms", duration_ms);
        self.hub.run_once(duration_ms);
    }

    /// [`Session::run`], reporting how many managed callbacks it invoked.
    pub fn run_reporting(&self, duration_ms: u32) -> PumpReport {
        let before = self.delivered.load(Ordering::Relaxed);
        self.run(duration_ms);
        PumpReport {
            events_dispatched: self.delivered.load(Ordering::Relaxed) - before,
        }
    }

    /// Waits for a device not seen before to pair. A `duration_ms` of zero waits indefinitely.
    pub fn wait_for_device(&self, duration_ms: u32) -> Option<DeviceHandle<'_>> {
        let device = self.hub.wait_for_device(duration_ms);
        tracing::debug!("Waited for a device: {:?}", device);
        device.map(|device| self.device(device))
    }

    /// A command handle for a device of this session.
    pub fn device(&self, device: NativeDevice) -> DeviceHandle<'_> {
        DeviceHandle::new(device, self.hub.as_ref())
    }

    /// Routes the events in `capabilities` to `listener` until unregistered.
    pub fn register(
        &self,
        listener: ObjectPtr,
        capabilities: CapabilitySet,
    ) -> Result<RegistrationId> {
        if listener.is_null() {
            return Err(BridgeError::InvalidArgument("listener is null".to_owned()));
        }
        let bridge = Arc::new(ListenerBridge::register(
            Arc::clone(&self.runtime),
            listener,
            capabilities,
            Arc::clone(&self.delivered),
        )?);
        let id = RegistrationId(self.next_registration.fetch_add(1, Ordering::Relaxed));

        self.hub.add_listener(bridge.clone());
        self.registrations().push((id, bridge));
        tracing::debug!("Added listener {:?}", id);
        Ok(id)
    }

    /// Stops routing events to a registration and releases its references.
    ///
    /// Returns whether `id` was registered.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let removed = {
            let mut registrations = self.registrations();
            registrations
                .iter()
                .position(|(registered, _)| *registered == id)
                .map(|i| registrations.remove(i).1)
        };
        match removed {
            Some(bridge) => {
                let listener: Arc<dyn NativeListener> = bridge;
                self.hub.remove_listener(&listener);
                tracing::debug!("Removed listener {:?}", id);
                true
            }
            None => {
                tracing::warn!("Cannot remove listener {:?}: not registered", id);
                false
            }
        }
    }

    pub fn registration_count(&self) -> usize {
        self.registrations().len()
    }

    /// Releases the native session and every registration still held.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let remaining = std::mem::take(&mut *self.registrations());
        for (id, bridge) in remaining {
            let listener: Arc<dyn NativeListener> = bridge;
            self.hub.remove_listener(&listener);
            tracing::debug!("Released listener {:?} with its session", id);
        }
        tracing::info!("Session released");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("registrations", &self.registration_count())
            .field("locking_policy", &self.locking_policy())
            .finish()
    }
}

impl FFI for BridgedSession {
    type Origin = FromArc;
}

#[derive(Debug)]
pub struct BridgedSession {
    inner: Session,
}

fn duration(ms: i32) -> u32 {
    u32::try_from(ms).unwrap_or(0)
}

/// The managed runtime hosting this library. A process hosts one, so the
/// first table handed to `session_create` serves every later session too.
static HOST: OnceLock<Arc<dyn ManagedRuntime>> = OnceLock::new();

fn process_runtime(make: impl FnOnce() -> Arc<dyn ManagedRuntime>) -> Arc<dyn ManagedRuntime> {
    Arc::clone(HOST.get_or_init(make))
}

fn create_session(host: *const HostVTable, app_id: HostStr<'_>) -> Result<BridgedSession> {
    // SAFETY: the managed side passes either null or a valid table; it is copied here.
    let host = unsafe { host.as_ref() }
        .copied()
        .ok_or_else(|| BridgeError::InvalidArgument("host table is null".to_owned()))?;
    let app_id = app_id
        .as_cstr()
        .ok_or_else(|| BridgeError::InvalidArgument("application identifier is null".to_owned()))?
        .to_str()
        .map_err(|err| BridgeError::InvalidArgument(format!("application identifier: {err}")))?;

    let runtime = process_runtime(|| Arc::new(host));
    let session = Session::init(runtime, app_id)?;
    Ok(BridgedSession { inner: session })
}

#[unsafe(no_mangle)]
pub extern "C" fn session_create(
    host: *const HostVTable,
    app_id: HostStr<'_>,
    out_session: *mut BridgedOwnedSharedPtr<BridgedSession>,
    constructors: &ExceptionConstructors,
) -> FfiException {
    crate::logging::init_logging();
    if out_session.is_null() {
        let err = BridgeError::InvalidArgument("out_session is null".to_owned());
        return FfiException::from_error(err, constructors);
    }

    match panic::catch_unwind(AssertUnwindSafe(|| create_session(host, app_id))) {
        Ok(Ok(session)) => {
            tracing::info!("[FFI] Session created");
            let ptr = ArcFFI::into_ptr(Arc::new(session));
            // SAFETY: checked non-null above; the managed side owns the slot.
            unsafe { out_session.write(ptr) };
            FfiException::ok()
        }
        Ok(Err(err)) => FfiException::from_error(err, constructors),
        Err(_) => FfiException::from_error(
            BridgeError::Unexpected("panic while creating the session".to_owned()),
            constructors,
        ),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn session_free(session_ptr: BridgedOwnedSharedPtr<BridgedSession>) {
    ArcFFI::free(session_ptr);
    tracing::debug!("[FFI] Session freed");
}

/// Runs `f` on the session behind a borrowed pointer, logging a null pointer.
pub(crate) fn with_session<R>(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    op: &str,
    f: impl FnOnce(&Session) -> R,
) -> Option<R> {
    match ArcFFI::as_ref(session_ptr) {
        Some(bridged) => Some(f(&bridged.inner)),
        None => {
            tracing::error!("[FFI] {}: session is null", op);
            None
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn session_set_locking_policy(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    code: i32,
) {
    with_session(session_ptr, "session_set_locking_policy", |session| {
        session.set_locking_policy(LockingPolicy::from_code(code))
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn session_run(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    duration_ms: i32,
) {
    with_session(session_ptr, "session_run", |session| {
        session.run(duration(duration_ms))
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn session_run_once(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    duration_ms: i32,
) {
    with_session(session_ptr, "session_run_once", |session| {
        session.run_once(duration(duration_ms))
    });
}

/// Pumps on a blocking worker and completes the task with a [`PumpReport`].
#[unsafe(no_mangle)]
pub extern "C" fn session_run_async(
    tcb: Tcb,
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    duration_ms: i32,
) {
    let bridged_session = ArcFFI::cloned_from_ptr(session_ptr);
    let duration_ms = duration(duration_ms);
    tracing::trace!("[FFI] Scheduling a pump of {} ms", duration_ms);

    BridgedFuture::spawn::<_, _, BridgeError>(tcb, async move {
        let bridged_session = bridged_session
            .ok_or_else(|| BridgeError::InvalidArgument("session is null".to_owned()))?;
        let report = tokio::task::spawn_blocking(move || {
            bridged_session.inner.run_reporting(duration_ms)
        })
        .await
        .map_err(|err| BridgeError::Unexpected(err.to_string()))?;
        tracing::debug!("[FFI] Pump finished: {:?}", report);
        Ok(report)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn pump_report_events_dispatched(
    report_ptr: BridgedBorrowedSharedPtr<'_, PumpReport>,
) -> u64 {
    ArcFFI::as_ref(report_ptr).map_or(0, |report| report.events_dispatched)
}

#[unsafe(no_mangle)]
pub extern "C" fn pump_report_free(report_ptr: BridgedOwnedSharedPtr<PumpReport>) {
    ArcFFI::free(report_ptr);
}

/// Returns the paired device, or null on timeout.
#[unsafe(no_mangle)]
pub extern "C" fn session_wait_for_device(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    duration_ms: i32,
) -> *mut c_void {
    with_session(session_ptr, "session_wait_for_device", |session| {
        session
            .wait_for_device(duration(duration_ms))
            .map(|device| device.native().as_raw())
    })
    .flatten()
    .unwrap_or(std::ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "C" fn session_add_listener(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    listener: ObjectPtr,
    capabilities: u16,
    out_id: *mut u64,
    constructors: &ExceptionConstructors,
) -> FfiException {
    let Some(bridged) = ArcFFI::as_ref(session_ptr) else {
        let err = BridgeError::InvalidArgument("session is null".to_owned());
        return FfiException::from_error(err, constructors);
    };
    if out_id.is_null() {
        let err = BridgeError::InvalidArgument("out_id is null".to_owned());
        return FfiException::from_error(err, constructors);
    }

    let registered = panic::catch_unwind(AssertUnwindSafe(|| {
        bridged
            .inner
            .register(listener, CapabilitySet::from_bits(capabilities))
    }));
    match registered {
        Ok(Ok(id)) => {
            // SAFETY: checked non-null above.
            unsafe { out_id.write(id.get()) };
            FfiException::ok()
        }
        Ok(Err(err)) => FfiException::from_error(err, constructors),
        Err(_) => FfiException::from_error(
            BridgeError::Unexpected("panic while registering a listener".to_owned()),
            constructors,
        ),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn session_remove_listener(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    id: u64,
) {
    with_session(session_ptr, "session_remove_listener", |session| {
        session.unregister(RegistrationId::from_raw(id))
    });
}

#[cfg(test)]
pub(crate) fn bridged(session: Session) -> BridgedOwnedSharedPtr<BridgedSession> {
    ArcFFI::into_ptr(Arc::new(BridgedSession { inner: session }))
}
