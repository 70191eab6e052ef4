//! [`NativeHub`] over the vendor's libmyo C API.

use std::ffi::{CStr, CString, c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;

use super::router::{EventRouter, wait_for_new_device};
use super::{
    NativeDevice, NativeError, NativeEvent, NativeFirmwareVersion, NativeHub, NativeListener,
    NativePayload, NativeSdk,
};

#[allow(non_camel_case_types)]
mod sys {
    use std::ffi::{c_char, c_void};

    pub type libmyo_hub_t = *mut c_void;
    pub type libmyo_myo_t = *mut c_void;
    pub type libmyo_event_t = *mut c_void;
    pub type libmyo_error_details_t = *mut c_void;
    pub type libmyo_result_t = i32;

    pub const LIBMYO_SUCCESS: libmyo_result_t = 0;
    pub const LIBMYO_ERROR_INVALID_ARGUMENT: libmyo_result_t = 2;

    pub const LIBMYO_HANDLER_CONTINUE: u32 = 0;
    pub const LIBMYO_HANDLER_STOP: u32 = 1;

    pub const LIBMYO_USER_ACTION_SINGLE: u32 = 0;

    pub mod event {
        pub const PAIRED: u32 = 0;
        pub const UNPAIRED: u32 = 1;
        pub const CONNECTED: u32 = 2;
        pub const DISCONNECTED: u32 = 3;
        pub const ARM_SYNCED: u32 = 4;
        pub const ARM_UNSYNCED: u32 = 5;
        pub const ORIENTATION: u32 = 6;
        pub const POSE: u32 = 7;
        pub const RSSI: u32 = 8;
        pub const UNLOCKED: u32 = 9;
        pub const LOCKED: u32 = 10;
        pub const EMG: u32 = 11;
        pub const BATTERY_LEVEL: u32 = 12;
        pub const WARMUP_COMPLETED: u32 = 13;
    }

    pub type libmyo_handler_t =
        unsafe extern "C" fn(user_data: *mut c_void, event: libmyo_event_t) -> u32;

    #[cfg_attr(all(windows, target_pointer_width = "64"), link(name = "myo64"))]
    #[cfg_attr(all(windows, target_pointer_width = "32"), link(name = "myo32"))]
    #[cfg_attr(target_os = "macos", link(name = "myo", kind = "framework"))]
    #[cfg_attr(not(any(windows, target_os = "macos")), link(name = "myo"))]
    unsafe extern "C" {
        pub fn libmyo_error_cstring(details: libmyo_error_details_t) -> *const c_char;
        pub fn libmyo_error_kind(details: libmyo_error_details_t) -> libmyo_result_t;
        pub fn libmyo_free_error_details(details: libmyo_error_details_t);

        pub fn libmyo_init_hub(
            out_hub: *mut libmyo_hub_t,
            application_identifier: *const c_char,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;
        pub fn libmyo_shutdown_hub(
            hub: libmyo_hub_t,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;
        pub fn libmyo_set_locking_policy(
            hub: libmyo_hub_t,
            locking_policy: u32,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;
        pub fn libmyo_run(
            hub: libmyo_hub_t,
            duration_ms: u32,
            handler: libmyo_handler_t,
            user_data: *mut c_void,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;

        pub fn libmyo_event_get_type(event: libmyo_event_t) -> u32;
        pub fn libmyo_event_get_timestamp(event: libmyo_event_t) -> u64;
        pub fn libmyo_event_get_myo(event: libmyo_event_t) -> libmyo_myo_t;
        pub fn libmyo_event_get_firmware_version(event: libmyo_event_t, component: u32) -> u32;
        pub fn libmyo_event_get_arm(event: libmyo_event_t) -> u32;
        pub fn libmyo_event_get_x_direction(event: libmyo_event_t) -> u32;
        pub fn libmyo_event_get_warmup_state(event: libmyo_event_t) -> u32;
        pub fn libmyo_event_get_warmup_result(event: libmyo_event_t) -> u32;
        pub fn libmyo_event_get_rotation_on_arm(event: libmyo_event_t) -> f32;
        pub fn libmyo_event_get_orientation(event: libmyo_event_t, index: u32) -> f32;
        pub fn libmyo_event_get_accelerometer(event: libmyo_event_t, index: u32) -> f32;
        pub fn libmyo_event_get_gyroscope(event: libmyo_event_t, index: u32) -> f32;
        pub fn libmyo_event_get_pose(event: libmyo_event_t) -> u32;
        pub fn libmyo_event_get_rssi(event: libmyo_event_t) -> i8;
        pub fn libmyo_event_get_battery_level(event: libmyo_event_t) -> u8;
        pub fn libmyo_event_get_emg(event: libmyo_event_t, sensor: u32) -> i8;

        pub fn libmyo_vibrate(
            myo: libmyo_myo_t,
            vibration: u32,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;
        pub fn libmyo_request_rssi(
            myo: libmyo_myo_t,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;
        pub fn libmyo_request_battery_level(
            myo: libmyo_myo_t,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;
        pub fn libmyo_set_stream_emg(
            myo: libmyo_myo_t,
            emg: u32,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;
        pub fn libmyo_myo_unlock(
            myo: libmyo_myo_t,
            unlock: u32,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;
        pub fn libmyo_myo_notify_user_action(
            myo: libmyo_myo_t,
            action: u32,
            out_error: *mut libmyo_error_details_t,
        ) -> libmyo_result_t;
    }
}

/// Turns a libmyo result and its error details into a `Result`, freeing the details.
fn check(
    result: sys::libmyo_result_t,
    details: sys::libmyo_error_details_t,
) -> Result<(), NativeError> {
    if result == sys::LIBMYO_SUCCESS {
        return Ok(());
    }
    let (kind, message) = if details.is_null() {
        (result, format!("libmyo error {result}"))
    } else {
        // SAFETY: non-null details come from the failed call and are freed exactly once here.
        unsafe {
            let kind = sys::libmyo_error_kind(details);
            let message = CStr::from_ptr(sys::libmyo_error_cstring(details))
                .to_string_lossy()
                .into_owned();
            sys::libmyo_free_error_details(details);
            (kind, message)
        }
    };
    Err(match kind {
        sys::LIBMYO_ERROR_INVALID_ARGUMENT => NativeError::InvalidArgument(message),
        _ => NativeError::Runtime(message),
    })
}

/// Calls a libmyo function taking a trailing `out_error`, checking its result.
fn call(
    f: impl FnOnce(*mut sys::libmyo_error_details_t) -> sys::libmyo_result_t,
) -> Result<(), NativeError> {
    let mut details: sys::libmyo_error_details_t = std::ptr::null_mut();
    let result = f(&mut details);
    check(result, details)
}

/// The libmyo SDK.
pub struct Libmyo;

impl NativeSdk for Libmyo {
    fn open(&self, application_identifier: &str) -> Result<Box<dyn NativeHub>, NativeError> {
        let app_id = CString::new(application_identifier)
            .map_err(|err| NativeError::InvalidArgument(err.to_string()))?;
        let mut hub: sys::libmyo_hub_t = std::ptr::null_mut();
        // SAFETY: both out-pointers are valid for the duration of the call.
        call(|err| unsafe { sys::libmyo_init_hub(&mut hub, app_id.as_ptr(), err) })?;
        let hub = NonNull::new(hub)
            .ok_or_else(|| NativeError::Runtime("libmyo returned no hub".to_owned()))?;
        tracing::debug!("libmyo hub initialised");
        Ok(Box::new(LibmyoHub {
            hub: RawHub(hub),
            router: EventRouter::new(),
        }))
    }
}

struct RawHub(NonNull<c_void>);

// libmyo hubs may be used from any thread; only `run` must not be re-entered.
unsafe impl Send for RawHub {}
unsafe impl Sync for RawHub {}

pub struct LibmyoHub {
    hub: RawHub,
    router: EventRouter,
}

impl LibmyoHub {
    fn raw(&self) -> sys::libmyo_hub_t {
        self.hub.0.as_ptr()
    }

    fn run_with(&self, duration_ms: u32, handler: sys::libmyo_handler_t) {
        let user_data = self as *const LibmyoHub as *mut c_void;
        // SAFETY: `self` outlives the call; the handler only borrows it.
        let result = call(|err| unsafe {
            sys::libmyo_run(self.raw(), duration_ms, handler, user_data, err)
        });
        if let Err(err) = result {
            tracing::error!("libmyo_run failed: {}", err);
        }
    }

    fn on_device_event(&self, event: sys::libmyo_event_t) {
        // SAFETY: `event` is valid for the duration of the handler call.
        let events: Vec<NativeEvent> = unsafe { decode(event) }.into_iter().flatten().collect();
        self.router.route(&events);
    }

    fn command(
        &self,
        op: &str,
        f: impl FnOnce(*mut sys::libmyo_error_details_t) -> sys::libmyo_result_t,
    ) {
        if let Err(err) = call(f) {
            tracing::warn!("{} failed: {}", op, err);
        }
    }
}

fn handle(user_data: *mut c_void, event: sys::libmyo_event_t) {
    // SAFETY: `user_data` is the `LibmyoHub` passed by `run_with`.
    let hub = unsafe { &*(user_data as *const LibmyoHub) };
    if panic::catch_unwind(AssertUnwindSafe(|| hub.on_device_event(event))).is_err() {
        tracing::error!("Panic while handling a libmyo event");
    }
}

unsafe extern "C" fn handle_all(user_data: *mut c_void, event: sys::libmyo_event_t) -> u32 {
    handle(user_data, event);
    sys::LIBMYO_HANDLER_CONTINUE
}

unsafe extern "C" fn handle_one(user_data: *mut c_void, event: sys::libmyo_event_t) -> u32 {
    handle(user_data, event);
    sys::LIBMYO_HANDLER_STOP
}

/// Reads one libmyo event. Orientation events carry three readings and
/// become three events.
unsafe fn decode(event: sys::libmyo_event_t) -> [Option<NativeEvent>; 3] {
    use sys::event as kind;

    unsafe {
        let Some(device) = NativeDevice::from_raw(sys::libmyo_event_get_myo(event)) else {
            return [None, None, None];
        };
        let timestamp = sys::libmyo_event_get_timestamp(event);
        let make = |payload| {
            Some(NativeEvent {
                device,
                timestamp,
                payload,
            })
        };
        let firmware = || NativeFirmwareVersion {
            major: sys::libmyo_event_get_firmware_version(event, 0),
            minor: sys::libmyo_event_get_firmware_version(event, 1),
            patch: sys::libmyo_event_get_firmware_version(event, 2),
            hardware_rev: sys::libmyo_event_get_firmware_version(event, 3),
        };

        let payload = match sys::libmyo_event_get_type(event) {
            kind::PAIRED => NativePayload::Paired {
                firmware: firmware(),
            },
            kind::UNPAIRED => NativePayload::Unpaired,
            kind::CONNECTED => NativePayload::Connected {
                firmware: firmware(),
            },
            kind::DISCONNECTED => NativePayload::Disconnected,
            kind::ARM_SYNCED => NativePayload::ArmSynced {
                arm: sys::libmyo_event_get_arm(event),
                x_direction: sys::libmyo_event_get_x_direction(event),
                rotation: sys::libmyo_event_get_rotation_on_arm(event),
                warmup_state: sys::libmyo_event_get_warmup_state(event),
            },
            kind::ARM_UNSYNCED => NativePayload::ArmUnsynced,
            kind::UNLOCKED => NativePayload::Unlocked,
            kind::LOCKED => NativePayload::Locked,
            kind::POSE => NativePayload::Pose {
                pose: sys::libmyo_event_get_pose(event),
            },
            kind::ORIENTATION => {
                let orientation =
                    [0, 1, 2, 3].map(|i| sys::libmyo_event_get_orientation(event, i));
                let accelerometer =
                    [0, 1, 2].map(|i| sys::libmyo_event_get_accelerometer(event, i));
                let gyroscope = [0, 1, 2].map(|i| sys::libmyo_event_get_gyroscope(event, i));
                return [
                    make(NativePayload::Orientation(orientation)),
                    make(NativePayload::Accelerometer(accelerometer)),
                    make(NativePayload::Gyroscope(gyroscope)),
                ];
            }
            kind::RSSI => NativePayload::Rssi(sys::libmyo_event_get_rssi(event)),
            kind::BATTERY_LEVEL => {
                NativePayload::BatteryLevel(sys::libmyo_event_get_battery_level(event))
            }
            kind::EMG => NativePayload::Emg(
                [0, 1, 2, 3, 4, 5, 6, 7].map(|i| sys::libmyo_event_get_emg(event, i)),
            ),
            kind::WARMUP_COMPLETED => NativePayload::WarmupCompleted {
                result: sys::libmyo_event_get_warmup_result(event),
            },
            other => {
                tracing::trace!("Ignoring libmyo event type {}", other);
                return [None, None, None];
            }
        };
        [make(payload), None, None]
    }
}

impl NativeHub for LibmyoHub {
    fn set_locking_policy(&self, policy: u32) {
        // SAFETY: the hub is valid until drop.
        self.command("libmyo_set_locking_policy", |err| unsafe {
            sys::libmyo_set_locking_policy(self.raw(), policy, err)
        });
    }

    fn run(&self, duration_ms: u32) {
        self.run_with(duration_ms, handle_all);
    }

    fn run_once(&self, duration_ms: u32) {
        self.run_with(duration_ms, handle_one);
    }

    fn wait_for_device(&self, duration_ms: u32) -> Option<NativeDevice> {
        wait_for_new_device(&self.router, duration_ms, |slice| self.run_once(slice))
    }

    fn add_listener(&self, listener: Arc<dyn NativeListener>) {
        self.router.add_listener(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn NativeListener>) {
        self.router.remove_listener(listener);
    }

    fn vibrate(&self, device: NativeDevice, vibration: u32) {
        // SAFETY: devices stay valid while their hub is alive.
        self.command("libmyo_vibrate", |err| unsafe {
            sys::libmyo_vibrate(device.as_raw(), vibration, err)
        });
    }

    fn request_rssi(&self, device: NativeDevice) {
        self.command("libmyo_request_rssi", |err| unsafe {
            sys::libmyo_request_rssi(device.as_raw(), err)
        });
    }

    fn request_battery_level(&self, device: NativeDevice) {
        self.command("libmyo_request_battery_level", |err| unsafe {
            sys::libmyo_request_battery_level(device.as_raw(), err)
        });
    }

    fn unlock(&self, device: NativeDevice, unlock: u32) {
        self.command("libmyo_myo_unlock", |err| unsafe {
            sys::libmyo_myo_unlock(device.as_raw(), unlock, err)
        });
    }

    fn notify_user_action(&self, device: NativeDevice) {
        self.command("libmyo_myo_notify_user_action", |err| unsafe {
            sys::libmyo_myo_notify_user_action(
                device.as_raw(),
                sys::LIBMYO_USER_ACTION_SINGLE,
                err,
            )
        });
    }

    fn set_stream_emg(&self, device: NativeDevice, mode: u32) {
        self.command("libmyo_set_stream_emg", |err| unsafe {
            sys::libmyo_set_stream_emg(device.as_raw(), mode, err)
        });
    }
}

impl Drop for LibmyoHub {
    fn drop(&mut self) {
        // SAFETY: the hub was returned by `libmyo_init_hub` and is shut down once.
        let result = call(|err| unsafe { sys::libmyo_shutdown_hub(self.raw(), err) });
        match result {
            Ok(()) => tracing::debug!("libmyo hub shut down"),
            Err(err) => tracing::error!("libmyo_shutdown_hub failed: {}", err),
        }
    }
}
