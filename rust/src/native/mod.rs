//! The interface consumed from the native armband SDK.
//!
//! The SDK is reached only through [`NativeHub`]; events flow back through
//! [`NativeListener`]. Payloads are kept exactly as the SDK reports them (raw
//! enumeration tags included) so that conversion to managed values happens in
//! one place, the bridge.

#[cfg(feature = "libmyo")]
pub mod libmyo;
pub(crate) mod router;

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

/// Opaque identity of a paired device, owned by the native session.
///
/// Two handles are equal iff they refer to the same native device object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeDevice(NonNull<c_void>);

// The pointer is only an identity; it is dereferenced by the SDK alone.
unsafe impl Send for NativeDevice {}
unsafe impl Sync for NativeDevice {}

impl NativeDevice {
    pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(NativeDevice)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Raw tags of the SDK's `libmyo_arm_t`.
pub mod arm {
    pub const RIGHT: u32 = 0;
    pub const LEFT: u32 = 1;
    pub const UNKNOWN: u32 = 2;
}

/// Raw tags of the SDK's `libmyo_x_direction_t`.
pub mod x_direction {
    pub const TOWARD_WRIST: u32 = 0;
    pub const TOWARD_ELBOW: u32 = 1;
    pub const UNKNOWN: u32 = 2;
}

/// Raw tags of the SDK's `libmyo_warmup_state_t`.
pub mod warmup_state {
    pub const UNKNOWN: u32 = 0;
    pub const COLD: u32 = 1;
    pub const WARM: u32 = 2;
}

/// Raw tags of the SDK's `libmyo_pose_t`.
pub mod pose {
    pub const REST: u32 = 0;
    pub const FIST: u32 = 1;
    pub const WAVE_IN: u32 = 2;
    pub const WAVE_OUT: u32 = 3;
    pub const FINGERS_SPREAD: u32 = 4;
    pub const DOUBLE_TAP: u32 = 5;
    pub const UNKNOWN: u32 = 0xffff;
}

/// Raw tags of the SDK's `libmyo_warmup_result_t`.
pub mod warmup_result {
    pub const UNKNOWN: u32 = 0;
    pub const SUCCESS: u32 = 1;
    pub const FAILED_TIMEOUT: u32 = 2;
}

/// Raw tags of the SDK's `libmyo_locking_policy_t`.
pub mod locking_policy {
    pub const NONE: u32 = 0;
    pub const STANDARD: u32 = 1;
}

/// Raw tags of the SDK's `libmyo_vibration_type_t`.
pub mod vibration {
    pub const SHORT: u32 = 0;
    pub const MEDIUM: u32 = 1;
    pub const LONG: u32 = 2;
}

/// Raw tags of the SDK's `libmyo_unlock_type_t`.
pub mod unlock {
    pub const TIMED: u32 = 0;
    pub const HOLD: u32 = 1;
}

/// Raw tags of the SDK's `libmyo_stream_emg_t`.
pub mod stream_emg {
    pub const DISABLED: u32 = 0;
    pub const ENABLED: u32 = 1;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativeFirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub hardware_rev: u32,
}

/// Kind-specific part of a native event, as reported by the SDK.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NativePayload {
    Paired {
        firmware: NativeFirmwareVersion,
    },
    Unpaired,
    Connected {
        firmware: NativeFirmwareVersion,
    },
    Disconnected,
    ArmSynced {
        arm: u32,
        x_direction: u32,
        rotation: f32,
        warmup_state: u32,
    },
    ArmUnsynced,
    Unlocked,
    Locked,
    Pose {
        pose: u32,
    },
    /// Orientation as `[x, y, z, w]`.
    Orientation([f32; 4]),
    Accelerometer([f32; 3]),
    Gyroscope([f32; 3]),
    Rssi(i8),
    BatteryLevel(u8),
    Emg([i8; 8]),
    WarmupCompleted {
        result: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NativeEvent {
    pub device: NativeDevice,
    /// Microseconds on the SDK's monotonic clock.
    pub timestamp: u64,
    pub payload: NativePayload,
}

/// The SDK's polymorphic callback interface, collapsed into one tagged entry point.
pub trait NativeListener: Send + Sync {
    fn on_event(&self, event: &NativeEvent);
}

/// Raised by [`NativeHub`] construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NativeError {
    /// The SDK rejected an argument (typically the application identifier).
    #[error("{0}")]
    InvalidArgument(String),
    /// Any other SDK failure, e.g. the device service is not running.
    #[error("{0}")]
    Runtime(String),
}

/// One native session.
///
/// Listeners are invoked in the order they were added, from whichever thread
/// drives [`NativeHub::run`]. Events from devices that never paired are not
/// delivered. Device commands are fire-and-forget.
pub trait NativeHub: Send + Sync {
    fn set_locking_policy(&self, policy: u32);

    /// Pumps events for up to `duration_ms`.
    fn run(&self, duration_ms: u32);

    /// Pumps events until one batch has been delivered or `duration_ms` elapsed.
    fn run_once(&self, duration_ms: u32);

    /// Pumps events until a device not seen before pairs, returning it, or
    /// `duration_ms` elapses. A `duration_ms` of zero waits indefinitely.
    fn wait_for_device(&self, duration_ms: u32) -> Option<NativeDevice>;

    fn add_listener(&self, listener: Arc<dyn NativeListener>);

    /// Removes a listener previously added, matched by identity.
    fn remove_listener(&self, listener: &Arc<dyn NativeListener>);

    fn vibrate(&self, device: NativeDevice, vibration: u32);
    fn request_rssi(&self, device: NativeDevice);
    fn request_battery_level(&self, device: NativeDevice);
    fn unlock(&self, device: NativeDevice, unlock: u32);
    fn notify_user_action(&self, device: NativeDevice);
    fn set_stream_emg(&self, device: NativeDevice, mode: u32);
}

/// Opens native sessions; the seam between session creation and the SDK.
pub trait NativeSdk: Send + Sync {
    fn open(&self, application_identifier: &str) -> Result<Box<dyn NativeHub>, NativeError>;
}

/// Used when the crate is built without an SDK to link against.
#[cfg_attr(feature = "libmyo", allow(dead_code))]
pub(crate) struct UnavailableSdk;

impl NativeSdk for UnavailableSdk {
    fn open(&self, _application_identifier: &str) -> Result<Box<dyn NativeHub>, NativeError> {
        Err(NativeError::Runtime(
            "native SDK not available: built without the `libmyo` feature".to_owned(),
        ))
    }
}

/// The SDK this build links against.
pub(crate) fn default_sdk() -> &'static dyn NativeSdk {
    #[cfg(feature = "libmyo")]
    {
        &libmyo::Libmyo
    }
    #[cfg(not(feature = "libmyo"))]
    {
        &UnavailableSdk
    }
}
