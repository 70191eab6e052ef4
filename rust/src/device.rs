use std::ffi::c_void;

use crate::ffi::BridgedBorrowedSharedPtr;
use crate::marshal::{EmgStreamMode, UnlockType, VibrationType};
use crate::native::{NativeDevice, NativeHub};
use crate::session::{BridgedSession, with_session};

/// A paired device of a session. Cannot outlive the session.
///
/// Commands are one-way; any response arrives later as an event. Two handles
/// are equal iff they refer to the same native device.
#[derive(Clone, Copy)]
pub struct DeviceHandle<'s> {
    device: NativeDevice,
    hub: &'s dyn NativeHub,
}

impl<'s> DeviceHandle<'s> {
    pub(crate) fn new(device: NativeDevice, hub: &'s dyn NativeHub) -> Self {
        DeviceHandle { device, hub }
    }

    pub fn native(&self) -> NativeDevice {
        self.device
    }

    pub fn vibrate(&self, vibration: VibrationType) {
        if vibration == VibrationType::Unknown {
            tracing::warn!("Unknown vibration type, vibrating long");
        }
        self.hub.vibrate(self.device, vibration.to_native());
    }

    pub fn request_rssi(&self) {
        self.hub.request_rssi(self.device);
    }

    pub fn request_battery_level(&self) {
        self.hub.request_battery_level(self.device);
    }

    pub fn unlock(&self, unlock: UnlockType) {
        if unlock == UnlockType::Unknown {
            tracing::warn!("Unknown unlock type, unlocking timed");
        }
        self.hub.unlock(self.device, unlock.to_native());
    }

    pub fn notify_user_action(&self) {
        self.hub.notify_user_action(self.device);
    }

    pub fn set_stream_emg(&self, mode: EmgStreamMode) {
        if mode == EmgStreamMode::Unknown {
            tracing::warn!("Unknown EMG stream mode, enabling the stream");
        }
        self.hub.set_stream_emg(self.device, mode.to_native());
    }
}

impl PartialEq for DeviceHandle<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
    }
}

impl Eq for DeviceHandle<'_> {}

impl std::fmt::Debug for DeviceHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceHandle").field(&self.device).finish()
    }
}

fn with_device(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    device: *mut c_void,
    op: &str,
    command: impl FnOnce(DeviceHandle<'_>),
) {
    let Some(device) = NativeDevice::from_raw(device) else {
        tracing::error!("[FFI] {}: device is null", op);
        return;
    };
    tracing::trace!("[FFI] {} on {:?}", op, device);
    with_session(session_ptr, op, |session| command(session.device(device)));
}

#[unsafe(no_mangle)]
pub extern "C" fn device_vibrate(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    device: *mut c_void,
    vibration: i32,
) {
    with_device(session_ptr, device, "device_vibrate", |device| {
        device.vibrate(VibrationType::from_code(vibration))
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn device_request_rssi(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    device: *mut c_void,
) {
    with_device(session_ptr, device, "device_request_rssi", |device| {
        device.request_rssi()
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn device_request_battery_level(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    device: *mut c_void,
) {
    with_device(session_ptr, device, "device_request_battery_level", |device| {
        device.request_battery_level()
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn device_unlock(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    device: *mut c_void,
    unlock: i32,
) {
    with_device(session_ptr, device, "device_unlock", |device| {
        device.unlock(UnlockType::from_code(unlock))
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn device_notify_user_action(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    device: *mut c_void,
) {
    with_device(session_ptr, device, "device_notify_user_action", |device| {
        device.notify_user_action()
    });
}

#[unsafe(no_mangle)]
pub extern "C" fn device_set_stream_emg(
    session_ptr: BridgedBorrowedSharedPtr<'_, BridgedSession>,
    device: *mut c_void,
    mode: i32,
) {
    with_device(session_ptr, device, "device_set_stream_emg", |device| {
        device.set_stream_emg(EmgStreamMode::from_code(mode))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{stream_emg, unlock, vibration};
    use crate::session::{Session, bridged, session_free};
    use crate::test_support::{FakeHub, FakeRuntime, FakeSdk, HubCommand, device};
    use std::sync::Arc;

    fn open() -> (FakeHub, Session) {
        let hub = FakeHub::new();
        let session = Session::init_with(
            &FakeSdk::new(hub.clone()),
            Arc::new(FakeRuntime::new()),
            "com.example.devices",
        )
        .unwrap();
        (hub, session)
    }

    #[test]
    fn commands_carry_native_tags() {
        let (hub, session) = open();
        let d = device(0x100);
        let handle = session.device(d);

        handle.vibrate(VibrationType::Short);
        handle.request_rssi();
        handle.request_battery_level();
        handle.unlock(UnlockType::Hold);
        handle.notify_user_action();
        handle.set_stream_emg(EmgStreamMode::Disabled);

        assert_eq!(
            hub.commands(),
            [
                HubCommand::Vibrate(d, vibration::SHORT),
                HubCommand::RequestRssi(d),
                HubCommand::RequestBatteryLevel(d),
                HubCommand::Unlock(d, unlock::HOLD),
                HubCommand::NotifyUserAction(d),
                HubCommand::SetStreamEmg(d, stream_emg::DISABLED),
            ]
        );
    }

    #[test]
    fn unknown_codes_fall_back() {
        let (hub, session) = open();
        let d = device(0x100);
        let owned = bridged(session);

        device_vibrate(owned.borrow(), d.as_raw(), 17);
        device_unlock(owned.borrow(), d.as_raw(), -1);
        device_set_stream_emg(owned.borrow(), d.as_raw(), 3);

        assert_eq!(
            hub.commands(),
            [
                HubCommand::Vibrate(d, vibration::LONG),
                HubCommand::Unlock(d, unlock::TIMED),
                HubCommand::SetStreamEmg(d, stream_emg::ENABLED),
            ]
        );
        session_free(owned);
    }

    #[test]
    fn null_devices_are_ignored() {
        let (hub, session) = open();
        let owned = bridged(session);
        device_request_rssi(owned.borrow(), std::ptr::null_mut());
        device_notify_user_action(owned.borrow(), std::ptr::null_mut());
        device_request_battery_level(owned.borrow(), device(0x100).as_raw());
        assert_eq!(hub.commands(), [HubCommand::RequestBatteryLevel(device(0x100))]);
        session_free(owned);
    }

    #[test]
    fn handles_compare_by_identity() {
        let (_hub, session) = open();
        assert_eq!(session.device(device(0x100)), session.device(device(0x100)));
        assert_ne!(session.device(device(0x100)), session.device(device(0x200)));
    }
}
