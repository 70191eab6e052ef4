//! The listener bridge: routes native events to one managed listener.
//!
//! A registration declares which of the sixteen event kinds its managed
//! listener implements ([`CapabilitySet`]). Only those kinds get their
//! metadata resolved at registration, and only those are marshaled and
//! dispatched; every other event is dropped before touching the runtime.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::attach::{CallContext, attach};
use crate::error_conversion::Result;
use crate::host::{HostError, ManagedRuntime, ManagedValue, ObjectPtr};
use crate::marshal::{
    Arm, EmgData, FirmwareVersion, ManagedEnum, Pose, Quaternion, Vector3, WarmupResult,
    WarmupState, XDirection, battery_level_to_managed, device_address, timestamp_to_managed,
};
use crate::native::{NativeEvent, NativeListener, NativePayload};
use crate::refs::{EnumType, ReferenceCache};

/// The sixteen kinds of device events, in capability-bit order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Pair = 0,
    Unpair = 1,
    Connect = 2,
    Disconnect = 3,
    ArmSync = 4,
    ArmUnsync = 5,
    Unlock = 6,
    Lock = 7,
    Pose = 8,
    OrientationData = 9,
    AccelerometerData = 10,
    GyroscopeData = 11,
    Rssi = 12,
    BatteryLevelReceived = 13,
    EmgData = 14,
    WarmupCompleted = 15,
}

impl EventKind {
    pub const COUNT: usize = 16;

    pub const ALL: [EventKind; EventKind::COUNT] = [
        EventKind::Pair,
        EventKind::Unpair,
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::ArmSync,
        EventKind::ArmUnsync,
        EventKind::Unlock,
        EventKind::Lock,
        EventKind::Pose,
        EventKind::OrientationData,
        EventKind::AccelerometerData,
        EventKind::GyroscopeData,
        EventKind::Rssi,
        EventKind::BatteryLevelReceived,
        EventKind::EmgData,
        EventKind::WarmupCompleted,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn of(payload: &NativePayload) -> EventKind {
        match payload {
            NativePayload::Paired { .. } => EventKind::Pair,
            NativePayload::Unpaired => EventKind::Unpair,
            NativePayload::Connected { .. } => EventKind::Connect,
            NativePayload::Disconnected => EventKind::Disconnect,
            NativePayload::ArmSynced { .. } => EventKind::ArmSync,
            NativePayload::ArmUnsynced => EventKind::ArmUnsync,
            NativePayload::Unlocked => EventKind::Unlock,
            NativePayload::Locked => EventKind::Lock,
            NativePayload::Pose { .. } => EventKind::Pose,
            NativePayload::Orientation(_) => EventKind::OrientationData,
            NativePayload::Accelerometer(_) => EventKind::AccelerometerData,
            NativePayload::Gyroscope(_) => EventKind::GyroscopeData,
            NativePayload::Rssi(_) => EventKind::Rssi,
            NativePayload::BatteryLevel(_) => EventKind::BatteryLevelReceived,
            NativePayload::Emg(_) => EventKind::EmgData,
            NativePayload::WarmupCompleted { .. } => EventKind::WarmupCompleted,
        }
    }

    /// Name of the listener method receiving this kind.
    pub fn callback_name(self) -> &'static str {
        match self {
            EventKind::Pair => "onPair",
            EventKind::Unpair => "onUnpair",
            EventKind::Connect => "onConnect",
            EventKind::Disconnect => "onDisconnect",
            EventKind::ArmSync => "onArmSync",
            EventKind::ArmUnsync => "onArmUnsync",
            EventKind::Unlock => "onUnlock",
            EventKind::Lock => "onLock",
            EventKind::Pose => "onPose",
            EventKind::OrientationData => "onOrientationData",
            EventKind::AccelerometerData => "onAccelerometerData",
            EventKind::GyroscopeData => "onGyroscopeData",
            EventKind::Rssi => "onRssi",
            EventKind::BatteryLevelReceived => "onBatteryLevelReceived",
            EventKind::EmgData => "onEmgData",
            EventKind::WarmupCompleted => "onWarmupCompleted",
        }
    }

    /// Descriptor of the listener method; every callback takes the device and
    /// the timestamp first.
    pub fn callback_signature(self) -> &'static str {
        match self {
            EventKind::Pair | EventKind::Connect => {
                "(Lcom/thalmic/myo/Myo;JLcom/thalmic/myo/FirmwareVersion;)V"
            }
            EventKind::Unpair
            | EventKind::Disconnect
            | EventKind::ArmUnsync
            | EventKind::Unlock
            | EventKind::Lock => "(Lcom/thalmic/myo/Myo;J)V",
            EventKind::ArmSync => {
                "(Lcom/thalmic/myo/Myo;JLcom/thalmic/myo/Arm;Lcom/thalmic/myo/XDirection;FLcom/thalmic/myo/WarmupState;)V"
            }
            EventKind::Pose => "(Lcom/thalmic/myo/Myo;JLcom/thalmic/myo/Pose;)V",
            EventKind::OrientationData => "(Lcom/thalmic/myo/Myo;JLcom/thalmic/myo/Quaternion;)V",
            EventKind::AccelerometerData | EventKind::GyroscopeData => {
                "(Lcom/thalmic/myo/Myo;JLcom/thalmic/myo/Vector3;)V"
            }
            EventKind::Rssi | EventKind::BatteryLevelReceived => "(Lcom/thalmic/myo/Myo;JB)V",
            EventKind::EmgData => "(Lcom/thalmic/myo/Myo;J[B)V",
            EventKind::WarmupCompleted => "(Lcom/thalmic/myo/Myo;JLcom/thalmic/myo/WarmupResult;)V",
        }
    }
}

/// The set of event kinds a managed listener implements.
///
/// Across the C ABI this is a `u16` with bit *i* set for [`EventKind::ALL`]`[i]`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const fn empty() -> Self {
        CapabilitySet(0)
    }

    pub const fn all() -> Self {
        CapabilitySet(u16::MAX)
    }

    pub const fn from_bits(bits: u16) -> Self {
        CapabilitySet(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn with(self, kind: EventKind) -> Self {
        CapabilitySet(self.0 | 1 << kind.index())
    }

    pub fn contains(self, kind: EventKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = EventKind> {
        EventKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<EventKind> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        iter.into_iter().fold(CapabilitySet::empty(), CapabilitySet::with)
    }
}

impl std::fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Why one event did not reach its listener cleanly.
#[derive(Debug, thiserror::Error)]
enum DispatchFault {
    #[error(transparent)]
    Attach(#[from] HostError),
    #[error("{} was not resolved at registration", .0.callback_name())]
    Unresolved(EventKind),
    #[error("cannot construct {0}")]
    Construct(&'static str),
    #[error("{} raised a managed fault", .0.callback_name())]
    Callback(EventKind),
}

/// Local references created for one event, deleted when it has been dispatched.
struct LocalRefs<'rt> {
    ctx: CallContext<'rt>,
    refs: Vec<ObjectPtr>,
}

impl<'rt> LocalRefs<'rt> {
    fn new(ctx: CallContext<'rt>) -> Self {
        LocalRefs {
            ctx,
            refs: Vec::with_capacity(4),
        }
    }

    fn track(
        &mut self,
        obj: Option<ObjectPtr>,
        what: &'static str,
    ) -> std::result::Result<ObjectPtr, DispatchFault> {
        match obj {
            Some(obj) => {
                self.refs.push(obj);
                Ok(obj)
            }
            None => {
                self.ctx.take_pending_fault();
                Err(DispatchFault::Construct(what))
            }
        }
    }

    fn constant<E: ManagedEnum>(
        &mut self,
        ty: Option<&EnumType<E>>,
        member: E,
        kind: EventKind,
    ) -> std::result::Result<ManagedValue, DispatchFault> {
        let ty = ty.ok_or(DispatchFault::Unresolved(kind))?;
        let constant = ty.constant(&self.ctx, member);
        self.track(constant, E::TYPE_NAME).map(ManagedValue::Object)
    }
}

impl Drop for LocalRefs<'_> {
    fn drop(&mut self) {
        for obj in self.refs.drain(..) {
            self.ctx.delete_local_ref(obj);
        }
    }
}

/// Adapts one managed listener to the native listener interface.
///
/// Owns every durable reference of its registration; dropping the bridge
/// releases them.
pub struct ListenerBridge {
    capabilities: CapabilitySet,
    refs: ReferenceCache,
    runtime: Arc<dyn ManagedRuntime>,
    /// Managed callbacks invoked, shared by all registrations of a session.
    delivered: Arc<AtomicU64>,
    faults: AtomicU64,
}

impl ListenerBridge {
    /// Pins `listener` and resolves what `capabilities` needs.
    pub(crate) fn register(
        runtime: Arc<dyn ManagedRuntime>,
        listener: ObjectPtr,
        capabilities: CapabilitySet,
        delivered: Arc<AtomicU64>,
    ) -> Result<Self> {
        let refs = ReferenceCache::resolve(&runtime, listener, capabilities)?;
        tracing::debug!(
            "Registered listener {:?} for {:?}",
            refs.listener.get(),
            capabilities
        );
        Ok(ListenerBridge {
            capabilities,
            refs,
            runtime,
            delivered,
            faults: AtomicU64::new(0),
        })
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// Events whose dispatch faulted, in marshaling or in the listener itself.
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    fn dispatch(
        &self,
        kind: EventKind,
        event: &NativeEvent,
    ) -> std::result::Result<(), DispatchFault> {
        let callback = self
            .refs
            .callback(kind)
            .ok_or(DispatchFault::Unresolved(kind))?;
        let ctx = attach(&self.runtime)?;
        let mut locals = LocalRefs::new(ctx);

        let device = &self.refs.device;
        let device = locals.track(
            ctx.new_object(
                device.ty.get(),
                device.constructor,
                &[ManagedValue::Long(device_address(event.device))],
            ),
            "Myo",
        )?;

        let mut args = Vec::with_capacity(6);
        args.push(ManagedValue::Object(device));
        args.push(ManagedValue::Long(timestamp_to_managed(event.timestamp)));
        self.payload_args(&mut locals, kind, &event.payload, &mut args)?;
        if ctx.take_pending_fault() {
            return Err(DispatchFault::Construct("the payload"));
        }

        ctx.call_void_method(self.refs.listener.get(), callback, &args);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        if ctx.take_pending_fault() {
            return Err(DispatchFault::Callback(kind));
        }
        Ok(())
    }

    fn payload_args(
        &self,
        locals: &mut LocalRefs<'_>,
        kind: EventKind,
        payload: &NativePayload,
        args: &mut Vec<ManagedValue>,
    ) -> std::result::Result<(), DispatchFault> {
        let ctx = locals.ctx;
        match *payload {
            NativePayload::Paired { firmware } | NativePayload::Connected { firmware } => {
                let meta = self
                    .refs
                    .firmware_version
                    .as_ref()
                    .ok_or(DispatchFault::Unresolved(kind))?;
                let version = locals.track(
                    ctx.new_object(meta.ty.get(), meta.constructor, &[]),
                    "FirmwareVersion",
                )?;
                let values = FirmwareVersion::from(firmware).fields();
                for (field, value) in meta.fields.iter().zip(values) {
                    ctx.set_int_field(version, *field, value);
                }
                args.push(ManagedValue::Object(version));
            }
            NativePayload::Unpaired
            | NativePayload::Disconnected
            | NativePayload::ArmUnsynced
            | NativePayload::Unlocked
            | NativePayload::Locked => {}
            NativePayload::ArmSynced {
                arm,
                x_direction,
                rotation,
                warmup_state,
            } => {
                let refs = &self.refs;
                args.push(locals.constant(refs.arm.as_ref(), Arm::from_native(arm), kind)?);
                args.push(locals.constant(
                    refs.x_direction.as_ref(),
                    XDirection::from_native(x_direction),
                    kind,
                )?);
                args.push(ManagedValue::Float(rotation));
                args.push(locals.constant(
                    refs.warmup_state.as_ref(),
                    WarmupState::from_native(warmup_state),
                    kind,
                )?);
            }
            NativePayload::Pose { pose } => {
                args.push(locals.constant(self.refs.pose.as_ref(), Pose::from_native(pose), kind)?);
            }
            NativePayload::Orientation(raw) => {
                let meta = self
                    .refs
                    .quaternion
                    .as_ref()
                    .ok_or(DispatchFault::Unresolved(kind))?;
                let q = Quaternion::from(raw);
                let values = [q.x, q.y, q.z, q.w].map(ManagedValue::Double);
                let quaternion = locals.track(
                    ctx.new_object(meta.ty.get(), meta.constructor, &values),
                    "Quaternion",
                )?;
                args.push(ManagedValue::Object(quaternion));
            }
            NativePayload::Accelerometer(raw) | NativePayload::Gyroscope(raw) => {
                let meta = self
                    .refs
                    .vector3
                    .as_ref()
                    .ok_or(DispatchFault::Unresolved(kind))?;
                let v = Vector3::from(raw);
                let values = [v.x, v.y, v.z].map(ManagedValue::Double);
                let vector = locals.track(
                    ctx.new_object(meta.ty.get(), meta.constructor, &values),
                    "Vector3",
                )?;
                args.push(ManagedValue::Object(vector));
            }
            NativePayload::Rssi(rssi) => args.push(ManagedValue::Byte(rssi)),
            NativePayload::BatteryLevel(level) => {
                args.push(ManagedValue::Byte(battery_level_to_managed(level)))
            }
            NativePayload::Emg(samples) => {
                let data = EmgData(samples);
                let array = locals.track(ctx.new_byte_array(data.as_slice()), "byte[]")?;
                args.push(ManagedValue::Object(array));
            }
            NativePayload::WarmupCompleted { result } => {
                args.push(locals.constant(
                    self.refs.warmup_result.as_ref(),
                    WarmupResult::from_native(result),
                    kind,
                )?);
            }
        }
        Ok(())
    }
}

impl NativeListener for ListenerBridge {
    fn on_event(&self, event: &NativeEvent) {
        let kind = EventKind::of(&event.payload);
        if !self.capabilities.contains(kind) {
            return;
        }

        // Nothing may unwind into the native SDK.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(kind, event)));
        let reason = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(fault)) => fault.to_string(),
            Err(panic) => {
                if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("panicked: {s}")
                } else {
                    "panicked".to_owned()
                }
            }
        };
        self.faults.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            target: "myo_bridge::dispatch",
            "{} for device {:?} at {}: {}",
            kind.callback_name(),
            event.device,
            event.timestamp,
            reason
        );
    }
}

impl std::fmt::Debug for ListenerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBridge")
            .field("listener", &self.refs.listener)
            .field("capabilities", &self.capabilities)
            .field("faults", &self.faults())
            .finish()
    }
}
