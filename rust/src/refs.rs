//! Durable references and the per-registration metadata cache.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::attach::{CallContext, attach};
use crate::bridge::{CapabilitySet, EventKind};
use crate::error_conversion::{BridgeError, Result};
use crate::host::{ManagedRuntime, MemberId, ObjectPtr};
use crate::marshal::{Arm, ManagedEnum, Pose, WarmupResult, WarmupState, XDirection, descriptors};

/// A managed object pinned against collection until dropped.
///
/// Not `Clone`: each durable reference is deleted exactly once, on drop.
pub(crate) struct DurableRef {
    obj: ObjectPtr,
    runtime: Arc<dyn ManagedRuntime>,
}

impl DurableRef {
    /// Pins `obj`, leaving the caller's reference untouched.
    pub(crate) fn pin(
        ctx: &CallContext<'_>,
        runtime: &Arc<dyn ManagedRuntime>,
        obj: ObjectPtr,
        what: &str,
    ) -> Result<Self> {
        let durable = require(ctx, ctx.new_durable_ref(obj), || {
            format!("Cannot create a durable reference to {what}")
        })?;
        Ok(DurableRef {
            obj: durable,
            runtime: Arc::clone(runtime),
        })
    }

    /// Pins a local reference and deletes the local one.
    fn pin_local(
        ctx: &CallContext<'_>,
        runtime: &Arc<dyn ManagedRuntime>,
        local: ObjectPtr,
        what: &str,
    ) -> Result<Self> {
        let pinned = Self::pin(ctx, runtime, local, what);
        ctx.delete_local_ref(local);
        pinned
    }

    pub(crate) fn get(&self) -> ObjectPtr {
        self.obj
    }
}

impl Drop for DurableRef {
    fn drop(&mut self) {
        match attach(&self.runtime) {
            Ok(ctx) => ctx.delete_durable_ref(self.obj),
            Err(err) => tracing::error!("Leaking durable reference {:?}: {}", self.obj, err),
        }
    }
}

impl std::fmt::Debug for DurableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DurableRef").field(&self.obj).finish()
    }
}

/// Unwraps a lookup result, clearing whatever fault the failed lookup left pending.
fn require<T>(ctx: &CallContext<'_>, value: Option<T>, what: impl FnOnce() -> String) -> Result<T> {
    match value {
        Some(value) => Ok(value),
        None => {
            ctx.take_pending_fault();
            Err(BridgeError::OutOfResources(what()))
        }
    }
}

fn find_type(
    ctx: &CallContext<'_>,
    runtime: &Arc<dyn ManagedRuntime>,
    name: &str,
) -> Result<DurableRef> {
    let local = require(ctx, ctx.find_type(name), || format!("Cannot find type {name}"))?;
    DurableRef::pin_local(ctx, runtime, local, name)
}

fn constructor(ctx: &CallContext<'_>, ty: &DurableRef, type_name: &str, signature: &str) -> Result<MemberId> {
    require(
        ctx,
        ctx.method(ty.get(), descriptors::CONSTRUCTOR_NAME, signature),
        || format!("Cannot resolve constructor {type_name}{signature}"),
    )
}

/// A managed type plus one of its constructors.
#[derive(Debug)]
pub(crate) struct ConstructibleType {
    pub(crate) ty: DurableRef,
    pub(crate) constructor: MemberId,
}

impl ConstructibleType {
    fn resolve(
        ctx: &CallContext<'_>,
        runtime: &Arc<dyn ManagedRuntime>,
        name: &str,
        signature: &str,
    ) -> Result<Self> {
        let ty = find_type(ctx, runtime, name)?;
        let constructor = constructor(ctx, &ty, name, signature)?;
        Ok(ConstructibleType { ty, constructor })
    }
}

/// `FirmwareVersion`: built with its no-arg constructor, then its four int fields set.
#[derive(Debug)]
pub(crate) struct FirmwareVersionType {
    pub(crate) ty: DurableRef,
    pub(crate) constructor: MemberId,
    pub(crate) fields: [MemberId; 4],
}

impl FirmwareVersionType {
    fn resolve(ctx: &CallContext<'_>, runtime: &Arc<dyn ManagedRuntime>) -> Result<Self> {
        let name = descriptors::FIRMWARE_VERSION_TYPE;
        let ty = find_type(ctx, runtime, name)?;
        let constructor = constructor(ctx, &ty, name, descriptors::FIRMWARE_VERSION_CONSTRUCTOR)?;

        let mut fields = [MemberId::from_raw(std::ptr::null_mut()); 4];
        for (slot, field) in fields.iter_mut().zip(descriptors::FIRMWARE_VERSION_FIELDS) {
            *slot = require(
                ctx,
                ctx.field(ty.get(), field, descriptors::INT_FIELD),
                || format!("Cannot resolve field {name}.{field}"),
            )?;
        }
        Ok(FirmwareVersionType {
            ty,
            constructor,
            fields,
        })
    }
}

/// A managed enumeration with every member's static field resolved.
pub(crate) struct EnumType<E> {
    ty: DurableRef,
    constants: Vec<MemberId>,
    _marker: PhantomData<E>,
}

impl<E: ManagedEnum> EnumType<E> {
    fn resolve(ctx: &CallContext<'_>, runtime: &Arc<dyn ManagedRuntime>) -> Result<Self> {
        let ty = find_type(ctx, runtime, E::TYPE_NAME)?;
        let signature = format!("L{};", E::TYPE_NAME);
        let constants = E::MEMBERS
            .iter()
            .map(|member| {
                let name = member.constant_name();
                require(ctx, ctx.static_field(ty.get(), name, &signature), || {
                    format!("Cannot resolve constant {}.{}", E::TYPE_NAME, name)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(EnumType {
            ty,
            constants,
            _marker: PhantomData,
        })
    }

    /// Reads the constant for `member` as a local reference.
    pub(crate) fn constant(&self, ctx: &CallContext<'_>, member: E) -> Option<ObjectPtr> {
        let field = *self.constants.get(member.index())?;
        ctx.static_object_field(self.ty.get(), field)
    }
}

impl<E> std::fmt::Debug for EnumType<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnumType")
            .field("ty", &self.ty)
            .field("constants", &self.constants.len())
            .finish()
    }
}

/// Everything a registration pins on the managed side.
///
/// Only metadata for the kinds in the registration's capability set is
/// resolved; the rest stays `None`. Dropping the cache releases every
/// reference it holds.
#[derive(Debug)]
pub(crate) struct ReferenceCache {
    pub(crate) listener: DurableRef,
    /// Pins the listener's type so the resolved callback ids stay valid.
    #[allow(dead_code)]
    pub(crate) listener_type: DurableRef,
    callbacks: [Option<MemberId>; EventKind::COUNT],
    pub(crate) device: ConstructibleType,
    pub(crate) firmware_version: Option<FirmwareVersionType>,
    pub(crate) arm: Option<EnumType<Arm>>,
    pub(crate) x_direction: Option<EnumType<XDirection>>,
    pub(crate) warmup_state: Option<EnumType<WarmupState>>,
    pub(crate) pose: Option<EnumType<Pose>>,
    pub(crate) quaternion: Option<ConstructibleType>,
    pub(crate) vector3: Option<ConstructibleType>,
    pub(crate) warmup_result: Option<EnumType<WarmupResult>>,
}

impl ReferenceCache {
    pub(crate) fn resolve(
        runtime: &Arc<dyn ManagedRuntime>,
        listener: ObjectPtr,
        capabilities: CapabilitySet,
    ) -> Result<Self> {
        let ctx = attach(runtime)?;
        let ctx = &ctx;

        let listener_ref = DurableRef::pin(ctx, runtime, listener, "the listener")?;
        let listener_type = require(ctx, ctx.type_of(listener), || {
            "Cannot get the listener's type".to_owned()
        })?;
        let listener_type = DurableRef::pin_local(ctx, runtime, listener_type, "the listener's type")?;

        let mut callbacks = [None; EventKind::COUNT];
        for kind in capabilities.iter() {
            let (name, signature) = (kind.callback_name(), kind.callback_signature());
            callbacks[kind.index()] = Some(require(
                ctx,
                ctx.method(listener_type.get(), name, signature),
                || format!("Cannot resolve callback {name}{signature}"),
            )?);
        }

        let device = ConstructibleType::resolve(
            ctx,
            runtime,
            descriptors::DEVICE_TYPE,
            descriptors::DEVICE_CONSTRUCTOR,
        )?;

        let wants = |kinds: &[EventKind]| kinds.iter().any(|k| capabilities.contains(*k));
        let arm_sync = wants(&[EventKind::ArmSync]);

        let firmware_version = wants(&[EventKind::Pair, EventKind::Connect])
            .then(|| FirmwareVersionType::resolve(ctx, runtime))
            .transpose()?;
        let arm = arm_sync
            .then(|| EnumType::resolve(ctx, runtime))
            .transpose()?;
        let x_direction = arm_sync
            .then(|| EnumType::resolve(ctx, runtime))
            .transpose()?;
        let warmup_state = arm_sync
            .then(|| EnumType::resolve(ctx, runtime))
            .transpose()?;
        let pose = wants(&[EventKind::Pose])
            .then(|| EnumType::resolve(ctx, runtime))
            .transpose()?;
        let quaternion = wants(&[EventKind::OrientationData])
            .then(|| {
                ConstructibleType::resolve(
                    ctx,
                    runtime,
                    descriptors::QUATERNION_TYPE,
                    descriptors::QUATERNION_CONSTRUCTOR,
                )
            })
            .transpose()?;
        let vector3 = wants(&[EventKind::AccelerometerData, EventKind::GyroscopeData])
            .then(|| {
                ConstructibleType::resolve(
                    ctx,
                    runtime,
                    descriptors::VECTOR3_TYPE,
                    descriptors::VECTOR3_CONSTRUCTOR,
                )
            })
            .transpose()?;
        let warmup_result = wants(&[EventKind::WarmupCompleted])
            .then(|| EnumType::resolve(ctx, runtime))
            .transpose()?;

        Ok(ReferenceCache {
            listener: listener_ref,
            listener_type,
            callbacks,
            device,
            firmware_version,
            arm,
            x_direction,
            warmup_state,
            pose,
            quaternion,
            vector3,
            warmup_result,
        })
    }

    /// The resolved callback for `kind`, if the registration declared it.
    pub(crate) fn callback(&self, kind: EventKind) -> Option<MemberId> {
        self.callbacks[kind.index()]
    }
}
