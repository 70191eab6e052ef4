//! Test doubles for both sides of the bridge.
//!
//! [`FakeRuntime`] is a managed runtime that records every call made to it and
//! keeps enough of an object model (types, instances, int fields, byte arrays,
//! static constants, durable references) for tests to inspect what a listener
//! received. [`FakeHub`] is a native session that routes scripted events the
//! way a real hub does.

use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use crate::error_conversion::ExceptionPtr;
use crate::ffi::FFIStr;
use crate::host::{
    EnvPtr, HostError, ManagedRuntime, ManagedValue, MemberId, ObjectPtr, ThreadAttachment,
};
use crate::native::router::{EventRouter, wait_for_new_device};
use crate::native::{
    NativeDevice, NativeError, NativeEvent, NativeFirmwareVersion, NativeHub, NativeListener,
    NativePayload, NativeSdk,
};
use crate::task::ExceptionConstructors;

/// A call observed by [`FakeRuntime`], with handles resolved to names.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    Attach,
    Detach,
    NewDurableRef(usize),
    DeleteDurableRef(usize),
    DeleteLocalRef(usize),
    TypeOf(usize),
    FindType(String),
    Method(String, String),
    Field(String, String),
    StaticField(String, String),
    StaticObjectField(String),
    NewObject(String, Vec<ManagedValue>),
    SetIntField(String, i32),
    NewByteArray(Vec<i8>),
    /// Receiver (the pinned object, resolved), method name, arguments.
    CallVoid(usize, String, Vec<ManagedValue>),
    TakeFault,
}

#[derive(Clone, Debug)]
enum Object {
    /// A type descriptor.
    Type(String),
    Instance {
        ty: String,
        ints: HashMap<String, i32>,
    },
    ByteArray(Vec<i8>),
    /// A static enum constant, e.g. `com/thalmic/myo/Arm.armLeft`.
    Constant(String),
    /// A durable reference to another object.
    Durable(usize),
}

#[derive(Default)]
struct State {
    next_id: usize,
    objects: HashMap<usize, Object>,
    /// member id -> (type name, member name)
    members: HashMap<usize, (String, String)>,
    live_durable: HashSet<usize>,
    calls: Vec<Call>,
    fail_attach: bool,
    fail_lookup: HashSet<String>,
    durable_budget: Option<usize>,
    fault_on: HashSet<String>,
    panic_on: HashSet<String>,
    fault_pending: bool,
    attached_threads: Vec<std::thread::ThreadId>,
    detached_threads: Vec<std::thread::ThreadId>,
    /// Threads the runtime attached itself.
    managed_threads: HashSet<std::thread::ThreadId>,
}

impl State {
    fn alloc(&mut self, object: Object) -> usize {
        self.next_id += 1;
        let id = 0x1000 + self.next_id;
        self.objects.insert(id, object);
        id
    }

    fn alloc_member(&mut self, ty: String, name: &str) -> usize {
        self.next_id += 1;
        let id = 0x1000 + self.next_id;
        self.members.insert(id, (ty, name.to_owned()));
        id
    }

    fn resolve(&self, id: usize) -> usize {
        match self.objects.get(&id) {
            Some(Object::Durable(target)) => *target,
            _ => id,
        }
    }

    fn type_name(&self, id: usize) -> String {
        match self.objects.get(&self.resolve(id)) {
            Some(Object::Type(name)) => name.clone(),
            other => panic!("object {id:#x} is not a type: {other:?}"),
        }
    }

    fn member_name(&self, member: MemberId) -> String {
        self.members
            .get(&member_id(member))
            .map(|(_, name)| name.clone())
            .unwrap_or_else(|| panic!("unknown member {member:?}"))
    }
}

fn obj(id: usize) -> ObjectPtr {
    ObjectPtr::from_raw(id as *mut c_void)
}

fn obj_id(ptr: ObjectPtr) -> usize {
    ptr.addr()
}

fn member_id(member: MemberId) -> usize {
    member.addr()
}

pub(crate) struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        FakeRuntime {
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // Detaching runs from thread-local destructors, where a second panic aborts.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Creates a listener instance whose type is named `type_name`.
    pub(crate) fn new_listener(&self, type_name: &str) -> ObjectPtr {
        let mut state = self.state();
        let id = state.alloc(Object::Instance {
            ty: type_name.to_owned(),
            ints: HashMap::new(),
        });
        obj(id)
    }

    pub(crate) fn id_of(&self, ptr: ObjectPtr) -> usize {
        obj_id(ptr)
    }

    pub(crate) fn fail_attach(&self, fail: bool) {
        self.state().fail_attach = fail;
    }

    /// Makes type, method and field lookups of `name` fail.
    pub(crate) fn fail_lookup(&self, name: &str) {
        self.state().fail_lookup.insert(name.to_owned());
    }

    /// Lets only `budget` more durable references succeed.
    pub(crate) fn limit_durable_refs(&self, budget: usize) {
        self.state().durable_budget = Some(budget);
    }

    /// Makes invocations of the named callback raise a fault.
    pub(crate) fn fault_on(&self, method: &str) {
        self.state().fault_on.insert(method.to_owned());
    }

    /// Makes invocations of the named callback panic inside the runtime.
    pub(crate) fn panic_on(&self, method: &str) {
        self.state().panic_on.insert(method.to_owned());
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn live_durable_refs(&self) -> usize {
        self.state().live_durable.len()
    }

    pub(crate) fn attached_threads(&self) -> Vec<std::thread::ThreadId> {
        self.state().attached_threads.clone()
    }

    pub(crate) fn detached_threads(&self) -> Vec<std::thread::ThreadId> {
        self.state().detached_threads.clone()
    }

    /// Treats the calling thread as one of the runtime's own, already attached.
    pub(crate) fn mark_managed_thread(&self) {
        self.state()
            .managed_threads
            .insert(std::thread::current().id());
    }

    /// Managed callbacks invoked so far: (receiver, method, args).
    pub(crate) fn callbacks(&self) -> Vec<(usize, String, Vec<ManagedValue>)> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::CallVoid(receiver, method, args) => {
                    Some((*receiver, method.clone(), args.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Int fields of an instance, e.g. a FirmwareVersion passed to `onPair`.
    pub(crate) fn ints_of(&self, ptr: ObjectPtr) -> HashMap<String, i32> {
        let state = self.state();
        match state.objects.get(&state.resolve(obj_id(ptr))) {
            Some(Object::Instance { ints, .. }) => ints.clone(),
            other => panic!("not an instance: {other:?}"),
        }
    }

    pub(crate) fn bytes_of(&self, ptr: ObjectPtr) -> Vec<i8> {
        let state = self.state();
        match state.objects.get(&state.resolve(obj_id(ptr))) {
            Some(Object::ByteArray(bytes)) => bytes.clone(),
            other => panic!("not a byte array: {other:?}"),
        }
    }

    /// `Type.constant` for enum constants, the type name for instances.
    pub(crate) fn describe(&self, ptr: ObjectPtr) -> String {
        let state = self.state();
        match state.objects.get(&state.resolve(obj_id(ptr))) {
            Some(Object::Constant(name)) => name.clone(),
            Some(Object::Instance { ty, .. }) => ty.clone(),
            Some(Object::Type(name)) => format!("type {name}"),
            Some(Object::ByteArray(_)) => "byte[]".to_owned(),
            other => panic!("cannot describe {other:?}"),
        }
    }
}

impl ManagedRuntime for FakeRuntime {
    fn attach_current_thread(&self) -> Result<ThreadAttachment, HostError> {
        let mut state = self.state();
        state.calls.push(Call::Attach);
        if state.fail_attach {
            return Err(HostError::AttachFailed(-1));
        }
        let thread = std::thread::current().id();
        state.attached_threads.push(thread);
        Ok(ThreadAttachment {
            env: EnvPtr::from_raw(0x1 as *mut c_void),
            newly_attached: !state.managed_threads.contains(&thread),
        })
    }

    fn detach_current_thread(&self) -> Result<(), HostError> {
        let mut state = self.state();
        state.calls.push(Call::Detach);
        state.detached_threads.push(std::thread::current().id());
        Ok(())
    }

    fn new_durable_ref(&self, _env: EnvPtr, target: ObjectPtr) -> Option<ObjectPtr> {
        let mut state = self.state();
        let target = state.resolve(obj_id(target));
        state.calls.push(Call::NewDurableRef(target));
        if let Some(budget) = state.durable_budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        let id = state.alloc(Object::Durable(target));
        state.live_durable.insert(id);
        Some(obj(id))
    }

    fn delete_durable_ref(&self, _env: EnvPtr, durable: ObjectPtr) {
        let mut state = self.state();
        let id = obj_id(durable);
        let target = state.resolve(id);
        state.calls.push(Call::DeleteDurableRef(target));
        assert!(
            state.live_durable.remove(&id),
            "durable reference {id:#x} released twice or never acquired"
        );
    }

    fn delete_local_ref(&self, _env: EnvPtr, local: ObjectPtr) {
        let mut state = self.state();
        state.calls.push(Call::DeleteLocalRef(obj_id(local)));
    }

    fn type_of(&self, _env: EnvPtr, instance: ObjectPtr) -> Option<ObjectPtr> {
        let mut state = self.state();
        let id = state.resolve(obj_id(instance));
        state.calls.push(Call::TypeOf(id));
        let ty = match state.objects.get(&id) {
            Some(Object::Instance { ty, .. }) => ty.clone(),
            _ => return None,
        };
        if state.fail_lookup.contains(&ty) {
            return None;
        }
        Some(obj(state.alloc(Object::Type(ty))))
    }

    fn find_type(&self, _env: EnvPtr, name: &str) -> Option<ObjectPtr> {
        let mut state = self.state();
        state.calls.push(Call::FindType(name.to_owned()));
        if state.fail_lookup.contains(name) {
            state.fault_pending = true;
            return None;
        }
        Some(obj(state.alloc(Object::Type(name.to_owned()))))
    }

    fn method(&self, _env: EnvPtr, ty: ObjectPtr, name: &str, signature: &str) -> Option<MemberId> {
        let mut state = self.state();
        let ty = state.type_name(obj_id(ty));
        state
            .calls
            .push(Call::Method(name.to_owned(), signature.to_owned()));
        if state.fail_lookup.contains(name) {
            state.fault_pending = true;
            return None;
        }
        let id = state.alloc_member(ty, name);
        Some(MemberId::from_raw(id as *mut c_void))
    }

    fn field(&self, _env: EnvPtr, ty: ObjectPtr, name: &str, signature: &str) -> Option<MemberId> {
        let mut state = self.state();
        let ty = state.type_name(obj_id(ty));
        state
            .calls
            .push(Call::Field(name.to_owned(), signature.to_owned()));
        if state.fail_lookup.contains(name) {
            state.fault_pending = true;
            return None;
        }
        let id = state.alloc_member(ty, name);
        Some(MemberId::from_raw(id as *mut c_void))
    }

    fn static_field(
        &self,
        _env: EnvPtr,
        ty: ObjectPtr,
        name: &str,
        signature: &str,
    ) -> Option<MemberId> {
        let mut state = self.state();
        let ty = state.type_name(obj_id(ty));
        state
            .calls
            .push(Call::StaticField(name.to_owned(), signature.to_owned()));
        if state.fail_lookup.contains(name) {
            state.fault_pending = true;
            return None;
        }
        let id = state.alloc_member(ty, name);
        Some(MemberId::from_raw(id as *mut c_void))
    }

    fn static_object_field(&self, _env: EnvPtr, ty: ObjectPtr, field: MemberId) -> Option<ObjectPtr> {
        let mut state = self.state();
        let ty = state.type_name(obj_id(ty));
        let (owner, name) = state.members[&member_id(field)].clone();
        assert_eq!(owner, ty, "static field read through the wrong type");
        let constant = format!("{ty}.{name}");
        state.calls.push(Call::StaticObjectField(constant.clone()));
        Some(obj(state.alloc(Object::Constant(constant))))
    }

    fn new_object(
        &self,
        _env: EnvPtr,
        ty: ObjectPtr,
        constructor: MemberId,
        args: &[ManagedValue],
    ) -> Option<ObjectPtr> {
        let mut state = self.state();
        let ty = state.type_name(obj_id(ty));
        assert_eq!(state.member_name(constructor), "<init>");
        state.calls.push(Call::NewObject(ty.clone(), args.to_vec()));
        Some(obj(state.alloc(Object::Instance {
            ty,
            ints: HashMap::new(),
        })))
    }

    fn set_int_field(&self, _env: EnvPtr, instance: ObjectPtr, field: MemberId, value: i32) {
        let mut state = self.state();
        let name = state.member_name(field);
        state.calls.push(Call::SetIntField(name.clone(), value));
        let id = state.resolve(obj_id(instance));
        if let Some(Object::Instance { ints, .. }) = state.objects.get_mut(&id) {
            ints.insert(name, value);
        }
    }

    fn new_byte_array(&self, _env: EnvPtr, bytes: &[i8]) -> Option<ObjectPtr> {
        let mut state = self.state();
        state.calls.push(Call::NewByteArray(bytes.to_vec()));
        Some(obj(state.alloc(Object::ByteArray(bytes.to_vec()))))
    }

    fn call_void_method(&self, _env: EnvPtr, receiver: ObjectPtr, method: MemberId, args: &[ManagedValue]) {
        let mut state = self.state();
        let receiver = state.resolve(obj_id(receiver));
        let name = state.member_name(method);
        if state.fault_on.contains(&name) {
            state.fault_pending = true;
        }
        let panics = state.panic_on.contains(&name);
        state.calls.push(Call::CallVoid(receiver, name.clone(), args.to_vec()));
        drop(state);
        if panics {
            panic!("{name} panicked");
        }
    }

    fn take_pending_fault(&self, _env: EnvPtr) -> bool {
        let mut state = self.state();
        state.calls.push(Call::TakeFault);
        std::mem::take(&mut state.fault_pending)
    }
}

/// A command a [`FakeHub`] received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HubCommand {
    LockingPolicy(u32),
    Vibrate(NativeDevice, u32),
    RequestRssi(NativeDevice),
    RequestBatteryLevel(NativeDevice),
    Unlock(NativeDevice, u32),
    NotifyUserAction(NativeDevice),
    SetStreamEmg(NativeDevice, u32),
}

#[derive(Default)]
struct HubState {
    queued: VecDeque<NativeEvent>,
    commands: Vec<HubCommand>,
    runs: Vec<(&'static str, u32)>,
}

/// A native session that delivers queued events when pumped.
#[derive(Clone, Default)]
pub(crate) struct FakeHub {
    state: Arc<Mutex<HubState>>,
    router: Arc<EventRouter>,
}

impl FakeHub {
    pub(crate) fn new() -> Self {
        FakeHub::default()
    }

    pub(crate) fn push(&self, event: NativeEvent) {
        self.state.lock().unwrap().queued.push_back(event);
    }

    /// Pairs `device` right away, without pumping.
    pub(crate) fn pair(&self, device: NativeDevice) {
        self.router.route(&[paired(device)]);
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.router.listener_count()
    }

    pub(crate) fn commands(&self) -> Vec<HubCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    pub(crate) fn runs(&self) -> Vec<(&'static str, u32)> {
        self.state.lock().unwrap().runs.clone()
    }

    /// Delivers the next queued event, if any.
    fn pump_one(&self) -> bool {
        let next = self.state.lock().unwrap().queued.pop_front();
        match next {
            Some(event) => {
                self.router.route(&[event]);
                true
            }
            None => false,
        }
    }

    fn command(&self, command: HubCommand) {
        self.state.lock().unwrap().commands.push(command);
    }
}

impl NativeHub for FakeHub {
    fn set_locking_policy(&self, policy: u32) {
        self.command(HubCommand::LockingPolicy(policy));
    }

    fn run(&self, duration_ms: u32) {
        self.state.lock().unwrap().runs.push(("run", duration_ms));
        while self.pump_one() {}
    }

    fn run_once(&self, duration_ms: u32) {
        self.state.lock().unwrap().runs.push(("run_once", duration_ms));
        self.pump_one();
    }

    fn wait_for_device(&self, duration_ms: u32) -> Option<NativeDevice> {
        wait_for_new_device(&self.router, duration_ms, |_| {
            self.pump_one();
        })
    }

    fn add_listener(&self, listener: Arc<dyn NativeListener>) {
        self.router.add_listener(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn NativeListener>) {
        self.router.remove_listener(listener);
    }

    fn vibrate(&self, device: NativeDevice, vibration: u32) {
        self.command(HubCommand::Vibrate(device, vibration));
    }

    fn request_rssi(&self, device: NativeDevice) {
        self.command(HubCommand::RequestRssi(device));
    }

    fn request_battery_level(&self, device: NativeDevice) {
        self.command(HubCommand::RequestBatteryLevel(device));
    }

    fn unlock(&self, device: NativeDevice, unlock: u32) {
        self.command(HubCommand::Unlock(device, unlock));
    }

    fn notify_user_action(&self, device: NativeDevice) {
        self.command(HubCommand::NotifyUserAction(device));
    }

    fn set_stream_emg(&self, device: NativeDevice, mode: u32) {
        self.command(HubCommand::SetStreamEmg(device, mode));
    }
}

/// Opens the given [`FakeHub`], or fails with a fixed error.
pub(crate) struct FakeSdk {
    hub: FakeHub,
    failure: Option<NativeError>,
}

impl FakeSdk {
    pub(crate) fn new(hub: FakeHub) -> Self {
        FakeSdk { hub, failure: None }
    }

    pub(crate) fn failing(failure: NativeError) -> Self {
        FakeSdk {
            hub: FakeHub::new(),
            failure: Some(failure),
        }
    }
}

impl NativeSdk for FakeSdk {
    fn open(&self, _application_identifier: &str) -> Result<Box<dyn NativeHub>, NativeError> {
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(Box::new(self.hub.clone())),
        }
    }
}

pub(crate) fn device(n: usize) -> NativeDevice {
    NativeDevice::from_raw(n as *mut c_void).unwrap()
}

pub(crate) fn paired(device: NativeDevice) -> NativeEvent {
    event(
        device,
        0,
        NativePayload::Paired {
            firmware: NativeFirmwareVersion::default(),
        },
    )
}

pub(crate) fn event(device: NativeDevice, timestamp: u64, payload: NativePayload) -> NativeEvent {
    NativeEvent {
        device,
        timestamp,
        payload,
    }
}

thread_local! {
    /// Which exception constructor ran last on this thread: 1 invalid argument,
    /// 2 connection failure, 3 out of resources, 4 unexpected.
    pub(crate) static LAST_EXCEPTION: Cell<u32> = const { Cell::new(0) };
}

unsafe extern "C" fn invalid_argument(_: FFIStr<'_>) -> ExceptionPtr {
    LAST_EXCEPTION.with(|e| e.set(1));
    ExceptionPtr::dangling()
}

unsafe extern "C" fn myo_exception(_: FFIStr<'_>) -> ExceptionPtr {
    LAST_EXCEPTION.with(|e| e.set(2));
    ExceptionPtr::dangling()
}

unsafe extern "C" fn out_of_resources(_: FFIStr<'_>) -> ExceptionPtr {
    LAST_EXCEPTION.with(|e| e.set(3));
    ExceptionPtr::dangling()
}

unsafe extern "C" fn rust_exception(_: FFIStr<'_>) -> ExceptionPtr {
    LAST_EXCEPTION.with(|e| e.set(4));
    ExceptionPtr::dangling()
}

pub(crate) fn test_constructors() -> ExceptionConstructors {
    ExceptionConstructors::new(invalid_argument, myo_exception, out_of_resources, rust_exception)
}
