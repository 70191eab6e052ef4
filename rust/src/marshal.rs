//! Value marshaling between native payloads and their managed representations.
//!
//! Every enumeration has an explicit `Unknown` member, and every conversion
//! from a native tag or a managed code is total: anything outside the known
//! set decodes to `Unknown`.

use crate::native::{
    self, NativeFirmwareVersion, arm, locking_policy, pose, stream_emg, unlock, vibration,
    warmup_result, warmup_state, x_direction,
};

/// Managed type names and member descriptors the bridge resolves at registration.
pub(crate) mod descriptors {
    pub const DEVICE_TYPE: &str = "com/thalmic/myo/Myo";
    pub const DEVICE_CONSTRUCTOR: &str = "(J)V";

    pub const FIRMWARE_VERSION_TYPE: &str = "com/thalmic/myo/FirmwareVersion";
    pub const FIRMWARE_VERSION_CONSTRUCTOR: &str = "()V";
    pub const FIRMWARE_VERSION_FIELDS: [&str; 4] = [
        "firmwareVersionMajor",
        "firmwareVersionMinor",
        "firmwareVersionPatch",
        "firmwareVersionHardwareRev",
    ];
    pub const INT_FIELD: &str = "I";

    pub const QUATERNION_TYPE: &str = "com/thalmic/myo/Quaternion";
    pub const QUATERNION_CONSTRUCTOR: &str = "(DDDD)V";

    pub const VECTOR3_TYPE: &str = "com/thalmic/myo/Vector3";
    pub const VECTOR3_CONSTRUCTOR: &str = "(DDD)V";

    pub const CONSTRUCTOR_NAME: &str = "<init>";
}

/// A managed enumeration whose members are read from static fields of its type.
pub(crate) trait ManagedEnum: Copy + Eq + 'static {
    const TYPE_NAME: &'static str;
    /// Every member, in the order their constants are resolved and cached.
    /// The last one is the `Unknown` fallback.
    const MEMBERS: &'static [Self];

    /// Name of the static field holding this member.
    fn constant_name(self) -> &'static str;

    fn index(self) -> usize {
        Self::MEMBERS
            .iter()
            .position(|m| *m == self)
            .unwrap_or(Self::MEMBERS.len() - 1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Arm {
    Left,
    Right,
    Unknown,
}

impl Arm {
    pub fn from_native(tag: u32) -> Self {
        match tag {
            arm::LEFT => Arm::Left,
            arm::RIGHT => Arm::Right,
            _ => Arm::Unknown,
        }
    }
}

impl ManagedEnum for Arm {
    const TYPE_NAME: &'static str = "com/thalmic/myo/Arm";
    const MEMBERS: &'static [Self] = &[Arm::Left, Arm::Right, Arm::Unknown];

    fn constant_name(self) -> &'static str {
        match self {
            Arm::Left => "armLeft",
            Arm::Right => "armRight",
            Arm::Unknown => "armUnknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum XDirection {
    TowardElbow,
    TowardWrist,
    Unknown,
}

impl XDirection {
    pub fn from_native(tag: u32) -> Self {
        match tag {
            x_direction::TOWARD_ELBOW => XDirection::TowardElbow,
            x_direction::TOWARD_WRIST => XDirection::TowardWrist,
            _ => XDirection::Unknown,
        }
    }
}

impl ManagedEnum for XDirection {
    const TYPE_NAME: &'static str = "com/thalmic/myo/XDirection";
    const MEMBERS: &'static [Self] = &[
        XDirection::TowardElbow,
        XDirection::TowardWrist,
        XDirection::Unknown,
    ];

    fn constant_name(self) -> &'static str {
        match self {
            XDirection::TowardElbow => "xDirectionTowardsElbow",
            XDirection::TowardWrist => "xDirectionTowardsWrist",
            XDirection::Unknown => "xDirectionUnknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum WarmupState {
    Cold,
    Warm,
    Unknown,
}

impl WarmupState {
    pub fn from_native(tag: u32) -> Self {
        match tag {
            warmup_state::COLD => WarmupState::Cold,
            warmup_state::WARM => WarmupState::Warm,
            _ => WarmupState::Unknown,
        }
    }
}

impl ManagedEnum for WarmupState {
    const TYPE_NAME: &'static str = "com/thalmic/myo/WarmupState";
    const MEMBERS: &'static [Self] = &[WarmupState::Cold, WarmupState::Warm, WarmupState::Unknown];

    fn constant_name(self) -> &'static str {
        match self {
            WarmupState::Cold => "warmupStateCold",
            WarmupState::Warm => "warmupStateWarm",
            WarmupState::Unknown => "warmupStateUnknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Pose {
    Rest,
    Fist,
    FingersSpread,
    WaveIn,
    WaveOut,
    DoubleTap,
    Unknown,
}

impl Pose {
    pub fn from_native(tag: u32) -> Self {
        match tag {
            pose::REST => Pose::Rest,
            pose::FIST => Pose::Fist,
            pose::FINGERS_SPREAD => Pose::FingersSpread,
            pose::WAVE_IN => Pose::WaveIn,
            pose::WAVE_OUT => Pose::WaveOut,
            pose::DOUBLE_TAP => Pose::DoubleTap,
            _ => Pose::Unknown,
        }
    }
}

impl ManagedEnum for Pose {
    const TYPE_NAME: &'static str = "com/thalmic/myo/Pose";
    const MEMBERS: &'static [Self] = &[
        Pose::Rest,
        Pose::Fist,
        Pose::FingersSpread,
        Pose::WaveIn,
        Pose::WaveOut,
        Pose::DoubleTap,
        Pose::Unknown,
    ];

    fn constant_name(self) -> &'static str {
        match self {
            Pose::Rest => "rest",
            Pose::Fist => "fist",
            Pose::FingersSpread => "fingersSpread",
            Pose::WaveIn => "waveIn",
            Pose::WaveOut => "waveOut",
            Pose::DoubleTap => "doubleTap",
            Pose::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum WarmupResult {
    Success,
    FailedTimeout,
    Unknown,
}

impl WarmupResult {
    pub fn from_native(tag: u32) -> Self {
        match tag {
            warmup_result::SUCCESS => WarmupResult::Success,
            warmup_result::FAILED_TIMEOUT => WarmupResult::FailedTimeout,
            _ => WarmupResult::Unknown,
        }
    }
}

impl ManagedEnum for WarmupResult {
    const TYPE_NAME: &'static str = "com/thalmic/myo/WarmupResult";
    const MEMBERS: &'static [Self] = &[
        WarmupResult::Success,
        WarmupResult::FailedTimeout,
        WarmupResult::Unknown,
    ];

    fn constant_name(self) -> &'static str {
        match self {
            WarmupResult::Success => "warmupResultSuccess",
            WarmupResult::FailedTimeout => "warmupResultFailedTimeout",
            WarmupResult::Unknown => "warmupResultUnknown",
        }
    }
}

// Managed-to-native command enumerations. Codes are the managed library's
// integer constants, not the SDK's tags.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockingPolicy {
    None,
    Standard,
    Unknown,
}

impl LockingPolicy {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => LockingPolicy::None,
            1 => LockingPolicy::Standard,
            _ => LockingPolicy::Unknown,
        }
    }

    /// Anything but `None` locks, as the managed library always did.
    pub fn to_native(self) -> u32 {
        match self {
            LockingPolicy::None => locking_policy::NONE,
            LockingPolicy::Standard | LockingPolicy::Unknown => locking_policy::STANDARD,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VibrationType {
    Short,
    Medium,
    Long,
    Unknown,
}

impl VibrationType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => VibrationType::Short,
            1 => VibrationType::Medium,
            2 => VibrationType::Long,
            _ => VibrationType::Unknown,
        }
    }

    pub fn to_native(self) -> u32 {
        match self {
            VibrationType::Short => vibration::SHORT,
            VibrationType::Medium => vibration::MEDIUM,
            VibrationType::Long | VibrationType::Unknown => vibration::LONG,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnlockType {
    Timed,
    Hold,
    Unknown,
}

impl UnlockType {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => UnlockType::Timed,
            1 => UnlockType::Hold,
            _ => UnlockType::Unknown,
        }
    }

    pub fn to_native(self) -> u32 {
        match self {
            UnlockType::Hold => unlock::HOLD,
            UnlockType::Timed | UnlockType::Unknown => unlock::TIMED,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EmgStreamMode {
    Disabled,
    Enabled,
    Unknown,
}

impl EmgStreamMode {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => EmgStreamMode::Disabled,
            1 => EmgStreamMode::Enabled,
            _ => EmgStreamMode::Unknown,
        }
    }

    pub fn to_native(self) -> u32 {
        match self {
            EmgStreamMode::Disabled => stream_emg::DISABLED,
            EmgStreamMode::Enabled | EmgStreamMode::Unknown => stream_emg::ENABLED,
        }
    }
}

/// Firmware version of a device. The native fields are unsigned; the managed
/// fields hold the same bits as `int`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
    pub hardware_rev: i32,
}

impl FirmwareVersion {
    /// Field values in the order of [`descriptors::FIRMWARE_VERSION_FIELDS`].
    pub(crate) fn fields(&self) -> [i32; 4] {
        [self.major, self.minor, self.patch, self.hardware_rev]
    }
}

impl From<NativeFirmwareVersion> for FirmwareVersion {
    fn from(fw: NativeFirmwareVersion) -> Self {
        FirmwareVersion {
            major: fw.major as i32,
            minor: fw.minor as i32,
            patch: fw.patch as i32,
            hardware_rev: fw.hardware_rev as i32,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl From<[f32; 4]> for Quaternion {
    fn from([x, y, z, w]: [f32; 4]) -> Self {
        Quaternion {
            x: x.into(),
            y: y.into(),
            z: z.into(),
            w: w.into(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<[f32; 3]> for Vector3 {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Vector3 {
            x: x.into(),
            y: y.into(),
            z: z.into(),
        }
    }
}

/// One EMG sample: eight signed 8-bit sensor readings.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmgData(pub [i8; 8]);

impl EmgData {
    pub fn as_slice(&self) -> &[i8] {
        &self.0
    }
}

/// Reinterprets the SDK's unsigned microsecond timestamp as the managed `long`.
///
/// Uptimes never approach 2^63 microseconds, so the bits are kept unchecked.
pub(crate) fn timestamp_to_managed(timestamp: u64) -> i64 {
    timestamp as i64
}

/// Device identity as the managed `long` address.
pub(crate) fn device_address(device: native::NativeDevice) -> i64 {
    device.as_raw() as usize as i64
}

/// Battery level is carried to the managed side as a signed byte.
pub(crate) fn battery_level_to_managed(level: u8) -> i8 {
    level as i8
}
