//! Per-frame capture metadata.
//!
//! A capture source reports, for every frame, a map of [`MetadataKey`] to
//! [`MetadataValue`] along with the frame number and sensor timestamp. The
//! 3A (auto-exposure, auto-focus, auto-white-balance) states are carried as
//! unsigned values and decoded through the typed enums in this module.

use std::collections::BTreeMap;
use std::fmt;

/// Strongly typed metadata key.
///
/// # Example
/// ```rust
/// use focus_core::prelude::MetadataKey;
///
/// assert_eq!(MetadataKey::AE_STATE.name(), "control.ae_state");
/// assert_eq!(MetadataKey(9000).name(), "vendor");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetadataKey(pub u32);

impl MetadataKey {
    pub const SENSOR_TIMESTAMP: MetadataKey = MetadataKey(1);
    pub const LENS_STATE: MetadataKey = MetadataKey(2);
    pub const FLASH_STATE: MetadataKey = MetadataKey(3);
    pub const FLASH_MODE: MetadataKey = MetadataKey(4);
    pub const AE_STATE: MetadataKey = MetadataKey(5);
    pub const AF_STATE: MetadataKey = MetadataKey(6);
    pub const AWB_STATE: MetadataKey = MetadataKey(7);
    pub const AE_MODE: MetadataKey = MetadataKey(8);
    pub const AF_MODE: MetadataKey = MetadataKey(9);
    pub const AE_PRECAPTURE_TRIGGER: MetadataKey = MetadataKey(10);
    pub const AF_TRIGGER: MetadataKey = MetadataKey(11);
    pub const JPEG_QUALITY: MetadataKey = MetadataKey(12);

    /// Stable dotted name for logging.
    pub fn name(self) -> &'static str {
        match self {
            Self::SENSOR_TIMESTAMP => "sensor.timestamp",
            Self::LENS_STATE => "lens.state",
            Self::FLASH_STATE => "flash.state",
            Self::FLASH_MODE => "flash.mode",
            Self::AE_STATE => "control.ae_state",
            Self::AF_STATE => "control.af_state",
            Self::AWB_STATE => "control.awb_state",
            Self::AE_MODE => "control.ae_mode",
            Self::AF_MODE => "control.af_mode",
            Self::AE_PRECAPTURE_TRIGGER => "control.ae_precapture_trigger",
            Self::AF_TRIGGER => "control.af_trigger",
            Self::JPEG_QUALITY => "jpeg.quality",
            _ => "vendor",
        }
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Metadata value variants with minimal footprint.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "kind", content = "value", rename_all = "snake_case")
)]
pub enum MetadataValue {
    None,
    Bool(bool),
    Int(i64),
    Uint(u32),
    Float(f32),
}

impl MetadataValue {
    pub fn as_uint(&self) -> Option<u32> {
        match self {
            MetadataValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(v) => Some(*v),
            MetadataValue::Uint(v) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

macro_rules! state_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $key:expr, { $($variant:ident = $raw:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Key under which this state is reported.
            pub const KEY: MetadataKey = $key;

            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $($raw => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn raw(self) -> u32 {
                match self {
                    $(Self::$variant => $raw),+
                }
            }

            pub fn value(self) -> MetadataValue {
                MetadataValue::Uint(self.raw())
            }
        }

        impl From<$name> for MetadataValue {
            fn from(state: $name) -> Self {
                state.value()
            }
        }
    };
}

state_enum!(
    /// Auto-exposure state.
    AeState, MetadataKey::AE_STATE, {
        Inactive = 0,
        Searching = 1,
        Converged = 2,
        Locked = 3,
        FlashRequired = 4,
        Precapture = 5,
    }
);

state_enum!(
    /// Auto-focus state.
    AfState, MetadataKey::AF_STATE, {
        Inactive = 0,
        PassiveScan = 1,
        PassiveFocused = 2,
        ActiveScan = 3,
        FocusedLocked = 4,
        NotFocusedLocked = 5,
        PassiveUnfocused = 6,
    }
);

state_enum!(
    /// Auto-white-balance state.
    AwbState, MetadataKey::AWB_STATE, {
        Inactive = 0,
        Searching = 1,
        Converged = 2,
        Locked = 3,
    }
);

state_enum!(
    /// Whether the lens was moving while the frame was exposed.
    LensState, MetadataKey::LENS_STATE, {
        Stationary = 0,
        Moving = 1,
    }
);

state_enum!(
    FlashState, MetadataKey::FLASH_STATE, {
        Unavailable = 0,
        Charging = 1,
        Ready = 2,
        Fired = 3,
        Partial = 4,
    }
);

state_enum!(
    FlashMode, MetadataKey::FLASH_MODE, {
        Off = 0,
        Single = 1,
        Torch = 2,
    }
);

state_enum!(
    /// Requested auto-exposure mode.
    AeMode, MetadataKey::AE_MODE, {
        Off = 0,
        On = 1,
        OnAutoFlash = 2,
        OnAlwaysFlash = 3,
    }
);

state_enum!(
    /// Requested auto-focus mode.
    AfMode, MetadataKey::AF_MODE, {
        Off = 0,
        Auto = 1,
        ContinuousPicture = 4,
    }
);

state_enum!(
    /// One-shot auto-focus trigger carried by a request.
    AfTrigger, MetadataKey::AF_TRIGGER, {
        Idle = 0,
        Start = 1,
        Cancel = 2,
    }
);

/// Tag attached to a capture request and echoed back in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RequestTag {
    /// Frames from the repeating preview/ZSL stream.
    Repeating,
    /// The auto-exposure precapture trigger frame.
    Precapture,
    /// The frame that starts an auto-focus scan.
    FocusTrigger,
    /// A single still capture explicitly requested by the caller; the id
    /// distinguishes consecutive requests.
    ExplicitCapture(u64),
}

/// Metadata for one captured frame.
///
/// # Example
/// ```rust
/// use focus_core::prelude::*;
///
/// let meta = CaptureMetadata::new(7, 1_000)
///     .with(MetadataKey::AE_STATE, AeState::Converged)
///     .with_tag(RequestTag::Repeating);
/// assert_eq!(meta.ae_state(), Some(AeState::Converged));
/// assert_eq!(meta.frame_number(), 7);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CaptureMetadata {
    frame_number: i64,
    timestamp: i64,
    tag: Option<RequestTag>,
    values: BTreeMap<MetadataKey, MetadataValue>,
}

impl CaptureMetadata {
    /// Create metadata for a frame; the sensor timestamp is also recorded
    /// under [`MetadataKey::SENSOR_TIMESTAMP`].
    pub fn new(frame_number: i64, timestamp: i64) -> Self {
        let mut values = BTreeMap::new();
        values.insert(MetadataKey::SENSOR_TIMESTAMP, MetadataValue::Int(timestamp));
        Self {
            frame_number,
            timestamp,
            tag: None,
            values,
        }
    }

    pub fn with(mut self, key: MetadataKey, value: impl Into<MetadataValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn with_tag(mut self, tag: RequestTag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn set(&mut self, key: MetadataKey, value: impl Into<MetadataValue>) {
        self.values.insert(key, value.into());
    }

    pub fn frame_number(&self) -> i64 {
        self.frame_number
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn tag(&self) -> Option<RequestTag> {
        self.tag
    }

    pub fn get(&self, key: MetadataKey) -> Option<&MetadataValue> {
        self.values.get(&key)
    }

    /// Iterate present keys and values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (MetadataKey, &MetadataValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn state(&self, key: MetadataKey) -> Option<u32> {
        self.get(key).and_then(MetadataValue::as_uint)
    }

    pub fn ae_state(&self) -> Option<AeState> {
        self.state(AeState::KEY).and_then(AeState::from_raw)
    }

    pub fn af_state(&self) -> Option<AfState> {
        self.state(AfState::KEY).and_then(AfState::from_raw)
    }

    pub fn awb_state(&self) -> Option<AwbState> {
        self.state(AwbState::KEY).and_then(AwbState::from_raw)
    }

    pub fn lens_state(&self) -> Option<LensState> {
        self.state(LensState::KEY).and_then(LensState::from_raw)
    }

    pub fn flash_state(&self) -> Option<FlashState> {
        self.state(FlashState::KEY).and_then(FlashState::from_raw)
    }

    pub fn flash_mode(&self) -> Option<FlashMode> {
        self.state(FlashMode::KEY).and_then(FlashMode::from_raw)
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        MetadataValue::Uint(v)
    }
}

impl From<f32> for MetadataValue {
    fn from(v: f32) -> Self {
        MetadataValue::Float(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_states_decode_from_raw_values() {
        let meta = CaptureMetadata::new(1, 10)
            .with(MetadataKey::FLASH_STATE, FlashState::Fired)
            .with(MetadataKey::LENS_STATE, 1u32)
            .with(MetadataKey::AF_STATE, 99u32);
        assert_eq!(meta.flash_state(), Some(FlashState::Fired));
        assert_eq!(meta.lens_state(), Some(LensState::Moving));
        assert_eq!(meta.af_state(), None);
        assert_eq!(meta.ae_state(), None);
    }

    #[test]
    fn timestamp_is_recorded_as_a_key() {
        let meta = CaptureMetadata::new(3, 42);
        assert_eq!(
            meta.get(MetadataKey::SENSOR_TIMESTAMP).and_then(MetadataValue::as_int),
            Some(42)
        );
        assert_eq!(meta.len(), 1);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn values_serialize_with_kind_tag() {
        let json = serde_json::to_string(&MetadataValue::Uint(4)).unwrap();
        assert_eq!(json, r#"{"kind":"uint","value":4}"#);
    }
}
