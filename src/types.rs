use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw volume step on the profile's scale
pub type VolumeValue = u8;

/// Logical source name (e.g. "cd", "opt1")
pub type SourceName = String;

/// Snapshot of the amplifier's last-known state
///
/// Every field starts out unknown (`None`). Fields are kept across
/// reconnects and flagged as `stale` until the next handshake completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Power state, `true` when on
    pub power: Option<bool>,

    /// Volume on the profile's raw scale
    pub volume: Option<VolumeValue>,

    /// Mute state, `true` when muted
    pub mute: Option<bool>,

    /// Selected logical source
    pub source: Option<SourceName>,

    /// Model string reported by the device
    pub model: Option<String>,

    /// Firmware version reported by the device
    pub version: Option<String>,

    /// Set while disconnected: values may no longer reflect the device
    #[serde(default)]
    pub stale: bool,
}

impl DeviceState {
    /// Current value of a field, if known
    pub fn get(&self, field: Field) -> Option<FieldValue> {
        match field {
            Field::Power => self.power.map(FieldValue::Power),
            Field::Volume => self.volume.map(FieldValue::Volume),
            Field::Mute => self.mute.map(FieldValue::Mute),
            Field::Source => self.source.clone().map(FieldValue::Source),
            Field::Model => self.model.clone().map(FieldValue::Model),
            Field::Version => self.version.clone().map(FieldValue::Version),
        }
    }

    /// Store a value, returning the change if it differs from the current one
    pub(crate) fn apply(&mut self, value: FieldValue) -> Option<StateChange> {
        let field = value.field();
        let old = self.get(field);
        if old.as_ref() == Some(&value) {
            return None;
        }

        match &value {
            FieldValue::Power(on) => self.power = Some(*on),
            FieldValue::Volume(v) => self.volume = Some(*v),
            FieldValue::Mute(m) => self.mute = Some(*m),
            FieldValue::Source(s) => self.source = Some(s.clone()),
            FieldValue::Model(m) => self.model = Some(m.clone()),
            FieldValue::Version(v) => self.version = Some(v.clone()),
        }

        Some(StateChange {
            field,
            old,
            new: value,
        })
    }
}

/// Fields tracked in [`DeviceState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Power,
    Volume,
    Mute,
    Source,
    Model,
    Version,
}

/// A typed value for one [`Field`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Power(bool),
    Volume(VolumeValue),
    Mute(bool),
    Source(SourceName),
    Model(String),
    Version(String),
}

impl FieldValue {
    /// The field this value belongs to
    pub fn field(&self) -> Field {
        match self {
            FieldValue::Power(_) => Field::Power,
            FieldValue::Volume(_) => Field::Volume,
            FieldValue::Mute(_) => Field::Mute,
            FieldValue::Source(_) => Field::Source,
            FieldValue::Model(_) => Field::Model,
            FieldValue::Version(_) => Field::Version,
        }
    }
}

/// Notification that a single field of the device state changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub field: Field,

    /// Previous value, `None` if it was unknown
    pub old: Option<FieldValue>,

    pub new: FieldValue,
}

/// Connectivity as surfaced to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    /// Whether the host should show the device as available
    pub fn is_available(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

/// Internal phase of the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Subscribed,
    Reconnecting,
    Closed,
}

impl SessionState {
    /// Connectivity status reported for this phase
    pub fn status(self) -> ConnectionStatus {
        match self {
            SessionState::Idle | SessionState::Closed => ConnectionStatus::Disconnected,
            SessionState::Connecting | SessionState::Handshaking => ConnectionStatus::Connecting,
            SessionState::Subscribed => ConnectionStatus::Connected,
            SessionState::Reconnecting => ConnectionStatus::Reconnecting,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Subscribed => "subscribed",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
