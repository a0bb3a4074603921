//! Telemetry model
//!
//! Maps decoded field names onto the small set of features the rest of the
//! application cares about, keeps a per-device record of capabilities and
//! latest values, and defines the events handed to the outside world.

use crate::codec::{DecodedRecord, FieldValue};
use crate::types::SensorLocation;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A measurement the application consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    Speed,
    Cadence,
    Power,
    HeartRate,
    Battery,
    Resistance,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Speed,
        Feature::Cadence,
        Feature::Power,
        Feature::HeartRate,
        Feature::Battery,
        Feature::Resistance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Speed => "speed",
            Feature::Cadence => "cadence",
            Feature::Power => "power",
            Feature::HeartRate => "heartRate",
            Feature::Battery => "battery",
            Feature::Resistance => "resistance",
        }
    }

    /// Feature fed by a decoded field, if any
    pub fn from_field(name: &str) -> Option<Self> {
        match name {
            "instantSpeed" => Some(Feature::Speed),
            "instantCadence" => Some(Feature::Cadence),
            "instantPower" => Some(Feature::Power),
            "heartRate" => Some(Feature::HeartRate),
            "batteryLevel" => Some(Feature::Battery),
            "resistanceLevel" => Some(Feature::Resistance),
            _ => None,
        }
    }

    /// Feature advertised by a Fitness Machine Feature flag, if any
    pub fn from_capability_flag(name: &str) -> Option<Self> {
        match name {
            "averageSpeedSupported" => Some(Feature::Speed),
            "cadenceSupported" => Some(Feature::Cadence),
            "powerMeasurementSupported" => Some(Feature::Power),
            "heartRateMeasurementSupported" => Some(Feature::HeartRate),
            "resistanceLevelSupported" => Some(Feature::Resistance),
            _ => None,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One telemetry value produced by a merge
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub feature: Feature,
    pub value: f64,
    pub unit: &'static str,
}

/// What a merge changed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeOutcome {
    pub readings: Vec<Reading>,
    pub capabilities_changed: bool,
}

/// Everything known about one connected device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub equipment_type: String,
    pub capabilities: BTreeMap<Feature, bool>,
    pub latest_values: BTreeMap<Feature, f64>,
    /// Where a heart rate sensor is worn, once read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_location: Option<SensorLocation>,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, equipment_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            equipment_type: equipment_type.into(),
            capabilities: BTreeMap::new(),
            latest_values: BTreeMap::new(),
            sensor_location: None,
        }
    }

    /// Fold one decoded frame into the record
    ///
    /// Mapped numeric fields update `latest_values` and mark the feature as
    /// supported; feature flag maps mark advertised features as supported.
    pub fn merge(&mut self, record: &DecodedRecord) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for field in record.iter() {
            match &field.value {
                FieldValue::Number(value) if field.name == "sensorLocation" => {
                    self.sensor_location = Some(SensorLocation::from_u8(*value as u8));
                }
                FieldValue::Number(value) => {
                    let Some(feature) = Feature::from_field(field.name) else {
                        continue;
                    };
                    self.latest_values.insert(feature, *value);
                    outcome.capabilities_changed |= self.enable(feature);
                    outcome.readings.push(Reading {
                        feature,
                        value: *value,
                        unit: field.unit,
                    });
                }
                FieldValue::Flags(flags) => {
                    for (flag, set) in flags {
                        if !set {
                            continue;
                        }
                        if let Some(feature) = Feature::from_capability_flag(flag) {
                            outcome.capabilities_changed |= self.enable(feature);
                        }
                    }
                }
            }
        }

        outcome
    }

    fn enable(&mut self, feature: Feature) -> bool {
        self.capabilities.insert(feature, true) != Some(true)
    }
}

/// Events emitted towards the application state layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// A device finished connecting and was registered
    Discovered {
        device_id: String,
        name: String,
        equipment_type: String,
        capabilities: BTreeMap<Feature, bool>,
    },
    Telemetry {
        device_id: String,
        feature: Feature,
        value: f64,
        unit: &'static str,
    },
    CapabilitiesChanged {
        device_id: String,
        capabilities: BTreeMap<Feature, bool>,
    },
    /// Device selection or connection failed
    SearchFailed { reason: String },
    CommandSucceeded {
        device_id: String,
        command: String,
    },
    CommandFailed {
        device_id: String,
        command: String,
        reason: String,
    },
    Disconnected { device_id: String },
}

/// Receiver of session events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SessionEvent);
}

impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    fn emit(&self, event: SessionEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped, discarding event");
        }
    }
}

/// Which device is the designated source of each feature
///
/// The first device to report a feature keeps it until its session ends.
#[derive(Debug, Default)]
pub struct FeatureDirectory {
    sources: Mutex<BTreeMap<Feature, String>>,
}

impl FeatureDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `device_id` as the source of `feature` unless one exists.
    /// Returns whether `device_id` is the source afterwards.
    pub fn claim(&self, feature: Feature, device_id: &str) -> bool {
        let Ok(mut sources) = self.sources.lock() else {
            return false;
        };
        let source = sources
            .entry(feature)
            .or_insert_with(|| device_id.to_string());
        source == device_id
    }

    pub fn source_of(&self, feature: Feature) -> Option<String> {
        self.sources
            .lock()
            .ok()
            .and_then(|sources| sources.get(&feature).cloned())
    }

    /// Drop every claim held by `device_id`
    pub fn release(&self, device_id: &str) {
        if let Ok(mut sources) = self.sources.lock() {
            sources.retain(|_, source| source != device_id);
        }
    }
}
