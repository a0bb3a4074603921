//! Bluetooth LE fitness equipment integration
//!
//! This library discovers smart trainers, power meters, speed/cadence and
//! heart rate sensors over Bluetooth Low Energy, decodes their standard GATT
//! characteristics into telemetry and sends Fitness Machine Control Point
//! commands with response verification.
//!
//! # Modules
//!
//! - `registry`: Descriptor types and lookups for known services and characteristics
//! - `profiles`: Static Bluetooth SIG layout and command tables
//! - `codec`: Flag-gated frame decoding, command encoding and response validation
//! - `notify`: Shared, reference-counted notification subscriptions
//! - `command`: Latest-wins command channel for writable characteristics
//! - `session`: Per-device discovery, classification and teardown
//! - `manager`: Multi-device sessions and command routing
//! - `telemetry`: Features, device records and outbound events
//! - `transport`: GATT capability traits implemented by a backend
//! - `bluez`: BlueZ backend (feature `bluez`)
//! - `types`: Common types and errors used throughout the library

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod codec;
pub mod command;
pub mod config;
pub mod manager;
pub mod notify;
pub mod profiles;
pub mod registry;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod types;

#[cfg(test)]
mod fake;

pub use codec::{
    decode_record, encode_command, validate_response, CommandInput, DecodedField, DecodedRecord,
    FieldValue, InputValue, ResponseVerdict,
};
pub use command::CommandChannel;
pub use config::SessionConfig;
pub use manager::DeviceManager;
pub use notify::{NotificationMux, Subscription};
pub use registry::{
    build_scan_filters, full_id_to_short_id, lookup_characteristic, lookup_service,
    short_id_to_full_id, CharacteristicDescriptor, CharacteristicRole, CommandDefinition,
    FieldLayout, ScanFilter, ServiceDescriptor,
};
pub use session::{DeviceSession, DiscoveredService, SessionState};
pub use telemetry::{DeviceRecord, EventSink, Feature, FeatureDirectory, SessionEvent};
pub use transport::{BleCentral, GattCharacteristic, GattDevice, GattService, NotificationStream};
pub use types::{Endian, NumberFormat, Result, SensorLocation, TrainerError};
